// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

// Shared across the integration binaries; not every binary uses every helper.
#![allow(dead_code)]

use datadog_mobile_crashtracker::CrashtrackerConfig;
use httpmock::Mock;
use std::path::Path;
use std::time::{Duration, Instant};

/// Millisecond-scale configuration so the suite runs in seconds: retry base
/// 10 ms, ANR threshold 120 ms, pending drain pause 10 ms.
pub fn test_config(endpoint: &str, root: &Path) -> CrashtrackerConfig {
    let mut config = CrashtrackerConfig::new(
        endpoint.to_string(),
        root.join("data"),
        root.join("cache"),
        "com.example.app".to_string(),
    )
    .unwrap();
    config.app_version = "1.2.3".to_string();
    config.environment = "test".to_string();
    config.enable_anr_detection = false;
    config.sample_rate = 1.0;
    config.retry_base_delay_ms = 10;
    config.retry_delay_cap_ms = 200;
    config.anr_check_interval_ms = 25;
    config.anr_threshold_ms = 120;
    config.anr_threshold_power_save_ms = 160;
    config.anr_cooldown_ms = 600;
    config.pending_max_per_minute = 6_000;
    config
}

/// Polls until the mock saw `expected` hits, or panics after `timeout`.
pub fn wait_for_hits(mock: &Mock, expected: usize, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    loop {
        if mock.hits() >= expected {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "expected {expected} hits, saw {} before timeout",
            mock.hits()
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}

/// Asserts the hit count stays at `expected` for `window`.
pub fn assert_hits_stable(mock: &Mock, expected: usize, window: Duration) {
    std::thread::sleep(window);
    assert_eq!(mock.hits(), expected, "hit count moved past {expected}");
}

pub fn managed_stack(marker: &str) -> String {
    format!(
        "at com.example.app.{marker}.run({marker}.kt:7)\n\
         at com.example.app.Dispatcher.dispatch(Dispatcher.kt:120)\n\
         at android.os.Handler.handleCallback(Handler.java:938)"
    )
}
