// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of the crash reporter.
///
/// `data_dir` owns the durable crash queue (`crashes/pending`, `crashes/sent`
/// and the native trailer file); `cache_dir` holds the fingerprint map and is
/// allowed to be wiped by the platform without losing pending crashes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashtrackerConfig {
    /// Base URL of the ingestion service; reports POST to `<base>/api/crashes`.
    pub endpoint: String,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Application package identifier reported in every record.
    pub app_id: String,
    pub app_version: String,
    pub environment: String,
    pub enable_anr_detection: bool,
    /// ANR threshold under normal power conditions.
    pub anr_threshold_ms: u64,
    pub anr_threshold_power_save_ms: u64,
    pub anr_cooldown_ms: u64,
    /// How often the watchdog wakes to compare `last_ping` with now.  Kept
    /// separate from the threshold so tests can run at millisecond scale.
    pub anr_check_interval_ms: u64,
    /// Fraction of non-fatal, non-duplicate crashes that are sent.
    pub sample_rate: f64,
    pub retry_base_delay_ms: u64,
    pub retry_delay_cap_ms: u64,
    pub max_retries: u32,
    pub batch_flush_interval_ms: u64,
    pub pending_max_per_minute: u32,
    pub http_timeout_ms: u64,
    /// The disk throughput probe performs a real 1 MiB write+read; it stays
    /// off unless the host opts in.
    pub enable_disk_probe: bool,
    pub create_alt_stack: bool,
}

impl CrashtrackerConfig {
    pub fn new(
        endpoint: String,
        data_dir: PathBuf,
        cache_dir: PathBuf,
        app_id: String,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!endpoint.is_empty(), "Expected an ingestion endpoint");
        anyhow::ensure!(!app_id.is_empty(), "Expected an application id");
        anyhow::ensure!(
            data_dir != cache_dir,
            "Data and cache directories must be distinct: the cache may be wiped \
             by the platform while crashes are pending"
        );
        Ok(Self {
            endpoint,
            data_dir,
            cache_dir,
            app_id,
            app_version: String::new(),
            environment: "production".to_string(),
            enable_anr_detection: true,
            anr_threshold_ms: constants::ANR_THRESHOLD_MS,
            anr_threshold_power_save_ms: constants::ANR_THRESHOLD_POWER_SAVE_MS,
            anr_cooldown_ms: constants::ANR_COOLDOWN_MS,
            anr_check_interval_ms: constants::ANR_THRESHOLD_MS / 3,
            sample_rate: constants::DEFAULT_SAMPLE_RATE,
            retry_base_delay_ms: constants::RETRY_BASE_DELAY_MS,
            retry_delay_cap_ms: constants::RETRY_DELAY_CAP_MS,
            max_retries: constants::MAX_RETRIES,
            batch_flush_interval_ms: constants::BATCH_FLUSH_INTERVAL_MS,
            pending_max_per_minute: constants::PENDING_MAX_PER_MINUTE,
            http_timeout_ms: constants::HTTP_TIMEOUT_MS,
            enable_disk_probe: false,
            create_alt_stack: true,
        })
    }

    /// Directory holding `pending/`, `sent/` and the native trailer.
    pub fn crashes_dir(&self) -> PathBuf {
        self.data_dir.join("crashes")
    }

    pub fn trailer_path(&self) -> PathBuf {
        self.crashes_dir().join(constants::NATIVE_CRASH_FILE)
    }

    pub fn crashes_url(&self) -> String {
        format!("{}/api/crashes", self.endpoint.trim_end_matches('/'))
    }

    /// Threshold adjusted for the power conditions observed by the caller.
    pub fn adjusted_anr_threshold_ms(&self, power_save: bool, battery_fraction: f64) -> u64 {
        if power_save || battery_fraction < constants::LOW_BATTERY_FRACTION {
            self.anr_threshold_power_save_ms
        } else {
            self.anr_threshold_ms
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> anyhow::Result<CrashtrackerConfig> {
        CrashtrackerConfig::new(
            "https://crash.example.com".to_string(),
            PathBuf::from("/data/app"),
            PathBuf::from("/cache/app"),
            "com.example.app".to_string(),
        )
    }

    #[test]
    fn test_crashes_url_normalizes_trailing_slash() {
        let mut config = base().unwrap();
        config.endpoint = "https://crash.example.com/".to_string();
        assert_eq!(config.crashes_url(), "https://crash.example.com/api/crashes");
    }

    #[test]
    fn test_rejects_shared_dirs() {
        let result = CrashtrackerConfig::new(
            "https://crash.example.com".to_string(),
            PathBuf::from("/data/app"),
            PathBuf::from("/data/app"),
            "com.example.app".to_string(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_adjusted_threshold() {
        let config = base().unwrap();
        assert_eq!(config.adjusted_anr_threshold_ms(false, 0.80), 15_000);
        assert_eq!(config.adjusted_anr_threshold_ms(true, 0.80), 20_000);
        assert_eq!(config.adjusted_anr_threshold_ms(false, 0.04), 20_000);
    }
}
