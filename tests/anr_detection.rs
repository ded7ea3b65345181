// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end ANR scenarios at millisecond scale: a real hang is persisted
//! and posted, rejected hangs stay silent, and the cooldown keeps one hang
//! from producing a storm.

mod common;

use common::{assert_hits_stable, test_config, wait_for_hits};
use datadog_mobile_crashtracker::anr::{ChannelUiProbe, UiThreadProbe};
use datadog_mobile_crashtracker::device_state::{FixedStateSource, ProcessImportance};
use datadog_mobile_crashtracker::orchestrator::Reporter;
use httpmock::{Method::POST, MockServer};
use std::sync::Arc;
use std::time::Duration;

fn anr_reporter(
    server: &MockServer,
    root: &std::path::Path,
    oracle: FixedStateSource,
) -> (Arc<ChannelUiProbe>, Arc<Reporter>) {
    let mut config = test_config(&server.base_url(), root);
    config.enable_anr_detection = true;
    let probe = Arc::new(ChannelUiProbe::spawn("main"));
    let reporter = Reporter::with_components(
        config,
        Arc::new(oracle),
        Arc::clone(&probe) as Arc<dyn UiThreadProbe>,
    )
    .unwrap();
    reporter.start().unwrap();
    (probe, reporter)
}

#[test]
fn test_real_anr_persisted_and_posted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .header("x-crash-severity", "Critical")
            .body_contains("\"is_anr\":true");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let (probe, reporter) = anr_reporter(&server, root.path(), FixedStateSource::default());

    // Block the UI-equivalent thread well past the 120 ms test threshold.
    probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));

    wait_for_hits(&mock, 1, Duration::from_secs(5));
    // Delivered records land in sent/: persistence preceded the POST.
    let sent_dir = root.path().join("data/crashes/sent");
    assert_eq!(std::fs::read_dir(sent_dir).unwrap().count(), 1);
    reporter.shutdown();
}

#[test]
fn test_screen_off_anr_not_posted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/crashes");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let oracle = FixedStateSource {
        screen_on: false,
        ..FixedStateSource::default()
    };
    let (probe, reporter) = anr_reporter(&server, root.path(), oracle);

    probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));

    assert_hits_stable(&mock, 0, Duration::from_millis(700));
    assert_eq!(reporter.pending_crash_count(), 0);
    reporter.shutdown();
}

#[test]
fn test_background_anr_not_posted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/crashes");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let oracle = FixedStateSource {
        importance: ProcessImportance::Background,
        ..FixedStateSource::default()
    };
    let (probe, reporter) = anr_reporter(&server, root.path(), oracle);

    probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));

    assert_hits_stable(&mock, 0, Duration::from_millis(700));
    reporter.shutdown();
}

#[test]
fn test_cooldown_limits_to_one_report() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/crashes");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let (probe, reporter) = anr_reporter(&server, root.path(), FixedStateSource::default());

    // One long hang spanning several detection cycles.
    probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(500))));

    wait_for_hits(&mock, 1, Duration::from_secs(5));
    assert_hits_stable(&mock, 1, Duration::from_millis(400));
    reporter.shutdown();
}

#[test]
fn test_paused_watchdog_reports_nothing() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/crashes");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let (probe, reporter) = anr_reporter(&server, root.path(), FixedStateSource::default());

    reporter.pause_anr_detection();
    probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));
    assert_hits_stable(&mock, 0, Duration::from_millis(700));

    // Resume re-primes the ping: the finished hang must not be reported
    // retroactively.
    reporter.resume_anr_detection();
    assert_hits_stable(&mock, 0, Duration::from_millis(400));
    reporter.shutdown();
}
