// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A trailer file left by a crashed session is parsed at the next start,
//! dispatched as a Critical record, and removed once its contents are safe.

mod common;

use common::{test_config, wait_for_hits};
use datadog_mobile_crashtracker::orchestrator::Reporter;
use httpmock::{Method::POST, MockServer};
use std::time::Duration;

const TRAILER: &str = "\
NATIVE_CRASH
Signal: SIGSEGV (11)
Description: Segmentation fault (invalid memory access)
Code: 1
Fault Address: 0xdeadbeef
Thread: main
PID: 4242
TID: 4242
Time: 1756771200
Frame Count: 2

REGISTERS:
  pc: 0000aaaabbbbcccc
  sp: 00007fff00001000
  lr: 0000000000000000

STACK TRACE:
#000 pc 0xaaaabbbbcccc /data/app/lib/libgame.so (render_frame+0x24)
#001 pc 0x7f0012345678 ???

MEMORY DUMP:
Before fault address (0xdeadbeef - 256):
0000: de ad be ef de ad be ef de ad be ef de ad be ef
After fault address (0xdeadbeef):
0000: 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00
";

#[test]
fn test_trailer_ingested_posted_and_deleted() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .header("x-crash-severity", "Critical")
            .body_contains("\"signal_name\":\"SIGSEGV\"")
            .body_contains("\"fault_address\":3735928559");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let config = test_config(&server.base_url(), root.path());
    let trailer_path = config.trailer_path();
    std::fs::create_dir_all(trailer_path.parent().unwrap()).unwrap();
    std::fs::write(&trailer_path, TRAILER).unwrap();

    let reporter = Reporter::new(config).unwrap();
    reporter.start().unwrap();

    wait_for_hits(&mock, 1, Duration::from_secs(5));
    // Success: trailer gone, record acknowledged.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while trailer_path.exists() {
        assert!(std::time::Instant::now() < deadline, "trailer not deleted");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(reporter.pending_crash_count(), 0);
    reporter.shutdown();
}

#[test]
fn test_malformed_trailer_discarded_without_post() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/api/crashes");
        then.status(200);
    });
    let root = tempfile::tempdir().unwrap();
    let config = test_config(&server.base_url(), root.path());
    let trailer_path = config.trailer_path();
    std::fs::create_dir_all(trailer_path.parent().unwrap()).unwrap();
    std::fs::write(&trailer_path, "garbage\nnot a trailer\n").unwrap();

    let reporter = Reporter::new(config).unwrap();
    reporter.start().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while trailer_path.exists() {
        assert!(std::time::Instant::now() < deadline, "trailer not deleted");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(mock.hits(), 0);
    assert_eq!(reporter.pending_crash_count(), 0);
    reporter.shutdown();
}
