// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The wire contract, observed at the HTTP boundary: secrets never leave the
//! device and oversized inputs arrive shrunk.

mod common;

use common::{test_config, wait_for_hits};
use datadog_mobile_crashtracker::orchestrator::Reporter;
use httpmock::{Method::POST, MockServer};
use std::collections::HashMap;
use std::time::Duration;

#[test]
fn test_secrets_and_emails_never_posted() {
    let server = MockServer::start();
    let delivered = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .body_contains("[REDACTED]");
        then.status(200);
    });
    let leaked_password = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .body_contains("hunter2");
        then.status(200);
    });
    let leaked_email = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .body_contains("user@example.com");
        then.status(200);
    });

    let root = tempfile::tempdir().unwrap();
    let reporter = Reporter::new(test_config(&server.base_url(), root.path())).unwrap();
    reporter.start().unwrap();

    let mut custom_data = HashMap::new();
    custom_data.insert(
        "request".to_string(),
        "POST /login user=user@example.com password=hunter2".to_string(),
    );
    custom_data.insert(
        "auth".to_string(),
        "Bearer eyJhbGciOiJIUzI1NiJ9.payload.sig".to_string(),
    );
    reporter.handle_managed_exception(
        "java.lang.SecurityException",
        "auth failed for user@example.com with password=hunter2",
        &common::managed_stack("Login"),
        true,
        custom_data,
    );

    wait_for_hits(&delivered, 1, Duration::from_secs(5));
    assert_eq!(leaked_password.hits(), 0, "password leaked to the wire");
    assert_eq!(leaked_email.hits(), 0, "email leaked to the wire");
    reporter.shutdown();
}

#[test]
fn test_oversized_record_arrives_shrunk() {
    let server = MockServer::start();
    let delivered = server.mock(|when, then| {
        when.method(POST)
            .path("/api/crashes")
            .body_contains("[stack trace truncated]")
            .body_contains("... [truncated]");
        then.status(200);
    });

    let root = tempfile::tempdir().unwrap();
    let reporter = Reporter::new(test_config(&server.base_url(), root.path())).unwrap();
    reporter.start().unwrap();

    let huge_stack: String = (0..500)
        .map(|i| format!("at com.example.deep.Layer{i}.call(Layer.kt:{i})"))
        .collect::<Vec<_>>()
        .join("\n");
    let mut custom_data = HashMap::new();
    custom_data.insert("payload".to_string(), "z".repeat(9_000));
    reporter.handle_managed_exception(
        "java.lang.StackOverflowError",
        "deep recursion",
        &huge_stack,
        true,
        custom_data,
    );

    wait_for_hits(&delivered, 1, Duration::from_secs(5));
    reporter.shutdown();
}
