// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embedding surface: process-wide entry points the host application and
//! its language bridges call.
//!
//! State lives behind a single registry owned by the orchestrator;
//! `initialize`/`shutdown` bracket the lifecycle explicitly so tests can
//! bring the reporter up and down with doubles instead of ambient globals.

use crate::breadcrumbs::Breadcrumb;
use crate::orchestrator::{self, Reporter};
use crate::shared::config::CrashtrackerConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Initializes the crash reporter and brings up all crash sources.
///
/// Idempotent: a second call while initialized is a no-op.
///
/// PRECONDITIONS:
///     `config.data_dir` and `config.cache_dir` must be writable.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
pub fn initialize(config: CrashtrackerConfig) -> anyhow::Result<()> {
    if orchestrator::global().is_some() {
        return Ok(());
    }
    let reporter = Reporter::new(config)?;
    reporter.start()?;
    orchestrator::set_global(reporter);
    Ok(())
}

/// Variant of [`initialize`] for hosts (and tests) that supply their own
/// device-state oracle and UI-thread probe.
pub fn initialize_with_components(
    config: CrashtrackerConfig,
    oracle: Arc<dyn crate::device_state::DeviceStateSource>,
    probe: Arc<dyn crate::anr::UiThreadProbe>,
) -> anyhow::Result<()> {
    if orchestrator::global().is_some() {
        return Ok(());
    }
    let reporter = Reporter::with_components(config, oracle, probe)?;
    reporter.start()?;
    orchestrator::set_global(reporter);
    Ok(())
}

pub fn is_initialized() -> bool {
    orchestrator::global().is_some()
}

/// Marks critical startup as complete; a crash after this no longer counts
/// as a startup crash for the next session.
pub fn mark_app_initialized() {
    with_reporter(|reporter| {
        if let Err(e) = reporter.mark_app_initialized() {
            warn!(error = %e, "failed to mark app initialized");
        }
    });
}

pub fn set_anr_threshold(threshold_ms: u64) {
    with_reporter(|reporter| {
        if let Err(e) = reporter.set_anr_threshold(threshold_ms) {
            warn!(error = %e, "failed to apply ANR threshold");
        }
    });
}

/// Suspends ANR detection across a cooperative long operation.
pub fn pause_anr_detection() {
    with_reporter(|reporter| reporter.pause_anr_detection());
}

pub fn resume_anr_detection() {
    with_reporter(|reporter| reporter.resume_anr_detection());
}

/// Kicks off an immediate, rate-limited drain of the pending queue.
pub fn send_pending_crashes_now() {
    with_reporter(|reporter| reporter.send_pending_crashes_now());
}

pub fn pending_crash_count() -> usize {
    orchestrator::global()
        .map(|reporter| reporter.pending_crash_count())
        .unwrap_or(0)
}

/// Records a crash reported by a host-language bridge.  `fatal` marks the
/// record unskippable for sampling.
pub fn handle_managed_exception(
    kind: &str,
    message: &str,
    stack_trace: &str,
    fatal: bool,
    custom_data: HashMap<String, String>,
) {
    with_reporter(|reporter| {
        reporter.handle_managed_exception(kind, message, stack_trace, fatal, custom_data)
    });
}

/// Deliberately crashes the process through the native signal path; test
/// hook only.  See [`crate::collector::trigger_native_crash`] for the types.
#[cfg(unix)]
pub fn trigger_native_crash(kind: u8) {
    crate::collector::trigger_native_crash(kind);
}

pub fn add_breadcrumb(category: &str, level: &str, message: &str) {
    with_reporter(|reporter| {
        reporter.add_breadcrumb(Breadcrumb::new(category, level, message))
    });
}

pub fn set_custom_data(key: &str, value: &str) {
    with_reporter(|reporter| reporter.set_custom_data(key.to_string(), value.to_string()));
}

/// Appends one application log line to the bounded tail attached to crash
/// records.
pub fn record_log_line(line: &str) {
    with_reporter(|reporter| reporter.record_log_line(line));
}

/// Host callback: memory pressure changed (informational ring).
pub fn report_memory_pressure(level: &str, description: &str) {
    with_reporter(|reporter| reporter.report_memory_pressure(level, description));
}

/// Host callback: connectivity changed.  `"lost"`/`"disconnected"` feed the
/// ANR validation engine's recent-loss clock.
pub fn report_network_change(kind: &str, description: &str) {
    with_reporter(|reporter| reporter.report_network_change(kind, description));
}

/// Host callback: screen state changed.  Logged for context only; detection
/// keeps running either way.
pub fn report_screen_state(screen_on: bool) {
    with_reporter(|reporter| reporter.report_screen_state(screen_on));
}

/// Tears the reporter down: stops the watchdog, flushes queued sends
/// best-effort, restores signal dispositions and clears the registry.
pub fn shutdown() {
    if let Some(reporter) = orchestrator::global() {
        orchestrator::clear_global();
        reporter.shutdown();
    }
}

fn with_reporter(f: impl FnOnce(&Arc<Reporter>)) {
    match orchestrator::global() {
        Some(reporter) => f(&reporter),
        None => warn!("crash reporter not initialized"),
    }
}
