// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash capture, grouping and durable delivery for mobile runtimes.
//!
//! Architecturally, the crate is built out of five cooperating pieces:
//! 1. Crash sources: a POSIX signal handler for native faults (SIGSEGV,
//!    SIGABRT, SIGFPE, SIGILL, SIGBUS, SIGTRAP), a process-wide panic hook for
//!    managed exceptions, and a watchdog thread that detects a blocked
//!    UI-equivalent thread (ANR).  The signal handler runs under a constrained
//!    environment where many standard operations are illegal
//!    <https://man7.org/linux/man-pages/man7/signal-safety.7.html>; it records
//!    into pre-allocated static memory and writes a single trailer file which
//!    is parsed on the next session.
//! 2. Grouping and cost control: fingerprint, issue title, severity,
//!    per-fingerprint deduplication (in-session and durable across sessions),
//!    sampling of non-fatal crashes, and deterministic payload shrinking plus
//!    secret scrubbing before anything leaves the device.
//! 3. A durable directory-backed crash store: every report is persisted to
//!    `pending/` before any network call, and moved to `sent/` only after a
//!    2xx from the ingestion endpoint.
//! 4. A sender with exponential-backoff retry, a bounded batch queue for
//!    non-fatal reports, and a rate-limited drain of `pending/` at startup.
//! 5. An orchestrator owning the lifecycle of all of the above, including the
//!    startup-crash / crash-loop safety brake that stops the reporter from
//!    amplifying its own failures.

pub mod anr;
pub mod breadcrumbs;
#[cfg(unix)]
pub mod collector;
pub mod crash_info;
pub mod crash_store;
pub mod device_state;
pub mod exception_handler;
pub mod fingerprint_store;
pub mod grouping;
pub mod op_tracker;
pub mod optimizer;
pub mod orchestrator;
pub mod receiver;
pub mod sender;
pub mod shared;
pub mod startup_tracker;
pub mod thread_snapshot;

mod api;

pub use api::{
    add_breadcrumb, handle_managed_exception, initialize, initialize_with_components,
    is_initialized, mark_app_initialized, pause_anr_detection, pending_crash_count,
    record_log_line, report_memory_pressure, report_network_change, report_screen_state,
    resume_anr_detection, send_pending_crashes_now, set_anr_threshold, set_custom_data, shutdown,
};
#[cfg(unix)]
pub use api::trigger_native_crash;
pub use crash_info::{CrashReport, Severity};
pub use shared::config::CrashtrackerConfig;
