// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed limits, windows and file names shared across the crate.
//!
//! The trailer file layout (see [`crate::collector::emitters`]) is frozen:
//! the next session parses it back with [`crate::receiver`], so any change
//! here is a wire-format change.

/// First line of the native crash trailer file.
pub const TRAILER_MAGIC: &str = "NATIVE_CRASH";
/// Section header for the register dump.
pub const TRAILER_REGISTERS: &str = "REGISTERS:";
/// Section header for the stack trace.
pub const TRAILER_STACKTRACE: &str = "STACK TRACE:";
/// Section header for the optional memory dump.
pub const TRAILER_MEMORY_DUMP: &str = "MEMORY DUMP:";

/// Name of the single-file native-crash trailer inside the crash directory.
pub const NATIVE_CRASH_FILE: &str = "native_crash.txt";
/// Name of the persistent fingerprint map inside the cache directory.
pub const FINGERPRINT_FILE: &str = "crash_fingerprints.json";
/// Name of the startup/loop detector state file inside the crash directory.
pub const STARTUP_STATE_FILE: &str = "startup_state.json";

/// Maximum raw code addresses captured during the in-fault unwind.
pub const MAX_STACK_FRAMES: usize = 128;
/// Bytes captured before and after the fault address.
pub const MEMORY_DUMP_BYTES: usize = 256;

/// Live threads enumerated into the all-thread snapshot list (the wire cap
/// is lower, see `MAX_THREADS`).
pub const MAX_CAPTURED_THREADS: usize = 16;

/// Ring capacity for breadcrumbs held in memory.
pub const BREADCRUMB_CAPACITY: usize = 100;
/// Ring capacity for the recent-log tail held in memory.
pub const LOG_TAIL_CAPACITY: usize = 50;
/// Ring capacity for memory-warning and network-change events held in memory.
pub const STATE_EVENT_CAPACITY: usize = 32;
/// Custom key/value entries held in memory (the wire cap is lower).
pub const CUSTOM_DATA_CAPACITY: usize = 64;

/// Payload caps applied by the optimizer to every outgoing record.
pub const MAX_STACK_TRACE_LINES: usize = 100;
pub const MAX_THREADS: usize = 5;
pub const MAX_BREADCRUMBS: usize = 20;
pub const MAX_STATE_EVENTS: usize = 10;
pub const MAX_CUSTOM_DATA_KEYS: usize = 20;
pub const MAX_STRING_CHARS: usize = 4000;
pub const MAX_MEMORY_DUMP_CHARS: usize = 1000;

/// A fingerprint reported within this window is a duplicate.
pub const FINGERPRINT_WINDOW_MS: u64 = 7 * 24 * 60 * 60 * 1000;
/// Delivered payloads are retained in `sent/` for this long.
pub const SENT_RETENTION_MS: u64 = 7 * 24 * 60 * 60 * 1000;

/// A crash this soon after `mark_started` counts as a startup crash.
pub const STARTUP_CRASH_WINDOW_MS: u64 = 5_000;
/// Crash-loop detection window, anchored at session start.
pub const CRASH_LOOP_WINDOW_MS: u64 = 60_000;
/// Startup crashes within the window before the loop flag trips.
pub const CRASH_LOOP_THRESHOLD: u32 = 3;
/// Startup crashes within the window before reporting is disabled entirely.
pub const SAFETY_BRAKE_THRESHOLD: u32 = 5;

/// ANR threshold under normal power conditions.
pub const ANR_THRESHOLD_MS: u64 = 15_000;
/// ANR threshold in power-save mode or with battery below 5%.
pub const ANR_THRESHOLD_POWER_SAVE_MS: u64 = 20_000;
/// Minimum time between two ANR reports from the watchdog.
pub const ANR_COOLDOWN_MS: u64 = 30_000;
/// A network loss within this window rejects short ANRs.
pub const NETWORK_LOSS_WINDOW_MS: u64 = 30_000;
/// Battery fraction below which the power-save threshold applies.
pub const LOW_BATTERY_FRACTION: f64 = 0.05;

/// Fraction of non-fatal, non-duplicate crashes that are sent.
pub const DEFAULT_SAMPLE_RATE: f64 = 0.15;

/// Sender pacing.
pub const RETRY_BASE_DELAY_MS: u64 = 5_000;
pub const RETRY_DELAY_CAP_MS: u64 = 60_000;
pub const MAX_RETRIES: u32 = 3;
pub const BATCH_CAPACITY: usize = 100;
pub const BATCH_FLUSH_SIZE: usize = 10;
pub const BATCH_FLUSH_INTERVAL_MS: u64 = 60_000;
pub const PENDING_MAX_PER_MINUTE: u32 = 10;
pub const HTTP_TIMEOUT_MS: u64 = 30_000;
