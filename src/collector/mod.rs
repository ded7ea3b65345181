// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The native crash collector.
//!
//! This module implements the fault-context half of the crate: a signal
//! handler catching the fatal UNIX signals and recording the state of the
//! program at crash time.  The handler runs under a constrained environment
//! where many standard operations are illegal
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>; in
//! particular, memory allocation and mutexes are potentially UB.  Everything
//! the handler touches is therefore pre-allocated static memory, and its only
//! output is a single trailer file written with `open`/`write`/`close`, which
//! the next session parses back into a full crash record.
#![cfg(unix)]

pub mod crash_handler;
pub mod emitters;
pub mod fault_record;
pub mod siginfo_strings;

pub use crash_handler::{install_crash_handlers, restore_old_handlers};
pub use fault_record::{ArchFamily, FaultRecord, RegisterFile};

use std::hint::black_box;

/// Deliberately crashes the process; test hook for exercising the signal
/// path end to end.  Types mirror the platform bridge: 0 null write, 1 abort,
/// 2 arithmetic fault, 3 wild pointer write, 4 stack overflow.
pub fn trigger_native_crash(kind: u8) {
    match kind {
        0 => unsafe {
            std::ptr::null_mut::<i32>().write_volatile(42);
        },
        1 => unsafe {
            libc::abort();
        },
        // Rust integer division is checked and panics instead of faulting,
        // so raise the signal the division would have produced.
        2 => unsafe {
            libc::raise(libc::SIGFPE);
        },
        3 => unsafe {
            (0xDEADBEEF as *mut u8).write_volatile(b'x');
        },
        4 => {
            overflow_stack(0);
        }
        other => {
            tracing::warn!(kind = other, "unknown native crash type");
        }
    }
}

#[inline(never)]
fn overflow_stack(depth: u64) -> u64 {
    let frame = [depth; 128];
    if black_box(depth) == u64::MAX {
        return frame[0];
    }
    // The addition keeps this out of tail position, so every level holds a
    // live frame until the guard page is hit.
    overflow_stack(depth + 1) + black_box(frame)[0]
}
