// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg(unix)]

/// Symbolic name for the signals the collector registers for.  Static strings
/// only: this is called from the signal handler.
pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGABRT => "SIGABRT",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGBUS => "SIGBUS",
        libc::SIGTRAP => "SIGTRAP",
        _ => "UNKNOWN",
    }
}

/// Human-readable description carried in the trailer header and shown on the
/// parsed record.
pub fn signal_description(signum: i32) -> &'static str {
    match signum {
        libc::SIGSEGV => "Segmentation fault (invalid memory access)",
        libc::SIGABRT => "Abort signal (abnormal termination)",
        libc::SIGFPE => "Floating point exception",
        libc::SIGILL => "Illegal instruction",
        libc::SIGBUS => "Bus error (invalid memory alignment)",
        libc::SIGTRAP => "Trace/breakpoint trap",
        _ => "Unknown signal",
    }
}

/// Inverse of [`signal_name`], used when parsing a trailer back.
pub fn signal_number(name: &str) -> Option<i32> {
    match name {
        "SIGSEGV" => Some(libc::SIGSEGV),
        "SIGABRT" => Some(libc::SIGABRT),
        "SIGFPE" => Some(libc::SIGFPE),
        "SIGILL" => Some(libc::SIGILL),
        "SIGBUS" => Some(libc::SIGBUS),
        "SIGTRAP" => Some(libc::SIGTRAP),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_number_round_trip() {
        for signum in [
            libc::SIGSEGV,
            libc::SIGABRT,
            libc::SIGFPE,
            libc::SIGILL,
            libc::SIGBUS,
            libc::SIGTRAP,
        ] {
            assert_eq!(signal_number(signal_name(signum)), Some(signum));
        }
        assert_eq!(signal_name(libc::SIGHUP), "UNKNOWN");
        assert_eq!(signal_number("UNKNOWN"), None);
    }
}
