// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::crash_info::{CrashReport, NativeCrashDetails, Severity, KIND_NATIVE_SIGNAL};
use crate::shared::constants::{
    TRAILER_MAGIC, TRAILER_MEMORY_DUMP, TRAILER_REGISTERS, TRAILER_STACKTRACE,
};
use anyhow::Context;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;

/// Everything recovered from one `native_crash.txt`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedNativeCrash {
    pub signal_name: String,
    pub signum: i32,
    pub description: String,
    pub code: i32,
    pub fault_address: Option<u64>,
    pub thread_name: String,
    pub pid: Option<u32>,
    pub tid: Option<i64>,
    pub time_secs: Option<i64>,
    pub frame_count: usize,
    pub registers: HashMap<String, u64>,
    pub stack_lines: Vec<String>,
    pub memory_dump: String,
}

/// The trailer is written in blocks; track which block we're in and collect
/// partial data until the section changes.
#[derive(Debug, PartialEq, Eq)]
enum Section {
    Header,
    Registers,
    StackTrace,
    MemoryDump,
}

/// Parses the frozen trailer format emitted by the signal handler.
///
/// The parser is deliberately forgiving below the header: a truncated file
/// (the process died mid-write) still yields a usable record from whatever
/// sections completed.
pub fn parse_trailer(contents: &str) -> anyhow::Result<ParsedNativeCrash> {
    let mut lines = contents.lines();
    let first = lines.next().context("empty trailer")?;
    anyhow::ensure!(
        first.trim() == TRAILER_MAGIC,
        "not a native crash trailer: {first}"
    );

    let mut parsed = ParsedNativeCrash::default();
    let mut section = Section::Header;

    for line in lines {
        match line.trim_end() {
            l if l == TRAILER_REGISTERS => {
                section = Section::Registers;
                continue;
            }
            l if l == TRAILER_STACKTRACE => {
                section = Section::StackTrace;
                continue;
            }
            l if l == TRAILER_MEMORY_DUMP => {
                section = Section::MemoryDump;
                continue;
            }
            "" => continue,
            _ => {}
        }

        match section {
            Section::Header => parse_header_line(&mut parsed, line),
            Section::Registers => parse_register_line(&mut parsed, line),
            Section::StackTrace => {
                if line.starts_with('#') {
                    parsed.stack_lines.push(line.trim_end().to_string());
                }
            }
            Section::MemoryDump => {
                parsed.memory_dump.push_str(line.trim_end());
                parsed.memory_dump.push('\n');
            }
        }
    }

    anyhow::ensure!(
        !parsed.signal_name.is_empty(),
        "trailer header missing signal"
    );
    Ok(parsed)
}

fn parse_header_line(parsed: &mut ParsedNativeCrash, line: &str) {
    let Some((key, value)) = line.split_once(':') else {
        return;
    };
    let value = value.trim();
    match key.trim() {
        "Signal" => {
            // "SIGSEGV (11)"
            let mut parts = value.splitn(2, ' ');
            parsed.signal_name = parts.next().unwrap_or_default().to_string();
            parsed.signum = parts
                .next()
                .and_then(|p| p.trim_matches(['(', ')']).parse().ok())
                .unwrap_or(0);
        }
        "Description" => parsed.description = value.to_string(),
        "Code" => parsed.code = value.parse().unwrap_or(0),
        "Fault Address" => {
            parsed.fault_address = parse_hex(value).filter(|&addr| addr != 0);
        }
        "Thread" => parsed.thread_name = value.to_string(),
        "PID" => parsed.pid = value.parse().ok(),
        "TID" => parsed.tid = value.parse().ok(),
        "Time" => parsed.time_secs = value.parse().ok(),
        "Frame Count" => parsed.frame_count = value.parse().unwrap_or(0),
        _ => {}
    }
}

fn parse_register_line(parsed: &mut ParsedNativeCrash, line: &str) {
    let Some((name, value)) = line.trim().split_once(':') else {
        return;
    };
    if let Some(value) = parse_hex(value.trim()) {
        parsed.registers.insert(name.trim().to_string(), value);
    }
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

impl ParsedNativeCrash {
    /// Lifts the parsed trailer into the common crash-record shape.  The
    /// record is Critical by construction: the process died on a signal.
    pub fn into_crash_report(self) -> CrashReport {
        let mut report = CrashReport::new(KIND_NATIVE_SIGNAL);
        if let Some(secs) = self.time_secs {
            if let Some(ts) = Utc.timestamp_opt(secs, 0).single() {
                report.timestamp = ts;
            }
        }
        report.exception_message = format!("{}: {}", self.signal_name, self.description);
        report.stack_trace = self.stack_lines.join("\n");
        report.thread_name = self.thread_name;
        report.process.pid = self.pid;
        report.severity = Severity::Critical;
        report.native = Some(NativeCrashDetails {
            signal_name: self.signal_name,
            fault_address: self.fault_address,
            registers: self.registers,
            memory_dump: self.memory_dump,
        });
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRAILER: &str = "\
NATIVE_CRASH
Signal: SIGSEGV (11)
Description: Segmentation fault (invalid memory access)
Code: 1
Fault Address: 0xdeadbeef
Thread: render-thread
PID: 4242
TID: 4243
Time: 1756771200
Frame Count: 3

REGISTERS:
  pc: 0000aaaabbbbcccc
  sp: 00007fff00001000
  lr: 0000000000000000
  x0: 0000000000000001

STACK TRACE:
#000 pc 0xaaaabbbbcccc /data/app/lib/libgame.so (render_frame+0x24)
#001 pc 0xaaaabbbbdddd /data/app/lib/libgame.so (game_loop+0x100)
#002 pc 0x7f0012345678 ???

MEMORY DUMP:
Before fault address (0xdeadbeef - 256):
0000: de ad be ef de ad be ef de ad be ef de ad be ef
After fault address (0xdeadbeef):
0000: 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00
";

    #[test]
    fn test_parse_full_trailer() {
        let parsed = parse_trailer(TRAILER).unwrap();
        assert_eq!(parsed.signal_name, "SIGSEGV");
        assert_eq!(parsed.signum, 11);
        assert_eq!(
            parsed.description,
            "Segmentation fault (invalid memory access)"
        );
        assert_eq!(parsed.fault_address, Some(0xdeadbeef));
        assert_eq!(parsed.thread_name, "render-thread");
        assert_eq!(parsed.pid, Some(4242));
        assert_eq!(parsed.frame_count, 3);
        assert_eq!(parsed.registers.get("pc"), Some(&0xaaaa_bbbb_cccc));
        assert_eq!(parsed.registers.get("x0"), Some(&1));
        assert_eq!(parsed.stack_lines.len(), 3);
        assert!(parsed.stack_lines[0].contains("render_frame+0x24"));
        assert!(parsed.memory_dump.contains("Before fault address"));
    }

    #[test]
    fn test_truncated_trailer_still_usable() {
        // Cut mid-way through the stack trace, as if the process died while
        // writing.
        let cut = TRAILER.split("#001").next().unwrap();
        let parsed = parse_trailer(cut).unwrap();
        assert_eq!(parsed.signal_name, "SIGSEGV");
        assert_eq!(parsed.stack_lines.len(), 1);
        assert!(parsed.memory_dump.is_empty());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_trailer("").is_err());
        assert!(parse_trailer("some log line\nanother\n").is_err());
    }

    #[test]
    fn test_into_crash_report() {
        let report = parse_trailer(TRAILER).unwrap().into_crash_report();
        assert_eq!(report.exception_kind, KIND_NATIVE_SIGNAL);
        assert_eq!(report.severity, Severity::Critical);
        assert!(report.is_fatal());
        assert_eq!(
            report.exception_message,
            "SIGSEGV: Segmentation fault (invalid memory access)"
        );
        let native = report.native.as_ref().unwrap();
        assert_eq!(native.signal_name, "SIGSEGV");
        assert_eq!(native.fault_address, Some(0xdeadbeef));
        assert_eq!(native.registers.len(), 4);
        assert_eq!(report.timestamp.timestamp(), 1_756_771_200);
    }
}
