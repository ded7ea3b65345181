// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trailer emission.
//!
//! The output schema is frozen; the next session parses it back in
//! [`crate::receiver`]:
//!
//! ```text
//! NATIVE_CRASH
//! Signal: SIGSEGV (11)
//! Description: Segmentation fault (invalid memory access)
//! Code: 1
//! Fault Address: 0xdeadbeef
//! Thread: main
//! PID: 4242
//! TID: 4242
//! Time: 1756771200
//! Frame Count: 12
//!
//! REGISTERS:
//!   pc: 0000aaaabbbbcccc
//!   ...
//!
//! STACK TRACE:
//! #000 pc 0xaaaabbbbcccc /lib/libfoo.so (bar+0x12)
//!
//! MEMORY DUMP:
//! Before fault address (0xdeadbeef - 256):
//! 0000: de ad be ef ...
//! After fault address (0xdeadbeef):
//! 0000: ...
//! ```
//!
//! SIGNAL SAFETY:
//!     Everything here writes integers and static strings through the
//!     handle; the only lookups are `dladdr` calls per frame, which read
//!     loader metadata without allocating.  No floats, no heap.
#![cfg(unix)]

use crate::collector::fault_record::FaultRecord;
use crate::collector::siginfo_strings::{signal_description, signal_name};
use crate::shared::constants::{
    MEMORY_DUMP_BYTES, TRAILER_MAGIC, TRAILER_MEMORY_DUMP, TRAILER_REGISTERS, TRAILER_STACKTRACE,
};
use std::ffi::CStr;
use std::io::Write;

pub(crate) fn emit_fault_trailer(w: &mut impl Write, record: &FaultRecord) -> std::io::Result<()> {
    emit_header(w, record)?;
    emit_registers(w, record)?;
    emit_stack_trace(w, record)?;
    if record.memory_readable {
        emit_memory_dump(w, record)?;
    }
    w.flush()
}

fn emit_header(w: &mut impl Write, record: &FaultRecord) -> std::io::Result<()> {
    writeln!(w, "{TRAILER_MAGIC}")?;
    writeln!(
        w,
        "Signal: {} ({})",
        signal_name(record.signum),
        record.signum
    )?;
    writeln!(w, "Description: {}", signal_description(record.signum))?;
    writeln!(w, "Code: {}", record.code)?;
    writeln!(w, "Fault Address: 0x{:x}", record.fault_addr)?;
    w.write_all(b"Thread: ")?;
    w.write_all(record.thread_name_bytes())?;
    writeln!(w)?;
    writeln!(w, "PID: {}", record.pid)?;
    writeln!(w, "TID: {}", record.tid)?;
    writeln!(w, "Time: {}", record.time_secs)?;
    writeln!(w, "Frame Count: {}", record.frame_count)?;
    writeln!(w)
}

fn emit_registers(w: &mut impl Write, record: &FaultRecord) -> std::io::Result<()> {
    let regs = &record.registers;
    writeln!(w, "{TRAILER_REGISTERS}")?;
    writeln!(w, "  pc: {:016x}", regs.pc)?;
    writeln!(w, "  sp: {:016x}", regs.sp)?;
    writeln!(w, "  lr: {:016x}", regs.lr)?;
    writeln!(w, "  {}: {:016x}", regs.arch.status_name(), regs.status)?;
    for i in 0..regs.gp_count {
        writeln!(w, "  {}: {:016x}", regs.arch.gp_name(i), regs.gp[i])?;
    }
    writeln!(w)
}

fn emit_stack_trace(w: &mut impl Write, record: &FaultRecord) -> std::io::Result<()> {
    writeln!(w, "{TRAILER_STACKTRACE}")?;
    for (i, &addr) in record.frames[..record.frame_count].iter().enumerate() {
        write!(w, "#{i:03} pc 0x{addr:x} ")?;
        emit_resolved_frame(w, addr)?;
        writeln!(w)?;
    }
    writeln!(w)
}

/// Resolves one address to library + symbol + offset via `dladdr` and writes
/// it inline.  Unresolvable pieces degrade to `???` like the platform's own
/// tombstones.  Also used by the all-thread snapshotter, which formats the
/// same frame lines outside the fault context.
pub(crate) fn emit_resolved_frame(w: &mut impl Write, addr: usize) -> std::io::Result<()> {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let resolved = unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) };
    if resolved == 0 || info.dli_fname.is_null() {
        return w.write_all(b"???");
    }

    let fname = unsafe { CStr::from_ptr(info.dli_fname) };
    w.write_all(fname.to_bytes())?;

    if info.dli_sname.is_null() {
        return Ok(());
    }
    let sname = unsafe { CStr::from_ptr(info.dli_sname) };
    let offset = addr.saturating_sub(info.dli_saddr as usize);
    w.write_all(b" (")?;
    w.write_all(sname.to_bytes())?;
    write!(w, "+0x{offset:x})")
}

fn emit_memory_dump(w: &mut impl Write, record: &FaultRecord) -> std::io::Result<()> {
    writeln!(w, "{TRAILER_MEMORY_DUMP}")?;
    writeln!(
        w,
        "Before fault address (0x{:x} - {}):",
        record.fault_addr, MEMORY_DUMP_BYTES
    )?;
    emit_hex_block(w, &record.memory_before)?;
    writeln!(w, "After fault address (0x{:x}):", record.fault_addr)?;
    emit_hex_block(w, &record.memory_after)
}

fn emit_hex_block(w: &mut impl Write, bytes: &[u8]) -> std::io::Result<()> {
    for (offset, chunk) in bytes.chunks(16).enumerate() {
        write!(w, "{:04x}:", offset * 16)?;
        for byte in chunk {
            write!(w, " {byte:02x}")?;
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fault_record::ArchFamily;

    fn sample_record() -> FaultRecord {
        let mut record = FaultRecord::zeroed();
        record.signum = libc::SIGSEGV;
        record.code = 1;
        record.fault_addr = 0xdeadbeef;
        record.pid = 4242;
        record.tid = 4243;
        record.time_secs = 1_756_771_200;
        let name = b"render-thread";
        record.thread_name[..name.len()].copy_from_slice(name);
        record.thread_name_len = name.len();
        record.registers.arch = ArchFamily::current();
        record.registers.pc = 0xaaaa_bbbb_cccc;
        record.registers.sp = 0x7fff_0000_1000;
        record.registers.gp_count = 2;
        record.registers.gp[0] = 0x1;
        record.registers.gp[1] = 0x2;
        record.frames[0] = sample_record as usize;
        record.frames[1] = 0x1234;
        record.frame_count = 2;
        record
    }

    #[test]
    fn test_trailer_sections_present() {
        let mut out = Vec::new();
        emit_fault_trailer(&mut out, &sample_record()).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("NATIVE_CRASH\n"));
        assert!(text.contains("Signal: SIGSEGV (11)"));
        assert!(text.contains("Description: Segmentation fault (invalid memory access)"));
        assert!(text.contains("Fault Address: 0xdeadbeef"));
        assert!(text.contains("Thread: render-thread"));
        assert!(text.contains("Frame Count: 2"));
        assert!(text.contains("REGISTERS:"));
        assert!(text.contains("  pc: 0000aaaabbbbcccc"));
        assert!(text.contains("STACK TRACE:"));
        assert!(text.contains("#000 pc 0x"));
        assert!(text.contains("#001 pc 0x1234"));
        // Memory was not readable, so no dump section.
        assert!(!text.contains("MEMORY DUMP:"));
    }

    #[test]
    fn test_memory_dump_format() {
        let mut record = sample_record();
        record.memory_readable = true;
        record.memory_before = [0xde; MEMORY_DUMP_BYTES];
        record.memory_after = [0xad; MEMORY_DUMP_BYTES];
        let mut out = Vec::new();
        emit_fault_trailer(&mut out, &record).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("MEMORY DUMP:"));
        assert!(text.contains("Before fault address (0xdeadbeef - 256):"));
        assert!(text.contains("After fault address (0xdeadbeef):"));
        assert!(text.contains("0000: de de de de"));
        assert!(text.contains("00f0: ad ad ad ad"));
    }

    #[test]
    fn test_known_symbol_resolves() {
        let mut out = Vec::new();
        // A libc symbol is as close to guaranteed-resolvable as it gets.
        emit_resolved_frame(&mut out, libc::getpid as usize).unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(!text.is_empty());
        assert_ne!(text, "???");
    }
}
