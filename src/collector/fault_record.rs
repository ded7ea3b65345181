// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The fixed, pre-allocated record the signal handler fills in.
//!
//! Nothing in this module allocates.  The record lives in static memory (see
//! [`crate::collector::crash_handler`]); every capture routine writes into
//! fixed-size buffers using only async-signal-safe calls.
#![cfg(unix)]

use crate::shared::constants::{MAX_STACK_FRAMES, MEMORY_DUMP_BYTES};

pub const THREAD_NAME_LEN: usize = 64;
/// General-purpose register slots; large enough for every supported family.
pub const MAX_GP_REGS: usize = 32;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArchFamily {
    Aarch64,
    X86_64,
    Other,
}

const AARCH64_GP_NAMES: [&str; 31] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30",
];

const X86_64_GP_NAMES: [&str; 15] = [
    "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15",
];

impl ArchFamily {
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            ArchFamily::Aarch64
        }
        #[cfg(target_arch = "x86_64")]
        {
            ArchFamily::X86_64
        }
        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
        {
            ArchFamily::Other
        }
    }

    /// Stable name of general-purpose register `i` as it appears in the
    /// trailer.
    pub fn gp_name(&self, i: usize) -> &'static str {
        match self {
            ArchFamily::Aarch64 => AARCH64_GP_NAMES.get(i).copied().unwrap_or("?"),
            ArchFamily::X86_64 => X86_64_GP_NAMES.get(i).copied().unwrap_or("?"),
            ArchFamily::Other => "?",
        }
    }

    /// Name of the status register for this family.
    pub fn status_name(&self) -> &'static str {
        match self {
            ArchFamily::Aarch64 => "cpsr",
            ArchFamily::X86_64 => "eflags",
            ArchFamily::Other => "status",
        }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct RegisterFile {
    pub pc: u64,
    pub sp: u64,
    pub lr: u64,
    pub status: u64,
    pub gp: [u64; MAX_GP_REGS],
    pub gp_count: usize,
    pub arch: ArchFamily,
}

impl RegisterFile {
    pub const fn zeroed() -> Self {
        Self {
            pc: 0,
            sp: 0,
            lr: 0,
            status: 0,
            gp: [0; MAX_GP_REGS],
            gp_count: 0,
            arch: ArchFamily::Other,
        }
    }
}

#[derive(Debug)]
pub struct FaultRecord {
    pub signum: i32,
    pub code: i32,
    pub fault_addr: usize,
    pub pid: i32,
    pub tid: i64,
    pub time_secs: i64,
    pub thread_name: [u8; THREAD_NAME_LEN],
    pub thread_name_len: usize,
    pub registers: RegisterFile,
    pub frames: [usize; MAX_STACK_FRAMES],
    pub frame_count: usize,
    pub memory_before: [u8; MEMORY_DUMP_BYTES],
    pub memory_after: [u8; MEMORY_DUMP_BYTES],
    pub memory_readable: bool,
}

impl FaultRecord {
    pub const fn zeroed() -> Self {
        Self {
            signum: 0,
            code: 0,
            fault_addr: 0,
            pid: 0,
            tid: 0,
            time_secs: 0,
            thread_name: [0; THREAD_NAME_LEN],
            thread_name_len: 0,
            registers: RegisterFile::zeroed(),
            frames: [0; MAX_STACK_FRAMES],
            frame_count: 0,
            memory_before: [0; MEMORY_DUMP_BYTES],
            memory_after: [0; MEMORY_DUMP_BYTES],
            memory_readable: false,
        }
    }

    pub fn thread_name_bytes(&self) -> &[u8] {
        &self.thread_name[..self.thread_name_len]
    }
}

/// Fills identity fields from the fault context.
///
/// SIGNAL SAFETY:
///     `getpid`, `gettid` and `clock_gettime` are async-signal-safe;
///     `pthread_getname_np` only reads thread-local storage.
pub unsafe fn capture_identity(record: &mut FaultRecord, signum: i32, info: *const libc::siginfo_t) {
    record.signum = signum;
    if !info.is_null() {
        record.code = (*info).si_code;
        if signum == libc::SIGSEGV || signum == libc::SIGBUS {
            record.fault_addr = (*info).si_addr() as usize;
        }
    }
    record.pid = libc::getpid();
    record.tid = current_tid();
    record.time_secs = libc::time(std::ptr::null_mut()) as i64;
    capture_thread_name(record);
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn current_tid() -> i64 {
    unsafe { libc::gettid() as i64 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn current_tid() -> i64 {
    0
}

unsafe fn capture_thread_name(record: &mut FaultRecord) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let rval = libc::pthread_getname_np(
            libc::pthread_self(),
            record.thread_name.as_mut_ptr() as *mut libc::c_char,
            THREAD_NAME_LEN,
        );
        if rval == 0 {
            record.thread_name_len = record
                .thread_name
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(THREAD_NAME_LEN);
            if record.thread_name_len > 0 {
                return;
            }
        }
    }
    // Numeric fallback: "Thread-<tid>", composed without formatting
    // machinery.
    let prefix = b"Thread-";
    record.thread_name[..prefix.len()].copy_from_slice(prefix);
    let digits = write_decimal(&mut record.thread_name[prefix.len()..], record.tid);
    record.thread_name_len = prefix.len() + digits;
}

/// Writes `value` in decimal into `buf`, returning the byte count.
fn write_decimal(buf: &mut [u8], value: i64) -> usize {
    let mut scratch = [0u8; 20];
    let mut v = value.unsigned_abs();
    let mut i = scratch.len();
    loop {
        i -= 1;
        scratch[i] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    let mut written = 0;
    if value < 0 && written < buf.len() {
        buf[written] = b'-';
        written += 1;
    }
    for &b in &scratch[i..] {
        if written >= buf.len() {
            break;
        }
        buf[written] = b;
        written += 1;
    }
    written
}

/// Snapshot of the register file from the delivered `ucontext`.
///
/// The captured set per architecture family is stable; names are defined by
/// [`ArchFamily::gp_name`] and frozen in the trailer format.
pub unsafe fn capture_registers(record: &mut FaultRecord, ucontext: *mut libc::c_void) {
    record.registers.arch = ArchFamily::current();
    if ucontext.is_null() {
        return;
    }

    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        let uc = &*(ucontext as *const libc::ucontext_t);
        let mc = &uc.uc_mcontext;
        record.registers.pc = mc.pc;
        record.registers.sp = mc.sp;
        record.registers.lr = mc.regs[30];
        record.registers.status = mc.pstate;
        record.registers.gp_count = 31;
        record.registers.gp[..31].copy_from_slice(&mc.regs);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let uc = &*(ucontext as *const libc::ucontext_t);
        let gregs = &uc.uc_mcontext.gregs;
        record.registers.pc = gregs[libc::REG_RIP as usize] as u64;
        record.registers.sp = gregs[libc::REG_RSP as usize] as u64;
        record.registers.status = gregs[libc::REG_EFL as usize] as u64;
        let named = [
            gregs[libc::REG_RAX as usize],
            gregs[libc::REG_RBX as usize],
            gregs[libc::REG_RCX as usize],
            gregs[libc::REG_RDX as usize],
            gregs[libc::REG_RSI as usize],
            gregs[libc::REG_RDI as usize],
            gregs[libc::REG_RBP as usize],
            gregs[libc::REG_R8 as usize],
            gregs[libc::REG_R9 as usize],
            gregs[libc::REG_R10 as usize],
            gregs[libc::REG_R11 as usize],
            gregs[libc::REG_R12 as usize],
            gregs[libc::REG_R13 as usize],
            gregs[libc::REG_R14 as usize],
            gregs[libc::REG_R15 as usize],
        ];
        record.registers.gp_count = named.len();
        for (slot, value) in record.registers.gp.iter_mut().zip(named) {
            *slot = value as u64;
        }
    }
}

/// Raw code addresses of up to [`MAX_STACK_FRAMES`] frames.
///
/// SIGNAL SAFETY:
///     Calculating the `ip` of the frames is crash safe; resolving names here
///     is not, so resolution is deferred to trailer emission where `dladdr`
///     is used frame by frame.
pub unsafe fn capture_stack(record: &mut FaultRecord) {
    let mut count = 0usize;
    backtrace::trace_unsynchronized(|frame| {
        if count >= MAX_STACK_FRAMES {
            return false;
        }
        let ip = frame.ip() as usize;
        if ip != 0 {
            record.frames[count] = ip;
            count += 1;
        }
        true
    });
    record.frame_count = count;
}

/// 256 bytes before and after the fault address.
///
/// Reads go through `process_vm_readv` on our own pid: the syscall reports
/// an unreadable mapping as an error instead of faulting, which is exactly
/// the "readable flag off" behavior the trailer wants.
pub fn capture_memory_dump(record: &mut FaultRecord) {
    record.memory_readable = false;
    if record.fault_addr == 0 || record.fault_addr < MEMORY_DUMP_BYTES {
        return;
    }

    let before_ok = read_process_memory(
        record.fault_addr - MEMORY_DUMP_BYTES,
        &mut record.memory_before,
    );
    let after_ok = read_process_memory(record.fault_addr, &mut record.memory_after);
    record.memory_readable = before_ok && after_ok;
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn read_process_memory(base: usize, buf: &mut [u8]) -> bool {
    use nix::sys::uio::{process_vm_readv, RemoteIoVec};
    use nix::unistd::Pid;
    use std::io::IoSliceMut;

    let len = buf.len();
    let mut local = [IoSliceMut::new(buf)];
    let remote = [RemoteIoVec { base, len }];
    matches!(
        process_vm_readv(Pid::this(), &mut local, &remote),
        Ok(n) if n == len
    )
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn read_process_memory(_base: usize, _buf: &mut [u8]) -> bool {
    false
}
