// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Signal handler installation and the fault-context entry point.
//!
//! Everything the handler needs is prepared at install time: the crash
//! record and the trailer path live in static memory, the altstack is
//! mmap'd with a guard page, and previous handler dispositions are stored so
//! they can be chained after the dump.  Inside the handler the only
//! synchronization is a single atomic re-entry guard; a second fault while
//! handling terminates immediately.
#![cfg(unix)]

use crate::collector::emitters::emit_fault_trailer;
use crate::collector::fault_record::{
    capture_identity, capture_memory_dump, capture_registers, capture_stack, FaultRecord,
};
use anyhow::Context;
use libc::{c_void, mmap, sigaltstack, siginfo_t, MAP_ANON, MAP_FAILED, MAP_PRIVATE, PROT_NONE,
    PROT_READ, PROT_WRITE, SIGSTKSZ};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::UnsafeCell;
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicPtr};

pub const HANDLED_SIGNALS: [Signal; 6] = [
    Signal::SIGSEGV,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGBUS,
    Signal::SIGTRAP,
];

const TRAILER_PATH_MAX: usize = 512;

struct OldHandlers {
    actions: [Option<SigAction>; 32],
}

/// Static storage shared with the fault context.  Exclusive access is
/// guaranteed by the `HANDLING` re-entry guard: the record is only ever
/// touched inside the handler, after the guard is won.
struct RecordCell(UnsafeCell<FaultRecord>);
// Safety: see above; the guard serializes all access.
unsafe impl Sync for RecordCell {}

struct PathCell {
    bytes: UnsafeCell<[u8; TRAILER_PATH_MAX]>,
    ready: AtomicBool,
}
// Safety: written once before handlers are registered, read-only afterwards.
unsafe impl Sync for PathCell {}

// Serializes install/restore; never touched on the fault path.
static REGISTRATION: std::sync::Mutex<()> = std::sync::Mutex::new(());
static HANDLING: AtomicBool = AtomicBool::new(false);
static ALTSTACK_INIT: AtomicBool = AtomicBool::new(false);
static RECORD: RecordCell = RecordCell(UnsafeCell::new(FaultRecord::zeroed()));
static TRAILER_PATH: PathCell = PathCell {
    bytes: UnsafeCell::new([0; TRAILER_PATH_MAX]),
    ready: AtomicBool::new(false),
};
static OLD_HANDLERS: AtomicPtr<OldHandlers> = AtomicPtr::new(ptr::null_mut());

/// Registers handlers for the six fatal signals, with the receive-context
/// flag and (optionally) an alternate stack.
///
/// Idempotent: a second call while handlers are installed is a no-op.
///
/// PRECONDITIONS:
///     `trailer_path`'s parent directory must exist.
/// SAFETY:
///     Crash-tracking functions are not guaranteed to be reentrant.
///     No other crash-handler functions should be called concurrently.
/// ATOMICITY:
///     Registration uses a compare-exchange on the old-handler pointer, but
///     setting the individual handlers is not atomic; a crash concurrent
///     with this call may see partially installed handlers.
pub fn install_crash_handlers(trailer_path: &Path, create_alt_stack: bool) -> anyhow::Result<()> {
    let _guard = REGISTRATION.lock().unwrap_or_else(|e| e.into_inner());
    if !OLD_HANDLERS.load(SeqCst).is_null() {
        return Ok(());
    }

    store_trailer_path(trailer_path)?;

    unsafe {
        if create_alt_stack {
            create_signal_altstack()?;
        }

        let mut olds = Box::new(OldHandlers {
            actions: [None; 32],
        });
        let sig_action = SigAction::new(
            SigHandler::SigAction(handle_posix_sigaction),
            SaFlags::SA_NODEFER | SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );
        for sig in HANDLED_SIGNALS {
            let old = signal::sigaction(sig, &sig_action)
                .with_context(|| format!("Failed to register handler for {sig}"))?;
            olds.actions[sig as usize] = Some(old);
        }

        let boxed_ptr = Box::into_raw(olds);
        let res = OLD_HANDLERS.compare_exchange(ptr::null_mut(), boxed_ptr, SeqCst, SeqCst);
        anyhow::ensure!(
            res.is_ok(),
            "TOCTTOU error registering native crash handlers"
        );
    }
    Ok(())
}

/// Restores the previously installed dispositions.
pub fn restore_old_handlers() -> anyhow::Result<()> {
    let _guard = REGISTRATION.lock().unwrap_or_else(|e| e.into_inner());
    let prev = OLD_HANDLERS.swap(ptr::null_mut(), SeqCst);
    anyhow::ensure!(!prev.is_null(), "No previous signal handlers to restore");
    // Safety: the only non-null pointer stored here comes from Box::into_raw.
    let prev = unsafe { Box::from_raw(prev) };
    for sig in HANDLED_SIGNALS {
        if let Some(action) = prev.actions[sig as usize] {
            // Safety: the value restored was returned by sigaction earlier.
            unsafe { signal::sigaction(sig, &action)? };
        }
    }
    Ok(())
}

fn store_trailer_path(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = path.as_os_str().as_bytes();
    anyhow::ensure!(
        bytes.len() < TRAILER_PATH_MAX,
        "Trailer path too long: {} bytes",
        bytes.len()
    );
    // Safety: handlers are not yet registered, nothing else reads this.
    unsafe {
        let dest = &mut *TRAILER_PATH.bytes.get();
        dest[..bytes.len()].copy_from_slice(bytes);
        dest[bytes.len()] = 0;
    }
    TRAILER_PATH.ready.store(true, SeqCst);
    Ok(())
}

/// Allocates a signal altstack with a guard page at the end.
/// The default SIGSTKSZ (8 KiB) is not enough for the unwind; use the
/// greater of 16 pages or SIGSTKSZ.
unsafe fn create_signal_altstack() -> anyhow::Result<()> {
    if ALTSTACK_INIT.load(SeqCst) {
        return Ok(());
    }

    let page_size = page_size::get();
    let stack_size = std::cmp::max(SIGSTKSZ, 16 * page_size);
    let stackp = mmap(
        ptr::null_mut(),
        stack_size + page_size,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANON,
        -1,
        0,
    );
    anyhow::ensure!(stackp != MAP_FAILED, "failed to allocate an alternate stack");
    let guard_result = libc::mprotect(stackp, page_size, PROT_NONE);
    anyhow::ensure!(guard_result == 0, "failed to set up alternate stack guard page");
    let stackp = stackp.add(page_size);

    let stack = libc::stack_t {
        ss_sp: stackp,
        ss_flags: 0,
        ss_size: stack_size,
    };
    let rval = sigaltstack(&stack, ptr::null_mut());
    anyhow::ensure!(rval == 0, "sigaltstack failed {rval}");
    ALTSTACK_INIT.store(true, SeqCst);
    Ok(())
}

extern "C" fn handle_posix_sigaction(signum: i32, info: *mut siginfo_t, ucontext: *mut c_void) {
    // A fault while handling a fault: nothing left to salvage, terminate.
    if HANDLING.swap(true, SeqCst) {
        unsafe { libc::_exit(1) };
    }

    unsafe {
        record_and_dump(signum, info, ucontext);
        chain_and_reraise(signum, info, ucontext);
    }
}

/// Fills the static record and writes the trailer file.
///
/// SIGNAL SAFETY:
///     Only `open`/`write`/`close`, syscalls and writes into static buffers.
///     Errors are ignored: there is no one to report them to in here.
unsafe fn record_and_dump(signum: i32, info: *mut siginfo_t, ucontext: *mut c_void) {
    let record = &mut *RECORD.0.get();
    ptr::write_bytes(record as *mut FaultRecord, 0, 1);
    capture_identity(record, signum, info);
    capture_registers(record, ucontext);
    capture_memory_dump(record);
    // Last: if the unwind itself faults, everything above is already in the
    // record, and the re-entry guard turns the nested fault into _exit.
    capture_stack(record);

    if !TRAILER_PATH.ready.load(SeqCst) {
        return;
    }
    let path = &*TRAILER_PATH.bytes.get();
    let fd = libc::open(
        path.as_ptr() as *const libc::c_char,
        libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC,
        0o644,
    );
    if fd < 0 {
        return;
    }
    // Safety: the File wraps a freshly opened fd and is mem::forget-ten
    // below; write! through it performs plain write(2) calls.
    let mut file = File::from_raw_fd(fd);
    let _ = emit_fault_trailer(&mut file, record);
    std::mem::forget(file);
    libc::close(fd);
}

/// Chains to whatever handler was installed before ours, then restores the
/// default disposition and re-raises so the platform terminates the process
/// (and produces its own tombstone/core).
unsafe fn chain_and_reraise(signum: i32, info: *mut siginfo_t, ucontext: *mut c_void) {
    let olds = OLD_HANDLERS.load(SeqCst);
    if !olds.is_null() {
        let old_action = (*olds)
            .actions
            .get(signum as usize)
            .copied()
            .flatten();
        if let Some(action) = old_action {
            match action.handler() {
                SigHandler::Handler(f) => f(signum),
                SigHandler::SigAction(f) => f(signum, info, ucontext),
                SigHandler::SigDfl | SigHandler::SigIgn => {}
            }
        }
    }

    if let Ok(sig) = Signal::try_from(signum) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let _ = signal::sigaction(sig, &default);
    }
    libc::raise(signum);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent_and_reversible() {
        let dir = tempfile::tempdir().unwrap();
        let trailer = dir.path().join("native_crash.txt");
        install_crash_handlers(&trailer, false).unwrap();
        install_crash_handlers(&trailer, false).unwrap();
        restore_old_handlers().unwrap();
        assert!(restore_old_handlers().is_err());
    }

    #[test]
    fn test_trailer_path_length_checked() {
        let long = "x".repeat(TRAILER_PATH_MAX);
        let result = store_trailer_path(Path::new(&long));
        assert!(result.is_err());
    }
}
