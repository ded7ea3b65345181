// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! All-thread stack snapshots for crash records.
//!
//! The crashing (or blocked) thread's snapshot comes from the caller; every
//! other live thread is enumerated from `/proc/self/task` and its stack
//! captured by posting a realtime signal whose handler walks the stack into
//! pre-allocated static memory.  Capture is strictly best effort: a thread
//! that exits mid-scan, refuses the signal or never answers within the
//! timeout simply contributes a snapshot without a stack.  On platforms
//! without a task filesystem the list degrades to the caller's entry alone.

use crate::crash_info::ThreadSnapshot;
use crate::shared::constants::MAX_CAPTURED_THREADS;

/// Builds the bounded all-thread list, `crashing` first.
///
/// A scanned thread with the same name as `crashing` is folded into it
/// rather than listed twice; if the caller could not produce a stack for the
/// crashing thread, the live capture fills it in.
pub fn capture_all_threads(crashing: ThreadSnapshot) -> Vec<ThreadSnapshot> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        linux::capture(crashing)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        vec![crashing]
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux {
    use super::*;
    use std::fs;

    pub(super) fn capture(mut crashing: ThreadSnapshot) -> Vec<ThreadSnapshot> {
        let self_tid = unsafe { libc::gettid() };
        let mut others = Vec::new();
        for tid in list_tids() {
            if tid == self_tid {
                continue;
            }
            if 1 + others.len() >= MAX_CAPTURED_THREADS {
                break;
            }
            let name = thread_name(tid);
            if name == crashing.name {
                // The crashing entry owns this thread; adopt the live stack
                // when the caller had none (e.g. a blocked UI thread).
                if crashing.stack_trace.is_empty() {
                    if let Some(stack) = remote::capture_stack(tid) {
                        crashing.stack_trace = stack;
                    }
                }
                continue;
            }
            others.push(ThreadSnapshot {
                name,
                state: thread_state(tid),
                stack_trace: remote::capture_stack(tid).unwrap_or_default(),
            });
        }
        let mut snapshots = vec![crashing];
        snapshots.extend(others);
        snapshots
    }

    fn list_tids() -> Vec<libc::pid_t> {
        let Ok(dir) = fs::read_dir("/proc/self/task") else {
            return Vec::new();
        };
        let mut tids: Vec<libc::pid_t> = dir
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(|s| s.parse().ok()))
            .collect();
        tids.sort();
        tids
    }

    fn thread_name(tid: libc::pid_t) -> String {
        fs::read_to_string(format!("/proc/self/task/{tid}/comm"))
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| format!("Thread-{tid}"))
    }

    /// Scheduler state letter from `/proc/self/task/<tid>/stat`, spelled out.
    fn thread_state(tid: libc::pid_t) -> String {
        let Ok(stat) = fs::read_to_string(format!("/proc/self/task/{tid}/stat")) else {
            return String::new();
        };
        // The state field follows the parenthesized comm, which may itself
        // contain spaces.
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .unwrap_or("");
        match state {
            "R" => "runnable",
            "S" => "sleeping",
            "D" => "uninterruptible",
            "T" | "t" => "stopped",
            "Z" => "zombie",
            _ => "unknown",
        }
        .to_string()
    }

    /// Signal-based remote stack capture.  The target thread's handler walks
    /// its own stack into static buffers; the requesting side serializes
    /// captures with a lock and waits, bounded, for the answer.
    mod remote {
        use std::io::Write;
        use std::sync::atomic::Ordering::SeqCst;
        use std::sync::atomic::{AtomicU32, AtomicUsize};
        use std::sync::{Mutex, OnceLock};
        use std::time::{Duration, Instant};

        const MAX_REMOTE_FRAMES: usize = 64;
        const CAPTURE_TIMEOUT: Duration = Duration::from_millis(50);

        // Shared with the capture handler.  CAPTURE_LOCK serializes
        // requesters; the generation counter pairs each answer with its
        // request so a late answer from a timed-out capture is ignored
        // rather than misattributed.
        static CAPTURE_LOCK: Mutex<()> = Mutex::new(());
        static REQUEST_GEN: AtomicU32 = AtomicU32::new(0);
        static DONE_GEN: AtomicU32 = AtomicU32::new(0);
        static FRAME_COUNT: AtomicUsize = AtomicUsize::new(0);

        struct FrameCell(std::cell::UnsafeCell<[usize; MAX_REMOTE_FRAMES]>);
        // Safety: written only by the handler of the single in-flight
        // capture, read only after its generation is acknowledged.
        unsafe impl Sync for FrameCell {}
        static FRAMES: FrameCell = FrameCell(std::cell::UnsafeCell::new([0; MAX_REMOTE_FRAMES]));

        /// Runs on the target thread.
        ///
        /// SIGNAL SAFETY:
        ///     Writes raw instruction pointers into static memory and two
        ///     atomics; no allocation, no locks.
        extern "C" fn capture_signal_handler(_signum: libc::c_int) {
            let gen = REQUEST_GEN.load(SeqCst);
            let frames = unsafe { &mut *FRAMES.0.get() };
            let mut count = 0usize;
            unsafe {
                backtrace::trace_unsynchronized(|frame| {
                    if count >= MAX_REMOTE_FRAMES {
                        return false;
                    }
                    let ip = frame.ip() as usize;
                    if ip != 0 {
                        frames[count] = ip;
                        count += 1;
                    }
                    true
                });
            }
            FRAME_COUNT.store(count, SeqCst);
            DONE_GEN.store(gen, SeqCst);
        }

        fn capture_signal() -> libc::c_int {
            static SIG: OnceLock<libc::c_int> = OnceLock::new();
            *SIG.get_or_init(|| {
                let sig = libc::SIGRTMIN() + 3;
                unsafe {
                    let mut sa: libc::sigaction = std::mem::zeroed();
                    sa.sa_sigaction = capture_signal_handler as libc::sighandler_t;
                    sa.sa_flags = libc::SA_RESTART;
                    libc::sigemptyset(&mut sa.sa_mask);
                    libc::sigaction(sig, &sa, std::ptr::null_mut());
                }
                sig
            })
        }

        pub(super) fn capture_stack(tid: libc::pid_t) -> Option<String> {
            let _guard = CAPTURE_LOCK.lock().ok()?;
            let sig = capture_signal();
            let gen = REQUEST_GEN.fetch_add(1, SeqCst).wrapping_add(1);

            let rval = unsafe {
                libc::syscall(
                    libc::SYS_tgkill,
                    libc::getpid() as libc::c_long,
                    tid as libc::c_long,
                    sig as libc::c_long,
                )
            };
            if rval != 0 {
                return None;
            }

            let deadline = Instant::now() + CAPTURE_TIMEOUT;
            while DONE_GEN.load(SeqCst) != gen {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_micros(200));
            }

            let count = FRAME_COUNT.load(SeqCst);
            let frames = unsafe { &*FRAMES.0.get() };
            let mut out = Vec::new();
            for (i, &addr) in frames[..count].iter().enumerate() {
                let _ = write!(out, "#{i:03} pc 0x{addr:x} ");
                let _ = crate::collector::emitters::emit_resolved_frame(&mut out, addr);
                let _ = writeln!(out);
            }
            Some(String::from_utf8_lossy(&out).trim_end().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn crashing_entry(stack: &str) -> ThreadSnapshot {
        ThreadSnapshot {
            name: std::thread::current().name().unwrap_or("unnamed").to_string(),
            state: "panicked".to_string(),
            stack_trace: stack.to_string(),
        }
    }

    #[test]
    fn test_crashing_thread_listed_first_with_caller_stack() {
        let snapshots = capture_all_threads(crashing_entry("at com.example.Boom.go"));
        assert!(!snapshots.is_empty());
        assert_eq!(snapshots[0].state, "panicked");
        assert_eq!(snapshots[0].stack_trace, "at com.example.Boom.go");
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn test_other_live_threads_enumerated() {
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let worker = std::thread::Builder::new()
            .name("snap-worker".to_string())
            .spawn(move || {
                while !worker_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();

        let snapshots = capture_all_threads(crashing_entry("at test"));
        stop.store(true, Ordering::Relaxed);
        worker.join().unwrap();

        assert!(snapshots.len() >= 2, "expected the worker to be listed");
        assert!(snapshots.len() <= MAX_CAPTURED_THREADS);
        // Thread names pass through comm, which truncates to 15 bytes.
        assert!(snapshots.iter().any(|t| t.name.starts_with("snap-worker")));
        // No duplicate of the calling thread.
        let own = &snapshots[0].name;
        assert_eq!(snapshots.iter().filter(|t| &t.name == own).count(), 1);
    }

    #[test]
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn test_empty_caller_stack_filled_by_live_capture() {
        let stop = Arc::new(AtomicBool::new(false));
        let ui_stop = Arc::clone(&stop);
        let ui = std::thread::Builder::new()
            .name("fake-ui".to_string())
            .spawn(move || {
                while !ui_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
            .unwrap();
        // Give the thread time to park in its loop.
        std::thread::sleep(Duration::from_millis(20));

        let snapshots = capture_all_threads(ThreadSnapshot {
            name: "fake-ui".to_string(),
            state: "blocked".to_string(),
            stack_trace: String::new(),
        });
        stop.store(true, Ordering::Relaxed);
        ui.join().unwrap();

        assert_eq!(snapshots[0].name, "fake-ui");
        // Best effort: when the live capture answered, the blocked thread's
        // entry carries a real stack instead of staying empty.
        if !snapshots[0].stack_trace.is_empty() {
            assert!(snapshots[0].stack_trace.starts_with("#000 pc 0x"));
        }
    }
}
