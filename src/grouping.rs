// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fingerprinting, severity classification and the send decision.
//!
//! The fingerprint groups identical crashes: exception kind plus the top five
//! stack frames, normalized so file/line drift does not split a group, hashed
//! to a short stable hex string.  The send decision is where cost control
//! happens: persistent dedup, in-session dedup, and sampling of non-fatal
//! records.

use crate::crash_info::{CrashReport, Severity};
use crate::fingerprint_store::FingerprintStore;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

const FINGERPRINT_FRAMES: usize = 5;

/// What the sender should do with a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Duplicate within the window: bump a counter, emit nothing.
    IncrementOnly(u64),
    /// Non-fatal record lost the sampling draw.
    Skip,
    /// Fatal record: send now, ahead of any batch.
    SendImmediately,
    /// Non-fatal record: enqueue for the next batch flush.
    AddToBatch,
}

/// Computes the 16-hex-char grouping fingerprint.
pub fn compute_fingerprint(exception_kind: &str, stack_trace: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(exception_kind.as_bytes());
    for frame in top_frames(stack_trace, FINGERPRINT_FRAMES) {
        hasher.update(b"\n");
        hasher.update(frame.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// The top `count` frames with location info (`(File.kt:42)`, addresses)
/// stripped so the fingerprint is stable across builds.
fn top_frames(stack_trace: &str, count: usize) -> Vec<String> {
    stack_trace
        .lines()
        .map(normalize_frame)
        .filter(|frame| !frame.is_empty())
        .take(count)
        .collect()
}

fn normalize_frame(line: &str) -> String {
    let line = line.trim();
    let line = line.strip_prefix("at ").unwrap_or(line);
    if let Some(native) = normalize_native_frame(line) {
        return native;
    }
    // Drop the "(File.kt:42)" suffix, keeping class+method.
    match line.find('(') {
        Some(idx) => line[..idx].trim().to_string(),
        None => line.to_string(),
    }
}

/// `#nnn pc 0xaddr /lib/libfoo.so (symbol+0x12)` carries a load address that
/// changes every run; only library and symbol are stable across processes.
fn normalize_native_frame(line: &str) -> Option<String> {
    let rest = line.strip_prefix('#')?;
    let pc_idx = rest.find(" pc 0x")?;
    let after = &rest[pc_idx + " pc 0x".len()..];
    let (_addr, tail) = after.split_once(' ')?;
    let tail = tail.trim();
    match tail.split_once(" (") {
        Some((library, symbol)) => {
            let symbol = symbol.trim_end_matches(')');
            let symbol = symbol.split_once('+').map(|(s, _)| s).unwrap_or(symbol);
            Some(format!("{library} {symbol}"))
        }
        None => Some(tail.to_string()),
    }
}

/// `"<TypeName> at <TopFrame>"`, where the type name is the last dotted
/// segment of the exception kind.
pub fn compute_issue_title(exception_kind: &str, stack_trace: &str) -> String {
    let type_name = exception_kind.rsplit('.').next().unwrap_or(exception_kind);
    match top_frames(stack_trace, 1).into_iter().next() {
        Some(frame) => format!("{type_name} at {frame}"),
        None => type_name.to_string(),
    }
}

pub fn compute_severity(report: &CrashReport) -> Severity {
    if report.severity == Severity::Critical
        || report.native.is_some()
        || report.exception_kind.starts_with("SIG")
        || report.is_anr
        || report.is_out_of_memory()
        || report.crashed_on_main_thread()
    {
        return Severity::Critical;
    }
    let kind = report.exception_kind.to_ascii_lowercase();
    if kind.contains("nullpointer")
        || kind.contains("null_pointer")
        || kind.contains("illegalstate")
        || kind.contains("illegal_state")
    {
        return Severity::High;
    }
    Severity::Medium
}

/// Fills in fingerprint, title and severity on a freshly built record.
pub fn apply_grouping(report: &mut CrashReport) {
    report.fingerprint = compute_fingerprint(&report.exception_kind, &report.stack_trace);
    report.issue_title = compute_issue_title(&report.exception_kind, &report.stack_trace);
    report.severity = compute_severity(report);
}

/// The stateful half of cost control: persistent window dedup, in-session
/// dedup and the sampling draw for non-fatal records.
pub struct SendPolicy {
    fingerprints: Arc<FingerprintStore>,
    session: Mutex<HashMap<String, u64>>,
    rng: Mutex<StdRng>,
    sample_rate: f64,
}

impl SendPolicy {
    pub fn new(fingerprints: Arc<FingerprintStore>, sample_rate: f64) -> Self {
        Self::with_rng(fingerprints, sample_rate, StdRng::from_entropy())
    }

    /// Seedable constructor so the sampling rate is testable.
    pub fn with_rng(fingerprints: Arc<FingerprintStore>, sample_rate: f64, rng: StdRng) -> Self {
        Self {
            fingerprints,
            session: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            sample_rate,
        }
    }

    pub fn decide(&self, report: &CrashReport) -> SendDecision {
        let fp = report.fingerprint.as_str();
        debug_assert!(!fp.is_empty(), "grouping must run before the send decision");

        if self.fingerprints.was_recently_reported(fp) {
            let count = self.bump_session(fp);
            debug!(fingerprint = fp, count, "duplicate within persistent window");
            return SendDecision::IncrementOnly(count);
        }

        {
            let Ok(mut session) = self.session.lock() else {
                return SendDecision::SendImmediately;
            };
            if let Some(count) = session.get_mut(fp) {
                *count += 1;
                debug!(fingerprint = fp, count = *count, "duplicate within session");
                return SendDecision::IncrementOnly(*count);
            }
        }

        if !report.is_fatal() && self.sampled_out() {
            debug!(fingerprint = fp, "non-fatal record sampled out");
            return SendDecision::Skip;
        }

        // The in-session mark lands here; the durable mark lands on delivery
        // (see [`SendPolicy::mark_delivered`]).  Marking durably at decision
        // time would let one failed send permanently swallow its group: the
        // redelivery from pending/ would look like a duplicate.
        self.bump_session(fp);

        if report.is_fatal() {
            SendDecision::SendImmediately
        } else {
            SendDecision::AddToBatch
        }
    }

    /// Records a successful delivery in the durable window, so further
    /// occurrences of the group dedupe across process restarts.
    pub fn mark_delivered(&self, fingerprint: &str) {
        if let Err(e) = self.fingerprints.mark_as_reported(fingerprint) {
            debug!(fingerprint, error = %e, "failed to persist fingerprint mark");
        }
    }

    /// Occurrences seen this session for a fingerprint, including the one
    /// that was actually sent.
    pub fn session_count(&self, fingerprint: &str) -> u64 {
        self.session
            .lock()
            .map(|s| s.get(fingerprint).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn bump_session(&self, fingerprint: &str) -> u64 {
        let Ok(mut session) = self.session.lock() else {
            return 0;
        };
        let count = session.entry(fingerprint.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn sampled_out(&self) -> bool {
        let Ok(mut rng) = self.rng.lock() else {
            return false;
        };
        rng.gen::<f64>() < 1.0 - self.sample_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::{KIND_ANR, KIND_UNHANDLED_EXCEPTION};

    const STACK: &str = "at com.example.app.MainActivity.onCreate(MainActivity.kt:42)\n\
                         at android.app.Activity.performCreate(Activity.java:8000)\n\
                         at android.app.ActivityThread.handleLaunchActivity(ActivityThread.java:3245)";

    #[test]
    fn test_fingerprint_is_16_hex_chars() {
        let fp = compute_fingerprint("java.lang.NullPointerException", STACK);
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_ignores_line_numbers() {
        let moved = STACK.replace(":42", ":97");
        assert_eq!(
            compute_fingerprint("java.lang.NullPointerException", STACK),
            compute_fingerprint("java.lang.NullPointerException", &moved),
        );
    }

    #[test]
    fn test_fingerprint_stable_across_native_load_addresses() {
        let first = "#000 pc 0x7f12345678 /data/app/lib/libgame.so (render_frame+0x24)\n\
                     #001 pc 0x7f12345abc /data/app/lib/libgame.so (game_loop+0x100)";
        let rebased = "#000 pc 0x5500aa1122 /data/app/lib/libgame.so (render_frame+0x38)\n\
                       #001 pc 0x5500aa5566 /data/app/lib/libgame.so (game_loop+0x100)";
        assert_eq!(
            compute_fingerprint("NativeSignal", first),
            compute_fingerprint("NativeSignal", rebased),
        );
    }

    #[test]
    fn test_fingerprint_distinguishes_kinds() {
        assert_ne!(
            compute_fingerprint("java.lang.NullPointerException", STACK),
            compute_fingerprint("java.lang.IllegalStateException", STACK),
        );
    }

    #[test]
    fn test_issue_title() {
        let title = compute_issue_title("java.lang.NullPointerException", STACK);
        assert_eq!(
            title,
            "NullPointerException at com.example.app.MainActivity.onCreate"
        );
    }

    #[test]
    fn test_severity_rules() {
        let mut report = CrashReport::new("java.lang.NullPointerException");
        report.stack_trace = STACK.to_string();
        assert_eq!(compute_severity(&report), Severity::High);

        report.thread_name = "main".to_string();
        assert_eq!(compute_severity(&report), Severity::Critical);

        let mut anr = CrashReport::new(KIND_ANR);
        anr.is_anr = true;
        assert_eq!(compute_severity(&anr), Severity::Critical);

        let plain = CrashReport::new("java.io.IOException");
        assert_eq!(compute_severity(&plain), Severity::Medium);
    }

    fn policy(dir: &std::path::Path, sample_rate: f64) -> SendPolicy {
        let store = Arc::new(FingerprintStore::new(dir).unwrap());
        SendPolicy::with_rng(store, sample_rate, StdRng::seed_from_u64(7))
    }

    fn fatal_report(kind: &str) -> CrashReport {
        let mut report = CrashReport::new(kind);
        report.thread_name = "main".to_string();
        report.stack_trace = STACK.to_string();
        apply_grouping(&mut report);
        report
    }

    #[test]
    fn test_first_occurrence_sends_then_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), 1.0);
        let report = fatal_report(KIND_UNHANDLED_EXCEPTION);
        assert_eq!(policy.decide(&report), SendDecision::SendImmediately);
        assert_eq!(policy.decide(&report), SendDecision::IncrementOnly(2));
        assert_eq!(policy.decide(&report), SendDecision::IncrementOnly(3));
    }

    #[test]
    fn test_persistent_dedup_across_policy_instances() {
        let dir = tempfile::tempdir().unwrap();
        let report = fatal_report(KIND_UNHANDLED_EXCEPTION);
        {
            let first_session = policy(dir.path(), 1.0);
            assert_eq!(first_session.decide(&report), SendDecision::SendImmediately);
            first_session.mark_delivered(&report.fingerprint);
        }
        let second_session = policy(dir.path(), 1.0);
        assert!(matches!(
            second_session.decide(&report),
            SendDecision::IncrementOnly(_)
        ));
    }

    #[test]
    fn test_fatal_records_never_sampled() {
        let dir = tempfile::tempdir().unwrap();
        // sample_rate 0.0 would drop every samplable record
        let policy = policy(dir.path(), 0.0);
        let report = fatal_report(KIND_ANR);
        assert_eq!(policy.decide(&report), SendDecision::SendImmediately);
    }

    #[test]
    fn test_sampling_rate_within_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let policy = policy(dir.path(), 0.15);
        let mut kept = 0u32;
        let total = 2000u32;
        for i in 0..total {
            let mut report = CrashReport::new("java.io.IOException");
            report.thread_name = "worker".to_string();
            report.stack_trace = format!("at com.example.Job{i}.run(Job.kt:1)");
            apply_grouping(&mut report);
            match policy.decide(&report) {
                SendDecision::AddToBatch => kept += 1,
                SendDecision::Skip => {}
                other => panic!("unexpected decision {other:?}"),
            }
        }
        // E[kept] = 300; a seeded rng keeps this deterministic, the bounds
        // leave room for a different rand version.
        assert!((200..=400).contains(&kept), "kept {kept} of {total}");
    }
}
