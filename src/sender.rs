// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery: dedup/sampling via the send policy, immediate dispatch for fatal
//! records, a bounded batch for the rest, exponential-backoff retry, and the
//! throttled drain of `pending/` at startup.
//!
//! A record reaches this module only after it has been persisted; everything
//! here may fail without losing data, because failure leaves the pending file
//! in place for the next drain.

use crate::crash_info::CrashReport;
use crate::crash_store::CrashStore;
use crate::grouping::{SendDecision, SendPolicy};
use crate::optimizer;
use crate::shared::config::CrashtrackerConfig;
use crate::shared::constants::{BATCH_CAPACITY, BATCH_FLUSH_SIZE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, warn};

pub type Attempts = u32;

/// What happened to a record handed to [`Sender::process`].
#[derive(Debug)]
pub enum SendOutcome {
    /// Delivered and acknowledged; the payload moved to `sent/`.
    Sent,
    /// Non-fatal record queued for the next batch flush.
    Enqueued,
    /// Duplicate fingerprint; only the occurrence counter moved.
    Deduplicated(u64),
    /// Non-fatal record dropped by the sampler.
    Sampled,
    /// All attempts failed; the record stays in `pending/`.
    Failed(SendError),
}

#[derive(Debug)]
pub enum SendError {
    /// The endpoint answered with a non-2xx status on the final attempt.
    Http(reqwest::StatusCode, Attempts),
    /// Connection, TLS or timeout failure on the final attempt.
    Transport(reqwest::Error, Attempts),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Http(status, attempts) => {
                write!(f, "http status {status} after {attempts} attempts")
            }
            SendError::Transport(error, attempts) => {
                write!(f, "transport error after {attempts} attempts: {error}")
            }
        }
    }
}

impl std::error::Error for SendError {}

/// Exponential backoff: `base, 2*base, 4*base, ...` capped at `delay_cap`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    max_retries: u32,
    base_delay: Duration,
    delay_cap: Duration,
}

impl RetryStrategy {
    pub fn new(max_retries: u32, base_delay_ms: u64, delay_cap_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
            delay_cap: Duration::from_millis(delay_cap_ms),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.delay_cap)
    }

    async fn delay(&self, attempt: u32) {
        sleep(self.delay_for(attempt)).await;
    }
}

pub struct Sender {
    client: reqwest::Client,
    url: String,
    store: Arc<CrashStore>,
    policy: Arc<SendPolicy>,
    retry: RetryStrategy,
    batch: Mutex<VecDeque<CrashReport>>,
    last_flush: Mutex<Instant>,
    batch_flush_interval: Duration,
    pending_max_per_minute: u32,
}

impl Sender {
    pub fn new(
        config: &CrashtrackerConfig,
        store: Arc<CrashStore>,
        policy: Arc<SendPolicy>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!(
                "datadog-mobile-crashtracker/",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.crashes_url(),
            store,
            policy,
            retry: RetryStrategy::new(
                config.max_retries,
                config.retry_base_delay_ms,
                config.retry_delay_cap_ms,
            ),
            batch: Mutex::new(VecDeque::new()),
            last_flush: Mutex::new(Instant::now()),
            batch_flush_interval: Duration::from_millis(config.batch_flush_interval_ms),
            pending_max_per_minute: config.pending_max_per_minute.max(1),
        })
    }

    /// Applies the send decision to an already-persisted record.
    ///
    /// Policy-suppressed outcomes (duplicate, sampled out) delete the pending
    /// file: the drop is deliberate and logged, never silent.
    pub async fn process(&self, report: CrashReport) -> SendOutcome {
        match self.policy.decide(&report) {
            SendDecision::IncrementOnly(count) => {
                debug!(fingerprint = %report.fingerprint, count, "duplicate crash, incrementing only");
                let _ = self.store.delete(&report.crash_id);
                SendOutcome::Deduplicated(count)
            }
            SendDecision::Skip => {
                debug!(fingerprint = %report.fingerprint, "crash sampled out");
                let _ = self.store.delete(&report.crash_id);
                SendOutcome::Sampled
            }
            SendDecision::SendImmediately => match self.send(&report).await {
                Ok(()) => SendOutcome::Sent,
                Err(e) => {
                    error!(crash_id = %report.crash_id, error = %e, "immediate send failed");
                    SendOutcome::Failed(e)
                }
            },
            SendDecision::AddToBatch => {
                self.add_to_batch(report);
                if self.should_flush() {
                    self.flush_batch().await;
                }
                SendOutcome::Enqueued
            }
        }
    }

    /// POSTs one record, retrying on failure, and acknowledges it in the
    /// store on 2xx.  Payload optimization is re-applied here so resends of
    /// old pending files are shrunk and scrubbed like fresh records.
    pub async fn send(&self, report: &CrashReport) -> Result<(), SendError> {
        let payload = optimizer::optimize(report);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Crash-Fingerprint", report.fingerprint.as_str())
                .header("X-Crash-Severity", report.severity.as_str())
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(crash_id = %report.crash_id, status = %response.status(), attempt, "crash delivered");
                    self.store.mark_sent(&report.crash_id);
                    self.policy.mark_delivered(&report.fingerprint);
                    return Ok(());
                }
                Ok(response) => {
                    let status = response.status();
                    if attempt <= self.retry.max_retries() {
                        debug!(status = %status, attempt, "error status, retrying");
                        self.retry.delay(attempt).await;
                    } else {
                        return Err(SendError::Http(status, attempt));
                    }
                }
                Err(e) => {
                    if attempt <= self.retry.max_retries() {
                        debug!(error = %e, attempt, "request failed, retrying");
                        self.retry.delay(attempt).await;
                    } else {
                        return Err(SendError::Transport(e, attempt));
                    }
                }
            }
        }
    }

    /// Sends every queued record individually, preserving FIFO order.
    pub async fn flush_batch(&self) {
        let drained: Vec<CrashReport> = {
            let Ok(mut batch) = self.batch.lock() else {
                return;
            };
            batch.drain(..).collect()
        };
        if let Ok(mut last_flush) = self.last_flush.lock() {
            *last_flush = Instant::now();
        }
        for report in drained {
            if let Err(e) = self.send(&report).await {
                // The record is still in pending/, the startup drain retries.
                warn!(crash_id = %report.crash_id, error = %e, "batched send failed");
            }
        }
    }

    /// Rate-limited drain of `pending/` in filesystem order.  Each record
    /// goes back through [`Sender::process`], so dedup and sampling apply to
    /// resends exactly as to fresh crashes.
    pub async fn send_all_pending(&self) {
        let files = self.store.list_pending();
        if files.is_empty() {
            return;
        }
        debug!(count = files.len(), "draining pending crashes");
        let pause = Duration::from_millis(60_000 / self.pending_max_per_minute as u64);
        let mut first = true;
        for path in files {
            if !first {
                sleep(pause).await;
            }
            first = false;
            match CrashReport::from_file(&path) {
                Ok(report) => {
                    let _ = self.process(report).await;
                }
                Err(e) => {
                    // Unparseable files stay for retention to clean up.
                    warn!(path = %path.display(), error = %e, "skipping unreadable pending crash");
                }
            }
        }
    }

    pub fn batch_len(&self) -> usize {
        self.batch.lock().map(|b| b.len()).unwrap_or(0)
    }

    fn add_to_batch(&self, report: CrashReport) {
        let Ok(mut batch) = self.batch.lock() else {
            return;
        };
        if batch.len() == BATCH_CAPACITY {
            if let Some(dropped) = batch.pop_front() {
                warn!(crash_id = %dropped.crash_id, "batch full, dropping oldest (still pending on disk)");
            }
        }
        batch.push_back(report);
    }

    fn should_flush(&self) -> bool {
        let len = self.batch_len();
        if len >= BATCH_FLUSH_SIZE {
            return true;
        }
        self.last_flush
            .lock()
            .map(|t| len > 0 && t.elapsed() >= self.batch_flush_interval)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash_info::KIND_UNHANDLED_EXCEPTION;
    use crate::fingerprint_store::FingerprintStore;
    use crate::grouping::apply_grouping;
    use httpmock::MockServer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fixture(
        endpoint: &str,
        sample_rate: f64,
        retry_base_ms: u64,
    ) -> (tempfile::TempDir, Sender) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CrashtrackerConfig::new(
            endpoint.to_string(),
            dir.path().join("data"),
            dir.path().join("cache"),
            "com.example.app".to_string(),
        )
        .unwrap();
        config.retry_base_delay_ms = retry_base_ms;
        config.sample_rate = sample_rate;
        let store = Arc::new(CrashStore::new(&config.crashes_dir()).unwrap());
        let fingerprints = Arc::new(FingerprintStore::new(&config.cache_dir).unwrap());
        let policy = Arc::new(SendPolicy::with_rng(
            fingerprints,
            sample_rate,
            StdRng::seed_from_u64(3),
        ));
        let sender = Sender::new(&config, store, policy).unwrap();
        (dir, sender)
    }

    fn fatal_report(message: &str) -> CrashReport {
        let mut report = CrashReport::new(KIND_UNHANDLED_EXCEPTION);
        report.thread_name = "main".to_string();
        report.exception_message = message.to_string();
        report.stack_trace = format!("at com.example.Crash.{message}(Crash.kt:1)");
        apply_grouping(&mut report);
        report
    }

    #[test]
    fn test_retry_delays_follow_schedule() {
        let strategy = RetryStrategy::new(3, 5_000, 60_000);
        assert_eq!(strategy.delay_for(1), Duration::from_secs(5));
        assert_eq!(strategy.delay_for(2), Duration::from_secs(10));
        assert_eq!(strategy.delay_for(3), Duration::from_secs(20));
        // The cap takes over where doubling would exceed a minute.
        assert_eq!(strategy.delay_for(5), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_send_marks_sent_on_2xx() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/api/crashes")
                    .header("content-type", "application/json")
                    .header_exists("x-crash-fingerprint");
                then.status(202);
            })
            .await;

        let (_dir, sender) = fixture(&server.base_url(), 1.0, 1);
        let report = fatal_report("segfault");
        sender.store.save(&report).unwrap();
        sender.send(&report).await.unwrap();
        mock.assert_async().await;
        assert_eq!(sender.store.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_gives_up_after_retries() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/crashes");
                then.status(503);
            })
            .await;

        let (_dir, sender) = fixture(&server.base_url(), 1.0, 1);
        let report = fatal_report("unreachable");
        sender.store.save(&report).unwrap();
        let err = sender.send(&report).await.unwrap_err();
        assert!(matches!(err, SendError::Http(status, 4) if status.as_u16() == 503));
        mock.assert_hits_async(4).await;
        // Failure leaves the record pending for the next drain.
        assert_eq!(sender.store.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_process_deletes_policy_suppressed_records() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/api/crashes");
                then.status(200);
            })
            .await;

        let (_dir, sender) = fixture(&server.base_url(), 1.0, 1);
        let report = fatal_report("dup");
        sender.store.save(&report).unwrap();
        assert!(matches!(
            sender.process(report.clone()).await,
            SendOutcome::Sent
        ));

        let mut duplicate = fatal_report("dup");
        duplicate.crash_id = uuid::Uuid::new_v4();
        sender.store.save(&duplicate).unwrap();
        assert!(matches!(
            sender.process(duplicate).await,
            SendOutcome::Deduplicated(2)
        ));
        assert_eq!(sender.store.pending_count(), 0);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_batch_bounded_and_fifo() {
        let server = MockServer::start_async().await;
        let (_dir, sender) = fixture(&server.base_url(), 1.0, 1);
        for i in 0..(BATCH_CAPACITY + 5) {
            let mut report = CrashReport::new("java.io.IOException");
            report.exception_message = format!("batch {i}");
            report.stack_trace = format!("at com.example.Io{i}.read(Io.kt:9)");
            apply_grouping(&mut report);
            sender.add_to_batch(report);
        }
        assert_eq!(sender.batch_len(), BATCH_CAPACITY);
        let front = sender.batch.lock().unwrap().front().unwrap().clone();
        assert_eq!(front.exception_message, "batch 5");
    }
}
