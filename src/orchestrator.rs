// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle owner: wires the stores, oracle, handlers, watchdog and sender
//! together, ingests the previous session's native trailer, and drains
//! pending crashes on start.
//!
//! Ordering rules enforced here:
//! - persistence happens-before sending, on every path;
//! - the ANR persist runs synchronously on the watchdog thread, so data is
//!   on disk before the async send is even scheduled;
//! - the safety brake is consulted before anything is persisted.

use crate::anr::{
    AnrEvent, AnrSink, AnrValidator, AnrWatchdog, ChannelUiProbe, NetworkLossClock, UiThreadProbe,
    WatchdogConfig,
};
use crate::breadcrumbs::{Breadcrumb, BreadcrumbRing, ContextStore, EventTrackers};
use crate::crash_info::{
    AppSnapshot, CrashReport, CpuInfo, DeviceSnapshot, ProcessSnapshot, Severity, StateEvent,
    ThreadSnapshot, KIND_ANR, KIND_UNHANDLED_EXCEPTION,
};
use crate::crash_store::CrashStore;
use crate::device_state::{DeviceStateSource, SystemStateSource};
use crate::exception_handler;
use crate::fingerprint_store::FingerprintStore;
use crate::grouping::{self, SendPolicy};
use crate::op_tracker::OperationTracker;
use crate::sender::{SendOutcome, Sender};
use crate::shared::config::CrashtrackerConfig;
use crate::startup_tracker::StartupTracker;
use crate::thread_snapshot;
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

static GLOBAL: RwLock<Option<Arc<Reporter>>> = RwLock::new(None);

/// The reporter instance the process-wide hooks deliver into.
pub fn global() -> Option<Arc<Reporter>> {
    GLOBAL.read().ok().and_then(|g| g.clone())
}

pub(crate) fn set_global(reporter: Arc<Reporter>) {
    if let Ok(mut global) = GLOBAL.write() {
        *global = Some(reporter);
    }
}

pub(crate) fn clear_global() {
    if let Ok(mut global) = GLOBAL.write() {
        *global = None;
    }
}

pub struct Reporter {
    config: CrashtrackerConfig,
    oracle: Arc<dyn DeviceStateSource>,
    probe: Arc<dyn UiThreadProbe>,
    breadcrumbs: Arc<BreadcrumbRing>,
    context: Arc<ContextStore>,
    trackers: Arc<EventTrackers>,
    op_tracker: Arc<OperationTracker>,
    store: Arc<CrashStore>,
    startup: Arc<StartupTracker>,
    fingerprints: Arc<FingerprintStore>,
    sender: Arc<Sender>,
    network_clock: Arc<NetworkLossClock>,
    runtime: tokio::runtime::Runtime,
    watchdog: Mutex<Option<AnrWatchdog>>,
    anr_threshold_ms: Mutex<u64>,
    reporting_disabled: AtomicBool,
    started: AtomicBool,
}

impl Reporter {
    /// Builds a reporter with the default system oracle and a dedicated
    /// event-loop thread standing in for the UI thread.
    pub fn new(config: CrashtrackerConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_components(
            config,
            Arc::new(SystemStateSource::new()),
            Arc::new(ChannelUiProbe::spawn("main")),
        )
    }

    /// Dependency-injecting constructor; tests supply oracle and probe
    /// doubles here.
    pub fn with_components(
        config: CrashtrackerConfig,
        oracle: Arc<dyn DeviceStateSource>,
        probe: Arc<dyn UiThreadProbe>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = Arc::new(CrashStore::new(&config.crashes_dir())?);
        let fingerprints = Arc::new(FingerprintStore::new(&config.cache_dir)?);
        let startup = Arc::new(StartupTracker::new(&config.data_dir)?);
        let policy = Arc::new(SendPolicy::new(
            Arc::clone(&fingerprints),
            config.sample_rate,
        ));
        let sender = Arc::new(Sender::new(&config, Arc::clone(&store), policy)?);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("crashtracker-io")
            .enable_all()
            .build()
            .context("Failed to build reporter runtime")?;

        let anr_threshold_ms = config.anr_threshold_ms;
        Ok(Arc::new(Self {
            config,
            oracle,
            probe,
            breadcrumbs: Arc::new(BreadcrumbRing::new()),
            context: Arc::new(ContextStore::new(String::new())),
            trackers: Arc::new(EventTrackers::new()),
            op_tracker: Arc::new(OperationTracker::new()),
            store,
            startup,
            fingerprints,
            sender,
            network_clock: Arc::new(NetworkLossClock::new()),
            runtime,
            watchdog: Mutex::new(None),
            anr_threshold_ms: Mutex::new(anr_threshold_ms),
            reporting_disabled: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }))
    }

    /// Brings the reporter up.  Idempotent; a second call is a no-op.
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.startup.did_crash_on_startup() {
            warn!("previous session crashed during startup");
        }
        if self.startup.is_in_crash_loop(self.oracle.uptime_ms()) {
            warn!(
                count = self.startup.startup_crash_count(),
                "startup crash loop detected"
            );
        }
        self.startup.mark_started()?;

        exception_handler::install_panic_hook();
        #[cfg(unix)]
        crate::collector::install_crash_handlers(
            &self.config.trailer_path(),
            self.config.create_alt_stack,
        )?;

        if self.config.enable_disk_probe {
            let throughput = self.oracle.disk_probe(&self.config.cache_dir);
            debug!(
                write_mbps = throughput.write_mbps,
                read_mbps = throughput.read_mbps,
                "disk probe"
            );
        }

        // Previous-session work: ingest the native trailer first so its
        // record is part of the pending set, then drain pending.  One task,
        // sequential, so the drain never races the ingestion.
        let reporter = Arc::clone(self);
        self.runtime.spawn(async move {
            reporter.ingest_native_trailer().await;
            reporter.sender.send_all_pending().await;
            reporter.store.cleanup_old_sent();
            if let Err(e) = reporter.fingerprints.periodic_cleanup() {
                debug!(error = %e, "fingerprint cleanup failed");
            }
        });

        // Time-based flush trigger for the non-fatal batch; the size trigger
        // lives in the sender itself.
        let sender = Arc::clone(&self.sender);
        let flush_interval =
            std::time::Duration::from_millis(self.config.batch_flush_interval_ms);
        self.runtime.spawn(async move {
            loop {
                tokio::time::sleep(flush_interval).await;
                if sender.batch_len() > 0 {
                    sender.flush_batch().await;
                }
            }
        });

        if self.config.enable_anr_detection {
            self.start_watchdog()?;
        }
        info!("crash reporter started");
        Ok(())
    }

    fn start_watchdog(self: &Arc<Self>) -> anyhow::Result<()> {
        let threshold = *self.anr_threshold_ms.lock().unwrap_or_else(|e| e.into_inner());
        let config = WatchdogConfig {
            check_interval_ms: self.config.anr_check_interval_ms,
            threshold_normal_ms: threshold,
            threshold_power_save_ms: self.config.anr_threshold_power_save_ms.max(threshold),
            cooldown_ms: self.config.anr_cooldown_ms,
        };
        let validator = Arc::new(AnrValidator::new(
            Arc::clone(&self.oracle),
            Arc::clone(&self.network_clock),
            config.threshold_normal_ms,
            config.threshold_power_save_ms,
        ));
        let weak: Weak<Reporter> = Arc::downgrade(self);
        let sink: AnrSink = Box::new(move |event| {
            if let Some(reporter) = weak.upgrade() {
                reporter.handle_anr_event(event);
            }
        });
        let watchdog = AnrWatchdog::start(
            config,
            Arc::clone(&self.oracle),
            validator,
            Arc::clone(&self.probe),
            sink,
        )?;
        if let Ok(mut slot) = self.watchdog.lock() {
            *slot = Some(watchdog);
        }
        Ok(())
    }

    /// Parses `native_crash.txt` left by a previous session, turns it into a
    /// Critical record, persists, and attempts delivery.  The trailer is
    /// removed once its contents are safely elsewhere (pending file or
    /// delivered payload); a malformed trailer is logged and removed.
    async fn ingest_native_trailer(self: &Arc<Self>) {
        let path = self.config.trailer_path();
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return,
        };
        info!(path = %path.display(), "found native crash from previous session");

        let parsed = match crate::receiver::parse_trailer(&contents) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "malformed native crash trailer, discarding");
                let _ = std::fs::remove_file(&path);
                return;
            }
        };

        let mut report = parsed.into_crash_report();
        self.enrich_report(&mut report);
        // The enrichment stamped this session's startup window; what matters
        // for a recovered record is whether the crashed session died before
        // finishing its own startup.
        report.is_startup_crash = self.startup.did_crash_on_startup();
        grouping::apply_grouping(&mut report);

        if self.store.save(&report).is_err() {
            // Leave the trailer for the next session to retry.
            return;
        }
        match self.sender.process(report).await {
            SendOutcome::Failed(e) => {
                // Record is pending; keep the trailer out of next session's way.
                warn!(error = %e, "native crash delivery failed, will retry from pending");
                let _ = std::fs::remove_file(&path);
            }
            _ => {
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    /// Panic-hook entry: the managed-exception path.
    pub fn handle_unhandled_panic(self: &Arc<Self>, message: &str, location: &str, stack: &str) {
        if let Err(e) = self.startup.record_crash() {
            debug!(error = %e, "failed to record crash time");
        }
        if self.brake_engaged() {
            return;
        }

        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed").to_string();
        let mut report = self.build_base_report(KIND_UNHANDLED_EXCEPTION, message, stack);
        report.thread_name = thread_name.clone();
        if !location.is_empty() {
            report
                .custom_data
                .insert("panic.location".to_string(), location.to_string());
        }
        report.threads = thread_snapshot::capture_all_threads(ThreadSnapshot {
            name: thread_name,
            state: "panicked".to_string(),
            stack_trace: stack.to_string(),
        });
        grouping::apply_grouping(&mut report);
        self.persist_then_send(report);
    }

    /// Bridge entry for host-language exceptions.
    pub fn handle_managed_exception(
        self: &Arc<Self>,
        kind: &str,
        message: &str,
        stack: &str,
        fatal: bool,
        custom_data: HashMap<String, String>,
    ) {
        if fatal {
            if let Err(e) = self.startup.record_crash() {
                debug!(error = %e, "failed to record crash time");
            }
        }
        if self.brake_engaged() {
            return;
        }

        let kind = if kind.is_empty() {
            KIND_UNHANDLED_EXCEPTION
        } else {
            kind
        };
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed").to_string();
        let mut report = self.build_base_report(kind, message, stack);
        report.thread_name = thread_name.clone();
        report.custom_data.extend(custom_data);
        if fatal {
            report.severity = Severity::Critical;
        }
        report.threads = thread_snapshot::capture_all_threads(ThreadSnapshot {
            name: thread_name,
            state: "crashed".to_string(),
            stack_trace: stack.to_string(),
        });
        grouping::apply_grouping(&mut report);
        self.persist_then_send(report);
    }

    /// Watchdog sink: runs on the watchdog thread.  The persist is
    /// deliberately synchronous here: it must complete before the async
    /// send is scheduled, so a force-close during the network attempt still
    /// finds the record on disk.
    fn handle_anr_event(self: &Arc<Self>, event: AnrEvent) {
        if self.brake_engaged() {
            return;
        }
        // All-thread snapshot, UI thread first.  When the probe cannot name
        // a stack, the live capture inside the snapshotter gets a chance to
        // supply one; the literal placeholder is the last resort.
        let mut threads = thread_snapshot::capture_all_threads(ThreadSnapshot {
            name: event.thread_name.clone(),
            state: "blocked".to_string(),
            stack_trace: event.ui_stack.unwrap_or_default(),
        });
        if threads[0].stack_trace.is_empty() {
            threads[0].stack_trace = "ANR detected - UI thread stack unavailable".to_string();
        }
        let stack = threads[0].stack_trace.clone();
        let message = format!(
            "Application Not Responding: UI thread blocked for {} ms",
            event.blocked_ms
        );
        let mut report = self.build_base_report(KIND_ANR, &message, &stack);
        report.thread_name = event.thread_name;
        report.threads = threads;
        report.is_anr = true;
        report.anr_duration_ms = Some(event.blocked_ms);
        report.anr_validation = Some(event.validation);
        grouping::apply_grouping(&mut report);
        self.persist_then_send(report);
    }

    /// Everything every path shares: snapshots, context, flags.
    fn build_base_report(&self, kind: &str, message: &str, stack: &str) -> CrashReport {
        let mut report = CrashReport::new(kind);
        report.exception_message = message.to_string();
        report.stack_trace = stack.to_string();
        self.enrich_report(&mut report);
        report
    }

    /// Folds current device conditions and context onto a record; also used
    /// for records recovered from a previous session's trailer, where
    /// identity fields are already set and must not be touched.
    fn enrich_report(&self, report: &mut CrashReport) {
        let os = os_info::get();
        report.device = DeviceSnapshot {
            model: String::new(),
            os_version: format!("{} {}", os.os_type(), os.version()),
            locale: std::env::var("LANG").unwrap_or_default(),
            screen_width: None,
            screen_height: None,
        };
        report.app = AppSnapshot {
            package_id: self.config.app_id.clone(),
            version: self.config.app_version.clone(),
            first_install: None,
            last_update: None,
        };
        report.device_state = self.oracle.snapshot(&self.config.data_dir);
        report.network.vpn_active = Some(self.oracle.vpn_active());
        report.network.proxy_active = Some(self.oracle.proxy_active());
        report.cpu = CpuInfo {
            core_count: std::thread::available_parallelism()
                .ok()
                .map(|n| n.get() as u32),
            arch: std::env::consts::ARCH.to_string(),
        };
        let importance = self.oracle.process_importance();
        report.process = ProcessSnapshot {
            // A record recovered from a trailer keeps the crashed process id.
            pid: report.process.pid.or(Some(std::process::id())),
            name: self.config.app_id.clone(),
            importance: importance.as_str().to_string(),
            foreground: Some(importance.user_facing()),
        };

        report.breadcrumbs = self.breadcrumbs.snapshot();
        for (key, value) in self.context.snapshot() {
            report.custom_data.entry(key).or_insert(value);
        }
        report.environment = if self.config.environment.is_empty() {
            self.context.environment()
        } else {
            self.config.environment.clone()
        };
        report.recent_logs = self.trackers.log_tail.snapshot();
        report.memory_warnings = self.trackers.memory_warnings.snapshot();
        report.network_changes = self.trackers.network_changes.snapshot();

        let ops = self.op_tracker.snapshot();
        for (key, value) in [
            ("operation.current", ops.current),
            ("operation.last_successful", ops.last_successful),
            ("operation.last_failed", ops.last_failed),
            ("operation.last_failure_reason", ops.last_failure_reason),
        ] {
            if let Some(value) = value {
                report.custom_data.insert(key.to_string(), value);
            }
        }

        report.is_startup_crash = self.startup.in_startup_window();
        report.is_crash_loop = self.startup.is_in_crash_loop(self.oracle.uptime_ms());
        report.startup_crash_count = self.startup.startup_crash_count();
    }

    /// The ordering rule, in one place: a successful `save` strictly
    /// precedes the dispatch.  The send itself is fire-and-forget; its
    /// failure leaves the pending file for the startup drain.
    fn persist_then_send(self: &Arc<Self>, report: CrashReport) {
        if let Err(e) = self.store.save(&report) {
            warn!(crash_id = %report.crash_id, error = %e, "failed to persist crash");
            return;
        }
        let sender = Arc::clone(&self.sender);
        self.runtime.spawn(async move {
            let _ = sender.process(report).await;
        });
    }

    /// True when reporting is disabled for this session, either explicitly
    /// or by the startup-loop safety brake.  The brake's window is measured
    /// against device uptime from the oracle: it exists to stop boot-time
    /// crash loops from being amplified by the reporter itself.
    fn brake_engaged(&self) -> bool {
        if self.reporting_disabled.load(Ordering::SeqCst) {
            return true;
        }
        if self.startup.should_disable_reporting(self.oracle.uptime_ms()) {
            warn!("startup crash loop: disabling crash reporting for this session");
            self.reporting_disabled.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn mark_app_initialized(&self) -> anyhow::Result<()> {
        self.startup.mark_initialized()
    }

    pub fn set_anr_threshold(self: &Arc<Self>, threshold_ms: u64) -> anyhow::Result<()> {
        if threshold_ms < 1_000 {
            warn!(threshold_ms, "ANR threshold below 1000 ms will be noisy");
        }
        if let Ok(mut current) = self.anr_threshold_ms.lock() {
            *current = threshold_ms;
        }
        // The watchdog reads its thresholds at start; apply by restart.
        let running = self
            .watchdog
            .lock()
            .map(|w| w.is_some())
            .unwrap_or(false);
        if running {
            self.stop_watchdog();
            self.start_watchdog()?;
        }
        Ok(())
    }

    pub fn pause_anr_detection(&self) {
        if let Ok(watchdog) = self.watchdog.lock() {
            if let Some(watchdog) = watchdog.as_ref() {
                watchdog.pause();
            }
        }
    }

    pub fn resume_anr_detection(&self) {
        if let Ok(watchdog) = self.watchdog.lock() {
            if let Some(watchdog) = watchdog.as_ref() {
                watchdog.resume();
            }
        }
    }

    pub fn send_pending_crashes_now(&self) {
        let sender = Arc::clone(&self.sender);
        self.runtime.spawn(async move {
            sender.send_all_pending().await;
        });
    }

    pub fn pending_crash_count(&self) -> usize {
        self.store.pending_count()
    }

    pub fn add_breadcrumb(&self, crumb: Breadcrumb) {
        self.breadcrumbs.add(crumb);
    }

    pub fn set_custom_data(&self, key: String, value: String) {
        self.context.set(key, value);
    }

    pub fn op_tracker(&self) -> &Arc<OperationTracker> {
        &self.op_tracker
    }

    /// Appends one line to the bounded recent-log tail carried on every
    /// record.
    pub fn record_log_line(&self, line: &str) {
        self.trackers.log_tail.push(line.to_string());
    }

    pub fn report_memory_pressure(&self, level: &str, description: &str) {
        self.trackers.memory_warnings.push(StateEvent {
            timestamp: Utc::now(),
            kind: level.to_string(),
            description: description.to_string(),
        });
    }

    pub fn report_network_change(&self, kind: &str, description: &str) {
        if matches!(kind, "lost" | "disconnected") {
            self.network_clock.record_loss();
        }
        self.trackers.network_changes.push(StateEvent {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            description: description.to_string(),
        });
    }

    /// Informational only; never pauses ANR detection.  A real ANR can start
    /// with the screen on and continue as it turns off; the validation
    /// engine alone decides what that means.
    pub fn report_screen_state(&self, screen_on: bool) {
        info!(screen_on, "screen state changed");
        self.breadcrumbs.add(Breadcrumb::new(
            "system",
            "info",
            if screen_on { "screen on" } else { "screen off" },
        ));
    }

    /// Stops the watchdog, flushes queued work best-effort and restores
    /// native handler dispositions.
    pub fn shutdown(&self) {
        self.stop_watchdog();
        let sender = Arc::clone(&self.sender);
        self.runtime.block_on(async move {
            sender.flush_batch().await;
        });
        #[cfg(unix)]
        if let Err(e) = crate::collector::restore_old_handlers() {
            debug!(error = %e, "native handlers already restored");
        }
        self.breadcrumbs.clear();
        self.context.clear();
        self.op_tracker.clear();
        self.reporting_disabled.store(true, Ordering::SeqCst);
        info!("crash reporter shut down");
    }

    fn stop_watchdog(&self) {
        if let Ok(mut slot) = self.watchdog.lock() {
            if let Some(watchdog) = slot.take() {
                watchdog.stop();
            }
        }
    }
}
