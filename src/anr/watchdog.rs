// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The watchdog thread.
//!
//! Liveness of the UI-equivalent thread is probed indirectly: the watchdog
//! posts a tiny task through [`UiThreadProbe`] that bumps a monotonic
//! `last_ping` counter.  If the counter goes stale past the adjusted
//! threshold, the block is handed to the validation engine, and only a
//! verdict of `valid` produces a report.  A cooldown keeps one long hang
//! from turning into a storm of reports.

use crate::anr::validation::{AnrValidation, AnrValidator};
use crate::device_state::DeviceStateSource;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Capability for reaching the UI-equivalent thread.  On platforms without a
/// single UI thread, any equivalent liveness primitive works: the contract is
/// only that a healthy target eventually runs posted tasks.
pub trait UiThreadProbe: Send + Sync {
    fn post(&self, task: Box<dyn FnOnce() + Send + 'static>);

    fn thread_name(&self) -> String {
        "main".to_string()
    }

    /// Stack trace of the probed thread, when the platform can produce one.
    fn stack_trace(&self) -> Option<String> {
        None
    }
}

/// A probe backed by a dedicated event-loop thread draining a channel.
/// Doubles as the test harness: posting a long sleep simulates a blocked UI
/// thread.
pub struct ChannelUiProbe {
    tx: std::sync::mpsc::Sender<Box<dyn FnOnce() + Send + 'static>>,
    name: String,
}

impl ChannelUiProbe {
    pub fn spawn(name: &str) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send + 'static>>();
        let thread_name = name.to_string();
        let builder = std::thread::Builder::new().name(thread_name.clone());
        let _ = builder.spawn(move || {
            while let Ok(task) = rx.recv() {
                task();
            }
        });
        Self {
            tx,
            name: name.to_string(),
        }
    }
}

impl UiThreadProbe for ChannelUiProbe {
    fn post(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        if self.tx.send(task).is_err() {
            warn!("UI probe target is gone, ping dropped");
        }
    }

    fn thread_name(&self) -> String {
        self.name.clone()
    }
}

/// A detected, validated ANR, ready for the orchestrator to turn into a
/// crash record (persist first, then send).
#[derive(Debug)]
pub struct AnrEvent {
    pub blocked_ms: u64,
    pub validation: AnrValidation,
    pub ui_stack: Option<String>,
    pub thread_name: String,
}

pub type AnrSink = Box<dyn Fn(AnrEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval_ms: u64,
    pub threshold_normal_ms: u64,
    pub threshold_power_save_ms: u64,
    pub cooldown_ms: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Running,
    Paused,
    Stopped,
}

struct Inner {
    state: Mutex<State>,
    state_changed: Condvar,
    /// Milliseconds since `origin`, written by the ping task on the UI thread.
    last_ping: AtomicU64,
    origin: Instant,
    last_report: Mutex<Option<Instant>>,
    config: WatchdogConfig,
    oracle: Arc<dyn DeviceStateSource>,
    validator: Arc<AnrValidator>,
    probe: Arc<dyn UiThreadProbe>,
    sink: AnrSink,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn prime_ping(&self) {
        self.last_ping.store(self.now_ms(), Ordering::SeqCst);
    }

    fn post_ping(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.probe.post(Box::new(move || {
            inner.last_ping.store(inner.now_ms(), Ordering::SeqCst);
        }));
    }

    fn adjusted_threshold_ms(&self) -> u64 {
        let power_save = self.oracle.power_save();
        let battery = self.oracle.battery_fraction();
        if power_save || battery < crate::shared::constants::LOW_BATTERY_FRACTION {
            self.config.threshold_power_save_ms
        } else {
            self.config.threshold_normal_ms
        }
    }

    fn cooldown_elapsed(&self) -> bool {
        self.last_report
            .lock()
            .map(|last| match *last {
                Some(at) => at.elapsed() >= Duration::from_millis(self.config.cooldown_ms),
                None => true,
            })
            .unwrap_or(false)
    }

    fn run(self: Arc<Self>) {
        self.prime_ping();
        self.post_ping();
        loop {
            let state = {
                let guard = match self.state.lock() {
                    Ok(g) => g,
                    Err(_) => break,
                };
                let interval = Duration::from_millis(self.config.check_interval_ms);
                let (guard, _timeout) = match self.state_changed.wait_timeout(guard, interval) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                *guard
            };
            match state {
                State::Stopped => break,
                State::Paused => continue,
                State::Running => {}
            }

            let blocked_ms = self.now_ms().saturating_sub(self.last_ping.load(Ordering::SeqCst));
            let threshold = self.adjusted_threshold_ms();
            if blocked_ms > threshold && self.cooldown_elapsed() {
                self.report(blocked_ms);
            }
            self.post_ping();
        }
        debug!("ANR watchdog exited");
    }

    fn report(self: &Arc<Self>, blocked_ms: u64) {
        // Snapshot at detection time: by the time the record is persisted the
        // user may have backgrounded the app or the screen may have gone off,
        // and the verdict must be judged against the moment of the hang.
        let importance = self.oracle.process_importance();
        let screen_on = self.oracle.screen_on();
        let validation = self.validator.validate(blocked_ms, importance, screen_on);
        if !validation.valid {
            debug!(
                blocked_ms,
                reason = %validation.reason,
                confidence = validation.confidence,
                "ANR rejected by validation"
            );
            return;
        }

        info!(blocked_ms, "ANR detected and validated");
        if let Ok(mut last_report) = self.last_report.lock() {
            *last_report = Some(Instant::now());
        }
        (self.sink)(AnrEvent {
            blocked_ms,
            validation,
            ui_stack: self.probe.stack_trace(),
            thread_name: self.probe.thread_name(),
        });
    }
}

/// Owns the daemon thread.  `pause` keeps `last_ping` frozen (a cooperative
/// long operation is not an ANR); `resume` re-primes it so the paused span is
/// never counted as a block.
pub struct AnrWatchdog {
    inner: Arc<Inner>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl AnrWatchdog {
    pub fn start(
        config: WatchdogConfig,
        oracle: Arc<dyn DeviceStateSource>,
        validator: Arc<AnrValidator>,
        probe: Arc<dyn UiThreadProbe>,
        sink: AnrSink,
    ) -> anyhow::Result<Self> {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::Running),
            state_changed: Condvar::new(),
            last_ping: AtomicU64::new(0),
            origin: Instant::now(),
            last_report: Mutex::new(None),
            config,
            oracle,
            validator,
            probe,
            sink,
        });
        let runner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("anr-watchdog".to_string())
            .spawn(move || runner.run())?;
        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn pause(&self) {
        self.transition(State::Paused);
    }

    pub fn resume(&self) {
        // Re-prime before flipping state so the watchdog never compares
        // against a ping frozen across the pause.
        self.inner.prime_ping();
        self.inner.post_ping();
        self.transition(State::Running);
    }

    /// Terminal: interrupts the sleep and joins the thread.
    pub fn stop(&self) {
        self.transition(State::Stopped);
        if let Ok(mut handle) = self.handle.lock() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|s| *s == State::Paused)
            .unwrap_or(false)
    }

    fn transition(&self, next: State) {
        if let Ok(mut state) = self.inner.state.lock() {
            if *state == State::Stopped {
                return;
            }
            *state = next;
            self.inner.state_changed.notify_all();
        }
    }
}

impl Drop for AnrWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anr::validation::NetworkLossClock;
    use crate::device_state::FixedStateSource;
    use std::sync::mpsc;

    fn fast_config() -> WatchdogConfig {
        WatchdogConfig {
            check_interval_ms: 25,
            threshold_normal_ms: 100,
            threshold_power_save_ms: 150,
            cooldown_ms: 400,
        }
    }

    fn harness(
        config: WatchdogConfig,
    ) -> (Arc<ChannelUiProbe>, mpsc::Receiver<AnrEvent>, AnrWatchdog) {
        let oracle: Arc<dyn DeviceStateSource> = Arc::new(FixedStateSource::default());
        let validator = Arc::new(AnrValidator::new(
            Arc::clone(&oracle),
            Arc::new(NetworkLossClock::new()),
            config.threshold_normal_ms,
            config.threshold_power_save_ms,
        ));
        let probe = Arc::new(ChannelUiProbe::spawn("main"));
        let (tx, rx) = mpsc::channel();
        let sink: AnrSink = Box::new(move |event| {
            let _ = tx.send(event);
        });
        let watchdog = AnrWatchdog::start(
            config,
            oracle,
            validator,
            Arc::clone(&probe) as Arc<dyn UiThreadProbe>,
            sink,
        )
        .unwrap();
        (probe, rx, watchdog)
    }

    #[test]
    fn test_healthy_ui_thread_never_reported() {
        let (_probe, rx, watchdog) = harness(fast_config());
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        watchdog.stop();
    }

    #[test]
    fn test_blocked_ui_thread_reported() {
        let (probe, rx, watchdog) = harness(fast_config());
        probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));
        let event = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("expected an ANR report");
        assert!(event.blocked_ms > 100);
        assert!(event.validation.valid);
        assert_eq!(event.thread_name, "main");
        watchdog.stop();
    }

    #[test]
    fn test_cooldown_suppresses_report_storm() {
        let (probe, rx, watchdog) = harness(fast_config());
        // One long block, several times the threshold.
        probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(380))));
        let _first = rx.recv_timeout(Duration::from_secs(2)).expect("first report");
        // Within the cooldown the continued hang produces nothing.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        watchdog.stop();
    }

    #[test]
    fn test_pause_suppresses_detection_resume_reprimes() {
        let (probe, rx, watchdog) = harness(fast_config());
        watchdog.pause();
        assert!(watchdog.is_paused());
        probe.post(Box::new(|| std::thread::sleep(Duration::from_millis(300))));
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
        // By resume time the block is over; the re-primed ping must keep the
        // stale pre-pause counter from being read as a hang.
        watchdog.resume();
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
        watchdog.stop();
    }

    #[test]
    fn test_stop_is_terminal() {
        let (_probe, _rx, watchdog) = harness(fast_config());
        watchdog.stop();
        watchdog.resume();
        assert!(!watchdog.is_paused());
    }
}
