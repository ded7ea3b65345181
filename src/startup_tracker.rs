// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Startup-crash and crash-loop detection.
//!
//! A small persisted key/value state answers two questions on every launch:
//! did the previous session die before finishing critical init, and is the
//! app crashing repeatedly right after start?  The latter feeds the safety
//! brake that disables reporting entirely rather than letting the reporter
//! amplify a crash loop.

use crate::shared::constants::{
    CRASH_LOOP_THRESHOLD, CRASH_LOOP_WINDOW_MS, SAFETY_BRAKE_THRESHOLD, STARTUP_CRASH_WINDOW_MS,
    STARTUP_STATE_FILE,
};
use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct StartupState {
    app_started: bool,
    app_started_time: u64,
    startup_crash_count: u32,
    last_crash_time: u64,
}

pub struct StartupTracker {
    path: PathBuf,
    state: Mutex<StartupState>,
    /// Whether `app_started` was still set when this session began, i.e. the
    /// prior session crashed before `mark_initialized`.
    crashed_on_startup: bool,
}

impl StartupTracker {
    pub fn new(data_dir: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create {}", data_dir.display()))?;
        let path = data_dir.join(STARTUP_STATE_FILE);
        let state: StartupState = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt startup state, starting fresh");
                StartupState::default()
            }),
            Err(_) => StartupState::default(),
        };
        let crashed_on_startup = state.app_started;
        Ok(Self {
            path,
            state: Mutex::new(state),
            crashed_on_startup,
        })
    }

    /// Called at orchestrator init, before anything that could crash.
    pub fn mark_started(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        state.app_started = true;
        state.app_started_time = now_ms();
        self.persist(&state)
    }

    /// Called by the host once critical startup is complete.
    pub fn mark_initialized(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        state.app_started = false;
        self.persist(&state)
    }

    /// Called at crash time.  Crashes within the startup window bump the
    /// rolling counter that drives loop detection and the safety brake.
    pub fn record_crash(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        let now = now_ms();
        state.last_crash_time = now;
        if now.saturating_sub(state.app_started_time) < STARTUP_CRASH_WINDOW_MS {
            state.startup_crash_count += 1;
        }
        self.persist(&state)
    }

    pub fn did_crash_on_startup(&self) -> bool {
        self.crashed_on_startup
    }

    /// True while the current session is still inside the startup window.
    pub fn in_startup_window(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        now_ms().saturating_sub(state.app_started_time) < STARTUP_CRASH_WINDOW_MS
    }

    /// True when the startup-crash counter reached the loop threshold while
    /// the device is still inside the boot window.  `uptime_ms` comes from
    /// the device-state oracle: the loop this guards against is the app
    /// crash-looping at device boot, not crashes clustered around one of its
    /// own relaunches.  Outside the window the counter resets so a slow
    /// trickle of crashes never reads as a loop.
    pub fn is_in_crash_loop(&self, uptime_ms: u64) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let within_window = uptime_ms < CRASH_LOOP_WINDOW_MS;
        if !within_window && state.startup_crash_count > 0 {
            state.startup_crash_count = 0;
            let _ = self.persist(&state);
            return false;
        }
        within_window && state.startup_crash_count >= CRASH_LOOP_THRESHOLD
    }

    /// The safety brake: too many startup crashes this soon after device
    /// boot means the reporter itself may be part of the loop, so stop
    /// reporting.
    pub fn should_disable_reporting(&self, uptime_ms: u64) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.startup_crash_count >= SAFETY_BRAKE_THRESHOLD && uptime_ms < CRASH_LOOP_WINDOW_MS
    }

    pub fn startup_crash_count(&self) -> u32 {
        self.state.lock().map(|s| s.startup_crash_count).unwrap_or(0)
    }

    pub fn clear(&self) -> anyhow::Result<()> {
        let mut state = self.lock()?;
        *state = StartupState::default();
        self.persist(&state)
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, StartupState>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("startup tracker poisoned"))
    }

    fn persist(&self, state: &StartupState) -> anyhow::Result<()> {
        let json = serde_json::to_string(state)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
