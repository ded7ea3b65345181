// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multi-factor classification of a detected ANR.
//!
//! The engine is pure over its inputs plus oracle reads so every factor is
//! independently testable.  When classification itself fails, the answer is
//! `valid` at confidence 50: over-reporting a questionable ANR is cheaper
//! than missing a real one.

use crate::device_state::{DeviceStateSource, ProcessImportance};
use crate::shared::constants::{LOW_BATTERY_FRACTION, NETWORK_LOSS_WINDOW_MS};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub const REASON_BACKGROUND_APP: &str = "BACKGROUND_APP";
pub const REASON_SCREEN_OFF: &str = "SCREEN_OFF_AT_DETECTION";
pub const REASON_NETWORK_TRANSITION: &str = "RECENT_NETWORK_TRANSITION";
pub const REASON_DURATION_BELOW_THRESHOLD: &str = "DURATION_BELOW_THRESHOLD";
pub const REASON_ALL_FACTORS_PASSED: &str = "ALL_FACTORS_PASSED";
pub const REASON_VALIDATION_ERROR: &str = "VALIDATION_ERROR";

/// The inputs the verdict was computed over, kept on the record so the
/// backend can audit rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnrFactors {
    pub process_importance: String,
    pub screen_on: bool,
    pub network_lost: bool,
    pub power_save: bool,
    pub battery_fraction: f64,
    pub adjusted_threshold_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnrValidation {
    pub valid: bool,
    pub reason: String,
    /// 50..=99; 99 means the factor is decisive, 50 means the engine failed
    /// and defaulted to reporting.
    pub confidence: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub blocking_factor: Option<String>,
    pub factors: AnrFactors,
}

/// Monotonic record of the most recent connectivity loss, fed by the
/// orchestrator's network tracker.
#[derive(Debug, Default)]
pub struct NetworkLossClock {
    last_loss_ms: AtomicU64,
}

impl NetworkLossClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_loss(&self) {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_loss_ms.store(now, Ordering::Relaxed);
    }

    pub fn ms_since_loss(&self) -> Option<u64> {
        let last = self.last_loss_ms.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        let now = Utc::now().timestamp_millis().max(0) as u64;
        Some(now.saturating_sub(last))
    }
}

pub struct AnrValidator {
    oracle: Arc<dyn DeviceStateSource>,
    network: Arc<NetworkLossClock>,
    threshold_normal_ms: u64,
    threshold_power_save_ms: u64,
}

impl AnrValidator {
    pub fn new(
        oracle: Arc<dyn DeviceStateSource>,
        network: Arc<NetworkLossClock>,
        threshold_normal_ms: u64,
        threshold_power_save_ms: u64,
    ) -> Self {
        Self {
            oracle,
            network,
            threshold_normal_ms,
            threshold_power_save_ms,
        }
    }

    /// Classifies a detected block.  `importance` and `screen_on` are the
    /// values captured *at detection time* by the watchdog; power, battery
    /// and network are read fresh here.
    pub fn validate(
        &self,
        blocked_ms: u64,
        importance: ProcessImportance,
        screen_on: bool,
    ) -> AnrValidation {
        match self.validate_inner(blocked_ms, importance, screen_on) {
            Ok(validation) => validation,
            Err(e) => {
                debug!(error = %e, "ANR validation failed, defaulting to valid");
                AnrValidation {
                    valid: true,
                    reason: REASON_VALIDATION_ERROR.to_string(),
                    confidence: 50,
                    blocking_factor: None,
                    factors: AnrFactors::default(),
                }
            }
        }
    }

    fn validate_inner(
        &self,
        blocked_ms: u64,
        importance: ProcessImportance,
        screen_on: bool,
    ) -> anyhow::Result<AnrValidation> {
        let power_save = self.oracle.power_save();
        let battery_fraction = self.oracle.battery_fraction();
        let adjusted_threshold_ms = if power_save || battery_fraction < LOW_BATTERY_FRACTION {
            self.threshold_power_save_ms
        } else {
            self.threshold_normal_ms
        };
        let network_lost = self
            .network
            .ms_since_loss()
            .map(|ms| ms <= NETWORK_LOSS_WINDOW_MS)
            .unwrap_or(false);

        let factors = AnrFactors {
            process_importance: importance.as_str().to_string(),
            screen_on,
            network_lost,
            power_save,
            battery_fraction,
            adjusted_threshold_ms,
        };

        // Ordered: the cheapest, most decisive rejections first.
        if !importance.user_facing() {
            return Ok(rejection(REASON_BACKGROUND_APP, 99, "process_importance", factors));
        }
        if !screen_on {
            return Ok(rejection(REASON_SCREEN_OFF, 95, "screen_state", factors));
        }
        if network_lost && blocked_ms < self.threshold_power_save_ms {
            return Ok(rejection(REASON_NETWORK_TRANSITION, 85, "network", factors));
        }
        if blocked_ms < adjusted_threshold_ms {
            return Ok(rejection(
                REASON_DURATION_BELOW_THRESHOLD,
                80,
                "duration",
                factors,
            ));
        }

        Ok(AnrValidation {
            valid: true,
            reason: REASON_ALL_FACTORS_PASSED.to_string(),
            confidence: 99,
            blocking_factor: None,
            factors,
        })
    }
}

fn rejection(reason: &str, confidence: u8, factor: &str, factors: AnrFactors) -> AnrValidation {
    AnrValidation {
        valid: false,
        reason: reason.to_string(),
        confidence,
        blocking_factor: Some(factor.to_string()),
        factors,
    }
}
