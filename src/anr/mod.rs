// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! ANR detection: a watchdog thread that notices a blocked UI-equivalent
//! thread, and a multi-factor validation engine that rejects the false
//! positives (backgrounded app, screen off, power-save slowdown, network
//! transition) before anything is reported.

mod validation;
mod watchdog;

pub use validation::{
    AnrFactors, AnrValidation, AnrValidator, NetworkLossClock, REASON_ALL_FACTORS_PASSED,
    REASON_BACKGROUND_APP, REASON_DURATION_BELOW_THRESHOLD, REASON_NETWORK_TRANSITION,
    REASON_SCREEN_OFF, REASON_VALIDATION_ERROR,
};
pub use watchdog::{AnrEvent, AnrSink, AnrWatchdog, ChannelUiProbe, UiThreadProbe, WatchdogConfig};
