// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The managed-exception hook.
//!
//! Installed as the process-wide panic hook: any unhandled panic on any
//! worker thread flows through here, is recorded against the startup/loop
//! detector, persisted synchronously (so force-close right after still finds
//! it on disk), sent best-effort, and finally handed to whatever hook was
//! installed before ours.
//!
//! The hook captures the panicking thread's own backtrace; the record
//! assembly in the orchestrator widens that into the all-thread snapshot
//! list via [`crate::thread_snapshot`].

use crate::orchestrator;
use std::sync::Once;
use tracing::debug;

static INSTALL: Once = Once::new();

/// Chains our capture in front of the previously installed panic hook.
/// Installed once per process; the reporter looked up at panic time is
/// whatever the global registry holds, so shutdown/re-init does not require
/// re-hooking.
pub fn install_panic_hook() {
    INSTALL.call_once(|| {
        let prior = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info);
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_default();
            let stack_trace = std::backtrace::Backtrace::force_capture().to_string();
            if let Some(reporter) = orchestrator::global() {
                reporter.handle_unhandled_panic(&message, &location, &stack_trace);
            } else {
                debug!("panic before reporter init, passing through");
            }
            // The platform's own termination behavior stays intact.
            prior(info);
        }));
    });
}

fn panic_message(info: &std::panic::PanicHookInfo<'_>) -> String {
    if let Some(s) = info.payload().downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_is_idempotent() {
        install_panic_hook();
        install_panic_hook();
        // A panic in a scratch thread must not kill the test process and
        // must reach the prior (default) hook without a reporter installed.
        let result = std::thread::spawn(|| panic!("scratch panic")).join();
        assert!(result.is_err());
    }
}
