// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracks what the application was doing when it crashed.
//!
//! If a crash consistently occurs while a particular operation is ongoing,
//! it is likely related.  The handler folds the snapshot into the custom data
//! of every managed-path record.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationSnapshot {
    pub current: Option<String>,
    pub last_successful: Option<String>,
    pub last_failed: Option<String>,
    pub last_failure_reason: Option<String>,
    pub last_transition: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct OperationTracker {
    state: Mutex<OperationSnapshot>,
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, operation: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.current = Some(operation.into());
            state.last_transition = Some(Utc::now());
        }
    }

    pub fn succeed(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.last_successful = state.current.take();
            state.last_transition = Some(Utc::now());
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.last_failed = state.current.take();
            state.last_failure_reason = Some(reason.into());
            state.last_transition = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        self.state.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = OperationSnapshot::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_moves_current() {
        let tracker = OperationTracker::new();
        tracker.begin("checkout");
        tracker.succeed();
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.last_successful.as_deref(), Some("checkout"));
        assert!(snapshot.current.is_none());
    }

    #[test]
    fn test_failure_records_reason() {
        let tracker = OperationTracker::new();
        tracker.begin("image_decode");
        tracker.fail("unsupported format");
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.last_failed.as_deref(), Some("image_decode"));
        assert_eq!(
            snapshot.last_failure_reason.as_deref(),
            Some("unsupported format")
        );
    }
}
