// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory context: the breadcrumb ring, the custom key/value
//! store, the recent-log tail and the memory/network event rings.
//!
//! All of these share one shape: appenders never block beyond a short
//! critical section, overflow evicts the oldest entry atomically with the
//! insertion, and readers get an owned snapshot in insertion order.

use crate::crash_info::StateEvent;
use crate::shared::constants::{
    BREADCRUMB_CAPACITY, CUSTOM_DATA_CAPACITY, LOG_TAIL_CAPACITY, STATE_EVENT_CAPACITY,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    #[serde(default)]
    pub data: HashMap<String, String>,
}

impl Breadcrumb {
    pub fn new(
        category: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            category: category.into(),
            level: level.into(),
            message: message.into(),
            data: HashMap::new(),
        }
    }
}

/// Concurrent FIFO of the most recent `capacity` entries.
#[derive(Debug)]
pub struct Ring<T> {
    entries: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Eviction of the oldest entry happens under the same lock as the push,
    /// so readers never observe the ring above capacity.
    pub fn push(&self, entry: T) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

pub struct BreadcrumbRing {
    ring: Ring<Breadcrumb>,
}

impl BreadcrumbRing {
    pub fn new() -> Self {
        Self {
            ring: Ring::new(BREADCRUMB_CAPACITY),
        }
    }

    pub fn add(&self, crumb: Breadcrumb) {
        self.ring.push(crumb);
    }

    pub fn snapshot(&self) -> Vec<Breadcrumb> {
        self.ring.snapshot()
    }

    pub fn clear(&self) {
        self.ring.clear()
    }
}

impl Default for BreadcrumbRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Custom tags plus the environment label.  Writers replace, readers copy.
pub struct ContextStore {
    data: Mutex<HashMap<String, String>>,
    environment: Mutex<String>,
}

impl ContextStore {
    pub fn new(environment: String) -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            environment: Mutex::new(environment),
        }
    }

    pub fn set(&self, key: String, value: String) {
        let Ok(mut data) = self.data.lock() else {
            return;
        };
        if data.len() >= CUSTOM_DATA_CAPACITY && !data.contains_key(&key) {
            warn!(key, "custom data full, dropping entry");
            return;
        }
        data.insert(key, value);
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut data) = self.data.lock() {
            data.remove(key);
        }
    }

    pub fn snapshot(&self) -> HashMap<String, String> {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn environment(&self) -> String {
        self.environment.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut data) = self.data.lock() {
            data.clear();
        }
    }
}

/// The informational rings the orchestrator's trackers feed.
pub struct EventTrackers {
    pub log_tail: Ring<String>,
    pub memory_warnings: Ring<StateEvent>,
    pub network_changes: Ring<StateEvent>,
}

impl EventTrackers {
    pub fn new() -> Self {
        Self {
            log_tail: Ring::new(LOG_TAIL_CAPACITY),
            memory_warnings: Ring::new(STATE_EVENT_CAPACITY),
            network_changes: Ring::new(STATE_EVENT_CAPACITY),
        }
    }
}

impl Default for EventTrackers {
    fn default() -> Self {
        Self::new()
    }
}
