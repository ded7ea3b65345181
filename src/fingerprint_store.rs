// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable record of which fingerprints were already reported, so identical
//! crashes across process restarts collapse into one payload per window.

use crate::shared::constants::{FINGERPRINT_FILE, FINGERPRINT_WINDOW_MS};
use anyhow::Context;
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Map of fingerprint → last-reported epoch ms, persisted as a single JSON
/// file under the cache directory.  Every mutation flushes to disk before
/// returning; a corrupt or missing file is treated as empty.
pub struct FingerprintStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, u64>>,
}

impl FingerprintStore {
    pub fn new(cache_dir: &std::path::Path) -> anyhow::Result<Self> {
        fs::create_dir_all(cache_dir)
            .with_context(|| format!("Failed to create {}", cache_dir.display()))?;
        let path = cache_dir.join(FINGERPRINT_FILE);
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "corrupt fingerprint file, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn was_recently_reported(&self, fingerprint: &str) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(fingerprint) {
            Some(&reported_ms) => now_ms().saturating_sub(reported_ms) <= FINGERPRINT_WINDOW_MS,
            None => false,
        }
    }

    /// Records `fingerprint` as reported now.  The write is flushed before
    /// this returns so a crash right after still sees the mark next session.
    pub fn mark_as_reported(&self, fingerprint: &str) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("fingerprint store poisoned"))?;
        entries.insert(fingerprint.to_string(), now_ms());
        self.persist(&entries)
    }

    /// Drops entries older than the window; rewrites the file only when
    /// something was actually removed.
    pub fn periodic_cleanup(&self) -> anyhow::Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow::anyhow!("fingerprint store poisoned"))?;
        let now = now_ms();
        let before = entries.len();
        entries.retain(|_, &mut reported_ms| now.saturating_sub(reported_ms) <= FINGERPRINT_WINDOW_MS);
        if entries.len() != before {
            debug!(removed = before - entries.len(), "fingerprint cleanup");
            self.persist(&entries)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self, entries: &HashMap<String, u64>) -> anyhow::Result<()> {
        let json = serde_json::to_string(entries)?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn now_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
