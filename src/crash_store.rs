// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Directory-backed durable queue of crash payloads.
//!
//! `pending/` holds records awaiting delivery; `sent/` holds delivered
//! records until retention removes them.  `save` persists before any network
//! call is allowed, which is what makes delivery at-least-once across
//! process death.

use crate::crash_info::CrashReport;
use crate::shared::constants::SENT_RETENTION_MS;
use anyhow::Context;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

pub struct CrashStore {
    pending_dir: PathBuf,
    sent_dir: PathBuf,
}

impl CrashStore {
    pub fn new(crashes_dir: &Path) -> anyhow::Result<Self> {
        let pending_dir = crashes_dir.join("pending");
        let sent_dir = crashes_dir.join("sent");
        fs::create_dir_all(&pending_dir)
            .with_context(|| format!("Failed to create {}", pending_dir.display()))?;
        fs::create_dir_all(&sent_dir)
            .with_context(|| format!("Failed to create {}", sent_dir.display()))?;
        Ok(Self {
            pending_dir,
            sent_dir,
        })
    }

    /// Writes `pending/crash_<id>.json` atomically: serialize to a temp file
    /// in the same directory, fsync, then rename over the final name.
    pub fn save(&self, report: &CrashReport) -> anyhow::Result<()> {
        let final_path = self.pending_path(&report.crash_id);
        let tmp_path = self
            .pending_dir
            .join(format!(".crash_{}.tmp", report.crash_id.simple()));

        let file = File::create(&tmp_path)
            .with_context(|| format!("Failed to create {}", tmp_path.display()))?;
        serde_json::to_writer(&file, report)
            .with_context(|| format!("Failed to write json to {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to fsync {}", tmp_path.display()))?;
        drop(file);

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "Failed to rename {} into {}",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        debug!(crash_id = %report.crash_id, "crash persisted");
        Ok(())
    }

    pub fn load(&self, crash_id: &Uuid) -> anyhow::Result<CrashReport> {
        CrashReport::from_file(&self.pending_path(crash_id))
    }

    /// Moves a delivered record into `sent/`.  Returns false when the pending
    /// file no longer exists (already acknowledged or deleted by retention).
    pub fn mark_sent(&self, crash_id: &Uuid) -> bool {
        let from = self.pending_path(crash_id);
        let to = self.sent_dir.join(Self::file_name(crash_id));
        match fs::rename(&from, &to) {
            Ok(()) => true,
            Err(e) => {
                warn!(crash_id = %crash_id, error = %e, "mark_sent failed");
                false
            }
        }
    }

    /// Pending crash files in filesystem order.
    pub fn list_pending(&self) -> Vec<PathBuf> {
        let Ok(dir) = fs::read_dir(&self.pending_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("crash_") && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        files
    }

    pub fn pending_count(&self) -> usize {
        self.list_pending().len()
    }

    /// Deletes files in `sent/` older than the retention window.
    pub fn cleanup_old_sent(&self) {
        let Ok(dir) = fs::read_dir(&self.sent_dir) else {
            return;
        };
        let cutoff = SystemTime::now() - Duration::from_millis(SENT_RETENTION_MS);
        for entry in dir.filter_map(|e| e.ok()) {
            let age_exceeded = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| modified < cutoff)
                .unwrap_or(false);
            if age_exceeded {
                if let Err(e) = fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "retention delete failed");
                }
            }
        }
    }

    pub fn delete(&self, crash_id: &Uuid) -> anyhow::Result<()> {
        let path = self.pending_path(crash_id);
        fs::remove_file(&path).with_context(|| format!("Failed to delete {}", path.display()))
    }

    pub fn delete_all(&self) -> anyhow::Result<()> {
        for path in self.list_pending() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
        }
        Ok(())
    }

    fn file_name(crash_id: &Uuid) -> String {
        format!("crash_{}.json", crash_id)
    }

    fn pending_path(&self, crash_id: &Uuid) -> PathBuf {
        self.pending_dir.join(Self::file_name(crash_id))
    }
}
