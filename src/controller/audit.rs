//! Audit Log
//!
//! Append-only record of every CompletionReport, optionally mirrored to a
//! JSON-lines file.

use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

use crate::types::CompletionReport;

#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<CompletionReport>>,
    mirror: Option<Mutex<File>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that also appends each report as a JSON line to `path`
    pub fn with_file(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            entries: RwLock::new(Vec::new()),
            mirror: Some(Mutex::new(file)),
        })
    }

    pub fn append(&self, report: CompletionReport) {
        if let Some(mirror) = &self.mirror {
            let written = serde_json::to_string(&report)
                .map_err(std::io::Error::other)
                .and_then(|line| writeln!(mirror.lock(), "{}", line));
            if let Err(e) = written {
                // The in-memory log stays authoritative
                warn!("Audit mirror write failed for {}: {}", report.task_id, e);
            }
        }
        self.entries.write().push(report);
    }

    /// Most recent report for a task id
    pub fn find(&self, task_id: &str) -> Option<CompletionReport> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|r| r.task_id == task_id)
            .cloned()
    }

    /// Last `n` reports, newest first
    pub fn recent(&self, n: usize) -> Vec<CompletionReport> {
        self.entries.read().iter().rev().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
