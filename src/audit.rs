use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

/// Destination for build-time privacy audit records.
pub(crate) trait AuditSink: Send + Sync {
    /// Record every provenance line found in one unit. Called at most once per unit.
    fn record(&self, unit: &str, lines: &[String]) -> Result<()>;
}

/// Appends records to `PrivacySentry_<timestamp>.txt` under a directory.
///
/// The timestamp is fixed at construction, so one build produces one report. The file is
/// only created by the first record.
pub(crate) struct FileAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileAuditSink {
    pub(crate) fn new(dir: &Path, started_at: DateTime<Local>) -> Self {
        let file_name = format!("PrivacySentry_{}.txt", started_at.format("%Y_%m_%d_%H_%M_%S"));
        FileAuditSink {
            path: dir.join(file_name),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditSink {
    fn record(&self, unit: &str, lines: &[String]) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit report lock poisoned"))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        let mut block = String::new();
        for line in lines {
            block.push_str(line);
            block.push_str("\n\n");
        }
        file.write_all(block.as_bytes())
            .with_context(|| format!("failed to write audit for {unit} to {}", self.path.display()))
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub(crate) struct MemoryAuditSink {
    records: Mutex<Vec<(String, Vec<String>)>>,
}

impl MemoryAuditSink {
    pub(crate) fn records(&self) -> Vec<(String, Vec<String>)> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, unit: &str, lines: &[String]) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("audit records lock poisoned"))?
            .push((unit.to_string(), lines.to_vec()));
        Ok(())
    }
}
