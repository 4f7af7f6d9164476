//! persistence.rs
//!
//! Append-only run history (JSON lines). Every record passes the privacy
//! gate before it touches disk.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::privacy::Scrubber;
use crate::state::PipelineRun;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub recorded_at: DateTime<Utc>,
    /// Payload text was dropped because it could not be scrubbed.
    #[serde(default)]
    pub payloads_dropped: bool,
    pub run: PipelineRun,
}

#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    // one writer at a time; lines must not interleave
    lock: Mutex<()>,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn from_config(cfg: &StoreConfig) -> Self {
        Self::new(cfg.history_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a snapshot of `run`. A record that fails the privacy gate is
    /// retried without payloads; if that fails too, nothing is written.
    pub fn append(&self, run: &PipelineRun, scrubber: &Scrubber) -> Result<(), StoreError> {
        let line = match scrubbed_line(run, false, scrubber) {
            Ok(line) => line,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "history record kept without payloads");
                scrubbed_line(&run.without_payloads(), true, scrubber)?
            }
        };

        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;

        debug!(run_id = %run.id, stage = %run.stage(), "history record appended");
        Ok(())
    }

    /// Latest record of each run, oldest first, at most `limit` runs.
    pub fn load_latest(&self, limit: usize) -> Result<Vec<RunRecord>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut order: Vec<uuid::Uuid> = Vec::new();
        let mut latest: HashMap<uuid::Uuid, RunRecord> = HashMap::new();
        for (i, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(line) {
                Ok(rec) => {
                    let id = rec.run.id;
                    order.retain(|x| *x != id);
                    order.push(id);
                    latest.insert(id, rec);
                }
                Err(e) => warn!(line = i + 1, error = %e, "skipping unreadable history line"),
            }
        }

        let skip = order.len().saturating_sub(limit);
        Ok(order
            .into_iter()
            .skip(skip)
            .filter_map(|id| latest.remove(&id))
            .collect())
    }
}

fn scrubbed_line(
    run: &PipelineRun,
    payloads_dropped: bool,
    scrubber: &Scrubber,
) -> Result<String, StoreError> {
    // scrub fields before serializing; JSON escaping hides quoted values
    let run = run.map_text(|text| scrubber.scrub(text).map(|s| s.text.into_inner()))?;
    let record = RunRecord {
        recorded_at: Utc::now(),
        payloads_dropped,
        run,
    };
    let line = serde_json::to_string(&record)?;
    // second pass catches unquoted matches in the remaining fields
    let line = scrubber.scrub(&line)?.text.into_inner();
    serde_json::from_str::<serde_json::Value>(&line)?;
    Ok(line)
}
