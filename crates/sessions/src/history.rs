//! Append-only run history ledger.
//!
//! Every archived run is appended as one JSON line. The file is trimmed to
//! the newest `max_records` every 100 appends via an atomic rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::run::RunState;

const TRIM_INTERVAL: u32 = 100;

pub struct RunHistoryStore {
    path: PathBuf,
    max_records: usize,
    appends_since_trim: Mutex<u32>,
}

impl RunHistoryStore {
    pub fn new(dir: &Path, max_records: usize) -> Self {
        let _ = fs::create_dir_all(dir);
        Self {
            path: dir.join("runs.jsonl"),
            max_records: max_records.max(100),
            appends_since_trim: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, run: &RunState) {
        let line = match serde_json::to_string(run) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize run record");
                return;
            }
        };
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed appending run record");
            return;
        }

        let mut count = self.appends_since_trim.lock();
        *count += 1;
        if *count >= TRIM_INTERVAL {
            *count = 0;
            drop(count);
            self.trim();
        }
    }

    /// Most recent runs, newest first.
    pub fn load_recent(&self, limit: usize) -> Vec<RunState> {
        let limit = limit.clamp(1, 5000);
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        let mut out = Vec::new();
        for line in raw.lines().rev() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(run) = serde_json::from_str::<RunState>(line) {
                out.push(run);
            }
            if out.len() >= limit {
                break;
            }
        }
        out
    }

    fn trim(&self) {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let lines: Vec<&str> = raw.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() <= self.max_records {
            return;
        }
        let keep = &lines[lines.len() - self.max_records..];
        let tmp = self.path.with_extension("jsonl.tmp");
        let result = fs::write(&tmp, format!("{}\n", keep.join("\n")))
            .and_then(|_| fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            tracing::debug!(error = %e, "run history trim skipped");
            let _ = fs::remove_file(&tmp);
        }
    }
}
