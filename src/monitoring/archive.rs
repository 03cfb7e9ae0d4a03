//! Run Archive
//!
//! Terminal runs are written as pretty JSON to
//! `<root>/<pipeline>/<run_id>.json` so they outlive the in-memory registry.

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use crate::error::ArchiveError;
use crate::run::{RunId, RunSnapshot};

/// A directory of archived run snapshots.
#[derive(Debug, Clone)]
pub struct RunArchive {
    root: PathBuf,
}

impl RunArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes a snapshot, replacing any earlier copy of the same run.
    pub fn save(&self, snapshot: &RunSnapshot) -> Result<PathBuf, ArchiveError> {
        let dir = self.pipeline_dir(&snapshot.pipeline);
        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let path = dir.join(format!("{}.json", snapshot.id));
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&path, json).map_err(|e| io_error(&path, e))?;

        info!("Archived run {} to {}", snapshot.id, path.display());
        Ok(path)
    }

    /// Reads one archived run.
    pub fn load(&self, pipeline: &str, id: RunId) -> Result<RunSnapshot, ArchiveError> {
        let path = self.pipeline_dir(pipeline).join(format!("{}.json", id));
        let content = fs::read_to_string(&path).map_err(|e| io_error(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Ids of a pipeline's archived runs, sorted. Empty if none exist.
    pub fn list(&self, pipeline: &str) -> Result<Vec<RunId>, ArchiveError> {
        let dir = self.pipeline_dir(pipeline);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| io_error(&dir, e))? {
            let path = entry.map_err(|e| io_error(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<RunId>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn pipeline_dir(&self, pipeline: &str) -> PathBuf {
        self.root.join(sanitize(pipeline))
    }
}

/// Keeps pipeline names from escaping the archive root.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ArchiveError {
    ArchiveError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{FailureReason, RunStatus, Trigger};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn finished_run(pipeline: &str) -> RunSnapshot {
        let mut input = BTreeMap::new();
        input.insert("full_name".to_string(), json!("Ivan Petrov"));
        let mut run = RunSnapshot::queued(
            RunId::new(),
            pipeline,
            Trigger::event("s3_upload", json!({"key": "debtors.csv"})),
            input,
            Utc::now(),
        );
        run.status = RunStatus::Cancelled;
        run.ended_at = Some(Utc::now());
        run.reason = Some(FailureReason::cancelled(None, "operator request"));
        run
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let archive = RunArchive::new(dir.path());
        let run = finished_run("call_debtor");

        let path = archive.save(&run).unwrap();
        assert!(path.starts_with(dir.path().join("call_debtor")));

        let loaded = archive.load("call_debtor", run.id).unwrap();
        assert_eq!(loaded, run);
    }

    #[test]
    fn test_list() {
        let dir = tempdir().unwrap();
        let archive = RunArchive::new(dir.path());
        assert!(archive.list("call_debtor").unwrap().is_empty());

        let a = finished_run("call_debtor");
        let b = finished_run("call_debtor");
        archive.save(&a).unwrap();
        archive.save(&b).unwrap();
        archive.save(&finished_run("other")).unwrap();
        fs::write(dir.path().join("call_debtor").join("notes.txt"), "x").unwrap();

        let mut expected = vec![a.id, b.id];
        expected.sort();
        assert_eq!(archive.list("call_debtor").unwrap(), expected);
    }

    #[test]
    fn test_pipeline_names_cannot_escape_root() {
        assert_eq!(sanitize("../etc"), "___etc");
        assert_eq!(sanitize("call_debtor"), "call_debtor");
        assert_eq!(sanitize(""), "_");
    }

    #[test]
    fn test_load_missing_is_io_error() {
        let dir = tempdir().unwrap();
        let archive = RunArchive::new(dir.path());
        assert!(matches!(
            archive.load("call_debtor", RunId::new()),
            Err(ArchiveError::Io { .. })
        ));
    }
}
