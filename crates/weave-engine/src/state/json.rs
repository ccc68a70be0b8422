use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use weave_core::error::{Result, WeaveError};
use weave_core::types::RunId;

use super::{RunSummary, StateStore};
use crate::run::Run;

/// One pretty-printed JSON file per run: `{dir}/{run_id}.json`.
pub struct JsonStateStore {
    dir: PathBuf,
}

impl JsonStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            WeaveError::State(format!(
                "failed to create state directory '{}': {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &RunId) -> Result<PathBuf> {
        let id = run_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(WeaveError::State(format!("invalid run id '{}'", id)));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

/// Write to a sibling temp file, fsync, then rename over the target.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| WeaveError::State(format!("invalid state path '{}'", path.display())))?;
    let temp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let write = || -> std::io::Result<()> {
        let mut file = File::create(&temp)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&temp, path)
    };

    write().map_err(|e| {
        let _ = fs::remove_file(&temp);
        WeaveError::State(format!("failed to write '{}': {}", path.display(), e))
    })
}

impl StateStore for JsonStateStore {
    fn save_state(&self, run: &Run) -> Result<()> {
        let path = self.path_for(&run.id)?;
        let json = serde_json::to_vec_pretty(run)?;
        atomic_write(&path, &json)?;
        debug!(run_id = %run.id, path = %path.display(), "Saved run state");
        Ok(())
    }

    fn load_state(&self, run_id: &RunId) -> Result<Run> {
        let path = self.path_for(run_id)?;
        let content = match fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WeaveError::NotFound(format!("run '{}'", run_id)));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&content).map_err(|e| {
            WeaveError::State(format!("corrupt state file '{}': {}", path.display(), e))
        })
    }

    fn list_runs(&self, workflow: &str) -> Result<Vec<RunSummary>> {
        let mut runs = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_state = path.extension().and_then(|e| e.to_str()) == Some("json")
                && !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with('.'));
            if !is_state {
                continue;
            }
            let run: Run = match fs::read(&path)
                .map_err(WeaveError::from)
                .and_then(|c| serde_json::from_slice(&c).map_err(WeaveError::from))
            {
                Ok(run) => run,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable state file");
                    continue;
                }
            };
            if run.workflow == workflow {
                runs.push(RunSummary::from(&run));
            }
        }
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::fixtures::partial_run;
    use weave_core::types::RunStatus;

    #[test]
    fn round_trip_keeps_partial_results() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();

        let run = partial_run("report");
        store.save_state(&run).unwrap();
        let loaded = store.load_state(&run.id).unwrap();
        assert_eq!(loaded, run);
        assert_eq!(loaded.output_of("research"), Some("three sources"));
    }

    #[test]
    fn save_replaces_snapshot_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();

        let mut run = Run::new("report");
        store.save_state(&run).unwrap();
        run.finish(RunStatus::Succeeded);
        store.save_state(&run).unwrap();

        assert_eq!(store.load_state(&run.id).unwrap().status, RunStatus::Succeeded);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();
        let err = store.load_state(&RunId::from_string("nope")).unwrap_err();
        assert!(matches!(err, WeaveError::NotFound(_)));
    }

    #[test]
    fn rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();
        let err = store
            .load_state(&RunId::from_string("../../etc/passwd"))
            .unwrap_err();
        assert!(matches!(err, WeaveError::State(_)));
    }

    #[test]
    fn lists_newest_first_per_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path()).unwrap();

        let mut older = Run::new("report");
        older.started_at -= chrono::Duration::minutes(5);
        let newer = Run::new("report");
        let other = Run::new("digest");
        for run in [&older, &newer, &other] {
            store.save_state(run).unwrap();
        }
        fs::write(dir.path().join("garbage.json"), b"{").unwrap();

        let ids: Vec<RunId> = store
            .list_runs("report")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![newer.id.clone(), older.id.clone()]);
    }
}
