//! Run directory layout and atomic persistence.
//!
//! ```text
//! {run_dir}/
//!   config.yaml                      snapshot of the effective config
//!   logs/{task_id|matforge}.log
//!   trajectories/[{task_id}/]trajectory.json
//!   workspaces/{task_id}/            working dir for tools
//!   workspaces/{task_id}/research_state.json
//! ```
//!
//! Every persisted artifact goes through `write_json_atomic`: write to
//! `foo.tmp`, then rename. A crash between the two leaves the previous
//! version intact.

use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Handle to one run's directory tree. Creating it guarantees the task
/// workspace exists before any tool call receives a workspace path.
#[derive(Clone, Debug)]
pub struct RunDir {
    root: PathBuf,
    task_id: Option<String>,
}

impl RunDir {
    pub fn create(root: impl Into<PathBuf>, task_id: Option<&str>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(root.join("logs"))?;
        std::fs::create_dir_all(root.join("trajectories"))?;
        let run_dir = Self {
            root,
            task_id: task_id.map(str::to_string),
        };
        std::fs::create_dir_all(run_dir.workspace())?;
        if let Some(task_id) = &run_dir.task_id {
            std::fs::create_dir_all(run_dir.root.join("trajectories").join(task_id))?;
        }
        Ok(run_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    /// `workspaces/{task_id}`, or `workspace/` for single-task runs.
    pub fn workspace(&self) -> PathBuf {
        match &self.task_id {
            Some(task_id) => self.root.join("workspaces").join(task_id),
            None => self.root.join("workspace"),
        }
    }

    /// Root substituted for the `__EVOMASTER_WORKSPACES__` placeholder in
    /// server configs.
    pub fn workspaces_root(&self) -> PathBuf {
        self.root.join("workspaces")
    }

    pub fn log_file(&self) -> PathBuf {
        let name = self.task_id.as_deref().unwrap_or("matforge");
        self.root.join("logs").join(format!("{}.log", name))
    }

    pub fn trajectory_file(&self) -> PathBuf {
        match &self.task_id {
            Some(task_id) => self
                .root
                .join("trajectories")
                .join(task_id)
                .join("trajectory.json"),
            None => self.root.join("trajectories").join("trajectory.json"),
        }
    }

    pub fn research_state_file(&self) -> PathBuf {
        self.workspace().join("research_state.json")
    }

    /// Creates and returns `workspaces/{task_id}/step_{id}/`.
    pub fn step_workspace(&self, step_id: u32) -> io::Result<PathBuf> {
        let dir = self.workspace().join(format!("step_{}", step_id));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Copies the effective config into the run dir once; later tasks of a
    /// batch reuse the first snapshot.
    pub fn snapshot_config(&self, source: &Path) -> io::Result<()> {
        let target = self.root.join("config.yaml");
        if source.exists() && !target.exists() {
            std::fs::copy(source, &target)?;
        }
        Ok(())
    }
}

/// Serializes `value` to `{path}.tmp` and renames over `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp = tmp_path(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

/// Reads JSON from `path`; a missing file is `None`, a malformed one is an
/// error (state corruption should be loud, not silently replanned).
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".into());
    name.push_str(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_builds_layout() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::create(dir.path().join("run"), Some("t1")).unwrap();
        assert!(run.workspace().is_dir());
        assert!(run.root().join("logs").is_dir());
        assert!(run.root().join("trajectories").join("t1").is_dir());
        assert_eq!(
            run.trajectory_file(),
            run.root().join("trajectories/t1/trajectory.json")
        );
        assert_eq!(run.log_file(), run.root().join("logs/t1.log"));
        let step = run.step_workspace(3).unwrap();
        assert!(step.ends_with("workspaces/t1/step_3"));
    }

    #[test]
    fn single_task_layout_uses_flat_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::create(dir.path().join("run"), None).unwrap();
        assert!(run.workspace().ends_with("workspace"));
        assert_eq!(run.log_file(), run.root().join("logs/matforge.log"));
    }

    #[test]
    fn write_json_atomic_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &json!({"v": 1})).unwrap();
        let read: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(read.unwrap()["v"], 1);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn crash_between_tmp_and_rename_keeps_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("research_state.json");
        write_json_atomic(&path, &json!({"v": 1})).unwrap();

        // Simulated crash: the next version reached the tmp file but the
        // rename never happened.
        std::fs::write(tmp_path(&path), serde_json::to_vec(&json!({"v": 2})).unwrap()).unwrap();
        let read: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(read.unwrap()["v"], 1);

        // Recovery: the next atomic write wins and clears the tmp file.
        write_json_atomic(&path, &json!({"v": 3})).unwrap();
        let read: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(read.unwrap()["v"], 3);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn read_json_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let read: Option<serde_json::Value> =
            read_json(&dir.path().join("absent.json")).unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn snapshot_config_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("config.yaml");
        std::fs::write(&src, "a: 1\n").unwrap();
        let run = RunDir::create(dir.path().join("run"), Some("t")).unwrap();
        run.snapshot_config(&src).unwrap();
        std::fs::write(&src, "a: 2\n").unwrap();
        run.snapshot_config(&src).unwrap();
        let snap = std::fs::read_to_string(run.root().join("config.yaml")).unwrap();
        assert_eq!(snap, "a: 1\n");
    }
}
