//! Execution session: the filesystem/shell black box tools run against.
//!
//! The runtime only depends on this surface; the local implementation is a
//! thin wrapper over the workspace and `sh`, enough for operator-skill
//! scripts and tests.

use std::path::{Path, PathBuf};
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("exec: {0}")]
    Exec(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Output of one shell execution.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The session contract the runtime needs from its environment.
pub trait ExecSession: Send + Sync {
    fn exec_bash(&self, command: &str) -> Result<ExecOutput, SessionError>;
    fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError>;
    fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError>;
    fn read_file(&self, path: &Path) -> Result<String, SessionError>;
    fn workspace(&self) -> &Path;
}

/// Session running commands in the task workspace on the local machine.
/// Upload/download degrade to copies into the workspace.
pub struct LocalSession {
    workspace: PathBuf,
}

impl LocalSession {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}

impl ExecSession for LocalSession {
    fn exec_bash(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace)
            .output()
            .map_err(|e| SessionError::Exec(format!("{}: {}", command, e)))?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        let target = self.workspace.join(remote);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, target)?;
        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.workspace.join(remote), local)?;
        Ok(())
    }

    fn read_file(&self, path: &Path) -> Result<String, SessionError> {
        Ok(std::fs::read_to_string(self.resolve(path))?)
    }

    fn workspace(&self) -> &Path {
        &self.workspace
    }
}
