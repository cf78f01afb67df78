//! Append-only trajectory of dialog turns, tool calls, and observations.
//!
//! One sink serves every agent instance in a run — planner, solver, and fix
//! agents all append to the same file so multi-agent runs can be correlated.
//! The file is rewritten atomically after each append.

use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Role, ToolCall, ToolResult};
use crate::rundir::write_json_atomic;

/// One trajectory entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub agent: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
    pub timestamp: DateTime<Utc>,
}

impl TrajectoryRecord {
    pub fn new(agent: &str, role: Role, content: impl Into<String>) -> Self {
        Self {
            agent: agent.to_string(),
            role,
            content: content.into(),
            tool_calls: None,
            tool_results: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        if !calls.is_empty() {
            self.tool_calls = Some(calls);
        }
        self
    }

    pub fn with_tool_results(mut self, results: Vec<ToolResult>) -> Self {
        if !results.is_empty() {
            self.tool_results = Some(results);
        }
        self
    }
}

/// Shared trajectory sink. The path is set once per run (all agents write
/// the same file); appends with no path configured stay in memory.
#[derive(Default)]
pub struct TrajectorySink {
    path: RwLock<Option<PathBuf>>,
    records: Mutex<Vec<TrajectoryRecord>>,
}

impl TrajectorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_path(&self, path: PathBuf) {
        *self.path.write().unwrap() = Some(path);
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.read().unwrap().clone()
    }

    /// Appends records and flushes the whole trajectory atomically.
    pub fn append(
        &self,
        records: impl IntoIterator<Item = TrajectoryRecord>,
    ) -> io::Result<()> {
        let snapshot = {
            let mut guard = self.records.lock().unwrap();
            guard.extend(records);
            guard.clone()
        };
        if let Some(path) = self.path() {
            write_json_atomic(&path, &snapshot)?;
        }
        Ok(())
    }

    pub fn records(&self) -> Vec<TrajectoryRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Drops in-memory records (a new task starting in the same process).
    pub fn reset(&self) {
        self.records.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_persists_full_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trajectory.json");
        let sink = TrajectorySink::new();
        sink.set_path(path.clone());

        sink.append([TrajectoryRecord::new("main", Role::User, "task")])
            .unwrap();
        sink.append([
            TrajectoryRecord::new("main", Role::Assistant, "thinking").with_tool_calls(vec![
                ToolCall {
                    id: "c1".into(),
                    name: "s_a".into(),
                    arguments: "{}".into(),
                },
            ]),
        ])
        .unwrap();

        let on_disk: Vec<TrajectoryRecord> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 2);
        assert_eq!(on_disk[1].tool_calls.as_ref().unwrap()[0].name, "s_a");
    }

    #[test]
    fn two_agents_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TrajectorySink::new();
        sink.set_path(dir.path().join("trajectory.json"));
        sink.append([TrajectoryRecord::new("planner", Role::Assistant, "plan")])
            .unwrap();
        sink.append([TrajectoryRecord::new("solver", Role::Assistant, "step")])
            .unwrap();
        let records = sink.records();
        assert_eq!(records[0].agent, "planner");
        assert_eq!(records[1].agent, "solver");
    }

    #[test]
    fn append_without_path_stays_in_memory() {
        let sink = TrajectorySink::new();
        sink.append([TrajectoryRecord::new("main", Role::User, "x")])
            .unwrap();
        assert_eq!(sink.records().len(), 1);
        sink.reset();
        assert!(sink.records().is_empty());
    }
}
