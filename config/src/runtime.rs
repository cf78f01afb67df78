//! Runtime YAML config (`config.yaml`): model selection, agent limits,
//! tool-server wiring, planner and resilient-calc settings.
//!
//! Sections the core runtime interprets further (executor templates, error
//! handlers) stay as raw JSON values here; the consuming subsystem owns
//! their schema.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("read runtime config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse runtime config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub temperature: Option<f32>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub max_turns: u32,
    pub max_context_messages: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_context_messages: 60,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub enabled: Option<bool>,
    /// Path to the server JSON, relative to the config file's directory.
    pub config_file: Option<String>,
    /// "calculation" enables the path adaptor.
    pub path_adaptor: Option<String>,
    /// Servers the adaptor applies to; absent means all of them.
    pub calculation_servers: Option<Vec<String>>,
    /// Per-server executor templates and sync tool lists (adaptor schema).
    pub calculation_executors: Option<Value>,
    /// Per-server allowlist of remote tool names.
    pub tool_include_only: Option<HashMap<String, Vec<String>>>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlannerSection {
    pub max_steps: usize,
    pub hardware_has_gpu: bool,
    pub target_fidelity: String,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            max_steps: 8,
            hardware_has_gpu: false,
            target_fidelity: "screening".into(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResilientSection {
    pub max_retries: Option<u32>,
    pub poll_interval_seconds: Option<u64>,
    pub error_handlers: Option<Value>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SkillsSection {
    pub enabled: bool,
    pub skills_root: Option<String>,
}

/// The whole runtime config document.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub mcp: McpSection,
    pub planner: PlannerSection,
    pub resilient_calc: ResilientSection,
    pub skills: SkillsSection,
}

impl RuntimeConfig {
    pub fn from_str(text: &str) -> Result<Self, RuntimeError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        Self::from_str(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gets_defaults() {
        let config = RuntimeConfig::from_str("{}").unwrap();
        assert_eq!(config.agent.max_turns, 20);
        assert_eq!(config.planner.max_steps, 8);
        assert!(!config.skills.enabled);
    }

    #[test]
    fn sections_parse_from_yaml() {
        let text = r#"
llm:
  model: test-model
  temperature: 0.2
agent:
  max_turns: 7
mcp:
  enabled: true
  config_file: servers.json
  path_adaptor: calculation
  calculation_servers: [calc]
  tool_include_only:
    sn: [web-search, search-papers-enhanced]
planner:
  max_steps: 4
  hardware_has_gpu: true
  target_fidelity: production
resilient_calc:
  max_retries: 5
  error_handlers:
    OOM:
      - set: mem=64G
skills:
  enabled: true
  skills_root: skills
"#;
        let config = RuntimeConfig::from_str(text).unwrap();
        assert_eq!(config.llm.model, "test-model");
        assert_eq!(config.agent.max_turns, 7);
        assert_eq!(config.agent.max_context_messages, 60);
        assert_eq!(config.mcp.config_file.as_deref(), Some("servers.json"));
        assert_eq!(
            config.mcp.tool_include_only.as_ref().unwrap()["sn"],
            vec!["web-search".to_string(), "search-papers-enhanced".to_string()]
        );
        assert_eq!(config.planner.max_steps, 4);
        assert_eq!(config.planner.target_fidelity, "production");
        assert_eq!(config.resilient_calc.max_retries, Some(5));
        assert!(config
            .resilient_calc
            .error_handlers
            .as_ref()
            .unwrap()
            .get("OOM")
            .is_some());
        assert_eq!(config.skills.skills_root.as_deref(), Some("skills"));
    }
}
