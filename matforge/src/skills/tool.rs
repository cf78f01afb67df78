//! `use_skill` tool: lets the agent list, search, load, and run skills.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::registry::{Tool, ToolContent, ToolError, ToolSpec};
use crate::session::ExecSession;

use super::{SkillRegistry, SkillType};

/// Tool name exposed to the LLM.
pub const TOOL_USE_SKILL: &str = "use_skill";

pub struct UseSkillTool {
    registry: Arc<SkillRegistry>,
    session: Arc<dyn ExecSession>,
}

impl UseSkillTool {
    pub fn new(registry: Arc<SkillRegistry>, session: Arc<dyn ExecSession>) -> Self {
        Self { registry, session }
    }

    fn arg<'a>(args: &'a Value, name: &str) -> Result<&'a str, ToolError> {
        args.get(name)
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput(format!("missing argument: {}", name)))
    }

    fn load(&self, args: &Value) -> Result<String, ToolError> {
        let name = Self::arg(args, "skill_name")?;
        let skill = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::InvalidInput(format!("unknown skill: {}", name)))?;
        let info = skill
            .full_info()
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(format!(
            "<skill name=\"{}\" type=\"{:?}\">\n{}\n</skill>",
            skill.meta.name, skill.meta.skill_type, info
        ))
    }

    fn search(&self, args: &Value) -> Result<String, ToolError> {
        let query = Self::arg(args, "query")?;
        let hits = self.registry.search(query);
        if hits.is_empty() {
            return Ok(format!("No skills match '{}'.", query));
        }
        Ok(hits
            .iter()
            .map(|s| s.context_line())
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn run_script(&self, args: &Value) -> Result<String, ToolError> {
        let name = Self::arg(args, "skill_name")?;
        let script_name = Self::arg(args, "script_name")?;
        let skill = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::InvalidInput(format!("unknown skill: {}", name)))?;
        if skill.meta.skill_type != SkillType::Operator {
            return Err(ToolError::InvalidInput(format!(
                "skill '{}' is a knowledge skill and has no scripts",
                name
            )));
        }
        let script = skill.script_path(script_name).ok_or_else(|| {
            ToolError::InvalidInput(format!(
                "skill '{}' has no script '{}'",
                name, script_name
            ))
        })?;

        let interpreter = match script.extension().and_then(|e| e.to_str()) {
            Some("py") => "python3",
            Some("js") => "node",
            _ => "sh",
        };
        let script_args: Vec<String> = args
            .get("script_args")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .map(|i| {
                        i.as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| i.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        let command = std::iter::once(format!("{} '{}'", interpreter, script.display()))
            .chain(script_args.iter().map(|a| format!("'{}'", a.replace('\'', "'\\''"))))
            .collect::<Vec<_>>()
            .join(" ");

        let output = self
            .session
            .exec_bash(&command)
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if output.exit_code != 0 {
            return Err(ToolError::Execution(format!(
                "script exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl Tool for UseSkillTool {
    fn name(&self) -> &str {
        TOOL_USE_SKILL
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_USE_SKILL.into(),
            description: Some(
                "Use a registered skill: action=list lists all skills, action=search finds \
                 skills by keyword, action=load returns a skill's full instructions, \
                 action=run_script executes an operator skill script."
                    .into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["list", "search", "load", "run_script"]},
                    "skill_name": {"type": "string"},
                    "query": {"type": "string"},
                    "script_name": {"type": "string"},
                    "script_args": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["action"]
            }),
        }
    }

    fn call(&self, args: Value) -> Result<ToolContent, ToolError> {
        let action = Self::arg(&args, "action")?;
        let text = match action {
            "list" => self.registry.meta_context(),
            "search" => self.search(&args)?,
            "load" => self.load(&args)?,
            "run_script" => self.run_script(&args)?,
            other => {
                return Err(ToolError::InvalidInput(format!(
                    "unknown action: {}",
                    other
                )))
            }
        };
        Ok(ToolContent::text(text))
    }
}
