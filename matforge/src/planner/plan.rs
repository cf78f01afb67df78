//! Plan document: the planner's JSON output normalized into typed steps.
//!
//! The LLM is free with field names (`steps` vs `execution_graph`,
//! `scientific_intent` vs `intent`, ...); normalization maps everything onto
//! one internal shape and is idempotent, so a normalized plan re-entering
//! the pipeline is unchanged.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::PlanError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    Approved,
    Refused,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fidelity {
    #[default]
    Screening,
    Production,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeCost {
    Low,
    #[default]
    Medium,
    High,
}

impl ComputeCost {
    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(|v| v.as_str()).map(str::to_lowercase).as_deref() {
            Some("low") => Self::Low,
            Some("high") => Self::High,
            Some("medium") => Self::Medium,
            _ => Self::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    fn parse(value: Option<&Value>) -> Self {
        match value.and_then(|v| v.as_str()).map(str::to_lowercase).as_deref() {
            Some("done") => Self::Done,
            Some("failed") => Self::Failed,
            Some("skipped") => Self::Skipped,
            _ => Self::Pending,
        }
    }
}

/// One plan step. `step_id` is dense from 1 in execution order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub step_id: u32,
    pub tool_name: String,
    pub intent: String,
    pub compute_cost: ComputeCost,
    pub requires_human_confirm: bool,
    pub fallback_logic: String,
    pub status: StepStatus,
}

/// The directed execution graph, linearized into ordered steps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal_reason: Option<String>,
    pub strategy_name: String,
    pub fidelity_level: Fidelity,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            plan_id: Uuid::new_v4().to_string(),
            status: PlanStatus::Refused,
            refusal_reason: Some(reason.into()),
            strategy_name: String::new(),
            fidelity_level: Fidelity::default(),
            steps: Vec::new(),
        }
    }

    /// First step index that still needs execution, if any.
    pub fn next_pending(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status != StepStatus::Done)
    }

    /// Human-readable rendering for the pre-flight gate.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Plan {} [{}] fidelity={:?}\n",
            self.plan_id, self.strategy_name, self.fidelity_level
        );
        for step in &self.steps {
            out.push_str(&format!(
                "  {}. [{:?}] {} — {} (cost: {:?}{})\n",
                step.step_id,
                step.status,
                step.tool_name,
                step.intent,
                step.compute_cost,
                if step.requires_human_confirm {
                    ", needs confirmation"
                } else {
                    ""
                }
            ));
        }
        out
    }
}

/// Extracts the first balanced `{...}` region, unwrapping a fenced code
/// block first when present. String literals are brace-blind.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let text = match text.find("```") {
        Some(start) => {
            let after = &text[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => text,
    };

    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn field<'a>(entry: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|n| entry.get(*n))
}

/// Normalizes raw planner output into a `Plan`.
///
/// Accepts `steps` or `execution_graph`; maps the external field names
/// (`scientific_intent`, `compute_intensity`, `requires_confirmation`,
/// `fallback_strategy`) onto the internal ones; assigns dense step ids from
/// 1; clamps to `max_steps`. A plan with zero steps is rejected.
pub fn normalize(raw: &Value, max_steps: usize) -> Result<Plan, PlanError> {
    if raw
        .get("status")
        .and_then(|s| s.as_str())
        .map(|s| s.eq_ignore_ascii_case("refused"))
        .unwrap_or(false)
    {
        return Ok(Plan {
            plan_id: raw
                .get("plan_id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: PlanStatus::Refused,
            refusal_reason: raw
                .get("refusal_reason")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            strategy_name: String::new(),
            fidelity_level: Fidelity::default(),
            steps: Vec::new(),
        });
    }

    let raw_steps = field(raw, &["steps", "execution_graph"])
        .and_then(|v| v.as_array())
        .ok_or_else(|| PlanError::Malformed("plan has no steps array".into()))?;

    let mut steps = Vec::new();
    for entry in raw_steps.iter().take(max_steps) {
        let tool_name = field(entry, &["tool_name", "tool"])
            .and_then(|v| v.as_str())
            .ok_or_else(|| PlanError::Malformed("step without tool_name".into()))?
            .to_string();
        let intent = field(entry, &["intent", "scientific_intent"])
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        steps.push(Step {
            step_id: steps.len() as u32 + 1,
            tool_name,
            intent,
            compute_cost: ComputeCost::parse(field(entry, &["compute_cost", "compute_intensity"])),
            requires_human_confirm: field(
                entry,
                &["requires_human_confirm", "requires_confirmation"],
            )
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
            fallback_logic: field(entry, &["fallback_logic", "fallback_strategy"])
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            status: StepStatus::parse(entry.get("status")),
        });
    }
    if steps.is_empty() {
        return Err(PlanError::Malformed("plan has zero steps".into()));
    }

    Ok(Plan {
        plan_id: raw
            .get("plan_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        status: PlanStatus::Approved,
        refusal_reason: None,
        strategy_name: raw
            .get("strategy_name")
            .and_then(|v| v.as_str())
            .unwrap_or("research_plan")
            .to_string(),
        fidelity_level: match field(raw, &["fidelity_level", "target_fidelity"])
            .and_then(|v| v.as_str())
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("production") => Fidelity::Production,
            _ => Fidelity::Screening,
        },
        steps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_balanced_object_from_fenced_block() {
        let text = "Here is the plan:\n```json\n{\"steps\": [{\"tool_name\": \"t\", \"intent\": \"a {brace} inside\"}]}\n```\ntrailing";
        let json = extract_json_object(text).unwrap();
        assert!(json.starts_with('{') && json.ends_with('}'));
        let parsed: Value = serde_json::from_str(json).unwrap();
        assert_eq!(parsed["steps"][0]["tool_name"], "t");
    }

    #[test]
    fn extracts_first_balanced_region_with_strings_containing_braces() {
        let text = r#"noise {"a": "close } brace", "b": {"c": 1}} {"second": true}"#;
        let json = extract_json_object(text).unwrap();
        assert_eq!(
            serde_json::from_str::<Value>(json).unwrap()["b"]["c"],
            1
        );
    }

    #[test]
    fn extract_returns_none_without_object() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{unbalanced").is_none());
    }

    #[test]
    fn normalize_maps_external_field_names() {
        let raw = json!({
            "strategy_name": "screen-then-refine",
            "target_fidelity": "Production",
            "execution_graph": [
                {
                    "tool": "calc_optimize_structure",
                    "scientific_intent": "relax the cell",
                    "compute_intensity": "High",
                    "requires_confirmation": true,
                    "fallback_strategy": "loosen convergence"
                }
            ]
        });
        let plan = normalize(&raw, 10).unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
        assert_eq!(plan.fidelity_level, Fidelity::Production);
        let step = &plan.steps[0];
        assert_eq!(step.step_id, 1);
        assert_eq!(step.tool_name, "calc_optimize_structure");
        assert_eq!(step.intent, "relax the cell");
        assert_eq!(step.compute_cost, ComputeCost::High);
        assert!(step.requires_human_confirm);
        assert_eq!(step.fallback_logic, "loosen convergence");
        assert_eq!(step.status, StepStatus::Pending);
    }

    #[test]
    fn normalize_is_idempotent() {
        let raw = json!({
            "plan_id": "p-1",
            "strategy_name": "s",
            "steps": [
                {"tool_name": "a", "intent": "x", "compute_cost": "low"},
                {"tool_name": "b", "scientific_intent": "y", "compute_intensity": "high"}
            ]
        });
        let once = normalize(&raw, 10).unwrap();
        let twice = normalize(&serde_json::to_value(&once).unwrap(), 10).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn normalize_clamps_to_max_steps_and_keeps_ids_dense() {
        let steps: Vec<Value> = (0..6)
            .map(|i| json!({"tool_name": format!("t{}", i)}))
            .collect();
        let plan = normalize(&json!({ "steps": steps }), 4).unwrap();
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(
            plan.steps.iter().map(|s| s.step_id).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn normalize_rejects_zero_steps_and_missing_steps() {
        assert!(matches!(
            normalize(&json!({"steps": []}), 10),
            Err(PlanError::Malformed(_))
        ));
        assert!(matches!(
            normalize(&json!({"note": "no steps"}), 10),
            Err(PlanError::Malformed(_))
        ));
    }

    #[test]
    fn normalize_passes_refused_plans_through() {
        let raw = json!({"status": "Refused", "refusal_reason": "blocked software"});
        let plan = normalize(&raw, 10).unwrap();
        assert_eq!(plan.status, PlanStatus::Refused);
        assert_eq!(plan.refusal_reason.as_deref(), Some("blocked software"));
    }

    #[test]
    fn next_pending_skips_done_steps() {
        let mut plan = normalize(
            &json!({"steps": [{"tool_name":"a"},{"tool_name":"b"},{"tool_name":"c"}]}),
            10,
        )
        .unwrap();
        plan.steps[0].status = StepStatus::Done;
        plan.steps[1].status = StepStatus::Done;
        assert_eq!(plan.next_pending(), Some(2));
        plan.steps[2].status = StepStatus::Done;
        assert_eq!(plan.next_pending(), None);
    }
}
