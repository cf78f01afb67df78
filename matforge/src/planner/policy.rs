//! Immutable compute-resource policy embedded in the planner context.
//!
//! License allow-list, blocked software, and the preferred open stack are
//! data baked into the binary. Changing them is a new deployment, not a
//! config toggle. The watchdog check is stateless and runs after
//! normalization.

use super::plan::{Plan, PlanStatus};

/// Software the platform holds no license to run; any plan step naming one
/// of these is refused.
pub const BLOCKED_SOFTWARE: &[&str] = &["VASP", "Gaussian", "CASTEP", "Materials Studio"];

/// Licenses the platform does hold.
pub const ACTIVE_LICENSES: &[&str] = &["ABACUS", "LAMMPS", "DPA", "ASE", "pymatgen"];

/// Preferred tool per workload class, offered as the alternative in
/// refusals.
pub const PREFERRED_TOOLS: &[(&str, &str)] = &[
    ("DFT", "ABACUS"),
    ("MLP", "DPA"),
    ("MD", "LAMMPS with DPA potentials"),
];

/// Policy block prepended to the planner system prompt.
pub fn policy_prompt_block() -> String {
    format!(
        "# Compute Resource Policy (immutable)\n\
         Licensed software: {}.\n\
         Blocked software (never plan around these): {}.\n\
         Preferred tools: {}.\n\
         Plans whose steps reference blocked software are refused.",
        ACTIVE_LICENSES.join(", "),
        BLOCKED_SOFTWARE.join(", "),
        PREFERRED_TOOLS
            .iter()
            .map(|(domain, tool)| format!("{} -> {}", domain, tool))
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn contains_identifier(haystack: &str, identifier: &str) -> bool {
    let haystack = haystack.to_lowercase();
    let identifier = identifier.to_lowercase();
    if identifier.contains(' ') {
        return haystack.contains(&identifier);
    }
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == identifier)
}

fn preferred_alternative() -> String {
    PREFERRED_TOOLS
        .iter()
        .map(|(domain, tool)| format!("{} via {}", domain, tool))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Watchdog: word-matches every blocked identifier against each step's
/// `tool_name` + `intent`. A match turns the whole plan into a refusal
/// naming the preferred alternative.
pub fn validate(plan: &Plan) -> Plan {
    if plan.status == PlanStatus::Refused {
        return plan.clone();
    }
    for step in &plan.steps {
        let subject = format!("{} {}", step.tool_name, step.intent);
        for blocked in BLOCKED_SOFTWARE {
            if contains_identifier(&subject, blocked) {
                return Plan::refused(format!(
                    "step {} references blocked software '{}'; use the licensed stack instead ({})",
                    step.step_id,
                    blocked,
                    preferred_alternative()
                ));
            }
        }
    }
    plan.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::plan::normalize;
    use serde_json::json;

    fn plan_with(tool_name: &str, intent: &str) -> Plan {
        normalize(
            &json!({"steps": [{"tool_name": tool_name, "intent": intent}]}),
            10,
        )
        .unwrap()
    }

    #[test]
    fn blocked_tool_name_refuses_with_alternative() {
        let plan = plan_with("run_vasp", "run VASP std");
        let checked = validate(&plan);
        assert_eq!(checked.status, PlanStatus::Refused);
        let reason = checked.refusal_reason.unwrap();
        assert!(reason.contains("VASP"));
        assert!(reason.contains("ABACUS"));
    }

    #[test]
    fn blocked_identifier_in_intent_is_caught_case_insensitively() {
        let plan = plan_with("submit_job", "relax the slab with gaussian 16");
        assert_eq!(validate(&plan).status, PlanStatus::Refused);
    }

    #[test]
    fn multi_word_identifier_matches_as_phrase() {
        let plan = plan_with("desktop_flow", "export to Materials Studio project");
        assert_eq!(validate(&plan).status, PlanStatus::Refused);
    }

    #[test]
    fn substring_inside_a_longer_word_does_not_match() {
        // "devastate" contains "vasta"... and more to the point "vasp" must
        // match whole words only.
        let plan = plan_with("evaspray_tool", "coat the sample");
        assert_eq!(validate(&plan).status, PlanStatus::Approved);
    }

    #[test]
    fn clean_plan_passes_unchanged() {
        let plan = plan_with("calc_optimize_structure", "relax with ABACUS");
        let checked = validate(&plan);
        assert_eq!(checked.status, PlanStatus::Approved);
        assert_eq!(checked.steps, plan.steps);
    }

    #[test]
    fn validation_is_deterministic() {
        let plan = plan_with("run_vasp", "dft");
        let a = validate(&plan);
        let b = validate(&plan);
        assert_eq!(a.status, b.status);
        assert_eq!(a.refusal_reason.is_some(), b.refusal_reason.is_some());
    }

    #[test]
    fn prompt_block_names_all_lists() {
        let block = policy_prompt_block();
        for s in BLOCKED_SOFTWARE {
            assert!(block.contains(s));
        }
        assert!(block.contains("ABACUS"));
    }
}
