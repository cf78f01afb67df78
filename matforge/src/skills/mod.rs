//! Skill registry: directory-bundled knowledge and operator skills.
//!
//! A skill is a directory with a `SKILL.md` whose YAML front matter names
//! it; operator skills additionally bundle runnable scripts under
//! `scripts/`. The registry walks a root tree, loads everything, and serves
//! lookup, substring search, and the meta-info block for agent prompts.
//! Dynamically produced skills (the skill-evolution flow) enter the registry
//! only after their sandbox test passes.

mod tool;

pub use tool::UseSkillTool;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use walkdir::WalkDir;

/// Script extensions operator skills may bundle.
pub const SCRIPT_EXTENSIONS: &[&str] = &["py", "sh", "js"];

#[derive(Debug, thiserror::Error)]
pub enum SkillError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("SKILL.md front matter in {path}: {reason}")]
    FrontMatter { path: PathBuf, reason: String },
    #[error("skill not found: {0}")]
    NotFound(String),
    #[error("script not found: {0}")]
    ScriptNotFound(String),
    #[error("reference not found: {0}")]
    ReferenceNotFound(String),
    #[error("sandbox test failed for skill '{name}': {reason}")]
    SandboxFailed { name: String, reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillType {
    Knowledge,
    Operator,
}

/// Front matter of SKILL.md.
#[derive(Clone, Debug, Deserialize)]
pub struct SkillMeta {
    pub name: String,
    pub description: String,
    pub skill_type: SkillType,
    #[serde(default)]
    pub license: Option<String>,
}

/// One loaded skill.
#[derive(Clone, Debug)]
pub struct Skill {
    pub meta: SkillMeta,
    path: PathBuf,
    scripts: Vec<PathBuf>,
}

/// Splits SKILL.md into front matter and body.
fn split_front_matter(content: &str) -> Option<(&str, &str)> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let front = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\r').unwrap_or(after);
    let body = body.strip_prefix('\n').unwrap_or(body);
    Some((front, body))
}

impl Skill {
    /// Loads one skill directory: parse front matter, scan `scripts/`.
    pub fn load(dir: &Path) -> Result<Self, SkillError> {
        let skill_md = dir.join("SKILL.md");
        let content = std::fs::read_to_string(&skill_md)?;
        let (front, _body) = split_front_matter(&content).ok_or_else(|| {
            SkillError::FrontMatter {
                path: skill_md.clone(),
                reason: "no YAML front matter".into(),
            }
        })?;
        let meta: SkillMeta =
            serde_yaml::from_str(front).map_err(|e| SkillError::FrontMatter {
                path: skill_md.clone(),
                reason: e.to_string(),
            })?;

        let scripts_dir = dir.join("scripts");
        let mut scripts = Vec::new();
        if scripts_dir.is_dir() {
            for entry in std::fs::read_dir(&scripts_dir)? {
                let path = entry?.path();
                let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                if path.is_file() && SCRIPT_EXTENSIONS.contains(&ext) {
                    scripts.push(path);
                }
            }
            scripts.sort();
        }

        Ok(Self {
            meta,
            path: dir.to_path_buf(),
            scripts,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scripts(&self) -> &[PathBuf] {
        &self.scripts
    }

    pub fn script_path(&self, script_name: &str) -> Option<&Path> {
        self.scripts
            .iter()
            .find(|p| p.file_name().map(|n| n == script_name).unwrap_or(false))
            .map(PathBuf::as_path)
    }

    /// Full info: `job_submit.md` when present, else the SKILL.md body.
    pub fn full_info(&self) -> Result<String, SkillError> {
        let job_submit = self.path.join("job_submit.md");
        if job_submit.is_file() {
            return Ok(std::fs::read_to_string(job_submit)?.trim().to_string());
        }
        let content = std::fs::read_to_string(self.path.join("SKILL.md"))?;
        Ok(split_front_matter(&content)
            .map(|(_, body)| body.trim().to_string())
            .unwrap_or(content))
    }

    /// Reference document lookup under the skill directory.
    pub fn reference(&self, name: &str) -> Result<String, SkillError> {
        for candidate in [
            self.path.join(name),
            self.path.join("references").join(name),
            self.path.join("reference").join(name),
        ] {
            if candidate.is_file() {
                return Ok(std::fs::read_to_string(candidate)?);
            }
        }
        Err(SkillError::ReferenceNotFound(name.to_string()))
    }

    /// One-line rendering for the agent's context.
    pub fn context_line(&self) -> String {
        match self.meta.skill_type {
            SkillType::Knowledge => {
                format!("[Knowledge: {}] {}", self.meta.name, self.meta.description)
            }
            SkillType::Operator => {
                let scripts = if self.scripts.is_empty() {
                    "No scripts".to_string()
                } else {
                    self.scripts
                        .iter()
                        .filter_map(|p| p.file_name())
                        .map(|n| n.to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                format!(
                    "[Operator: {}] {} (Scripts: {})",
                    self.meta.name, self.meta.description, scripts
                )
            }
        }
    }
}

/// Registry of all discovered skills, keyed by front-matter name.
pub struct SkillRegistry {
    root: PathBuf,
    skills: RwLock<BTreeMap<String, Arc<Skill>>>,
}

impl SkillRegistry {
    /// Walks `root` and loads every directory holding a SKILL.md. Broken
    /// skills are logged and skipped; one bad bundle must not take down the
    /// registry.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self, SkillError> {
        let root = root.into();
        let mut skills = BTreeMap::new();
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() || !entry.path().join("SKILL.md").is_file() {
                continue;
            }
            match Skill::load(entry.path()) {
                Ok(skill) => {
                    tracing::info!("loaded skill: {}", skill.meta.name);
                    skills.insert(skill.meta.name.clone(), Arc::new(skill));
                }
                Err(e) => tracing::error!("failed to load skill from {:?}: {}", entry.path(), e),
            }
        }
        Ok(Self {
            root,
            skills: RwLock::new(skills),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn get(&self, name: &str) -> Option<Arc<Skill>> {
        self.skills.read().unwrap().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Skill>> {
        self.skills.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.skills.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Case-insensitive substring search over name and description.
    pub fn search(&self, query: &str) -> Vec<Arc<Skill>> {
        let query = query.to_lowercase();
        self.all()
            .into_iter()
            .filter(|s| {
                s.meta.name.to_lowercase().contains(&query)
                    || s.meta.description.to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Meta-info block listing every skill, for the agent system prompt.
    pub fn meta_context(&self) -> String {
        let mut lines = vec!["# Available Skills".to_string()];
        let skills = self.all();
        let knowledge: Vec<_> = skills
            .iter()
            .filter(|s| s.meta.skill_type == SkillType::Knowledge)
            .collect();
        let operators: Vec<_> = skills
            .iter()
            .filter(|s| s.meta.skill_type == SkillType::Operator)
            .collect();
        if !knowledge.is_empty() {
            lines.push("## Knowledge Skills".into());
            lines.extend(knowledge.iter().map(|s| s.context_line()));
        }
        if !operators.is_empty() {
            lines.push("## Operator Skills".into());
            lines.extend(operators.iter().map(|s| s.context_line()));
        }
        lines.join("\n")
    }

    /// Registers a dynamically produced skill (skill-evolution output).
    /// The sandbox test gates insertion: a skill that fails it never lands.
    pub fn register_dynamic(
        &self,
        dir: &Path,
        sandbox_test: &dyn Fn(&Skill) -> Result<(), String>,
    ) -> Result<Arc<Skill>, SkillError> {
        let skill = Skill::load(dir)?;
        sandbox_test(&skill).map_err(|reason| SkillError::SandboxFailed {
            name: skill.meta.name.clone(),
            reason,
        })?;
        let skill = Arc::new(skill);
        self.skills
            .write()
            .unwrap()
            .insert(skill.meta.name.clone(), Arc::clone(&skill));
        tracing::info!("registered dynamic skill: {}", skill.meta.name);
        Ok(skill)
    }
}
