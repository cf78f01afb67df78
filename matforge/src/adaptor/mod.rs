//! Argument adaptor for calculation tools: rewrite file-path arguments into
//! object-store URLs and inject executor/storage descriptors.
//!
//! Remote calculation providers cannot see the local workspace, so every
//! path-typed argument must be uploaded and replaced by a URL before the
//! call leaves the machine. Which arguments are paths comes from the union
//! of a hand-maintained per-tool table and a conservative schema heuristic;
//! an explicit denylist excludes output-only keys. The table is the source
//! of truth for known tools — the heuristic supplements it, never replaces
//! it.

mod upload;

pub use upload::{ObjectStore, OssUploader};

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use url::Url;

/// Per-invocation adaptor failures. All are fatal for the invocation; the
/// adaptor never retries.
#[derive(Debug, thiserror::Error)]
pub enum AdaptorError {
    #[error("path argument file not found: {0}; calculation inputs must exist in the workspace so they can be uploaded and passed as a URL")]
    MissingFile(PathBuf),
    #[error("path argument is not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("upload: {0}")]
    Upload(String),
    #[error("credentials: {0}")]
    Credentials(String),
    #[error("arguments: {0}")]
    InvalidArgs(String),
}

/// Hand-maintained table: remote tool name -> argument names that are input
/// file paths. Kept alongside the schema heuristic and unioned with it.
static CALCULATION_PATH_ARGS: Lazy<HashMap<&'static str, &'static [&'static str]>> =
    Lazy::new(|| {
        let entries: [(&str, &[&str]); 24] = [
            ("get_structure_info", &["structure_path"]),
            ("get_molecule_info", &["molecule_path"]),
            ("build_bulk_structure_by_template", &[]),
            ("build_bulk_structure_by_wyckoff", &[]),
            ("make_supercell_structure", &["structure_path"]),
            ("apply_structure_transformation", &["structure_path"]),
            ("build_molecule_structures_from_smiles", &[]),
            ("add_cell_for_molecules", &["molecule_path"]),
            ("build_surface_slab", &["material_path"]),
            ("build_surface_adsorbate", &["surface_path", "adsorbate_path"]),
            ("build_surface_interface", &["material1_path", "material2_path"]),
            ("make_defect_structure", &["structure_path"]),
            ("make_doped_structure", &["structure_path"]),
            ("make_amorphous_structure", &["molecule_paths"]),
            ("add_hydrogens", &["structure_path"]),
            ("generate_ordered_replicas", &["structure_path"]),
            ("remove_solvents", &["structure_path"]),
            ("optimize_structure", &["input_structure"]),
            ("calculate_phonon", &["input_structure"]),
            ("run_molecular_dynamics", &["initial_structure"]),
            ("calculate_elastic_constants", &["input_structure"]),
            ("run_neb", &["initial_structure", "final_structure"]),
            ("extract_material_data_from_pdf", &["pdf_path"]),
            ("extract_info_from_webpage", &[]),
        ];
        entries.into_iter().collect()
    });

/// Schema keys that are never input paths (outputs, enum-like names).
const NON_PATH_SCHEMA_KEYS: &[&str] = &["crystal_structure", "output_file"];

/// Property-name hints that mark an argument as an input file path.
const KEY_HINTS: &[&str] = &[
    "structure_path",
    "molecule_path",
    "material_path",
    "surface_path",
    "adsorbate_path",
    "input_structure",
    "initial_structure",
    "final_structure",
    "pdf_path",
];

/// From a tool's input schema, collect property names that look like input
/// file paths. Conservative on purpose: a false positive uploads a file the
/// tool did not want; a false negative is covered by the hand table.
pub fn path_arg_names_from_schema(schema: Option<&Value>) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    let props = match schema
        .and_then(|s| s.get("properties"))
        .and_then(|p| p.as_object())
    {
        Some(props) => props,
        None => return out,
    };
    for (key, prop) in props {
        let key_lower = key.to_lowercase();
        if NON_PATH_SCHEMA_KEYS.contains(&key_lower.as_str()) {
            continue;
        }
        if KEY_HINTS.iter().any(|h| key_lower.contains(h)) || key_lower.ends_with("_path") {
            out.insert(key.clone());
            continue;
        }
        let desc = prop
            .get("description")
            .or_else(|| prop.get("title"))
            .and_then(|d| d.as_str())
            .unwrap_or("")
            .to_lowercase();
        if desc.contains("input")
            && (desc.contains("path") || desc.contains("file") || desc.contains("url"))
        {
            out.insert(key.clone());
        }
    }
    out
}

/// True when `value` is a local path rather than an already-resolved URL.
fn is_local_path(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    if let Ok(parsed) = Url::parse(value) {
        if matches!(parsed.scheme(), "http" | "https" | "local") {
            return false;
        }
    }
    true
}

/// Maps `/workspace/...` and relative paths into the actual workspace root;
/// other absolute paths pass through.
fn workspace_path_to_local(value: &str, workspace_root: &Path) -> PathBuf {
    let value = value.trim().replace('\\', "/");
    if let Some(rel) = value.strip_prefix("/workspace/") {
        return workspace_root.join(rel.trim_start_matches('/'));
    }
    if let Some(rel) = value.strip_prefix("/workspace") {
        let rel = rel.trim_start_matches('/');
        return if rel.is_empty() {
            workspace_root.to_path_buf()
        } else {
            workspace_root.join(rel)
        };
    }
    let path = Path::new(&value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace_root.join(path)
    }
}

/// Bohrium-style provider credentials, read from the process environment at
/// the first call that needs them.
#[derive(Debug, Clone)]
pub struct ProviderCredentials {
    pub access_key: String,
    pub project_id: i64,
    pub user_id: i64,
}

pub const ENV_ACCESS_KEY: &str = "BOHRIUM_ACCESS_KEY";
pub const ENV_PROJECT_ID: &str = "BOHRIUM_PROJECT_ID";
pub const ENV_USER_ID: &str = "BOHRIUM_USER_ID";

impl ProviderCredentials {
    pub fn from_env() -> Result<Self, AdaptorError> {
        let access_key = std::env::var(ENV_ACCESS_KEY)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AdaptorError::Credentials(format!("{} not set", ENV_ACCESS_KEY)))?;
        let parse_id = |key: &str| -> i64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(-1)
        };
        Ok(Self {
            access_key,
            project_id: parse_id(ENV_PROJECT_ID),
            user_id: parse_id(ENV_USER_ID),
        })
    }

    /// HTTPS storage descriptor injected as `effective_args.storage`.
    pub fn storage_config(&self) -> Value {
        json!({
            "type": "https",
            "plugin": {
                "type": "bohrium",
                "access_key": self.access_key,
                "project_id": self.project_id,
                "app_key": "agent",
            }
        })
    }
}

/// Per-server executor configuration from the runtime config:
/// a template to deep-copy plus the tools that run synchronously without one.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ServerExecutors {
    #[serde(default)]
    pub executor: Option<Value>,
    #[serde(default)]
    pub sync_tools: Vec<String>,
}

pub type CalculationExecutors = HashMap<String, ServerExecutors>;

/// The adaptor itself. Read-only after construction; shared by all remote
/// tool adapters of the calculation servers.
pub struct PathAdaptor {
    executors: CalculationExecutors,
    store: Arc<dyn ObjectStore>,
}

impl PathAdaptor {
    pub fn new(executors: CalculationExecutors, store: Arc<dyn ObjectStore>) -> Self {
        Self { executors, store }
    }

    /// Executor for `(server, tool)`: `null` when the tool is synchronous or
    /// the server has no template; otherwise the template deep-copied with
    /// provider credentials injected.
    fn resolve_executor(
        &self,
        origin_server: &str,
        remote_name: &str,
    ) -> Result<Value, AdaptorError> {
        let server_cfg = match self.executors.get(origin_server) {
            Some(cfg) => cfg,
            None => return Ok(Value::Null),
        };
        if server_cfg.sync_tools.iter().any(|t| t == remote_name) {
            return Ok(Value::Null);
        }
        let template = match &server_cfg.executor {
            Some(Value::Object(obj)) => obj.clone(),
            _ => return Ok(Value::Null),
        };
        let creds = ProviderCredentials::from_env()?;
        let mut executor = Value::Object(template);
        if executor.get("type").and_then(|t| t.as_str()) == Some("dispatcher") {
            // Missing nesting levels are created rather than assumed.
            ensure_object(&mut executor, "machine");
            if let Some(machine) = executor.get_mut("machine") {
                ensure_object(machine, "remote_profile");
                if let Some(rp) = machine.get_mut("remote_profile") {
                    rp["access_key"] = json!(creds.access_key);
                    rp["project_id"] = json!(creds.project_id);
                    rp["real_user_id"] = json!(creds.user_id);
                }
            }
            ensure_object(&mut executor, "resources");
            if let Some(resources) = executor.get_mut("resources") {
                ensure_object(resources, "envs");
                if let Some(envs) = resources.get_mut("envs") {
                    envs["BOHRIUM_PROJECT_ID"] = json!(creds.project_id);
                }
            }
        }
        Ok(executor)
    }

    /// Uploads one local value and substitutes the returned URL. Already
    /// resolved URLs pass through untouched.
    fn resolve_one(&self, value: &str, workspace_root: &Path) -> Result<String, AdaptorError> {
        if !is_local_path(value) {
            return Ok(value.to_string());
        }
        let path = workspace_path_to_local(value, workspace_root);
        if !path.exists() {
            return Err(AdaptorError::MissingFile(path));
        }
        if !path.is_file() {
            return Err(AdaptorError::NotAFile(path));
        }
        self.store.upload(&path)
    }

    /// Produces the effective arguments for one invocation: executor and
    /// storage are always set; every path argument is rewritten to a URL,
    /// lists element-wise.
    pub fn resolve(
        &self,
        workspace_root: &Path,
        raw_args: &Value,
        qualified_name: &str,
        origin_server: &str,
        input_schema: Option<&Value>,
    ) -> Result<Value, AdaptorError> {
        let mut out: Map<String, Value> = raw_args
            .as_object()
            .cloned()
            .ok_or_else(|| AdaptorError::InvalidArgs("tool arguments must be an object".into()))?;

        let remote_name = qualified_name
            .strip_prefix(&format!("{}_", origin_server))
            .unwrap_or(qualified_name);

        out.insert(
            "executor".into(),
            self.resolve_executor(origin_server, remote_name)?,
        );
        out.insert(
            "storage".into(),
            ProviderCredentials::from_env()?.storage_config(),
        );

        let mut path_args: BTreeSet<String> = CALCULATION_PATH_ARGS
            .get(remote_name)
            .map(|names| names.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        path_args.extend(path_arg_names_from_schema(input_schema));

        for key in path_args {
            let Some(value) = out.get(&key).cloned() else {
                continue;
            };
            let resolved = match value {
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| {
                            let s = item.as_str().map(str::to_string).unwrap_or_else(|| {
                                item.to_string()
                            });
                            self.resolve_one(&s, workspace_root).map(Value::String)
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                Value::String(s) => Value::String(self.resolve_one(&s, workspace_root)?),
                other => other,
            };
            out.insert(key, resolved);
        }
        Ok(Value::Object(out))
    }
}

fn ensure_object(value: &mut Value, key: &str) {
    if let Some(obj) = value.as_object_mut() {
        let entry = obj.entry(key.to_string()).or_insert_with(|| json!({}));
        if !entry.is_object() {
            *entry = json!({});
        }
    }
}
