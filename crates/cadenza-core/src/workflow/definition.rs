//! Workflow definition loading and schema validation.
//!
//! Converts a declarative YAML document (a loose, enumerated-key mapping)
//! into the in-memory `Workflow` model. Documents may carry a flat `steps`
//! list or tiered `<tier>_workflow` variants selected by a caller-supplied
//! tier tag; an `orchestration` block configures polling, timeouts,
//! retries and recovery.
//!
//! Validation returns `(errors, warnings)`; strict mode promotes warnings
//! to errors. Loading a document that fails validation raises.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use cadenza_types::workflow::{
    Agent, ApprovalGate, ApprovalGateKind, BackoffStrategy, OrchestrationConfig, Route,
    StaleStepAction, TimeoutAction, Workflow, WorkflowStep,
};

/// Valid backoff strategies accepted in a `retry_policy` block.
pub const RETRY_BACKOFF_STRATEGIES: [&str; 3] = ["exponential", "linear", "constant"];

const ORCHESTRATION_TIMEOUT_ACTIONS: [&str; 3] = ["retry", "fail_step", "alert_only"];
const ORCHESTRATION_STALE_ACTIONS: [&str; 2] = ["reconcile", "fail_workflow"];

const TRUTHY_STRINGS: [&str; 4] = ["1", "true", "yes", "on"];
const FALSY_STRINGS: [&str; 4] = ["0", "false", "no", "off"];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("schema validation failed:\n{}", format_lines(.0))]
    Validation(Vec<String>),

    /// Strict mode promoted warnings to errors.
    #[error("schema warnings (strict mode):\n{}", format_lines(.0))]
    StrictWarnings(Vec<String>),
}

fn format_lines(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| format!("  - {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Load options
// ---------------------------------------------------------------------------

/// Caller-supplied overrides for definition loading.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Explicit workflow id; defaults to the slugified name.
    pub workflow_id: Option<String>,
    pub name_override: Option<String>,
    pub description_override: Option<String>,
    /// Extra metadata merged onto the workflow.
    pub metadata: HashMap<String, Value>,
    /// Tier selector ("full", "shortened", "fast-track", or any custom
    /// tier defined in the document). Empty selects the flat layout.
    pub tier: String,
    /// Promote schema warnings to errors.
    pub strict: bool,
    /// Root the `completion_glob` must resolve inside. Defaults to the
    /// current directory.
    pub workspace_root: Option<PathBuf>,
}

impl LoadOptions {
    pub fn tier(tier: impl Into<String>) -> Self {
        LoadOptions {
            tier: tier.into(),
            ..LoadOptions::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML document into a JSON value mapping.
pub fn parse_document(text: &str) -> Result<Value, DefinitionError> {
    serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))
}

/// Load and validate a workflow definition from a YAML file.
pub fn load_file(path: &Path, options: &LoadOptions) -> Result<Workflow, DefinitionError> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text, options)
}

/// Load and validate a workflow definition from a YAML string.
pub fn load_str(text: &str, options: &LoadOptions) -> Result<Workflow, DefinitionError> {
    let data = parse_document(text)?;
    load_from_value(&data, options)
}

/// Load and validate a workflow definition from a parsed document.
pub fn load_from_value(data: &Value, options: &LoadOptions) -> Result<Workflow, DefinitionError> {
    let (errors, warnings) =
        validate_document(data, &options.tier, options.workspace_root.as_deref());
    if !errors.is_empty() {
        return Err(DefinitionError::Validation(errors));
    }
    if options.strict && !warnings.is_empty() {
        return Err(DefinitionError::StrictWarnings(warnings));
    }
    for warning in &warnings {
        tracing::warn!(warning = warning.as_str(), "workflow definition warning");
    }

    let name = options
        .name_override
        .clone()
        .or_else(|| get_str(data, "name").map(str::to_string))
        .unwrap_or_else(|| "Unnamed Workflow".to_string());
    let description = options
        .description_override
        .clone()
        .or_else(|| get_str(data, "description").map(str::to_string))
        .unwrap_or_default();
    let version = match data.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "1.0".to_string(),
    };

    let resolved_id = options
        .workflow_id
        .clone()
        .or_else(|| get_str(data, "id").map(str::to_string))
        .unwrap_or_else(|| slugify(&name));
    if resolved_id.is_empty() {
        return Err(DefinitionError::Validation(vec![
            "workflow id could not be resolved".to_string(),
        ]));
    }

    let orchestration = parse_orchestration_config(data);
    let steps_data = resolve_steps(data, &options.tier);
    let steps = build_steps(&steps_data, &orchestration)?;

    let mut workflow = Workflow::new(resolved_id, name, version);
    workflow.description = description;
    workflow.steps = steps;
    workflow.require_human_merge_approval = parse_require_human_merge_approval(data);
    workflow.schema_version = get_str(data, "schema_version").map(str::to_string);
    workflow.orchestration = orchestration;
    workflow
        .metadata
        .insert("definition".to_string(), data.clone());
    for (key, value) in &options.metadata {
        workflow.metadata.insert(key.clone(), value.clone());
    }
    workflow.apply_approval_gates();

    Ok(workflow)
}

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

/// Parse booleans from YAML scalars without treating non-empty strings as
/// truthy: "true"/"yes"/"on"/"1" and "false"/"no"/"off"/"0" are
/// recognized, anything else falls back to the default.
pub fn parse_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            let normalized = s.trim().to_lowercase();
            if TRUTHY_STRINGS.contains(&normalized.as_str()) {
                true
            } else if FALSY_STRINGS.contains(&normalized.as_str()) {
                false
            } else {
                default
            }
        }
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
        _ => default,
    }
}

/// Convert text into a safe workflow/step id.
pub fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = false;
    for c in text.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

fn get_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn get_u64(data: &Value, key: &str, default: u64) -> u64 {
    data.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn get_f64(data: &Value, key: &str, default: f64) -> f64 {
    data.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn get_map<'a>(data: &'a Value, key: &str) -> Option<&'a serde_json::Map<String, Value>> {
    data.get(key).and_then(Value::as_object)
}

// ---------------------------------------------------------------------------
// Tier resolution
// ---------------------------------------------------------------------------

/// Resolve the step list from a flat or tiered document layout.
///
/// With a tier tag: try the explicit `workflow_types` mapping, then the
/// conventional keys `<tier>_workflow`, `<tier>` (hyphens normalized to
/// underscores first, raw tag second), returning the first non-empty
/// steps list. Without a tier: the flat `steps` list, else the first
/// `*_workflow` section with steps.
pub fn resolve_steps<'a>(data: &'a Value, tier: &str) -> Vec<&'a Value> {
    let Some(root) = data.as_object() else {
        return Vec::new();
    };

    if !tier.is_empty() {
        let mapped = get_map(data, "workflow_types")
            .and_then(|m| m.get(tier))
            .and_then(Value::as_str)
            .unwrap_or(tier);

        let prefix = mapped.replace('-', "_");
        let candidates = [
            format!("{prefix}_workflow"),
            prefix.clone(),
            format!("{mapped}_workflow"),
            mapped.to_string(),
        ];
        let mut seen = HashSet::new();
        for key in candidates {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(steps) = tier_steps(root.get(&key)) {
                return steps;
            }
        }
        return Vec::new();
    }

    if let Some(Value::Array(steps)) = root.get("steps") {
        if !steps.is_empty() {
            return steps.iter().collect();
        }
    }

    for (key, value) in root {
        if key.ends_with("_workflow") {
            if let Some(steps) = tier_steps(Some(value)) {
                return steps;
            }
        }
    }

    Vec::new()
}

fn tier_steps(section: Option<&Value>) -> Option<Vec<&Value>> {
    let steps = section?.as_object()?.get("steps")?.as_array()?;
    if steps.is_empty() {
        None
    } else {
        Some(steps.iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Step construction
// ---------------------------------------------------------------------------

fn build_steps(
    steps_data: &[&Value],
    orchestration: &OrchestrationConfig,
) -> Result<Vec<WorkflowStep>, DefinitionError> {
    let mut steps = Vec::with_capacity(steps_data.len());

    for (pos, step_data) in steps_data.iter().enumerate() {
        let idx = (pos + 1) as u32;
        let Some(map) = step_data.as_object() else {
            return Err(DefinitionError::Validation(vec![format!(
                "step {idx} must be a mapping"
            )]));
        };
        let step_data: &Value = step_data;

        let agent_type = get_str(step_data, "agent_type").unwrap_or("agent");
        let raw_name = get_str(step_data, "id")
            .or_else(|| get_str(step_data, "name"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{idx}"));
        let step_desc = get_str(step_data, "description").unwrap_or_default();
        let prompt_template = get_str(step_data, "prompt_template")
            .filter(|p| !p.is_empty())
            .or(Some(step_desc).filter(|d| !d.is_empty()))
            .unwrap_or("Execute step");

        // retry may come from the bare `retry` key or a retry_policy block
        let mut retry = step_data.get("retry").and_then(Value::as_u64).map(|r| r as u32);
        let mut backoff_strategy = None;
        let mut initial_delay = 0.0;
        if let Some(policy) = get_map(step_data, "retry_policy") {
            if retry.is_none() {
                retry = policy.get("max_retries").and_then(Value::as_u64).map(|r| r as u32);
            }
            backoff_strategy = policy
                .get("backoff")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<BackoffStrategy>().ok());
            initial_delay = policy
                .get("initial_delay")
                .and_then(Value::as_f64)
                .filter(|d| *d >= 0.0)
                .unwrap_or(0.0);
        }

        let agent = Agent {
            name: agent_type.to_string(),
            display_name: get_str(step_data, "name").unwrap_or(agent_type).to_string(),
            description: if step_desc.is_empty() {
                format!("Step {idx}")
            } else {
                step_desc.to_string()
            },
            provider_preference: get_str(step_data, "provider").map(str::to_string),
            timeout_secs: orchestration.default_agent_timeout_seconds,
            max_retries: orchestration.max_retries_per_step,
        };

        let slug = slugify(&raw_name);
        let mut step = WorkflowStep::new(
            idx,
            if slug.is_empty() { raw_name } else { slug },
            agent,
            prompt_template,
        );
        step.condition = get_str(step_data, "condition").map(str::to_string);
        step.timeout_secs = step_data.get("timeout").and_then(Value::as_u64);
        step.retry = retry;
        step.backoff_strategy = backoff_strategy;
        step.initial_delay_secs = initial_delay;
        step.inputs = normalize_inputs(step_data.get("inputs"));
        step.on_success = get_str(step_data, "on_success").map(str::to_string);
        step.final_step = parse_bool(step_data.get("final_step"), false);
        step.routes = parse_routes(step_data.get("routes"));
        step.approval_gates = parse_approval_gates(step_data.get("approval_gates"));
        step.parallel_with = map
            .get("parallel")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|id| {
                        let slug = slugify(id);
                        if slug.is_empty() { id.to_string() } else { slug }
                    })
                    .collect()
            })
            .unwrap_or_default();

        steps.push(step);
    }

    Ok(steps)
}

/// Inputs may be a mapping or a list of single-entry mappings.
fn normalize_inputs(inputs: Option<&Value>) -> HashMap<String, Value> {
    match inputs {
        Some(Value::Object(map)) => map.clone().into_iter().collect(),
        Some(Value::Array(entries)) => {
            let mut normalized = HashMap::new();
            for entry in entries {
                if let Value::Object(map) = entry {
                    for (key, value) in map {
                        normalized.insert(key.clone(), value.clone());
                    }
                }
            }
            normalized
        }
        _ => HashMap::new(),
    }
}

fn parse_routes(routes: Option<&Value>) -> Vec<Route> {
    let Some(Value::Array(entries)) = routes else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| serde_json::from_value::<Route>(entry.clone()).ok())
        .collect()
}

fn parse_approval_gates(gates: Option<&Value>) -> Vec<ApprovalGate> {
    let Some(Value::Array(entries)) = gates else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let map = entry.as_object()?;
            let kind = map
                .get("gate_type")
                .or_else(|| map.get("type"))
                .and_then(Value::as_str)
                .map(|s| match s {
                    "pr_merge" => ApprovalGateKind::PrMerge,
                    "deployment" => ApprovalGateKind::Deployment,
                    "data_access" => ApprovalGateKind::DataAccess,
                    _ => ApprovalGateKind::Custom,
                })
                .unwrap_or(ApprovalGateKind::Custom);
            Some(ApprovalGate {
                kind,
                required: parse_bool(map.get("required"), true),
                tool_restrictions: map
                    .get("tool_restrictions")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default(),
                approval_message: map
                    .get("approval_message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                metadata: HashMap::new(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Workflow-level settings
// ---------------------------------------------------------------------------

/// Workflow-level approval setting: `monitoring.require_human_merge_approval`
/// with a top-level key override. Defaults to true.
pub fn parse_require_human_merge_approval(data: &Value) -> bool {
    let mut required = true;
    if let Some(monitoring) = get_map(data, "monitoring") {
        required = parse_bool(monitoring.get("require_human_merge_approval"), true);
    }
    if let Some(top_level) = data.get("require_human_merge_approval") {
        required = parse_bool(Some(top_level), true);
    }
    required
}

/// Parse the orchestration block with defaults and the v1
/// `timeout_seconds` fallback.
pub fn parse_orchestration_config(data: &Value) -> OrchestrationConfig {
    let defaults = OrchestrationConfig::default();
    let empty = serde_json::Map::new();
    let orchestration = get_map(data, "orchestration").unwrap_or(&empty);
    let section = |key: &str| {
        orchestration
            .get(key)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default()
    };

    let polling = section("polling");
    let timeouts = section("timeouts");
    let chaining = section("chaining");
    let retries = section("retries");
    let recovery = section("recovery");

    let polling = Value::Object(polling);
    let timeouts = Value::Object(timeouts);
    let chaining = Value::Object(chaining);
    let retries = Value::Object(retries);
    let recovery = Value::Object(recovery);

    // v1 documents carried a top-level timeout_seconds
    let default_timeout = match data.get("timeout_seconds").and_then(Value::as_u64) {
        Some(t) if t > 0 => t,
        _ => get_u64(
            &timeouts,
            "default_agent_timeout_seconds",
            defaults.default_agent_timeout_seconds,
        ),
    };

    OrchestrationConfig {
        interval_seconds: get_u64(&polling, "interval_seconds", defaults.interval_seconds),
        completion_glob: get_str(&polling, "completion_glob")
            .unwrap_or(defaults.completion_glob.as_str())
            .to_string(),
        dedupe_cache_size: get_u64(&polling, "dedupe_cache_size", defaults.dedupe_cache_size as u64)
            as usize,
        default_agent_timeout_seconds: default_timeout,
        liveness_miss_threshold: get_u64(
            &timeouts,
            "liveness_miss_threshold",
            defaults.liveness_miss_threshold as u64,
        ) as u32,
        timeout_action: get_str(&timeouts, "timeout_action")
            .and_then(|s| s.parse::<TimeoutAction>().ok())
            .unwrap_or(defaults.timeout_action),
        chaining_enabled: parse_bool(chaining.get("enabled"), defaults.chaining_enabled),
        require_completion_comment: parse_bool(
            chaining.get("require_completion_comment"),
            defaults.require_completion_comment,
        ),
        block_on_closed_issue: parse_bool(
            chaining.get("block_on_closed_issue"),
            defaults.block_on_closed_issue,
        ),
        max_retries_per_step: get_u64(
            &retries,
            "max_retries_per_step",
            defaults.max_retries_per_step as u64,
        ) as u32,
        backoff: get_str(&retries, "backoff")
            .and_then(|s| s.parse::<BackoffStrategy>().ok())
            .unwrap_or(defaults.backoff),
        initial_delay_seconds: get_f64(&retries, "initial_delay_seconds", defaults.initial_delay_seconds),
        stale_running_step_action: get_str(&recovery, "stale_running_step_action")
            .and_then(|s| s.parse::<StaleStepAction>().ok())
            .unwrap_or(defaults.stale_running_step_action),
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate the orchestration block contract and return error messages.
///
/// Enum fields must be in their domains, numeric fields positive, the
/// initial delay non-negative, and the completion glob non-empty and
/// confined to the workspace root (path traversal rejected).
pub fn validate_orchestration(data: &Value, workspace_root: Option<&Path>) -> Vec<String> {
    let mut errors = Vec::new();
    let empty = serde_json::Map::new();
    let orchestration = get_map(data, "orchestration").unwrap_or(&empty);

    let raw = |section: &str, key: &str| -> Option<Value> {
        orchestration
            .get(section)
            .and_then(Value::as_object)
            .and_then(|m| m.get(key))
            .cloned()
    };

    let config = parse_orchestration_config(data);

    let numeric_positive = [
        ("polling", "interval_seconds"),
        ("polling", "dedupe_cache_size"),
        ("timeouts", "default_agent_timeout_seconds"),
        ("timeouts", "liveness_miss_threshold"),
        ("retries", "max_retries_per_step"),
    ];
    for (section, key) in numeric_positive {
        if let Some(value) = raw(section, key) {
            if value.as_u64().is_none_or(|n| n == 0) {
                errors.push(format!(
                    "orchestration.{section}.{key} must be a positive integer, got {value}"
                ));
            }
        }
    }

    if let Some(action) = raw("timeouts", "timeout_action") {
        let valid = action
            .as_str()
            .is_some_and(|s| ORCHESTRATION_TIMEOUT_ACTIONS.contains(&s));
        if !valid {
            errors.push(format!(
                "orchestration.timeouts.timeout_action must be one of {ORCHESTRATION_TIMEOUT_ACTIONS:?}, got {action}"
            ));
        }
    }
    if let Some(backoff) = raw("retries", "backoff") {
        let valid = backoff
            .as_str()
            .is_some_and(|s| RETRY_BACKOFF_STRATEGIES.contains(&s));
        if !valid {
            errors.push(format!(
                "orchestration.retries.backoff must be one of {RETRY_BACKOFF_STRATEGIES:?}, got {backoff}"
            ));
        }
    }
    if let Some(action) = raw("recovery", "stale_running_step_action") {
        let valid = action
            .as_str()
            .is_some_and(|s| ORCHESTRATION_STALE_ACTIONS.contains(&s));
        if !valid {
            errors.push(format!(
                "orchestration.recovery.stale_running_step_action must be one of {ORCHESTRATION_STALE_ACTIONS:?}, got {action}"
            ));
        }
    }

    if let Some(delay) = raw("retries", "initial_delay_seconds") {
        if delay.as_f64().is_none_or(|d| d < 0.0) {
            errors.push(format!(
                "orchestration.retries.initial_delay_seconds must be non-negative, got {delay}"
            ));
        }
    }

    let glob = config.completion_glob.trim();
    if glob.is_empty() {
        errors.push("orchestration.polling.completion_glob must not be empty".to_string());
    } else {
        let root = workspace_root
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        if !glob_confined_to_root(glob, &root) {
            errors.push(
                "orchestration.polling.completion_glob must resolve inside workspace root"
                    .to_string(),
            );
        }
    }

    errors
}

/// Check the non-wildcard prefix of a glob stays inside the root.
fn glob_confined_to_root(glob: &str, root: &Path) -> bool {
    let wildcard = glob
        .find(['*', '?', '['])
        .unwrap_or(glob.len());
    let base = &glob[..wildcard];

    if Path::new(glob).is_absolute() {
        let base_path = normalize_path(Path::new(base));
        let root = normalize_path(root);
        base_path.starts_with(&root)
    } else {
        // Relative globs may not climb out of the workspace.
        !Path::new(base)
            .components()
            .any(|c| matches!(c, Component::ParentDir))
    }
}

/// Lexically resolve `.` and `..` components without touching the
/// filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Validate a workflow definition document.
///
/// Returns `(errors, warnings)`. Errors are fatal; warnings are
/// informational unless strict mode promotes them.
pub fn validate_document(
    data: &Value,
    tier: &str,
    workspace_root: Option<&Path>,
) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if !data.is_object() {
        errors.push("workflow definition must be a mapping".to_string());
        return (errors, warnings);
    }

    if get_str(data, "name").is_none_or(str::is_empty)
        && get_str(data, "id").is_none_or(str::is_empty)
    {
        errors.push("missing required field: 'name' or 'id'".to_string());
    }

    let steps = resolve_steps(data, tier);
    if steps.is_empty() {
        errors.push(format!(
            "no steps found for workflow_type='{tier}'; \
             ensure the definition has a non-empty 'steps' list or matching tier section"
        ));
        errors.extend(validate_orchestration(data, workspace_root));
        return (errors, warnings);
    }

    let step_ids: HashSet<&str> = steps
        .iter()
        .filter_map(|s| get_str(s, "id"))
        .collect();

    for (pos, step) in steps.iter().enumerate() {
        let idx = pos + 1;
        let Some(map) = step.as_object() else {
            errors.push(format!("step {idx}: must be a mapping"));
            continue;
        };

        let label = get_str(step, "id")
            .or_else(|| get_str(step, "name"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("step_{idx}"));

        if get_str(step, "agent_type").is_none_or(str::is_empty) {
            errors.push(format!("step '{label}': missing required field 'agent_type'"));
        }

        if let Some(target) = get_str(step, "on_success") {
            if !step_ids.is_empty() && !step_ids.contains(target) {
                errors.push(format!(
                    "step '{label}': 'on_success' references unknown step id '{target}'"
                ));
            }
        }

        if let Some(condition) = get_str(step, "condition") {
            if !condition_parses(condition) {
                errors.push(format!(
                    "step '{label}': malformed 'condition' expression '{condition}'"
                ));
            }
        }

        if let Some(policy) = map.get("retry_policy") {
            match policy.as_object() {
                None => errors.push(format!("step '{label}': 'retry_policy' must be a mapping")),
                Some(policy) => {
                    if let Some(max_retries) = policy.get("max_retries") {
                        if max_retries.as_u64().is_none() {
                            errors.push(format!(
                                "step '{label}': 'retry_policy.max_retries' must be a \
                                 non-negative integer, got {max_retries}"
                            ));
                        }
                    }
                    if let Some(backoff) = policy.get("backoff") {
                        let valid = backoff
                            .as_str()
                            .is_some_and(|s| RETRY_BACKOFF_STRATEGIES.contains(&s));
                        if !valid {
                            errors.push(format!(
                                "step '{label}': 'retry_policy.backoff' must be one of \
                                 {RETRY_BACKOFF_STRATEGIES:?}, got {backoff}"
                            ));
                        }
                    }
                    if let Some(delay) = policy.get("initial_delay") {
                        if delay.as_f64().is_none_or(|d| d < 0.0) {
                            errors.push(format!(
                                "step '{label}': 'retry_policy.initial_delay' must be a \
                                 non-negative number, got {delay}"
                            ));
                        }
                    }
                }
            }
        }

        if let Some(parallel) = map.get("parallel") {
            match parallel.as_array() {
                None => errors.push(format!(
                    "step '{label}': 'parallel' must be a list of step ids"
                )),
                Some(entries) => {
                    for entry in entries {
                        match entry.as_str() {
                            None => errors.push(format!(
                                "step '{label}': 'parallel' entries must be strings, got {entry}"
                            )),
                            Some(id) if !step_ids.is_empty() && !step_ids.contains(id) => {
                                warnings.push(format!(
                                    "step '{label}': 'parallel' references unknown step id '{id}'"
                                ));
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
        }
    }

    errors.extend(validate_orchestration(data, workspace_root));
    (errors, warnings)
}

/// Whether an expression is syntactically valid. Identifier resolution
/// happens at evaluation time, so only the grammar is checked here.
pub fn condition_parses(condition: &str) -> bool {
    jexl_parser::Parser::parse(condition).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
