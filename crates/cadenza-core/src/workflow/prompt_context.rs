//! Prompt-context rendering: enumerate workflow steps and derive
//! next-agent constraints for injection into agent prompts.
//!
//! Works directly on resolved definition steps (the raw document
//! mappings) so it can run without instantiating a workflow. Router
//! steps are hidden from the enumeration; the constraint block follows
//! the current agent's `on_success` chain and expands router route
//! targets into their agent types.

use serde_json::Value;

use super::definition::parse_bool;

/// Render workflow steps and next-agent constraints as prompt context
/// text. Returns an empty string when there are no steps.
pub fn build_prompt_context_text(
    steps: &[&Value],
    source_name: &str,
    tier: &str,
    current_agent_type: &str,
    valid_next_agents: &[String],
) -> String {
    if steps.is_empty() {
        return String::new();
    }

    let tier_label = if tier.is_empty() {
        String::new()
    } else {
        format!(" [{tier}]")
    };
    let mut lines = vec![format!("**Workflow Steps{tier_label} (from {source_name}):**\n")];

    for (pos, step) in steps.iter().enumerate() {
        let agent_type = get_str(step, "agent_type").unwrap_or("unknown");
        if agent_type == "router" {
            continue;
        }
        let name = get_str(step, "name")
            .or_else(|| get_str(step, "id"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("Step {}", pos + 1));
        let desc = get_str(step, "description").unwrap_or_default();
        lines.push(format!("- {}. **{name}** -- `{agent_type}` : {desc}", pos + 1));
    }

    lines.push(
        "\n**CRITICAL:** Use ONLY the agent_type names listed above. \
         DO NOT use old agent names or reference other workflow definitions."
            .to_string(),
    );

    let mut seen = Vec::new();
    let mut display_pairs = Vec::new();
    for step in steps {
        let agent_type = get_str(step, "agent_type").unwrap_or_default();
        if !agent_type.is_empty()
            && agent_type != "router"
            && !seen.contains(&agent_type.to_string())
        {
            seen.push(agent_type.to_string());
            display_pairs.push(format!("`{agent_type}` -> **{}**", title_case(agent_type)));
        }
    }
    if !display_pairs.is_empty() {
        lines.push(format!(
            "\n**Display Names (for the 'Ready for @...' line in your comment):**\n{}",
            display_pairs.join(", ")
        ));
    }

    if !current_agent_type.is_empty() && !valid_next_agents.is_empty() {
        let names = valid_next_agents
            .iter()
            .map(|a| format!("`{a}`"))
            .collect::<Vec<_>>()
            .join(", ");
        if valid_next_agents.len() == 1 {
            lines.push(format!(
                "\n**YOUR next_agent MUST be:** {names}\n\
                 Do NOT skip ahead or pick a different agent."
            ));
        } else {
            lines.push(format!(
                "\n**YOUR next_agent MUST be one of:** {names}\n\
                 Choose based on your classification. \
                 Do NOT skip ahead or pick a different agent."
            ));
        }
    }

    lines.join("\n")
}

/// Resolve valid next agent_type values for the current agent by
/// following `on_success` edges and expanding router routes.
/// Deduplicates while preserving order; a final step (or a step with no
/// successor) contributes "none".
pub fn resolve_next_agent_types(steps: &[&Value], current_agent_type: &str) -> Vec<String> {
    if steps.is_empty() {
        return Vec::new();
    }

    let by_id: std::collections::HashMap<&str, &Value> = steps
        .iter()
        .filter_map(|s| get_str(s, "id").map(|id| (id, *s)))
        .collect();

    let current_steps: Vec<&&Value> = steps
        .iter()
        .filter(|s| get_str(s, "agent_type") == Some(current_agent_type))
        .collect();
    if current_steps.is_empty() {
        return Vec::new();
    }

    let mut result: Vec<String> = Vec::new();
    for step in current_steps {
        let on_success = get_str(step, "on_success");
        if parse_bool(step.get("final_step"), false) || on_success.is_none() {
            result.push("none".to_string());
            continue;
        }

        let Some(target) = on_success.and_then(|id| by_id.get(id)) else {
            continue;
        };

        if get_str(target, "agent_type") == Some("router") {
            let routes = target
                .get("routes")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for route in routes {
                let route_target = get_str(route, "then").or_else(|| get_str(route, "default"));
                if let Some(id) = route_target {
                    match by_id.get(id) {
                        Some(resolved) => result.push(
                            get_str(resolved, "agent_type").unwrap_or("unknown").to_string(),
                        ),
                        None => result.push(id.to_string()),
                    }
                }
            }
            if let Some(resolved) = get_str(target, "default").and_then(|id| by_id.get(id)) {
                result.push(get_str(resolved, "agent_type").unwrap_or("unknown").to_string());
            }
        } else {
            result.push(get_str(target, "agent_type").unwrap_or("unknown").to_string());
        }
    }

    let mut seen = std::collections::HashSet::new();
    result.into_iter().filter(|a| seen.insert(a.clone())).collect()
}

/// Map a normalized candidate (step id or name) back to a valid next
/// agent_type. Falls back to the single valid agent when there is
/// exactly one, else the empty string.
pub fn canonicalize_next_agent(
    steps: &[&Value],
    candidate: &str,
    valid_next_agents: &[String],
) -> String {
    let candidate_lc = candidate.to_lowercase();
    for step in steps {
        let step_id = get_str(step, "id").unwrap_or_default().trim().to_lowercase();
        let step_name = get_str(step, "name").unwrap_or_default().trim().to_lowercase();
        if candidate_lc == step_id || candidate_lc == step_name {
            let mapped = get_str(step, "agent_type").unwrap_or_default().trim();
            if valid_next_agents.iter().any(|a| a == mapped) {
                return mapped.to_string();
            }
        }
    }
    if valid_next_agents.len() == 1 {
        valid_next_agents[0].clone()
    } else {
        String::new()
    }
}

fn get_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if at_word_start {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            at_word_start = false;
        } else {
            out.push(c);
            at_word_start = true;
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
