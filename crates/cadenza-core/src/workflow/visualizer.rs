//! Workflow visualization -- Mermaid.js flowchart generation.
//!
//! Renders a workflow as a `flowchart TD` diagram with one node per step
//! and one style class per step status. The returned string is plain
//! text suitable for embedding in a chat message as a fenced code block
//! or rendering with any Mermaid-compatible viewer.

use cadenza_types::workflow::{StepStatus, Workflow};

/// Mermaid classDef declarations appended at the end of every diagram.
const CLASS_DEFS: &str = "    classDef pending fill:#e0e0e0,stroke:#9e9e9e\n    \
                          classDef running fill:#2196f3,stroke:#1565c0,color:#fff\n    \
                          classDef completed fill:#4caf50,stroke:#2e7d32,color:#fff\n    \
                          classDef failed fill:#f44336,stroke:#b71c1c,color:#fff\n    \
                          classDef skipped fill:#ff9800,stroke:#e65100,color:#fff";

fn status_class(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::Running => "running",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "failed",
        StepStatus::Skipped => "skipped",
    }
}

/// Convert a workflow to a Mermaid flowchart string.
///
/// Nodes are labelled `<step_num>. <name> [<STATUS>]`; edges connect
/// consecutive sequential steps. `title` defaults to the workflow name.
pub fn workflow_to_mermaid(workflow: &Workflow, title: Option<&str>) -> String {
    let diagram_title = title.unwrap_or(&workflow.name);
    let mut lines = vec![
        format!("---\ntitle: \"{diagram_title}\"\n---"),
        "flowchart TD".to_string(),
    ];

    let mut node_ids = Vec::with_capacity(workflow.steps.len());
    for step in &workflow.steps {
        let node_id = format!("step{}", step.step_num);
        let status_label = step.status.as_str().to_uppercase();
        let label = format!("{}. {}\\n[{}]", step.step_num, step.name, status_label);
        lines.push(format!(
            "    {node_id}[\"{label}\"]:::{}",
            status_class(step.status)
        ));
        node_ids.push(node_id);
    }

    for window in node_ids.windows(2) {
        lines.push(format!("    {} --> {}", window[0], window[1]));
    }

    lines.push(CLASS_DEFS.to_string());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_types::workflow::{Agent, WorkflowStep};

    fn workflow() -> Workflow {
        let agent = |name: &str| Agent {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            provider_preference: None,
            timeout_secs: 600,
            max_retries: 2,
        };
        let mut wf = Workflow::new("wf-1", "delivery", "1.0");
        wf.steps = vec![
            WorkflowStep::new(1, "triage", agent("triage"), "p"),
            WorkflowStep::new(2, "develop", agent("developer"), "p"),
            WorkflowStep::new(3, "review", agent("reviewer"), "p"),
        ];
        wf.steps[0].status = StepStatus::Completed;
        wf.steps[1].status = StepStatus::Running;
        wf
    }

    #[test]
    fn renders_nodes_with_status_classes() {
        let diagram = workflow_to_mermaid(&workflow(), None);

        assert!(diagram.contains("flowchart TD"));
        assert!(diagram.contains("title: \"delivery\""));
        assert!(diagram.contains("step1[\"1. triage\\n[COMPLETED]\"]:::completed"));
        assert!(diagram.contains("step2[\"2. develop\\n[RUNNING]\"]:::running"));
        assert!(diagram.contains("step3[\"3. review\\n[PENDING]\"]:::pending"));
    }

    #[test]
    fn renders_sequential_edges() {
        let diagram = workflow_to_mermaid(&workflow(), None);
        assert!(diagram.contains("step1 --> step2"));
        assert!(diagram.contains("step2 --> step3"));
        assert!(!diagram.contains("step3 --> "));
    }

    #[test]
    fn renders_all_class_defs() {
        let diagram = workflow_to_mermaid(&workflow(), None);
        for class in ["pending", "running", "completed", "failed", "skipped"] {
            assert!(diagram.contains(&format!("classDef {class}")), "{class}");
        }
    }

    #[test]
    fn custom_title_overrides_name() {
        let diagram = workflow_to_mermaid(&workflow(), Some("Issue #42"));
        assert!(diagram.contains("title: \"Issue #42\""));
    }
}
