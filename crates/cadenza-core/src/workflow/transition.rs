//! Transition service: resolve and activate the successor of a
//! successfully completed step.
//!
//! Successor selection order: the completed step's `on_success` target
//! (with goto re-entry reset), else the next step in declaration order.
//! Router candidates are marked SKIPPED and replaced by their matched
//! route target; guarded candidates whose condition is false are marked
//! SKIPPED and passed over. When no candidate remains, the workflow is
//! COMPLETED.
//!
//! The functions here mutate the workflow and report what happened in a
//! `TransitionOutcome`; persistence, audit writes, event emission and
//! callbacks belong to the caller.

use chrono::Utc;
use serde_json::{Map, Value};

use cadenza_types::workflow::{StepStatus, Workflow, WorkflowState, WorkflowStep};

use super::expression::ConditionEvaluator;

/// Hard safety limit on goto re-entries of a single step.
pub const DEFAULT_MAX_LOOP_ITERATIONS: u32 = 10;

/// A step passed over during successor resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipRecord {
    pub step_num: u32,
    pub step_name: String,
    /// Guard expression, when the skip came from a false condition.
    pub condition: Option<String>,
    pub reason: String,
}

/// A goto re-entry that would exceed the loop-iteration limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopViolation {
    pub step: String,
    pub iteration: u32,
    pub limit: u32,
}

/// What `advance_after_success` did to the workflow.
#[derive(Debug, Default)]
pub struct TransitionOutcome {
    /// Step numbers activated, primary step first, parallel siblings after.
    pub activated: Vec<u32>,
    /// Steps marked SKIPPED, in the order they were passed over.
    pub skipped: Vec<SkipRecord>,
    /// Set when a goto re-entry hit the loop-iteration limit; the
    /// workflow was not advanced.
    pub loop_violation: Option<LoopViolation>,
}

// ---------------------------------------------------------------------------
// Context building
// ---------------------------------------------------------------------------

/// Build the expression context from completed-step outputs.
///
/// Outputs merge flat in step order (later steps win); the most recently
/// completed step's outputs are additionally exposed as `result`, and
/// every completed step's outputs as `steps.<name>`.
pub fn build_step_context(workflow: &Workflow) -> Value {
    let mut root = Map::new();
    let mut steps = Map::new();
    let mut latest: Option<(&WorkflowStep, chrono::DateTime<Utc>)> = None;

    for step in &workflow.steps {
        if step.status != StepStatus::Completed {
            continue;
        }
        for (key, value) in &step.outputs {
            root.insert(key.clone(), value.clone());
        }
        steps.insert(
            step.name.clone(),
            Value::Object(step.outputs.clone().into_iter().collect()),
        );
        if let Some(completed_at) = step.completed_at {
            if latest.is_none_or(|(_, t)| completed_at >= t) {
                latest = Some((step, completed_at));
            }
        }
    }

    if let Some((step, _)) = latest {
        root.insert(
            "result".to_string(),
            Value::Object(step.outputs.clone().into_iter().collect()),
        );
    }
    root.insert("steps".to_string(), Value::Object(steps));
    Value::Object(root)
}

// ---------------------------------------------------------------------------
// Goto re-entry
// ---------------------------------------------------------------------------

/// Reset a step for goto/loop re-execution, guarded by the iteration
/// limit. Increments `iteration` and clears all transient fields.
pub fn reset_step_for_goto(
    step: &mut WorkflowStep,
    max_loop_iterations: u32,
) -> Result<(), LoopViolation> {
    if step.iteration >= max_loop_iterations {
        return Err(LoopViolation {
            step: step.name.clone(),
            iteration: step.iteration,
            limit: max_loop_iterations,
        });
    }
    step.iteration += 1;
    step.status = StepStatus::Pending;
    step.started_at = None;
    step.completed_at = None;
    step.error = None;
    step.outputs.clear();
    step.retry_count = 0;
    Ok(())
}

// ---------------------------------------------------------------------------
// Router resolution
// ---------------------------------------------------------------------------

/// Evaluate a router step's routes and return the index of the matched
/// target step.
///
/// The first non-default route whose `when` expression evaluates true
/// (route guards default to false on evaluation errors) selects its
/// target; otherwise the first default route's target applies. Returns
/// None when no route resolves to a known step.
pub fn resolve_route_target(
    workflow: &Workflow,
    router_idx: usize,
    context: &Value,
    evaluator: &ConditionEvaluator,
) -> Option<usize> {
    let router = &workflow.steps[router_idx];
    let mut default_target: Option<&str> = None;

    for route in &router.routes {
        if route.is_default() {
            if default_target.is_none() {
                default_target = route.default_target();
            }
            continue;
        }
        let (Some(when), Some(target)) = (route.when.as_deref(), route.target()) else {
            continue;
        };
        if evaluator.evaluate(Some(when), context, false) {
            return workflow.step_index_by_name(target);
        }
    }

    default_target.and_then(|name| workflow.step_index_by_name(name))
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Mark the step RUNNING and co-activate its pending parallel siblings.
/// Returns the activated step numbers, primary first.
pub fn activate_step(workflow: &mut Workflow, idx: usize) -> Vec<u32> {
    let now = Utc::now();
    let mut activated = Vec::new();

    workflow.current_step = workflow.steps[idx].step_num;
    workflow.steps[idx].status = StepStatus::Running;
    workflow.steps[idx].started_at = Some(now);
    activated.push(workflow.steps[idx].step_num);

    let siblings = workflow.steps[idx].parallel_with.clone();
    for name in siblings {
        if let Some(sidx) = workflow.step_index_by_name(&name) {
            if workflow.steps[sidx].status == StepStatus::Pending {
                workflow.steps[sidx].status = StepStatus::Running;
                workflow.steps[sidx].started_at = Some(now);
                activated.push(workflow.steps[sidx].step_num);
            }
        }
    }
    activated
}

/// Whether any member of the completed step's parallel group is still
/// RUNNING (the group completes with a barrier before advancing).
pub fn parallel_group_busy(workflow: &Workflow, idx: usize) -> bool {
    let name = workflow.steps[idx].name.as_str();
    let in_group = |step: &WorkflowStep| {
        workflow.steps[idx].parallel_with.iter().any(|n| n == &step.name)
            || step.parallel_with.iter().any(|n| n == name)
    };
    workflow
        .steps
        .iter()
        .filter(|s| s.name != name)
        .any(|s| in_group(s) && s.status == StepStatus::Running)
}

/// Highest step number in the completed step's parallel group, or None
/// when the step has no siblings. Advancing sequentially resumes after
/// this frontier, not after whichever sibling happened to finish last.
pub fn parallel_group_frontier(workflow: &Workflow, idx: usize) -> Option<u32> {
    let name = workflow.steps[idx].name.as_str();
    let own_num = workflow.steps[idx].step_num;
    let mut frontier = None;
    for step in &workflow.steps {
        let in_group = workflow.steps[idx].parallel_with.iter().any(|n| n == &step.name)
            || step.parallel_with.iter().any(|n| n == name);
        if in_group && step.name != name {
            let num = step.step_num.max(own_num);
            frontier = Some(frontier.map_or(num, |f: u32| f.max(num)));
        }
    }
    frontier
}

// ---------------------------------------------------------------------------
// Advance after success
// ---------------------------------------------------------------------------

/// Advance workflow state after a successful step completion.
///
/// Mutates the workflow in place: resets goto targets, skips routers and
/// false-guarded steps, activates the resolved candidate, or completes
/// the workflow when no candidate remains.
pub fn advance_after_success(
    workflow: &mut Workflow,
    completed_idx: usize,
    max_loop_iterations: u32,
) -> TransitionOutcome {
    let evaluator = ConditionEvaluator::new();
    let mut outcome = TransitionOutcome::default();
    let context = build_step_context(workflow);

    // Successor selection: on_success goto, else next in declaration order.
    let mut next_idx: Option<usize> = None;
    if let Some(target) = workflow.steps[completed_idx].on_success.clone() {
        if let Some(idx) = workflow.step_index_by_name(&target) {
            if workflow.steps[idx].status != StepStatus::Pending {
                if let Err(violation) =
                    reset_step_for_goto(&mut workflow.steps[idx], max_loop_iterations)
                {
                    outcome.loop_violation = Some(violation);
                    return outcome;
                }
            }
            next_idx = Some(idx);
        }
    }
    if next_idx.is_none() {
        let next_num = workflow.current_step + 1;
        next_idx = workflow.steps.iter().position(|s| s.step_num == next_num);
    }

    while let Some(idx) = next_idx {
        // Routers are evaluated, never executed.
        if workflow.steps[idx].is_router() {
            workflow.steps[idx].status = StepStatus::Skipped;
            workflow.steps[idx].completed_at = Some(Utc::now());
            outcome.skipped.push(SkipRecord {
                step_num: workflow.steps[idx].step_num,
                step_name: workflow.steps[idx].name.clone(),
                condition: None,
                reason: "router evaluated".to_string(),
            });
            workflow.current_step = workflow.steps[idx].step_num;

            let Some(target_idx) = resolve_route_target(workflow, idx, &context, &evaluator)
            else {
                complete_workflow(workflow);
                return outcome;
            };
            if let Err(violation) =
                reset_step_for_goto(&mut workflow.steps[target_idx], max_loop_iterations)
            {
                outcome.loop_violation = Some(violation);
                return outcome;
            }
            next_idx = Some(target_idx);
            continue;
        }

        let condition = workflow.steps[idx].condition.clone();
        if evaluator.evaluate(condition.as_deref(), &context, true) {
            outcome.activated = activate_step(workflow, idx);
            return outcome;
        }

        // Guard evaluated false: skip and take the next sequential step.
        workflow.steps[idx].status = StepStatus::Skipped;
        workflow.steps[idx].completed_at = Some(Utc::now());
        outcome.skipped.push(SkipRecord {
            step_num: workflow.steps[idx].step_num,
            step_name: workflow.steps[idx].name.clone(),
            condition: condition.clone(),
            reason: format!(
                "Condition evaluated to false: {}",
                condition.as_deref().unwrap_or_default()
            ),
        });
        workflow.current_step = workflow.steps[idx].step_num;
        let next_num = workflow.current_step + 1;
        next_idx = workflow.steps.iter().position(|s| s.step_num == next_num);
    }

    complete_workflow(workflow);
    outcome
}

fn complete_workflow(workflow: &mut Workflow) {
    workflow.state = WorkflowState::Completed;
    workflow.completed_at = Some(Utc::now());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_types::workflow::{Agent, Route};
    use serde_json::json;

    fn agent(name: &str) -> Agent {
        Agent {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            provider_preference: None,
            timeout_secs: 600,
            max_retries: 2,
        }
    }

    fn step(num: u32, id: &str, agent_type: &str) -> WorkflowStep {
        WorkflowStep::new(num, id, agent(agent_type), "do work")
    }

    fn running_workflow(steps: Vec<WorkflowStep>) -> Workflow {
        let mut wf = Workflow::new("wf-1", "test", "1.0");
        wf.steps = steps;
        wf.state = WorkflowState::Running;
        wf.current_step = 1;
        wf.steps[0].status = StepStatus::Running;
        wf.steps[0].started_at = Some(Utc::now());
        wf
    }

    fn complete(workflow: &mut Workflow, idx: usize, outputs: Value) {
        workflow.steps[idx].status = StepStatus::Completed;
        workflow.steps[idx].completed_at = Some(Utc::now());
        if let Value::Object(map) = outputs {
            workflow.steps[idx].outputs = map.into_iter().collect();
        }
    }

    // -------------------------------------------------------------------
    // build_step_context
    // -------------------------------------------------------------------

    #[test]
    fn context_merges_outputs_and_exposes_result() {
        let mut wf = running_workflow(vec![
            step(1, "analyze", "analyst"),
            step(2, "develop", "developer"),
        ]);
        complete(&mut wf, 0, json!({"tier": "low", "shared": "a"}));
        // develop completes later and overrides the shared key
        std::thread::sleep(std::time::Duration::from_millis(2));
        complete(&mut wf, 1, json!({"pr": "1", "shared": "b"}));

        let ctx = build_step_context(&wf);
        assert_eq!(ctx["tier"], json!("low"));
        assert_eq!(ctx["shared"], json!("b"));
        assert_eq!(ctx["result"]["pr"], json!("1"));
        assert_eq!(ctx["steps"]["analyze"]["tier"], json!("low"));
    }

    #[test]
    fn context_ignores_non_completed_steps() {
        let mut wf = running_workflow(vec![
            step(1, "analyze", "analyst"),
            step(2, "develop", "developer"),
        ]);
        wf.steps[1].outputs.insert("pr".to_string(), json!("1"));
        complete(&mut wf, 0, json!({"tier": "low"}));

        let ctx = build_step_context(&wf);
        assert_eq!(ctx["tier"], json!("low"));
        assert!(ctx.get("pr").is_none());
    }

    // -------------------------------------------------------------------
    // reset_step_for_goto
    // -------------------------------------------------------------------

    #[test]
    fn goto_reset_clears_transient_state() {
        let mut s = step(1, "develop", "developer");
        s.status = StepStatus::Completed;
        s.started_at = Some(Utc::now());
        s.completed_at = Some(Utc::now());
        s.error = Some("err".to_string());
        s.outputs.insert("a".to_string(), json!(1));
        s.retry_count = 2;

        reset_step_for_goto(&mut s, 5).unwrap();

        assert_eq!(s.iteration, 1);
        assert_eq!(s.status, StepStatus::Pending);
        assert!(s.started_at.is_none());
        assert!(s.completed_at.is_none());
        assert!(s.error.is_none());
        assert!(s.outputs.is_empty());
        assert_eq!(s.retry_count, 0);
    }

    #[test]
    fn goto_reset_rejects_at_limit() {
        let mut s = step(1, "develop", "developer");
        s.iteration = 5;
        let violation = reset_step_for_goto(&mut s, 5).unwrap_err();
        assert_eq!(violation.step, "develop");
        assert_eq!(violation.iteration, 5);
        assert_eq!(violation.limit, 5);
        // the step was not mutated
        assert_eq!(s.iteration, 5);
    }

    // -------------------------------------------------------------------
    // resolve_route_target
    // -------------------------------------------------------------------

    fn router_workflow() -> Workflow {
        let mut router = step(1, "route_review", "router");
        router.routes = vec![
            Route {
                when: Some("approved".to_string()),
                then: Some("deploy".to_string()),
                ..Route::default()
            },
            Route {
                default: Some(json!(true)),
                goto: Some("develop".to_string()),
                ..Route::default()
            },
        ];
        running_workflow(vec![
            router,
            step(2, "deploy", "deployer"),
            step(3, "develop", "developer"),
        ])
    }

    #[test]
    fn route_matches_when_then_and_default() {
        let wf = router_workflow();
        let eval = ConditionEvaluator::new();

        let matched =
            resolve_route_target(&wf, 0, &json!({"approved": true}), &eval).unwrap();
        assert_eq!(wf.steps[matched].name, "deploy");

        let fallback =
            resolve_route_target(&wf, 0, &json!({"approved": false}), &eval).unwrap();
        assert_eq!(wf.steps[fallback].name, "develop");
    }

    #[test]
    fn route_default_as_string_value() {
        let mut wf = router_workflow();
        wf.steps[0].routes[1] = Route {
            default: Some(json!("develop")),
            ..Route::default()
        };
        let eval = ConditionEvaluator::new();
        let fallback = resolve_route_target(&wf, 0, &json!({}), &eval).unwrap();
        assert_eq!(wf.steps[fallback].name, "develop");
    }

    #[test]
    fn route_without_match_or_default_is_none() {
        let mut wf = router_workflow();
        wf.steps[0].routes.pop(); // drop the default
        let eval = ConditionEvaluator::new();
        assert!(resolve_route_target(&wf, 0, &json!({"approved": false}), &eval).is_none());
    }

    // -------------------------------------------------------------------
    // advance_after_success
    // -------------------------------------------------------------------

    #[test]
    fn advances_to_next_sequential_step() {
        let mut wf = running_workflow(vec![
            step(1, "triage", "triage"),
            step(2, "develop", "developer"),
        ]);
        complete(&mut wf, 0, json!({}));

        let outcome = advance_after_success(&mut wf, 0, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(outcome.activated, vec![2]);
        assert!(outcome.skipped.is_empty());
        assert_eq!(wf.current_step, 2);
        assert_eq!(wf.steps[1].status, StepStatus::Running);
        assert!(wf.steps[1].started_at.is_some());
        assert_eq!(wf.state, WorkflowState::Running);
    }

    #[test]
    fn completes_workflow_after_last_step() {
        let mut wf = running_workflow(vec![step(1, "only", "solo")]);
        complete(&mut wf, 0, json!({}));

        let outcome = advance_after_success(&mut wf, 0, DEFAULT_MAX_LOOP_ITERATIONS);

        assert!(outcome.activated.is_empty());
        assert_eq!(wf.state, WorkflowState::Completed);
        assert!(wf.completed_at.is_some());
    }

    #[test]
    fn skips_step_with_false_condition() {
        let mut design = step(2, "detailed_design", "designer");
        design.condition = Some("result.tier == 'high'".to_string());
        let mut wf = running_workflow(vec![
            step(1, "analyze", "analyst"),
            design,
            step(3, "implement", "developer"),
        ]);
        complete(&mut wf, 0, json!({"tier": "low"}));

        let outcome = advance_after_success(&mut wf, 0, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(wf.steps[1].status, StepStatus::Skipped);
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("result.tier == 'high'"));
        assert_eq!(outcome.activated, vec![3]);
        assert_eq!(wf.steps[2].status, StepStatus::Running);
        assert_eq!(wf.state, WorkflowState::Running);
    }

    #[test]
    fn router_routes_to_matched_target() {
        let develop = step(1, "develop", "developer");
        let review = step(2, "review", "reviewer");
        let mut router = step(3, "route_review", "router");
        router.routes = vec![
            Route {
                when: Some("approval_status == 'approved'".to_string()),
                then: Some("close_loop".to_string()),
                ..Route::default()
            },
            Route {
                default: Some(json!("develop")),
                ..Route::default()
            },
        ];
        let close_loop = step(4, "close_loop", "summarizer");

        let mut wf = running_workflow(vec![develop, review, router, close_loop]);
        complete(&mut wf, 0, json!({"pr": "1"}));
        wf.current_step = 2;
        complete(&mut wf, 1, json!({"approval_status": "approved"}));

        let outcome = advance_after_success(&mut wf, 1, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(wf.steps[2].status, StepStatus::Skipped);
        assert_eq!(outcome.skipped[0].reason, "router evaluated");
        assert_eq!(outcome.activated, vec![4]);
        assert_eq!(wf.steps[3].status, StepStatus::Running);
    }

    #[test]
    fn router_default_loops_back_and_increments_iteration() {
        let develop = step(1, "develop", "developer");
        let review = step(2, "review", "reviewer");
        let mut router = step(3, "route_review", "router");
        router.routes = vec![
            Route {
                when: Some("approval_status == 'approved'".to_string()),
                then: Some("close_loop".to_string()),
                ..Route::default()
            },
            Route {
                default: Some(json!("develop")),
                ..Route::default()
            },
        ];
        let close_loop = step(4, "close_loop", "summarizer");

        let mut wf = running_workflow(vec![develop, review, router, close_loop]);
        complete(&mut wf, 0, json!({"pr": "1"}));
        wf.current_step = 2;
        complete(&mut wf, 1, json!({"approval_status": "changes_requested"}));

        let outcome = advance_after_success(&mut wf, 1, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(outcome.activated, vec![1]);
        assert_eq!(wf.steps[0].status, StepStatus::Running);
        assert_eq!(wf.steps[0].iteration, 1);
        assert!(wf.steps[0].outputs.is_empty(), "goto reset clears outputs");
        assert_eq!(wf.current_step, 1);
    }

    #[test]
    fn router_without_target_completes_workflow() {
        let mut router = step(2, "route", "router");
        router.routes = vec![Route {
            when: Some("done".to_string()),
            then: Some("missing-step".to_string()),
            ..Route::default()
        }];
        let mut wf = running_workflow(vec![step(1, "work", "worker"), router]);
        complete(&mut wf, 0, json!({"done": false}));

        let outcome = advance_after_success(&mut wf, 0, DEFAULT_MAX_LOOP_ITERATIONS);

        assert!(outcome.activated.is_empty());
        assert_eq!(wf.state, WorkflowState::Completed);
    }

    #[test]
    fn on_success_goto_resets_completed_target() {
        let mut review = step(2, "review", "reviewer");
        review.on_success = Some("develop".to_string());
        let mut wf = running_workflow(vec![step(1, "develop", "developer"), review]);
        complete(&mut wf, 0, json!({"pr": "1"}));
        wf.current_step = 2;
        complete(&mut wf, 1, json!({}));

        let outcome = advance_after_success(&mut wf, 1, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(outcome.activated, vec![1]);
        assert_eq!(wf.steps[0].iteration, 1);
        assert_eq!(wf.steps[0].status, StepStatus::Running);
    }

    #[test]
    fn goto_loop_limit_reports_violation_without_advancing() {
        let mut review = step(2, "review", "reviewer");
        review.on_success = Some("develop".to_string());
        let mut wf = running_workflow(vec![step(1, "develop", "developer"), review]);
        complete(&mut wf, 0, json!({}));
        wf.steps[0].iteration = 3;
        wf.current_step = 2;
        complete(&mut wf, 1, json!({}));

        let outcome = advance_after_success(&mut wf, 1, 3);

        let violation = outcome.loop_violation.unwrap();
        assert_eq!(violation.step, "develop");
        assert_eq!(violation.iteration, 3);
        assert!(outcome.activated.is_empty());
        assert_eq!(wf.state, WorkflowState::Running, "state untouched");
    }

    #[test]
    fn activation_co_activates_parallel_siblings() {
        let mut lint = step(2, "lint", "linter");
        lint.parallel_with = vec!["test".to_string()];
        let mut wf = running_workflow(vec![
            step(1, "build", "builder"),
            lint,
            step(3, "test", "tester"),
        ]);
        complete(&mut wf, 0, json!({}));

        let outcome = advance_after_success(&mut wf, 0, DEFAULT_MAX_LOOP_ITERATIONS);

        assert_eq!(outcome.activated, vec![2, 3]);
        assert_eq!(wf.steps[1].status, StepStatus::Running);
        assert_eq!(wf.steps[2].status, StepStatus::Running);
        assert_eq!(wf.current_step, 2, "primary step owns current_step");
    }

    #[test]
    fn parallel_group_barrier_detection() {
        let mut lint = step(1, "lint", "linter");
        lint.parallel_with = vec!["test".to_string()];
        let mut wf = running_workflow(vec![lint, step(2, "test", "tester")]);
        wf.steps[1].status = StepStatus::Running;

        assert!(parallel_group_busy(&wf, 0));
        // membership is symmetric
        assert!(parallel_group_busy(&wf, 1));

        wf.steps[1].status = StepStatus::Completed;
        assert!(!parallel_group_busy(&wf, 0));
    }

    #[test]
    fn parallel_group_frontier_is_highest_member() {
        let mut lint = step(2, "lint", "linter");
        lint.parallel_with = vec!["test".to_string()];
        let wf = running_workflow(vec![
            step(1, "build", "builder"),
            lint,
            step(3, "test", "tester"),
            step(4, "ship", "shipper"),
        ]);

        // frontier is symmetric across the group
        assert_eq!(parallel_group_frontier(&wf, 1), Some(3));
        assert_eq!(parallel_group_frontier(&wf, 2), Some(3));
        // steps without siblings have no frontier
        assert_eq!(parallel_group_frontier(&wf, 0), None);
        assert_eq!(parallel_group_frontier(&wf, 3), None);
    }
}
