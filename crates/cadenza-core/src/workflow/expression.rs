//! Sandboxed expression evaluation for step guards and router routes.
//!
//! Wraps `jexl_eval::Evaluator`: expressions can only reference the
//! supplied context object plus the `true`/`false`/`null` literals --
//! no builtins, no filesystem, no host state. Evaluation failures fall
//! back to a caller-chosen default (typically true for step guards,
//! false for router branches).
//!
//! Context payloads are always passed as context objects, NEVER
//! interpolated into expression strings.

use serde_json::Value;

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Expression evaluator for workflow conditions and route guards.
pub struct ConditionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self {
            evaluator: jexl_eval::Evaluator::new(),
        }
    }

    /// Evaluate an optional guard expression against a context mapping.
    ///
    /// - An absent or empty condition is vacuously true.
    /// - The result is coerced to boolean by truthiness.
    /// - On any evaluation failure the caller-chosen default is returned
    ///   and the failure is logged.
    pub fn evaluate(
        &self,
        condition: Option<&str>,
        context: &Value,
        default_on_error: bool,
    ) -> bool {
        let Some(condition) = condition.filter(|c| !c.trim().is_empty()) else {
            return true;
        };

        match self.evaluate_value(condition, context) {
            Ok(value) => value_to_bool(&value),
            Err(err) => {
                tracing::warn!(
                    condition,
                    error = %err,
                    default = default_on_error,
                    "condition evaluation error, using default"
                );
                default_on_error
            }
        }
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(
        &self,
        expression: &str,
        context: &Value,
    ) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
