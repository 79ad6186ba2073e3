// Step results and the `steps`/`job` expression contexts built from them.

use std::collections::HashMap;

use localrun_common::StepStatus;
use serde::Serialize;

/// Recorded result for a single step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepResult {
    /// Outcome before `continue-on-error` adjustment.
    pub outcome: StepStatus,

    /// Conclusion after `continue-on-error` adjustment.
    pub conclusion: StepStatus,

    pub outputs: HashMap<String, String>,
}

impl StepResult {
    /// The optimistic result every step starts with.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Set outcome and conclusion to the same status.
    pub fn settle(&mut self, status: StepStatus) {
        self.outcome = status;
        self.conclusion = status;
    }
}

/// Names one output of one step: `steps.<step_id>.outputs.<output_name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappableOutput {
    pub step_id: String,
    pub output_name: String,
}

impl MappableOutput {
    pub fn new(step_id: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            output_name: output_name.into(),
        }
    }
}

/// The `job` expression context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobContext {
    pub status: StepStatus,
}

impl JobContext {
    /// `failure` as soon as any recorded conclusion is a failure.
    pub fn from_results(results: &HashMap<String, StepResult>) -> Self {
        let failed = results.values().any(|r| r.conclusion.is_failure());
        Self {
            status: if failed {
                StepStatus::Failure
            } else {
                StepStatus::Success
            },
        }
    }
}

/// Convert step results to a JSON value for expression evaluation.
pub fn steps_to_value(results: &HashMap<String, StepResult>) -> serde_json::Value {
    serde_json::to_value(results).unwrap_or(serde_json::Value::Null)
}
