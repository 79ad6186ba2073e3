// Per-step result status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome or conclusion of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Success,
    Failure,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Success => write!(f, "success"),
            StepStatus::Failure => write!(f, "failure"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

impl StepStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, StepStatus::Failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Skipped).unwrap(),
            "\"skipped\""
        );
        let parsed: StepStatus = serde_json::from_str("\"failure\"").unwrap();
        assert!(parsed.is_failure());
        assert_eq!(StepStatus::Success.to_string(), "success");
    }
}
