use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::EngineState;

/// Failures that end or prevent a scenario run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("scenario is invalid:\n{}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("screen capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("screen capture lost: {0}")]
    CaptureLost(String),

    #[error("cannot go from {from} to {to}")]
    InvalidState { from: &'static str, to: &'static str },

    #[error(transparent)]
    Bitmap(#[from] BitmapError),
}

impl EngineError {
    pub(crate) fn transition(from: &EngineState, to: &EngineState) -> Self {
        EngineError::InvalidState { from: from.label(), to: to.label() }
    }
}

#[derive(Debug, Error)]
pub enum BitmapError {
    #[error("bitmap not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("cannot decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("invalid bitmap size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },
}

/// One problem found while checking a scenario graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Where the problem is, e.g. `event 3 / action 12`.
    pub location: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self { location: location.into(), message: message.into() }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues.iter().map(|i| format!("  - {i}")).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_issue() {
        let err = EngineError::Validation(vec![
            ValidationIssue::new("event 1", "has no actions"),
            ValidationIssue::new("event 2 / condition 5", "threshold above 100"),
        ]);
        let text = err.to_string();
        assert!(text.contains("event 1: has no actions"));
        assert!(text.contains("event 2 / condition 5: threshold above 100"));
    }

    #[test]
    fn transition_uses_state_labels() {
        let err = EngineError::transition(&EngineState::Idle, &EngineState::Paused);
        assert_eq!(err.to_string(), "cannot go from idle to paused");
    }
}
