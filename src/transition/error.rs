use serde::Serialize;
use std::fmt;

/// The five store-mutating steps of an execution, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStep {
    CreateSections,
    Graduate,
    Promote,
    ResetAssignments,
    CommitYear,
}

impl ExecutionStep {
    pub const ALL: [ExecutionStep; 5] = [
        Self::CreateSections,
        Self::Graduate,
        Self::Promote,
        Self::ResetAssignments,
        Self::CommitYear,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::CreateSections => 1,
            Self::Graduate => 2,
            Self::Promote => 3,
            Self::ResetAssignments => 4,
            Self::CommitYear => 5,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::CreateSections => "create sections",
            Self::Graduate => "graduate students",
            Self::Promote => "promote students",
            Self::ResetAssignments => "reset teacher assignments",
            Self::CommitYear => "commit academic year",
        }
    }
}

impl fmt::Display for ExecutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} ({})", self.number(), self.describe())
    }
}

/// A single store call failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PersistenceError {
    pub message: String,
}

impl PersistenceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transition was not confirmed")]
    Declined,

    #[error("{step} failed: {cause}")]
    Persistence {
        step: ExecutionStep,
        cause: PersistenceError,
    },

    /// Earlier steps stayed applied; nothing was undone. `moved_sections` names
    /// the sections whose students the failed step had already moved.
    #[error(
        "{failed_step} failed after {} applied step(s) and {} moved section(s): {cause}",
        .applied.len(),
        .moved_sections.len()
    )]
    PartialExecution {
        failed_step: ExecutionStep,
        applied: Vec<ExecutionStep>,
        moved_sections: Vec<String>,
        cause: PersistenceError,
    },
}

impl TransitionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn failed_step(&self) -> Option<ExecutionStep> {
        match self {
            Self::Persistence { step, .. } => Some(*step),
            Self::PartialExecution { failed_step, .. } => Some(*failed_step),
            Self::Validation(_) | Self::Declined => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::Declined => "confirmation_declined",
            Self::Persistence { .. } | Self::PartialExecution { .. } => "transition_failed",
        }
    }
}
