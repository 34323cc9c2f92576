//! Typed error hierarchy for the devplane control plane.
//!
//! `OrchestratorError` covers every failure the process and job orchestration
//! core can surface. Admission and precondition errors are returned
//! synchronously and never touch project state; runtime process failures are
//! delivered through job outcomes and status events.

use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::models::ProcessKind;

/// Errors from the orchestration core (lifecycle manager, admission queue,
/// port allocator and event hub).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Project {id} is already running")]
    AlreadyRunning { id: String },

    #[error("Project {id} is already building")]
    AlreadyBuilding { id: String },

    #[error("Project {id} already has a queued or running job")]
    DuplicateBuild { id: String },

    #[error("Failed to spawn {kind} process for project {id}: {source}")]
    SpawnError {
        id: String,
        kind: ProcessKind,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} process for project {id} exited with code {}", display_code(.code))]
    NonZeroExit {
        id: String,
        kind: ProcessKind,
        code: Option<i32>,
    },

    #[error("{kind} job for project {id} timed out after {}s", .after.as_secs())]
    Timeout {
        id: String,
        kind: ProcessKind,
        after: Duration,
    },

    #[error("Job for project {id} was cancelled")]
    Cancelled { id: String },

    #[error("No free port in {start}..{}", range_end(.start, .window))]
    PortExhausted { start: u16, window: u16 },

    #[error("Connection limit of {max} observers reached")]
    ConnectionLimitExceeded { max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Project {id} already exists")]
    ProjectExists { id: String },

    #[error("Project store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

fn range_end(start: &u16, window: &u16) -> u32 {
    u32::from(*start) + u32::from(*window)
}

impl OrchestratorError {
    /// Stable machine-readable code, used in HTTP bodies and `error` envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::AlreadyBuilding { .. } => "already_building",
            Self::DuplicateBuild { .. } => "duplicate_build",
            Self::SpawnError { .. } => "spawn_error",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::PortExhausted { .. } => "port_exhausted",
            Self::ConnectionLimitExceeded { .. } => "connection_limit_exceeded",
            Self::MalformedMessage(_) => "malformed_message",
            Self::ProjectNotFound { .. } => "project_not_found",
            Self::ProjectExists { .. } => "project_exists",
            Self::Store(_) => "store_error",
            Self::Other(_) => "internal",
        }
    }

    /// True for failures of a supervised process (as opposed to admission or
    /// precondition failures). These move the project into `error`.
    pub fn is_runtime_failure(&self) -> bool {
        matches!(
            self,
            Self::SpawnError { .. } | Self::NonZeroExit { .. } | Self::Timeout { .. }
        )
    }
}
