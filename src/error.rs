//! Error taxonomy for the orchestrator.
//!
//! Errors propagate through `anyhow` and are downcast to [`LuigiError`] at the
//! boundaries that care: the scheduler (per-candidate handling) and `main`
//! (exit codes). Everything else just adds context and bubbles up.

use thiserror::Error;

/// Machine-readable error kinds surfaced in the run snapshot and exit codes.
#[derive(Error, Debug)]
pub enum LuigiError {
    /// Invalid or unreadable configuration. Surfaced before any run starts.
    #[error("config error: {0}")]
    Config(String),

    /// The run's log directory cannot be written. Fatal for the run.
    #[error("storage error: {0}")]
    Storage(String),

    /// Workspace provisioning or persistence failed. Fatal for one candidate;
    /// the iteration may still complete with the others.
    #[error("workspace error: {0}")]
    Workspace(String),

    /// An agent process could not be spawned, timed out, or exited non-zero
    /// without leaving a structured message behind.
    #[error("agent invocation failed: {0}")]
    AgentInvocation(String),

    /// An agent produced a structured message that does not validate
    /// (unknown status, missing required fields).
    #[error("agent protocol violation: {0}")]
    AgentProtocol(String),

    /// A plan-provided test command could not be run at all. Failing tests
    /// are data, not errors; this is for the runner itself breaking.
    #[error("test runner error: {0}")]
    TestRunner(String),

    /// Merging an approved branch into the target hit conflicts.
    #[error("merge conflict in {} file(s)", files.len())]
    MergeConflict { files: Vec<String> },

    /// The user or an observing UI cancelled the run.
    #[error("aborted by user")]
    Aborted,

    /// A bounded wait (prompt response, admin decision) ran out of time.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl LuigiError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::Workspace(msg.into())
    }

    pub fn invocation(msg: impl Into<String>) -> Self {
        Self::AgentInvocation(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::AgentProtocol(msg.into())
    }

    /// Whether an agent call that failed this way is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AgentInvocation(_) | Self::AgentProtocol(_))
    }

    /// Short machine-readable kind stored in the snapshot's terminal error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
            Self::Workspace(_) => "workspace",
            Self::AgentInvocation(_) => "agent-invocation",
            Self::AgentProtocol(_) => "agent-protocol",
            Self::TestRunner(_) => "test-runner",
            Self::MergeConflict { .. } => "merge-conflict",
            Self::Aborted => "aborted",
            Self::DeadlineExceeded(_) => "deadline-exceeded",
        }
    }
}
