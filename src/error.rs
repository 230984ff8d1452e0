use thiserror::Error;

pub type SitsimResult<T> = Result<T, SitsimError>;

#[derive(Debug, Error)]
pub enum SitsimError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Cost(#[from] CostError),

    #[error(transparent)]
    Io(#[from] IoError),
}

/// Errors found while loading or validating a [`crate::situation::Situation`].
///
/// These are all fail-fast: a malformed situation is rejected before any
/// simulation step runs, never clamped or patched up silently.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate agent name: '{0}'")]
    DuplicateAgentName(String),

    #[error("duplicate item name: '{0}'")]
    DuplicateItemName(String),

    #[error("action '{action}' available_to references unknown agent '{agent}'")]
    DanglingAvailability { action: String, agent: String },

    #[error("dm_blacklist references unknown agent '{0}'")]
    DanglingBlacklistEntry(String),

    #[error("channel '{0}' references unknown member agent")]
    DanglingChannelMember(String),

    #[error("max_steps must be greater than zero")]
    InvalidMaxSteps,

    #[error("situation has no agents")]
    NoAgents,

    #[error("failed to parse situation JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors surfaced by the external LLM boundary.
///
/// Most of these are recovered locally (an agent whose LLM call fails falls
/// back to `no_action`); the policy agent and forecast resolver propagate
/// them instead, since there is no sane default action for "produce 16
/// forecasts" or "judge this qualitative question".
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("LLM provider returned an error: {0}")]
    Provider(String),

    #[error("failed to extract structured output: {0}")]
    Extraction(String),

    #[error("LLM response was empty")]
    EmptyResponse,
}

/// Errors from the monetary cost budget.
#[derive(Debug, Error)]
pub enum CostError {
    #[error("cost limit of ${limit:.4} would be exceeded (already spent ${spent:.4})")]
    LimitExceeded { limit: f64, spent: f64 },

    #[error("no active cost scope on this task")]
    NoActiveScope,
}

/// Errors from the JSONL/JSON run-record writer and reader.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("malformed run record at line {line}: {msg}")]
    MalformedRecord { line: usize, msg: String },
}
