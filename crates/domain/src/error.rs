use serde::Serialize;

/// Category of an LLM call failure, per the provider's error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorCategory {
    Auth,
    RateLimit,
    ContextLength,
    Network,
    Server,
    Unknown,
}

impl std::fmt::Display for LlmErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::ContextLength => "context_length",
            Self::Network => "network",
            Self::Server => "server",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Shared error type for every `loom-*` crate.
///
/// Variants map directly onto the error taxonomy in the spec: validation
/// failures are user-facing, the rest describe a specific substrate
/// condition a caller may want to match on rather than just display.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid parentAgentId")]
    InvalidParentAgentId,

    #[error("invalid agentId")]
    InvalidAgentId,

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("agent already terminated: {0}")]
    AgentAlreadyTerminated(String),

    #[error("role already deleted: {0}")]
    RoleAlreadyDeleted(String),

    #[error("cannot delete system agent: {0}")]
    CannotDeleteSystemAgent(String),

    #[error("cannot modify system role: {0}")]
    CannotModifySystemRole(String),

    #[error("reserved tool group: {0}")]
    ReservedToolGroup(String),

    #[error("llm call failed ({category}): {message}")]
    LlmCallFailed {
        category: LlmErrorCategory,
        message: String,
    },

    #[error("llm result discarded: {0}")]
    LlmResultDiscarded(String),

    #[error("max tool rounds exceeded ({0})")]
    MaxToolRoundsExceeded(u32),

    #[error("tool '{tool_name}' execution failed: {message}")]
    ToolExecutionFailed { tool_name: String, message: String },

    #[error("missing llm client for agent {0}")]
    MissingLlmClient(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
