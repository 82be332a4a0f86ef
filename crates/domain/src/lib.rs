//! Shared records, errors, and configuration for the agent-society runtime.
//!
//! This crate holds no behavior beyond small constructors and pure
//! computations (`ContextStatus::compute`, `PromptTokenEstimator`,
//! `RuntimeConfig::validate`) — the stores and engine crates own mutation.

pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod org;
pub mod persist;
pub mod usage;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::RuntimeConfig;
pub use error::{Error, LlmErrorCategory, Result};
pub use message::{Message, Role, ToolCall, ToolDefinition, ToolFunctionDef};
pub use org::{Agent, AgentStatus, ContactEntry, Role as OrgRole, RoleDeletionResult, RoleStatus, Termination};
pub use usage::{ContextHealth, ContextStatus, PromptTokenEstimator, TokenUsage};
