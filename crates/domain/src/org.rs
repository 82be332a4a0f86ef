//! Organizational primitives: roles, agents, terminations.
//!
//! These are plain persisted records (see `loom-orgstore`) — this crate
//! only defines their shape, following the teacher's split between a
//! `domain` crate of shared records and a separate store crate that owns
//! mutation and persistence (`sa_sessions::store::SessionEntry` vs.
//! `sa_gateway::runtime::runs::Run` is the analogous split in the teacher).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The well-known entry point for user requirements. Never persisted.
pub const ROOT_AGENT_ID: &str = "root";
/// The well-known endpoint that does not run LLM turns. Never persisted.
pub const USER_AGENT_ID: &str = "user";

pub fn is_well_known_agent(agent_id: &str) -> bool {
    agent_id == ROOT_AGENT_ID || agent_id == USER_AGENT_ID
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    Active,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub role_id: String,
    pub name: String,
    pub role_prompt: String,
    #[serde(default)]
    pub org_prompt: Option<String>,
    #[serde(default)]
    pub llm_service_id: Option<String>,
    /// Ordered list of tool-group ids. Absent/empty ⇒ inherit the default
    /// set (every non-reserved-by-role group the registry knows about).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_groups: Option<Vec<String>>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: RoleStatus,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deleted_by: Option<String>,
    #[serde(default)]
    pub deletion_reason: Option<String>,
}

impl Role {
    /// Normalize an incoming `tool_groups` argument: `Some(empty)` becomes
    /// `None` so "absent" and "explicitly empty" are never distinguished
    /// downstream (spec §4.1).
    pub fn normalize_tool_groups(tool_groups: Option<Vec<String>>) -> Option<Vec<String>> {
        match tool_groups {
            Some(v) if v.is_empty() => None,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Terminated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub agent_id: String,
    pub role_id: String,
    pub parent_agent_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: AgentStatus,
    #[serde(default)]
    pub terminated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Termination {
    pub agent_id: String,
    pub terminated_by: String,
    pub terminated_at: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of `OrgStore::delete_role`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleDeletionResult {
    pub affected_agents: Vec<String>,
    pub affected_roles: Vec<String>,
}

/// A peer an agent has been introduced to, used by the contact registry
/// persisted alongside roles/agents/terminations (spec §4.1 persistence
/// contract names `contactRegistries` in `org.json` but leaves its shape
/// to the implementation beyond "per agent, entries").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactEntry {
    pub agent_id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub introduced_at: DateTime<Utc>,
}

/// Validate a `parentAgentId` per spec §4.1: empty, `"null"`, and
/// `"undefined"` are all rejected regardless of whether they'd otherwise
/// resolve to a real agent.
pub fn validate_parent_agent_id(parent_agent_id: &str) -> bool {
    !(parent_agent_id.is_empty()
        || parent_agent_id == "null"
        || parent_agent_id == "undefined")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_blank_and_sentinel_parent_ids() {
        assert!(!validate_parent_agent_id(""));
        assert!(!validate_parent_agent_id("null"));
        assert!(!validate_parent_agent_id("undefined"));
        assert!(validate_parent_agent_id("root"));
        assert!(validate_parent_agent_id("agent-123"));
    }

    #[test]
    fn normalize_tool_groups_collapses_empty_to_none() {
        assert_eq!(Role::normalize_tool_groups(Some(vec![])), None);
        assert_eq!(Role::normalize_tool_groups(None), None);
        assert_eq!(
            Role::normalize_tool_groups(Some(vec!["g1".into()])),
            Some(vec!["g1".into()])
        );
    }

    #[test]
    fn well_known_agents_are_recognized() {
        assert!(is_well_known_agent(ROOT_AGENT_ID));
        assert!(is_well_known_agent(USER_AGENT_ID));
        assert!(!is_well_known_agent("agent-1"));
    }
}
