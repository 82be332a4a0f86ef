//! Named sets of tool definitions, consulted by the TurnEngine at
//! call-assembly time (spec §4.5).
//!
//! Grounded on the teacher's `runtime::tools::build_tool_definitions`
//! (builds a flat `Vec<ToolDefinition>`, filtered by a role's tool
//! policy) — generalized here into named, independently-updatable groups
//! plus a reserved builtin set, since the spec's data model gives roles a
//! list of group ids rather than an allow/deny filter.

use std::collections::HashMap;

use parking_lot::RwLock;

use loom_domain::error::{Error, Result};
use loom_domain::message::ToolDefinition;

/// Id of the builtin group that carries the core `send_message` tool
/// (spec §6: "Tool identifiers reserved by the core"). Always included in
/// a role's effective set, named or not, since without it an agent can't
/// talk to anyone.
pub const CORE_GROUP_ID: &str = "core";
pub const SEND_MESSAGE_TOOL: &str = "send_message";

const RESERVED_GROUP_IDS: &[&str] = &[CORE_GROUP_ID];

#[derive(Debug, Clone)]
struct GroupEntry {
    description: String,
    tools: Vec<ToolDefinition>,
    reserved: bool,
    /// Included in a role's effective set when its `toolGroups` is absent.
    /// Non-default-eligible groups (e.g. a dangerous or opt-in-only
    /// group) are only granted when a role names them explicitly.
    default_eligible: bool,
}

/// Mapping from `groupId` to its description and tool set, plus a
/// reverse index from tool name to the group that currently provides it.
pub struct ToolGroupRegistry {
    state: RwLock<Registry>,
}

struct Registry {
    groups: HashMap<String, GroupEntry>,
    insertion_order: Vec<String>,
    tool_to_group: HashMap<String, String>,
}

impl Default for ToolGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolGroupRegistry {
    pub fn new() -> Self {
        let mut registry = Registry {
            groups: HashMap::new(),
            insertion_order: Vec::new(),
            tool_to_group: HashMap::new(),
        };
        registry.insert_unchecked(
            CORE_GROUP_ID,
            GroupEntry {
                description: "Core messaging primitive every agent carries".into(),
                tools: vec![send_message_definition()],
                reserved: true,
                default_eligible: true,
            },
        );
        Self {
            state: RwLock::new(registry),
        }
    }

    /// Register (or overwrite, if non-reserved and already present) a
    /// group. Overwriting clears the prior reverse-index entries for
    /// this group's earlier tool set.
    pub fn register_group(
        &self,
        group_id: &str,
        description: impl Into<String>,
        tools: Vec<ToolDefinition>,
        default_eligible: bool,
    ) -> Result<()> {
        if RESERVED_GROUP_IDS.contains(&group_id) {
            return Err(Error::ReservedToolGroup(group_id.to_string()));
        }
        let mut state = self.state.write();
        if let Some(old) = state.groups.get(group_id) {
            let old_tools: Vec<String> = old.tools.iter().map(|t| t.name().to_string()).collect();
            for name in old_tools {
                if state.tool_to_group.get(&name) == Some(&group_id.to_string()) {
                    state.tool_to_group.remove(&name);
                }
            }
        }
        state.insert_unchecked(
            group_id,
            GroupEntry {
                description: description.into(),
                tools,
                reserved: false,
                default_eligible,
            },
        );
        Ok(())
    }

    pub fn unregister_group(&self, group_id: &str) -> Result<()> {
        if RESERVED_GROUP_IDS.contains(&group_id) {
            return Err(Error::ReservedToolGroup(group_id.to_string()));
        }
        let mut state = self.state.write();
        if let Some(entry) = state.groups.remove(group_id) {
            state.insertion_order.retain(|g| g != group_id);
            for tool in &entry.tools {
                if state.tool_to_group.get(tool.name()) == Some(&group_id.to_string()) {
                    state.tool_to_group.remove(tool.name());
                }
            }
        }
        Ok(())
    }

    /// In-place replace of a group's tool set. Unlike `register_group`,
    /// this is allowed on reserved groups (spec §4.5 only protects
    /// register/unregister, not in-place tool updates).
    pub fn update_group_tools(&self, group_id: &str, tools: Vec<ToolDefinition>) -> Result<()> {
        let mut state = self.state.write();
        let Some(entry) = state.groups.get_mut(group_id) else {
            return Err(Error::Other(format!("unknown tool group: {group_id}")));
        };
        let old_tools: Vec<String> = entry.tools.iter().map(|t| t.name().to_string()).collect();
        entry.tools = tools.clone();
        for name in old_tools {
            if state.tool_to_group.get(&name) == Some(&group_id.to_string()) {
                state.tool_to_group.remove(&name);
            }
        }
        for tool in &tools {
            state
                .tool_to_group
                .entry(tool.name().to_string())
                .or_insert_with(|| group_id.to_string());
        }
        Ok(())
    }

    /// Deduplicated tool definitions across `group_ids`, in insertion
    /// order of the first group that provides each tool.
    pub fn get_tool_definitions(&self, group_ids: &[String]) -> Vec<ToolDefinition> {
        let state = self.state.read();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for group_id in group_ids {
            let Some(entry) = state.groups.get(group_id) else {
                continue;
            };
            for tool in &entry.tools {
                if seen.insert(tool.name().to_string()) {
                    out.push(tool.clone());
                }
            }
        }
        out
    }

    pub fn is_tool_in_groups(&self, tool_name: &str, group_ids: &[String]) -> bool {
        let state = self.state.read();
        group_ids.iter().any(|g| {
            state
                .groups
                .get(g)
                .is_some_and(|entry| entry.tools.iter().any(|t| t.name() == tool_name))
        })
    }

    pub fn list_groups(&self) -> Vec<String> {
        self.state.read().insertion_order.clone()
    }

    /// Resolve a role's effective group selection: the role's own
    /// `toolGroups` if present (plus the core group, always present),
    /// otherwise every default-eligible group known to the registry.
    pub fn effective_groups_for_role(&self, role_tool_groups: Option<&[String]>) -> Vec<String> {
        let state = self.state.read();
        let mut groups: Vec<String> = match role_tool_groups {
            Some(named) => named.to_vec(),
            None => state
                .insertion_order
                .iter()
                .filter(|id| state.groups[*id].default_eligible)
                .cloned()
                .collect(),
        };
        if !groups.iter().any(|g| g == CORE_GROUP_ID) {
            groups.insert(0, CORE_GROUP_ID.to_string());
        }
        groups
    }
}

impl Registry {
    fn insert_unchecked(&mut self, group_id: &str, entry: GroupEntry) {
        if !self.groups.contains_key(group_id) {
            self.insertion_order.push(group_id.to_string());
        }
        for tool in &entry.tools {
            self.tool_to_group
                .insert(tool.name().to_string(), group_id.to_string());
        }
        self.groups.insert(group_id.to_string(), entry);
    }
}

fn send_message_definition() -> ToolDefinition {
    ToolDefinition::new(
        SEND_MESSAGE_TOOL,
        "Send a message to another agent by id.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "to": { "type": "string", "description": "Recipient agent id" },
                "text": { "type": "string", "description": "Message text" },
                "taskId": { "type": "string", "description": "Optional task id to correlate replies" }
            },
            "required": ["to", "text"]
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom_tool(name: &str) -> ToolDefinition {
        ToolDefinition::new(name, format!("does {name}"), serde_json::json!({}))
    }

    #[test]
    fn core_group_is_present_and_reserved() {
        let registry = ToolGroupRegistry::new();
        assert!(registry.list_groups().contains(&CORE_GROUP_ID.to_string()));
        let err = registry.unregister_group(CORE_GROUP_ID).unwrap_err();
        assert!(matches!(err, Error::ReservedToolGroup(_)));
        let err = registry
            .register_group(CORE_GROUP_ID, "x", vec![], true)
            .unwrap_err();
        assert!(matches!(err, Error::ReservedToolGroup(_)));
    }

    #[test]
    fn register_and_fetch_definitions_dedup_by_first_group() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("writer", "writing tools", vec![custom_tool("write_file")], true)
            .unwrap();
        registry
            .register_group("shared", "shared tools", vec![custom_tool("write_file")], true)
            .unwrap();

        let defs = registry.get_tool_definitions(&["writer".into(), "shared".into()]);
        let names: Vec<_> = defs.iter().map(|d| d.name()).collect();
        assert_eq!(names.iter().filter(|&&n| n == "write_file").count(), 1);
    }

    #[test]
    fn effective_groups_default_to_default_eligible_groups_plus_core() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("writer", "p", vec![custom_tool("write_file")], true)
            .unwrap();
        registry
            .register_group("danger", "p", vec![custom_tool("rm_rf")], false)
            .unwrap();

        let effective = registry.effective_groups_for_role(None);
        assert!(effective.contains(&CORE_GROUP_ID.to_string()));
        assert!(effective.contains(&"writer".to_string()));
        assert!(!effective.contains(&"danger".to_string()));
    }

    #[test]
    fn effective_groups_named_explicitly_always_include_core() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("danger", "p", vec![custom_tool("rm_rf")], false)
            .unwrap();
        let effective = registry.effective_groups_for_role(Some(&["danger".to_string()]));
        assert!(effective.contains(&CORE_GROUP_ID.to_string()));
        assert!(effective.contains(&"danger".to_string()));
    }

    #[test]
    fn update_group_tools_replaces_in_place_and_fixes_reverse_index() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("writer", "p", vec![custom_tool("old_tool")], true)
            .unwrap();
        registry
            .update_group_tools("writer", vec![custom_tool("new_tool")])
            .unwrap();

        assert!(!registry.is_tool_in_groups("old_tool", &["writer".into()]));
        assert!(registry.is_tool_in_groups("new_tool", &["writer".into()]));
    }

    #[test]
    fn register_group_overwrite_clears_prior_reverse_index_entries() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("writer", "p", vec![custom_tool("old_tool")], true)
            .unwrap();
        registry
            .register_group("writer", "p2", vec![custom_tool("new_tool")], true)
            .unwrap();

        assert!(!registry.is_tool_in_groups("old_tool", &["writer".into()]));
        assert!(registry.is_tool_in_groups("new_tool", &["writer".into()]));
    }

    #[test]
    fn unregister_removes_group_and_its_reverse_index_entries() {
        let registry = ToolGroupRegistry::new();
        registry
            .register_group("writer", "p", vec![custom_tool("write_file")], true)
            .unwrap();
        registry.unregister_group("writer").unwrap();
        assert!(!registry.list_groups().contains(&"writer".to_string()));
        assert!(registry.get_tool_definitions(&["writer".into()]).is_empty());
    }
}
