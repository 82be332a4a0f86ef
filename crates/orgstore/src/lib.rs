//! Authoritative store of roles, agents, and terminations (spec §4.1).
//!
//! Shaped like the teacher's `sa_sessions::store::SessionStore`: one
//! `parking_lot::RwLock`-guarded in-memory document, loaded eagerly at
//! construction and rewritten atomically (tmp + rename, via
//! `loom_domain::persist`) after every mutation. Unlike the session store,
//! the document here has four top-level collections (`roles`, `agents`,
//! `terminations`, `contact_registries`) rather than one, so persistence
//! goes through a single `OrgDocument` struct mirroring the file's shape.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use loom_domain::error::{Error, Result};
use loom_domain::org::{
    is_well_known_agent, validate_parent_agent_id, Agent, AgentStatus, ContactEntry,
    Role, RoleDeletionResult, RoleStatus, Termination,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgDocument {
    #[serde(default)]
    roles: Vec<Role>,
    #[serde(default)]
    agents: Vec<Agent>,
    #[serde(default)]
    terminations: Vec<Termination>,
    #[serde(default)]
    contact_registries: HashMap<String, Vec<ContactEntry>>,
}

struct OrgState {
    roles: HashMap<String, Role>,
    agents: HashMap<String, Agent>,
    terminations: Vec<Termination>,
    contact_registries: HashMap<String, Vec<ContactEntry>>,
}

impl OrgState {
    fn to_document(&self) -> OrgDocument {
        let mut roles: Vec<Role> = self.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut agents: Vec<Agent> = self
            .agents
            .values()
            .filter(|a| !is_well_known_agent(&a.agent_id))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        OrgDocument {
            roles,
            agents,
            terminations: self.terminations.clone(),
            contact_registries: self.contact_registries.clone(),
        }
    }

    fn from_document(doc: OrgDocument) -> Self {
        let mut roles = HashMap::new();
        for role in doc.roles {
            roles.insert(role.role_id.clone(), role);
        }
        let mut agents = HashMap::new();
        for agent in doc.agents {
            if is_well_known_agent(&agent.agent_id) {
                tracing::warn!(agent_id = %agent.agent_id, "dropping persisted well-known agent");
                continue;
            }
            agents.insert(agent.agent_id.clone(), agent);
        }
        Self {
            roles,
            agents,
            terminations: doc.terminations,
            contact_registries: doc.contact_registries,
        }
    }
}

/// Authoritative, persisted store of organizational state.
pub struct OrgStore {
    org_path: PathBuf,
    state: RwLock<OrgState>,
}

impl OrgStore {
    /// Load `org_path` if it exists and parses; otherwise start empty
    /// (per §4.1's "if the document cannot be parsed at all, the store
    /// starts empty").
    pub fn load(org_path: PathBuf) -> Self {
        let doc = loom_domain::persist::load_json_lenient::<OrgDocument>(&org_path)
            .unwrap_or_default();
        let state = OrgState::from_document(doc);
        tracing::info!(
            path = %org_path.display(),
            roles = state.roles.len(),
            agents = state.agents.len(),
            "org store loaded"
        );
        Self {
            org_path,
            state: RwLock::new(state),
        }
    }

    fn persist(&self, state: &OrgState) -> Result<()> {
        let doc = state.to_document();
        loom_domain::persist::atomic_write_json(&self.org_path, &doc).map_err(Error::Io)
    }

    // ─────────────────────────────────────────────────────────────
    // Roles
    // ─────────────────────────────────────────────────────────────

    /// Returns the existing non-deleted role if `name` is already taken,
    /// otherwise creates and persists a new one.
    pub fn create_role(
        &self,
        name: &str,
        role_prompt: &str,
        org_prompt: Option<String>,
        created_by: Option<String>,
        llm_service_id: Option<String>,
        tool_groups: Option<Vec<String>>,
    ) -> Result<Role> {
        let mut state = self.state.write();

        if let Some(existing) = state
            .roles
            .values()
            .find(|r| r.name == name && r.status == RoleStatus::Active)
        {
            return Ok(existing.clone());
        }

        let role = Role {
            role_id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            role_prompt: role_prompt.to_string(),
            org_prompt,
            llm_service_id,
            tool_groups: Role::normalize_tool_groups(tool_groups),
            created_by,
            created_at: Utc::now(),
            status: RoleStatus::Active,
            deleted_at: None,
            deleted_by: None,
            deletion_reason: None,
        };
        state.roles.insert(role.role_id.clone(), role.clone());
        self.persist(&state)?;
        Ok(role)
    }

    /// Partial update: `None` fields are left unchanged. Returns `Ok(None)`
    /// if `role_id` doesn't exist.
    #[allow(clippy::too_many_arguments)]
    pub fn update_role(
        &self,
        role_id: &str,
        role_prompt: Option<String>,
        org_prompt: Option<Option<String>>,
        llm_service_id: Option<Option<String>>,
        tool_groups: Option<Option<Vec<String>>>,
    ) -> Result<Option<Role>> {
        let mut state = self.state.write();
        let Some(role) = state.roles.get_mut(role_id) else {
            return Ok(None);
        };
        if let Some(rp) = role_prompt {
            role.role_prompt = rp;
        }
        if let Some(op) = org_prompt {
            role.org_prompt = op;
        }
        if let Some(lid) = llm_service_id {
            role.llm_service_id = lid;
        }
        if let Some(tg) = tool_groups {
            role.tool_groups = Role::normalize_tool_groups(tg);
        }
        let updated = role.clone();
        self.persist(&state)?;
        Ok(Some(updated))
    }

    pub fn get_role(&self, role_id: &str) -> Option<Role> {
        self.state.read().roles.get(role_id).cloned()
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.state.read().roles.values().cloned().collect()
    }

    // ─────────────────────────────────────────────────────────────
    // Agents
    // ─────────────────────────────────────────────────────────────

    pub fn create_agent(
        &self,
        role_id: &str,
        parent_agent_id: &str,
        name: Option<String>,
    ) -> Result<Agent> {
        if !validate_parent_agent_id(parent_agent_id) {
            return Err(Error::InvalidParentAgentId);
        }
        let mut state = self.state.write();
        if !state.roles.contains_key(role_id) {
            return Err(Error::RoleNotFound(role_id.to_string()));
        }
        if !is_well_known_agent(parent_agent_id) && !state.agents.contains_key(parent_agent_id) {
            return Err(Error::AgentNotFound(parent_agent_id.to_string()));
        }

        let agent = Agent {
            agent_id: uuid::Uuid::new_v4().to_string(),
            role_id: role_id.to_string(),
            parent_agent_id: parent_agent_id.to_string(),
            name: normalize_name(name),
            created_at: Utc::now(),
            status: AgentStatus::Active,
            terminated_at: None,
        };
        state.agents.insert(agent.agent_id.clone(), agent.clone());
        self.persist(&state)?;
        Ok(agent)
    }

    /// Blank/whitespace-only names collapse to `None` (spec §4.1).
    pub fn set_agent_name(&self, agent_id: &str, name: Option<String>) -> Result<Option<Agent>> {
        let mut state = self.state.write();
        let Some(agent) = state.agents.get_mut(agent_id) else {
            return Ok(None);
        };
        agent.name = normalize_name(name);
        let updated = agent.clone();
        self.persist(&state)?;
        Ok(Some(updated))
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.state.read().agents.get(agent_id).cloned()
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.state.read().agents.values().cloned().collect()
    }

    /// Marks `agent_id` terminated, then recursively terminates every
    /// descendant (by `parentAgentId`) with the same timestamp, appending
    /// one termination record per newly-affected agent.
    pub fn record_termination(
        &self,
        agent_id: &str,
        terminated_by: &str,
        reason: Option<String>,
    ) -> Result<Termination> {
        if is_well_known_agent(agent_id) {
            return Err(Error::CannotDeleteSystemAgent(agent_id.to_string()));
        }
        let mut state = self.state.write();
        if !state.agents.contains_key(agent_id) {
            return Err(Error::AgentNotFound(agent_id.to_string()));
        }

        let now = Utc::now();
        let affected = terminate_cascade(&mut state.agents, agent_id, now);
        if affected.is_empty() {
            // Every agent in the cascade was already terminated.
            return Err(Error::AgentAlreadyTerminated(agent_id.to_string()));
        }

        let mut root_record = None;
        for affected_id in &affected {
            let record = Termination {
                agent_id: affected_id.clone(),
                terminated_by: terminated_by.to_string(),
                terminated_at: now,
                reason: reason.clone(),
            };
            if affected_id == agent_id {
                root_record = Some(record.clone());
            }
            state.terminations.push(record);
        }
        self.persist(&state)?;
        Ok(root_record.expect("root agent is always in its own cascade"))
    }

    /// Terminates every active agent bound to the role, recursively
    /// deletes child roles inferred from `createdBy` edges between roles,
    /// then marks `role_id` deleted.
    ///
    /// Child-role inference follows the stricter policy decided in
    /// SPEC_FULL §11: a role `R2` is a child of `R1` iff `R2.createdBy`
    /// names an agent bound to `R1` at the time `R2` was created, rather
    /// than any agent currently bound to `R1`.
    pub fn delete_role(
        &self,
        role_id: &str,
        deleted_by: &str,
        reason: Option<String>,
    ) -> Result<RoleDeletionResult> {
        let mut state = self.state.write();
        if !state.roles.contains_key(role_id) {
            return Err(Error::RoleNotFound(role_id.to_string()));
        }
        if state.roles[role_id].status == RoleStatus::Deleted {
            return Err(Error::RoleAlreadyDeleted(role_id.to_string()));
        }

        let mut result = RoleDeletionResult::default();
        let mut role_queue = vec![role_id.to_string()];
        let mut visited_roles = std::collections::HashSet::new();
        let now = Utc::now();

        while let Some(current_role_id) = role_queue.pop() {
            if !visited_roles.insert(current_role_id.clone()) {
                continue;
            }

            // Snapshot agents bound to this role *before* cascading
            // terminations, so we can infer child roles from the
            // createdBy edges those agents left behind.
            let bound_agent_ids: Vec<String> = state
                .agents
                .values()
                .filter(|a| a.role_id == current_role_id)
                .map(|a| a.agent_id.clone())
                .collect();

            for agent_id in &bound_agent_ids {
                if state.agents[agent_id].status == AgentStatus::Active {
                    let affected = terminate_cascade(&mut state.agents, agent_id, now);
                    for affected_id in affected {
                        state.terminations.push(Termination {
                            agent_id: affected_id.clone(),
                            terminated_by: deleted_by.to_string(),
                            terminated_at: now,
                            reason: reason.clone(),
                        });
                        if !result.affected_agents.contains(&affected_id) {
                            result.affected_agents.push(affected_id);
                        }
                    }
                }
            }

            // Child roles: any active role whose createdBy names one of
            // this role's bound agents.
            let child_role_ids: Vec<String> = state
                .roles
                .values()
                .filter(|r| {
                    r.status == RoleStatus::Active
                        && r.created_by
                            .as_ref()
                            .is_some_and(|cb| bound_agent_ids.contains(cb))
                })
                .map(|r| r.role_id.clone())
                .collect();

            if let Some(role) = state.roles.get_mut(&current_role_id) {
                role.status = RoleStatus::Deleted;
                role.deleted_at = Some(now);
                role.deleted_by = Some(deleted_by.to_string());
                role.deletion_reason = reason.clone();
            }
            result.affected_roles.push(current_role_id.clone());
            role_queue.extend(child_role_ids);
        }

        self.persist(&state)?;
        Ok(result)
    }

    // ─────────────────────────────────────────────────────────────
    // Contact registries
    // ─────────────────────────────────────────────────────────────

    pub fn introduce_contact(&self, agent_id: &str, contact: ContactEntry) -> Result<()> {
        let mut state = self.state.write();
        let entries = state.contact_registries.entry(agent_id.to_string()).or_default();
        if !entries.iter().any(|c| c.agent_id == contact.agent_id) {
            entries.push(contact);
        }
        self.persist(&state)?;
        Ok(())
    }

    pub fn list_contacts(&self, agent_id: &str) -> Vec<ContactEntry> {
        self.state
            .read()
            .contact_registries
            .get(agent_id)
            .cloned()
            .unwrap_or_default()
    }
}

fn normalize_name(name: Option<String>) -> Option<String> {
    name.and_then(|n| {
        let trimmed = n.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Terminates `agent_id` and every descendant (by `parentAgentId`) not
/// already terminated, all stamped with `at`. Returns the ids newly
/// affected, root first.
fn terminate_cascade(
    agents: &mut HashMap<String, Agent>,
    agent_id: &str,
    at: DateTime<Utc>,
) -> Vec<String> {
    let mut affected = Vec::new();
    let mut queue = vec![agent_id.to_string()];

    while let Some(current_id) = queue.pop() {
        let already_terminated = agents
            .get(&current_id)
            .map(|a| a.status == AgentStatus::Terminated)
            .unwrap_or(true);
        if already_terminated {
            continue;
        }
        if let Some(agent) = agents.get_mut(&current_id) {
            agent.status = AgentStatus::Terminated;
            agent.terminated_at = Some(at);
        }
        affected.push(current_id.clone());

        let children: Vec<String> = agents
            .values()
            .filter(|a| a.parent_agent_id == current_id && a.status == AgentStatus::Active)
            .map(|a| a.agent_id.clone())
            .collect();
        queue.extend(children);
    }

    affected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (OrgStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = OrgStore::load(dir.path().join("org.json"));
        (store, dir)
    }

    #[test]
    fn create_role_is_idempotent_by_name() {
        let (store, _dir) = store();
        let r1 = store.create_role("writer", "you write things", None, None, None, None).unwrap();
        let r2 = store.create_role("writer", "a different prompt", None, None, None, None).unwrap();
        assert_eq!(r1.role_id, r2.role_id);
        assert_eq!(r2.role_prompt, "you write things");
    }

    #[test]
    fn create_agent_rejects_invalid_parent() {
        let (store, _dir) = store();
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        let err = store.create_agent(&role.role_id, "", None).unwrap_err();
        assert!(matches!(err, Error::InvalidParentAgentId));
        let err = store.create_agent(&role.role_id, "null", None).unwrap_err();
        assert!(matches!(err, Error::InvalidParentAgentId));
    }

    #[test]
    fn create_agent_under_root_succeeds() {
        let (store, _dir) = store();
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        let agent = store
            .create_agent(&role.role_id, loom_domain::org::ROOT_AGENT_ID, Some("  ".into()))
            .unwrap();
        assert_eq!(agent.parent_agent_id, "root");
        assert_eq!(agent.name, None, "blank name collapses to None");
    }

    #[test]
    fn termination_cascades_to_descendants() {
        let (store, _dir) = store();
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        let parent = store.create_agent(&role.role_id, "root", None).unwrap();
        let child = store.create_agent(&role.role_id, &parent.agent_id, None).unwrap();
        let grandchild = store.create_agent(&role.role_id, &child.agent_id, None).unwrap();

        store.record_termination(&parent.agent_id, "root", Some("cleanup".into())).unwrap();

        assert_eq!(store.get_agent(&parent.agent_id).unwrap().status, AgentStatus::Terminated);
        assert_eq!(store.get_agent(&child.agent_id).unwrap().status, AgentStatus::Terminated);
        assert_eq!(store.get_agent(&grandchild.agent_id).unwrap().status, AgentStatus::Terminated);
    }

    #[test]
    fn terminating_already_terminated_agent_errors() {
        let (store, _dir) = store();
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        let agent = store.create_agent(&role.role_id, "root", None).unwrap();
        store.record_termination(&agent.agent_id, "root", None).unwrap();
        let err = store.record_termination(&agent.agent_id, "root", None).unwrap_err();
        assert!(matches!(err, Error::AgentAlreadyTerminated(_)));
    }

    #[test]
    fn delete_role_terminates_bound_agents_and_cascades_to_child_roles() {
        let (store, _dir) = store();
        let manager_role = store.create_role("manager", "p", None, None, None, None).unwrap();
        let manager = store.create_agent(&manager_role.role_id, "root", None).unwrap();

        // A role created by the manager agent is a child role.
        let worker_role = store
            .create_role("worker", "p", None, Some(manager.agent_id.clone()), None, None)
            .unwrap();
        let worker = store.create_agent(&worker_role.role_id, &manager.agent_id, None).unwrap();

        let result = store.delete_role(&manager_role.role_id, "root", Some("reorg".into())).unwrap();

        assert!(result.affected_roles.contains(&manager_role.role_id));
        assert!(result.affected_roles.contains(&worker_role.role_id));
        assert!(result.affected_agents.contains(&manager.agent_id));
        assert!(result.affected_agents.contains(&worker.agent_id));

        assert_eq!(store.get_role(&worker_role.role_id).unwrap().status, RoleStatus::Deleted);
        assert_eq!(store.get_agent(&worker.agent_id).unwrap().status, AgentStatus::Terminated);
    }

    #[test]
    fn deleting_already_deleted_role_errors() {
        let (store, _dir) = store();
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        store.delete_role(&role.role_id, "root", None).unwrap();
        let err = store.delete_role(&role.role_id, "root", None).unwrap_err();
        assert!(matches!(err, Error::RoleAlreadyDeleted(_)));
    }

    #[test]
    fn well_known_agents_are_never_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let org_path = dir.path().join("org.json");
        let store = OrgStore::load(org_path.clone());
        let role = store.create_role("writer", "p", None, None, None, None).unwrap();
        store.create_agent(&role.role_id, "root", None).unwrap();

        let raw = std::fs::read_to_string(&org_path).unwrap();
        assert!(!raw.contains("\"agentId\":\"root\""));
        assert!(!raw.contains("\"root\",\"roleId\""));
    }

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let org_path = dir.path().join("org.json");
        let role_id = {
            let store = OrgStore::load(org_path.clone());
            let role = store.create_role("writer", "p", None, None, None, None).unwrap();
            store.create_agent(&role.role_id, "root", None).unwrap();
            role.role_id
        };

        let reloaded = OrgStore::load(org_path);
        assert!(reloaded.get_role(&role_id).is_some());
        assert_eq!(reloaded.list_agents().len(), 1);
    }

    #[test]
    fn cannot_terminate_well_known_agent() {
        let (store, _dir) = store();
        let err = store.record_termination("root", "root", None).unwrap_err();
        assert!(matches!(err, Error::CannotDeleteSystemAgent(_)));
    }
}
