//! Wires the core crates together into one running instance and exposes
//! the ports §6 of spec.md describes as "consumed by the HTTP/UI layer" —
//! submit requirement, send text, query org tree, set name, delete role,
//! force-terminate, abort. There is no HTTP layer in this repo (out of
//! scope per spec.md §1), so this struct stands in for it: the CLI calls
//! these methods directly instead of a router dispatching to them.

use std::path::PathBuf;
use std::sync::Arc;

use loom_bus::{BusMessage, MessageBus, OutboundMessage};
use loom_cancel::{CancelManager, CancelReason};
use loom_conversation::ConversationStore;
use loom_domain::clock::{Clock, SystemClock};
use loom_domain::config::RuntimeConfig;
use loom_domain::org::{Agent, Role, RoleDeletionResult, Termination, ROOT_AGENT_ID, USER_AGENT_ID};
use loom_engine::TurnEngine;
use loom_orgstore::OrgStore;
use loom_scheduler::{ComputeScheduler, LlmDispatcher, ToolExecutor};
use loom_toolgroups::ToolGroupRegistry;

/// Everything needed to run the agent society substrate for one process.
pub struct Runtime {
    pub org: Arc<OrgStore>,
    pub bus: Arc<MessageBus>,
    pub cancel: Arc<CancelManager>,
    pub conversation: Arc<ConversationStore>,
    pub toolgroups: Arc<ToolGroupRegistry>,
    pub engine: Arc<TurnEngine>,
    pub scheduler: Arc<ComputeScheduler>,
}

impl Runtime {
    pub fn build(
        config: RuntimeConfig,
        llm: Arc<dyn LlmDispatcher>,
        tools: Arc<dyn ToolExecutor>,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let org = Arc::new(OrgStore::load(config.storage.org_path()));
        let bus = Arc::new(MessageBus::new(clock.clone()));
        let cancel = CancelManager::new(clock.clone());
        let conversation = ConversationStore::new(config.storage.conversations_dir(), clock.clone());
        let toolgroups = Arc::new(ToolGroupRegistry::new());
        let engine = Arc::new(TurnEngine::new(
            org.clone(),
            conversation.clone(),
            toolgroups.clone(),
            config.clone(),
        ));
        let scheduler = ComputeScheduler::new(
            org.clone(),
            conversation.clone(),
            engine.clone(),
            bus.clone(),
            cancel.clone(),
            llm,
            tools,
            config.scheduler,
            clock,
        );
        Self {
            org,
            bus,
            cancel,
            conversation,
            toolgroups,
            engine,
            scheduler,
        }
    }

    /// "Submit user requirement" port (spec §6): deliver `text` to `root`
    /// as a fresh task, returning the generated `taskId`.
    pub fn submit_requirement(&self, text: &str) -> String {
        let task_id = uuid::Uuid::new_v4().to_string();
        self.send_text(USER_AGENT_ID, ROOT_AGENT_ID, text, Some(task_id.clone()));
        task_id
    }

    /// "Send text to agent" port (spec §6), with an optional `taskId` to
    /// correlate replies and no attachment support (workspace/artifact
    /// store is out of scope per spec.md §1). Returns the bus message id
    /// (spec §4.2: `send` yields `{messageId, scheduledDeliveryTime?}`).
    pub fn send_text(&self, from: &str, to: &str, text: &str, task_id: Option<String>) -> String {
        let result = self.bus.send(OutboundMessage {
            id: None,
            from: from.to_string(),
            to: to.to_string(),
            task_id,
            payload: serde_json::json!({ "text": text }),
            scheduled_delivery_time: None,
        });
        tracing::debug!(from, to, message_id = %result.message_id, fresh = result.message_id_is_fresh, "send_text");
        result.message_id
    }

    /// Pop one pending message for the well-known `user` endpoint, if any
    /// — how a CLI or future UI layer observes agent replies without its
    /// own bus subscription.
    pub fn receive_for_user(&self) -> Option<BusMessage> {
        self.bus.receive_next(USER_AGENT_ID)
    }

    pub fn list_roles(&self) -> Vec<Role> {
        self.org.list_roles()
    }

    pub fn list_agents(&self) -> Vec<Agent> {
        self.org.list_agents()
    }

    /// "Set agent display name" port (spec §6).
    pub fn set_agent_name(&self, agent_id: &str, name: Option<String>) -> anyhow::Result<Option<Agent>> {
        Ok(self.org.set_agent_name(agent_id, name)?)
    }

    /// "Delete role" port (spec §6). Well-known agents never hold a role,
    /// so this never touches `root`/`user`.
    pub fn delete_role(
        &self,
        role_id: &str,
        deleted_by: &str,
        reason: Option<String>,
    ) -> anyhow::Result<RoleDeletionResult> {
        Ok(self.org.delete_role(role_id, deleted_by, reason)?)
    }

    /// "Force-terminate agent" port (spec §6).
    pub fn force_terminate(
        &self,
        agent_id: &str,
        terminated_by: &str,
        reason: Option<String>,
    ) -> anyhow::Result<Termination> {
        self.cancel.abort(agent_id, CancelReason::UserRequested);
        Ok(self.org.record_termination(agent_id, terminated_by, reason)?)
    }

    /// "Abort in-flight LLM call on agent" port (spec §6): routes to
    /// `CancelManager::abort(agentId, user_requested)` directly.
    pub fn abort_agent(&self, agent_id: &str) {
        self.cancel.abort(agent_id, CancelReason::UserRequested);
    }

    pub fn runtime_dir(&self) -> Option<PathBuf> {
        None
    }
}
