//! Drives every agent's [`loom_engine::TurnEngine`] forward (spec §4.7,
//! §7): pulls due bus traffic in, steps each agent's turn machine, and
//! farms out the two kinds of I/O a step can ask for — an LLM call or a
//! tool call — to pluggable ports.
//!
//! Grounded on the teacher's `runtime::schedule_runner::ScheduleRunner`:
//! same `tick()`-then-sleep-or-wait shape, and the same
//! one-task-in-flight-per-key bookkeeping as its `ConcurrencyGuard`, just
//! keyed by agent id instead of schedule id (spec §7 caps each agent at
//! one in-flight LLM or tool call at a time rather than a configurable
//! concurrency limit per schedule). Where the teacher's loop fires on a
//! wall-clock cron cadence, this one fires whenever the bus has something
//! to deliver or an agent has a runnable step, falling back to
//! `MessageBus::wait_for_message` to avoid busy-spinning when neither is
//! true.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use loom_bus::{MessageBus, OutboundMessage};
use loom_cancel::{CancelManager, CancelReason};
use loom_conversation::ConversationStore;
use loom_domain::clock::Clock;
use loom_domain::config::SchedulerConfig;
use loom_domain::org::{AgentStatus, ROOT_AGENT_ID};
use loom_engine::{
    InboundMessage, IngestOutcome, LlmRequest, LlmResponse, Outcome, PendingToolCall, ToolCallCtx,
    TurnEngine,
};
use loom_orgstore::OrgStore;
use loom_toolgroups::SEND_MESSAGE_TOOL;

/// Per-agent scheduling status (spec §4.7/§5). `WaitingLlm`/`Processing`
/// mirror the in-flight `{llm, tool}` kinds; `Idle` is the state property
/// 7 ("idle convergence") asserts every agent with no in-flight work, no
/// runnable turn, and an empty bus queue eventually reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    Idle,
    WaitingLlm,
    Processing,
}

/// Bookkeeping the idle-collapse policy needs per agent: its current
/// status, and (while idle) the moment it became idle.
#[derive(Debug, Clone, Copy)]
struct AgentComputeState {
    status: ComputeStatus,
    idle_since: Option<DateTime<Utc>>,
}

impl Default for AgentComputeState {
    fn default() -> Self {
        Self {
            status: ComputeStatus::Idle,
            idle_since: None,
        }
    }
}

/// Port to whatever serves chat completions for this deployment. One
/// `complete` call corresponds to one `Outcome::NeedLlm`.
#[async_trait]
pub trait LlmDispatcher: Send + Sync {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, String>;
}

/// Port to whatever actually executes a non-`send_message` tool call.
/// `send_message` itself never reaches this port — the scheduler
/// intercepts it and talks to the bus directly (spec §6).
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, ctx: ToolCallCtx, call: PendingToolCall) -> Result<Value, String>;
}

/// Owns the run loop. Stepping, dispatch, and bus draining all happen
/// under one `Arc`, cloned into each spawned completion task so routing
/// the result back into the engine doesn't need a return channel.
pub struct ComputeScheduler {
    org: Arc<OrgStore>,
    conversation: Arc<ConversationStore>,
    engine: Arc<TurnEngine>,
    bus: Arc<MessageBus>,
    cancel: Arc<CancelManager>,
    llm: Arc<dyn LlmDispatcher>,
    tools: Arc<dyn ToolExecutor>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    /// Agent ids with an outstanding LLM or tool call. Absence is the
    /// scheduler's permission slip to call `step` again for that agent.
    in_flight: Mutex<HashSet<String>>,
    /// Per-agent `computeStatus` (spec §4.7) plus `idle_since` (SPEC_FULL
    /// §11 bookkeeping backing testable property 7).
    compute: Mutex<HashMap<String, AgentComputeState>>,
    shutdown: AtomicBool,
}

impl ComputeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        org: Arc<OrgStore>,
        conversation: Arc<ConversationStore>,
        engine: Arc<TurnEngine>,
        bus: Arc<MessageBus>,
        cancel: Arc<CancelManager>,
        llm: Arc<dyn LlmDispatcher>,
        tools: Arc<dyn ToolExecutor>,
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            org,
            conversation,
            engine,
            bus,
            cancel,
            llm,
            tools,
            config,
            clock,
            in_flight: Mutex::new(HashSet::new()),
            compute: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Current `computeStatus` for `agent_id` (spec §4.7); `Idle` for any
    /// agent the scheduler hasn't observed yet, since an unseen agent has
    /// no in-flight work by definition.
    pub fn compute_status(&self, agent_id: &str) -> ComputeStatus {
        self.compute
            .lock()
            .get(agent_id)
            .map(|s| s.status)
            .unwrap_or(ComputeStatus::Idle)
    }

    /// When `agent_id` last became idle, if it currently is. `None` both
    /// for agents that are busy and for agents never observed.
    pub fn idle_since(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.compute.lock().get(agent_id).and_then(|s| s.idle_since)
    }

    fn set_busy(&self, agent_id: &str, status: ComputeStatus) {
        let mut compute = self.compute.lock();
        let entry = compute.entry(agent_id.to_string()).or_default();
        entry.status = status;
        entry.idle_since = None;
    }

    /// Idle collapse (spec §4.7): if `agent_id` has no in-flight work, no
    /// runnable turn, and an empty bus queue, converge it to `Idle` and
    /// stamp `idle_since` the moment it first got there. Any other agent
    /// is left exactly as its last `set_busy` call left it.
    fn maybe_collapse_idle(&self, agent_id: &str) {
        if self.in_flight.lock().contains(agent_id) {
            return;
        }
        if self.engine.has_runnable_work(agent_id) || self.bus.get_queue_depth(agent_id) > 0 {
            return;
        }
        let mut compute = self.compute.lock();
        let entry = compute.entry(agent_id.to_string()).or_default();
        if entry.status != ComputeStatus::Idle || entry.idle_since.is_none() {
            entry.status = ComputeStatus::Idle;
            entry.idle_since = Some(self.clock.now());
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Run until `request_shutdown` is called. Each iteration is one
    /// `tick`; when a tick makes no progress at all the loop parks on
    /// `wait_for_message` instead of spinning.
    pub async fn run(self: Arc<Self>) {
        while !self.shutdown.load(Ordering::Relaxed) {
            let made_progress = self.tick().await;
            if made_progress {
                tokio::time::sleep(Duration::from_millis(self.config.yield_sleep_ms)).await;
            } else {
                self.bus.wait_for_message(self.config.bus_wait_timeout_ms).await;
            }
        }
    }

    /// One round: deliver due messages, drain the bus into the engine,
    /// then step every known non-busy agent once. Returns whether
    /// anything actually happened, for the caller's idle-collapse
    /// decision.
    pub async fn tick(self: &Arc<Self>) -> bool {
        self.bus.deliver_due_messages();
        let mut made_progress = self.drain_inbound();

        for agent_id in self.known_agents() {
            if self.in_flight.lock().contains(&agent_id) {
                continue;
            }
            let scope = self.cancel.new_scope(&agent_id);
            match self.engine.step(&agent_id, &scope) {
                Outcome::Noop => {
                    self.maybe_collapse_idle(&agent_id);
                }
                Outcome::Done => {
                    made_progress = true;
                    self.maybe_collapse_idle(&agent_id);
                }
                Outcome::NeedLlm {
                    turn_id,
                    step_id,
                    request,
                } => {
                    made_progress = true;
                    self.set_busy(&agent_id, ComputeStatus::WaitingLlm);
                    self.dispatch_llm(agent_id, turn_id, step_id, request, scope);
                }
                Outcome::NeedTool {
                    turn_id,
                    step_id,
                    ctx,
                    call,
                } => {
                    made_progress = true;
                    if call.tool_name == SEND_MESSAGE_TOOL {
                        self.handle_send_message(&agent_id, &turn_id, step_id, &ctx, call);
                        self.maybe_collapse_idle(&agent_id);
                    } else {
                        self.set_busy(&agent_id, ComputeStatus::Processing);
                        self.dispatch_tool(agent_id, turn_id, step_id, ctx, call);
                    }
                }
                Outcome::Send {
                    turn_id: _,
                    step_id: _,
                    message,
                } => {
                    made_progress = true;
                    self.bus.send(OutboundMessage {
                        id: None,
                        from: agent_id.clone(),
                        to: message.to,
                        task_id: message.task_id,
                        payload: message.payload,
                        scheduled_delivery_time: None,
                    });
                    self.conversation.persist_conversation(&agent_id);
                    self.maybe_collapse_idle(&agent_id);
                }
            }
        }

        made_progress
    }

    /// Every agent that can have a turn, in no particular order: `root`
    /// plus every non-terminated agent the org store knows about. The
    /// well-known `user` endpoint never runs turns — messages addressed
    /// to it just sit in its bus queue for an external reader.
    fn known_agents(&self) -> Vec<String> {
        let mut ids = vec![ROOT_AGENT_ID.to_string()];
        ids.extend(
            self.org
                .list_agents()
                .into_iter()
                .filter(|a| a.status == AgentStatus::Active)
                .map(|a| a.agent_id),
        );
        ids
    }

    /// Pop every queued message for each known agent and hand it to the
    /// engine, aborting the agent's cancel scope when the engine reports
    /// the message merged as an interruption rather than a fresh turn.
    fn drain_inbound(&self) -> bool {
        let mut any = false;
        for agent_id in self.known_agents() {
            while let Some(msg) = self.bus.receive_next(&agent_id) {
                any = true;
                let text = extract_text(&msg.payload);
                let outcome = self.engine.ingest_message(
                    &agent_id,
                    InboundMessage {
                        from: msg.from.clone(),
                        task_id: msg.task_id.clone(),
                        text,
                    },
                );
                if outcome == IngestOutcome::Interrupted {
                    self.cancel.abort(&agent_id, CancelReason::MessageInterruption);
                }
            }
        }
        any
    }

    fn dispatch_llm(
        self: &Arc<Self>,
        agent_id: String,
        turn_id: String,
        step_id: u64,
        request: LlmRequest,
        scope: loom_cancel::CancelScope,
    ) {
        self.in_flight.lock().insert(agent_id.clone());
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    // spec §7: only a `message_interruption` abort retries
                    // the turn via `onLlmCancelled`; any other abort reason
                    // (e.g. `user_requested`) discards the in-flight call
                    // and ends the turn instead, same as a dispatcher error.
                    let is_interruption = matches!(
                        this.cancel.get_last_abort_info(&agent_id).map(|i| i.reason),
                        Some(CancelReason::MessageInterruption)
                    );
                    if is_interruption {
                        this.engine.on_llm_cancelled(&agent_id, &turn_id, step_id);
                    } else {
                        this.engine.on_llm_error(&agent_id, &turn_id, step_id, "llm_result_discarded");
                    }
                }
                result = this.llm.complete(request) => {
                    match result {
                        Ok(response) => {
                            // spec §4.7: on success, update tokenUsage with
                            // the returned usage and update the
                            // prompt-token estimator before handing the
                            // result to the engine.
                            if let Some(usage) = response.usage {
                                this.conversation.update_token_usage(&agent_id, usage);
                                this.conversation
                                    .update_prompt_token_estimator(&agent_id, usage.prompt_tokens);
                            }
                            this.engine.on_llm_result(&agent_id, &turn_id, step_id, response);
                        }
                        Err(e) => {
                            this.engine.on_llm_error(&agent_id, &turn_id, step_id, &e);
                            this.notify_parent_of_llm_error(&agent_id, &e);
                        }
                    }
                }
            }
            this.conversation.persist_conversation(&agent_id);
            this.in_flight.lock().remove(&agent_id);
        });
    }

    fn dispatch_tool(
        self: &Arc<Self>,
        agent_id: String,
        turn_id: String,
        step_id: u64,
        ctx: ToolCallCtx,
        call: PendingToolCall,
    ) {
        self.in_flight.lock().insert(agent_id.clone());
        let this = self.clone();
        tokio::spawn(async move {
            let call_id = call.call_id.clone();
            let result = this.tools.execute(ctx, call).await;
            this.engine
                .on_tool_result(&agent_id, &turn_id, step_id, &call_id, result);
            this.in_flight.lock().remove(&agent_id);
        });
    }

    /// Intercept a `send_message` tool call: resolve it against the bus
    /// directly, synchronously, instead of routing it through
    /// `ToolExecutor` (spec §6: `send_message` is reserved by the core,
    /// not an ordinary tool group member).
    fn handle_send_message(
        &self,
        agent_id: &str,
        turn_id: &str,
        step_id: u64,
        ctx: &ToolCallCtx,
        call: PendingToolCall,
    ) {
        let to = call.arguments.get("to").and_then(Value::as_str);
        let text = call.arguments.get("text").and_then(Value::as_str);
        let result = match (to, text) {
            (Some(to), Some(text)) => {
                let task_id = call
                    .arguments
                    .get("taskId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| ctx.task_id.clone());
                self.bus.send(OutboundMessage {
                    id: None,
                    from: agent_id.to_string(),
                    to: to.to_string(),
                    task_id,
                    payload: serde_json::json!({ "text": text }),
                    scheduled_delivery_time: None,
                });
                Ok(serde_json::json!({ "ok": true }))
            }
            _ => Err("send_message requires both \"to\" and \"text\" arguments".to_string()),
        };
        self.engine
            .on_tool_result(agent_id, turn_id, step_id, &call.call_id, result);
    }

    /// Notify an agent's parent of an unrecoverable LLM failure (spec §7:
    /// unlike the round-cap notification, which the engine constructs
    /// itself since it already has the full turn in hand, this is the
    /// scheduler's job because only the scheduler knows the dispatcher
    /// failed — the engine just sees `on_llm_error` called).
    fn notify_parent_of_llm_error(&self, agent_id: &str, error: &str) {
        if agent_id == ROOT_AGENT_ID {
            return;
        }
        let Some(parent_id) = self.org.get_agent(agent_id).map(|a| a.parent_agent_id) else {
            return;
        };
        self.bus.send(OutboundMessage {
            id: None,
            from: agent_id.to_string(),
            to: parent_id,
            task_id: None,
            payload: serde_json::json!({
                "kind": "error",
                "category": "llm_dispatch_failed",
                "userMessage": format!("Agent {agent_id} hit an unrecoverable LLM error."),
                "technicalInfo": error,
                "agent": { "agentId": agent_id },
            }),
            scheduled_delivery_time: None,
        });
    }
}

fn extract_text(payload: &Value) -> String {
    payload
        .get("text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string())
}
