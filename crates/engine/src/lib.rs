//! The per-agent turn state machine (spec §4.6) — the single writer of
//! conversation history, parameterized over [`loom_orgstore::OrgStore`],
//! [`loom_conversation::ConversationStore`], and
//! [`loom_toolgroups::ToolGroupRegistry`].
//!
//! Grounded on the teacher's `runtime::turn::run_turn_inner` tool loop
//! (`crates/gateway/src/runtime/turn.rs`): same phases (build context →
//! call LLM → dispatch tools → loop or finish), reshaped from an
//! all-at-once async function into the spec's pausable `step()` state
//! machine so a cooperative scheduler can interleave many agents over one
//! thread instead of one `tokio::spawn` per turn.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use loom_cancel::CancelScope;
use loom_conversation::ConversationStore;
use loom_domain::config::RuntimeConfig;
use loom_domain::message::{Message, Role as MsgRole, ToolCall, ToolDefinition};
use loom_domain::org::ROOT_AGENT_ID;
use loom_domain::usage::TokenUsage;
use loom_orgstore::OrgStore;
use loom_toolgroups::ToolGroupRegistry;

/// One inbound message that starts (or interrupts) a turn.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub from: String,
    pub task_id: Option<String>,
    pub text: String,
}

/// A message the engine wants delivered through `MessageBus::send` —
/// returned inside `Outcome::Send`, never sent directly (the engine has
/// no bus dependency; the scheduler owns that hop).
#[derive(Debug, Clone)]
pub struct OutboundEnvelope {
    pub to: String,
    pub task_id: Option<String>,
    pub payload: Value,
}

/// A tool call the model asked to make and hasn't been resolved yet.
#[derive(Debug, Clone)]
pub struct PendingToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
}

/// Context handed to the external `ToolExecutor` alongside a call.
#[derive(Debug, Clone)]
pub struct ToolCallCtx {
    pub agent_id: String,
    pub role_id: Option<String>,
    pub task_id: Option<String>,
}

/// What the LLM dispatcher returned for one round. Raw tool-call
/// arguments are a JSON *string* here — parsing (and the parse-failure
/// path) is the engine's job per spec §4.6. `usage`/`reasoning` mirror
/// the `chat → {role, content, tool_calls?, reasoning?, usage?}` shape
/// spec §4.8 gives the dispatcher port.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<RawToolCall>,
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone)]
pub struct RawToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments_json: String,
}

/// Bookkeeping passed to the LLM dispatcher alongside a request.
#[derive(Debug, Clone)]
pub struct LlmRequestMeta {
    pub agent_id: String,
    pub turn_id: String,
    pub step_id: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub meta: LlmRequestMeta,
}

/// Outcome of one `TurnEngine::step` call (spec §4.6).
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Nothing to do right now (e.g. a tool call is still executing).
    Noop,
    /// Made progress with no externally-visible action.
    Done,
    NeedLlm {
        turn_id: String,
        step_id: u64,
        request: LlmRequest,
    },
    NeedTool {
        turn_id: String,
        step_id: u64,
        ctx: ToolCallCtx,
        call: PendingToolCall,
    },
    Send {
        turn_id: String,
        step_id: u64,
        message: OutboundEnvelope,
    },
}

/// Result of `ingest_message`: tells the scheduler whether the message
/// became a new queued turn or was merged as an interruption into an
/// in-flight one (in which case the caller must also abort the agent's
/// cancel scope with `CancelReason::MessageInterruption`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Queued,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    NeedLlm,
    WaitingLlm,
    DispatchTools,
    SendText,
    Finished,
}

struct Turn {
    turn_id: String,
    agent_id: String,
    message: InboundMessage,
    phase: Phase,
    round: u32,
    pending_tool_calls: VecDeque<PendingToolCall>,
    executing_tool_call: Option<PendingToolCall>,
    last_step_id: u64,
    heuristic_retry_used: bool,
    outgoing: Option<OutboundEnvelope>,
}

impl Turn {
    fn new(agent_id: &str, message: InboundMessage) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_string(),
            message,
            phase: Phase::Init,
            round: 0,
            pending_tool_calls: VecDeque::new(),
            executing_tool_call: None,
            last_step_id: 0,
            heuristic_retry_used: false,
            outgoing: None,
        }
    }
}

#[derive(Default)]
struct AgentState {
    queue: VecDeque<Turn>,
    active: Option<Turn>,
    interruptions: Vec<String>,
}

/// Owns every agent's turn state machine. Single writer of
/// `ConversationStore` entries: only `step`/`on_*_result` append.
pub struct TurnEngine {
    org: Arc<OrgStore>,
    conversation: Arc<ConversationStore>,
    toolgroups: Arc<ToolGroupRegistry>,
    config: RuntimeConfig,
    agents: Mutex<HashMap<String, AgentState>>,
    next_step_id: AtomicU64,
}

impl TurnEngine {
    pub fn new(
        org: Arc<OrgStore>,
        conversation: Arc<ConversationStore>,
        toolgroups: Arc<ToolGroupRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            org,
            conversation,
            toolgroups,
            config,
            agents: Mutex::new(HashMap::new()),
            next_step_id: AtomicU64::new(1),
        }
    }

    fn take_step_id(&self) -> u64 {
        self.next_step_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue `message` as a new turn, or — if `agent_id` currently has a
    /// turn awaiting an in-flight LLM response — merge it as an
    /// interruption instead (spec §4.6, glossary "Interruption").
    pub fn ingest_message(&self, agent_id: &str, message: InboundMessage) -> IngestOutcome {
        let mut agents = self.agents.lock();
        let state = agents.entry(agent_id.to_string()).or_default();
        if matches!(state.active.as_ref().map(|t| t.phase), Some(Phase::WaitingLlm)) {
            state.interruptions.push(message.text);
            return IngestOutcome::Interrupted;
        }
        state.queue.push_back(Turn::new(agent_id, message));
        IngestOutcome::Queued
    }

    /// Whether `agent_id` has a turn that could make progress right now
    /// (used by the scheduler to decide whether to re-mark it ready).
    pub fn has_runnable_work(&self, agent_id: &str) -> bool {
        let agents = self.agents.lock();
        let Some(state) = agents.get(agent_id) else {
            return false;
        };
        if !state.queue.is_empty() {
            return true;
        }
        match &state.active {
            None => false,
            Some(t) => !matches!(t.phase, Phase::WaitingLlm)
                && !(t.phase == Phase::DispatchTools && t.executing_tool_call.is_some()),
        }
    }

    pub fn queue_depth(&self, agent_id: &str) -> usize {
        self.agents
            .lock()
            .get(agent_id)
            .map(|s| s.queue.len())
            .unwrap_or(0)
    }

    /// Resolve the prompt and effective tool-group selection for
    /// `agent_id`. Well-known `root` gets a fixed orchestrator prompt and
    /// the registry's default tool-group set; ordinary agents read their
    /// bound role.
    fn role_prompt_and_groups(&self, agent_id: &str) -> (String, Option<Vec<String>>, Option<String>) {
        if agent_id == ROOT_AGENT_ID {
            return (
                "You are the root orchestrator of this agent society. You receive \
                 user requirements and delegate to the agents you've spawned."
                    .to_string(),
                None,
                None,
            );
        }
        match self
            .org
            .get_agent(agent_id)
            .and_then(|a| self.org.get_role(&a.role_id).map(|r| (a.role_id, r)))
        {
            Some((role_id, role)) => {
                let mut prompt = role.role_prompt.clone();
                if let Some(org_prompt) = &role.org_prompt {
                    prompt = format!("{org_prompt}\n\n{prompt}");
                }
                (prompt, role.tool_groups.clone(), Some(role_id))
            }
            None => (
                format!("You are agent {agent_id}."),
                None,
                None,
            ),
        }
    }

    /// Advance `agent_id`'s turn machine by exactly one atomic step.
    pub fn step(&self, agent_id: &str, scope: &CancelScope) -> Outcome {
        debug_assert_eq!(scope.agent_id(), agent_id);
        let mut agents = self.agents.lock();
        let state = agents.entry(agent_id.to_string()).or_default();

        if state.active.is_none() {
            match state.queue.pop_front() {
                Some(turn) => state.active = Some(turn),
                None => return Outcome::Noop,
            }
        }

        let (role_prompt, tool_groups, role_id) = self.role_prompt_and_groups(agent_id);
        let turn = state.active.as_mut().expect("just ensured Some");
        let _span =
            tracing::debug_span!("turn", agent_id, turn_id = %turn.turn_id, phase = ?turn.phase).entered();

        match turn.phase {
            Phase::Init => {
                self.conversation.ensure_conversation(agent_id, &role_prompt);
                let mut content = turn.message.text.clone();
                if let Some(note) = self
                    .conversation
                    .build_context_status_prompt(agent_id, self.config.context_window.max_tokens)
                {
                    content = format!("{content}\n\n{note}");
                }
                self.conversation.append(agent_id, Message::user(content));
                turn.phase = Phase::NeedLlm;
                Outcome::Done
            }

            Phase::NeedLlm => {
                if !state.interruptions.is_empty() {
                    let joined = state.interruptions.drain(..).collect::<Vec<_>>().join("\n");
                    self.conversation
                        .append(agent_id, Message::interruption(format!("【插话消息】{joined}")));
                }

                self.conversation
                    .slide_window_if_needed_by_estimate(agent_id, &self.config.context_window);

                let messages = self.conversation.messages(agent_id);
                let groups = self
                    .toolgroups
                    .effective_groups_for_role(tool_groups.as_deref());
                let tools = self.toolgroups.get_tool_definitions(&groups);

                let turn = state.active.as_mut().expect("active turn present");
                let step_id = self.take_step_id();
                turn.last_step_id = step_id;
                turn.phase = Phase::WaitingLlm;

                Outcome::NeedLlm {
                    turn_id: turn.turn_id.clone(),
                    step_id,
                    request: LlmRequest {
                        messages,
                        tools,
                        meta: LlmRequestMeta {
                            agent_id: agent_id.to_string(),
                            turn_id: turn.turn_id.clone(),
                            step_id,
                            epoch: scope.epoch(),
                        },
                    },
                }
            }

            Phase::WaitingLlm => Outcome::Noop,

            Phase::DispatchTools => {
                if turn.executing_tool_call.is_some() {
                    return Outcome::Noop;
                }
                if let Some(call) = turn.pending_tool_calls.pop_front() {
                    turn.executing_tool_call = Some(call.clone());
                    let step_id = self.take_step_id();
                    turn.last_step_id = step_id;
                    return Outcome::NeedTool {
                        turn_id: turn.turn_id.clone(),
                        step_id,
                        ctx: ToolCallCtx {
                            agent_id: agent_id.to_string(),
                            role_id,
                            task_id: turn.message.task_id.clone(),
                        },
                        call,
                    };
                }

                turn.round += 1;
                if turn.round > self.config.turn.max_tool_rounds {
                    tracing::warn!(agent_id, round = turn.round, "max tool rounds exceeded");
                    turn.outgoing = round_cap_envelope(&self.org, agent_id, turn);
                    turn.phase = Phase::SendText;
                } else {
                    turn.phase = Phase::NeedLlm;
                }
                Outcome::Done
            }

            Phase::SendText => {
                turn.phase = Phase::Finished;
                match turn.outgoing.take() {
                    Some(message) => Outcome::Send {
                        turn_id: turn.turn_id.clone(),
                        step_id: turn.last_step_id,
                        message,
                    },
                    None => Outcome::Done,
                }
            }

            Phase::Finished => {
                state.active = None;
                Outcome::Done
            }
        }
    }

    /// Apply a successful LLM completion. Parses tool-call arguments
    /// (parse failures become an immediate error `tool` entry and are
    /// dropped from the pending set, per spec §4.6), then routes to
    /// `dispatch_tools` or `send_text`, applying the described-but-
    /// didn't-call heuristic retry when enabled (SPEC_FULL §11).
    pub fn on_llm_result(&self, agent_id: &str, turn_id: &str, step_id: u64, response: LlmResponse) {
        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            tracing::warn!(agent_id, "on_llm_result: no engine state for agent");
            return;
        };
        let Some(turn) = state.active.as_mut() else {
            tracing::warn!(agent_id, "on_llm_result: no active turn");
            return;
        };
        if turn.turn_id != turn_id || turn.phase != Phase::WaitingLlm || turn.last_step_id != step_id {
            tracing::warn!(agent_id, turn_id, step_id, "on_llm_result: stale or mismatched call");
            return;
        }

        let had_raw_tool_calls = !response.tool_calls.is_empty();
        let mut message_tool_calls = Vec::with_capacity(response.tool_calls.len());
        let mut parsed = VecDeque::new();
        for raw in response.tool_calls {
            match serde_json::from_str::<Value>(&raw.arguments_json) {
                Ok(args) => {
                    message_tool_calls.push(ToolCall {
                        call_id: raw.call_id.clone(),
                        tool_name: raw.tool_name.clone(),
                        arguments: args.clone(),
                    });
                    parsed.push_back(PendingToolCall {
                        call_id: raw.call_id,
                        tool_name: raw.tool_name,
                        arguments: args,
                    });
                }
                Err(e) => {
                    message_tool_calls.push(ToolCall {
                        call_id: raw.call_id.clone(),
                        tool_name: raw.tool_name.clone(),
                        arguments: Value::Null,
                    });
                    self.conversation.append(
                        agent_id,
                        Message::tool_result(
                            &raw.call_id,
                            serde_json::json!({
                                "error": format!("invalid tool call arguments: {e}")
                            })
                            .to_string(),
                        ),
                    );
                }
            }
        }

        let mut assistant_message =
            Message::assistant_with_tool_calls(response.content.clone(), message_tool_calls);
        assistant_message.reasoning = response.reasoning.clone();
        assistant_message.usage = response.usage;
        self.conversation.append(agent_id, assistant_message);

        if !parsed.is_empty() {
            turn.pending_tool_calls = parsed;
            turn.phase = Phase::DispatchTools;
            return;
        }

        if had_raw_tool_calls {
            // Every tool call failed to parse: errors are already
            // recorded above, so this round is over with nothing to
            // dispatch. Route through the same empty-dispatch path that
            // normally follows a round of real tool calls.
            turn.phase = Phase::DispatchTools;
            return;
        }

        if self.should_retry_described_tool_call(turn, &response.content) {
            turn.heuristic_retry_used = true;
            self.conversation.append(
                agent_id,
                Message::user(
                    "[system] You described calling a tool but didn't actually invoke it. \
                     Either call the tool now, or give your final answer as plain text.",
                ),
            );
            turn.phase = Phase::NeedLlm;
            return;
        }

        turn.outgoing = Some(OutboundEnvelope {
            to: turn.message.from.clone(),
            task_id: turn.message.task_id.clone(),
            payload: serde_json::json!({ "text": response.content }),
        });
        turn.phase = Phase::SendText;
    }

    fn should_retry_described_tool_call(&self, turn: &Turn, content: &str) -> bool {
        self.config.turn.retry_on_described_tool_call
            && !turn.heuristic_retry_used
            && !content.trim().is_empty()
            && turn.round < self.config.turn.max_tool_rounds
            && describes_uncalled_tool(content)
    }

    /// Revert `waiting_llm` back to `need_llm` without clearing the turn
    /// (spec §4.6: the turn retries, interruptions merge on next
    /// emission).
    pub fn on_llm_cancelled(&self, agent_id: &str, turn_id: &str, step_id: u64) {
        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            return;
        };
        let Some(turn) = state.active.as_mut() else {
            return;
        };
        if turn.turn_id != turn_id || turn.phase != Phase::WaitingLlm || turn.last_step_id != step_id {
            tracing::warn!(agent_id, turn_id, "on_llm_cancelled: stale or mismatched call");
            return;
        }
        turn.phase = Phase::NeedLlm;
    }

    /// End the turn on an unrecoverable LLM error. Per spec §7 the
    /// scheduler (which owns the bus and the parent-notification
    /// construction) is responsible for emitting the cross-agent
    /// notification; the engine's job is just to record the failure in
    /// the agent's own log and retire the turn.
    pub fn on_llm_error(&self, agent_id: &str, turn_id: &str, step_id: u64, message: &str) {
        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            return;
        };
        let Some(turn) = state.active.as_mut() else {
            return;
        };
        if turn.turn_id != turn_id || turn.phase != Phase::WaitingLlm || turn.last_step_id != step_id {
            tracing::warn!(agent_id, turn_id, "on_llm_error: stale or mismatched call");
            return;
        }
        self.conversation
            .append(agent_id, Message::assistant(format!("[turn error] {message}")));
        turn.outgoing = None;
        turn.phase = Phase::Finished;
    }

    /// Resolve an executing tool call with its result (or error). The
    /// turn continues regardless of success (spec §7: tool errors become
    /// a JSON error `tool` entry, not a turn abort).
    pub fn on_tool_result(
        &self,
        agent_id: &str,
        turn_id: &str,
        step_id: u64,
        call_id: &str,
        result: Result<Value, String>,
    ) {
        let mut agents = self.agents.lock();
        let Some(state) = agents.get_mut(agent_id) else {
            return;
        };
        let Some(turn) = state.active.as_mut() else {
            return;
        };
        let matches_executing = turn
            .executing_tool_call
            .as_ref()
            .is_some_and(|c| c.call_id == call_id);
        if turn.turn_id != turn_id
            || turn.phase != Phase::DispatchTools
            || turn.last_step_id != step_id
            || !matches_executing
        {
            tracing::warn!(agent_id, turn_id, call_id, "on_tool_result: stale or mismatched call");
            return;
        }
        let content = match result {
            Ok(value) => value.to_string(),
            Err(e) => serde_json::json!({ "error": e }).to_string(),
        };
        self.conversation.append(agent_id, Message::tool_result(call_id, content));
        turn.executing_tool_call = None;
    }
}

fn describes_uncalled_tool(content: &str) -> bool {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(
            r"(?i)\bI(?:'ll| will| am going to)\s+(?:call|invoke|use)\s+(?:the\s+)?`?[a-zA-Z_][a-zA-Z0-9_.]*`?\s+(tool|function)\b",
        )
        .expect("static pattern is valid")
    });
    re.is_match(content)
}

fn round_cap_envelope(org: &OrgStore, agent_id: &str, turn: &Turn) -> Option<OutboundEnvelope> {
    if agent_id == ROOT_AGENT_ID {
        return None;
    }
    let parent_id = org.get_agent(agent_id).map(|a| a.parent_agent_id)?;
    Some(OutboundEnvelope {
        to: parent_id,
        task_id: turn.message.task_id.clone(),
        payload: serde_json::json!({
            "kind": "error",
            "category": "max_tool_rounds_exceeded",
            "userMessage": format!("Agent {agent_id} stopped after exceeding the tool-call round limit."),
            "technicalInfo": format!("round {} exceeded configured cap", turn.round),
            "agent": { "agentId": agent_id },
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_cancel::CancelManager;
    use loom_domain::clock::FixedClock;
    use chrono::Utc;

    fn harness() -> (
        TurnEngine,
        Arc<OrgStore>,
        Arc<ConversationStore>,
        Arc<ToolGroupRegistry>,
        Arc<CancelManager>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let org = Arc::new(OrgStore::load(dir.path().join("org.json")));
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let conversation = ConversationStore::new(dir.path().join("conversations"), clock.clone());
        let toolgroups = Arc::new(ToolGroupRegistry::new());
        let cancel = CancelManager::new(clock);
        let config = RuntimeConfig::default();
        let engine = TurnEngine::new(org.clone(), conversation.clone(), toolgroups.clone(), config);
        (engine, org, conversation, toolgroups, cancel, dir)
    }

    #[test]
    fn ping_pong_turn_reaches_send_text_with_no_tool_calls() {
        let (engine, org, _conv, _tg, cancel, _dir) = harness();
        let role = org.create_role("writer", "be nice", None, None, None, None).unwrap();
        let a1 = org.create_agent(&role.role_id, "root", None).unwrap();

        engine.ingest_message(
            &a1.agent_id,
            InboundMessage { from: "root".into(), task_id: Some("t1".into()), text: "hi".into() },
        );

        let scope = cancel.new_scope(&a1.agent_id);
        // init -> need_llm
        assert!(matches!(engine.step(&a1.agent_id, &scope), Outcome::Done));
        // need_llm -> waiting_llm
        let outcome = engine.step(&a1.agent_id, &scope);
        let (turn_id, step_id) = match outcome {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("expected NeedLlm, got {other:?}"),
        };
        assert!(matches!(engine.step(&a1.agent_id, &scope), Outcome::Noop));

        engine.on_llm_result(
            &a1.agent_id,
            &turn_id,
            step_id,
            LlmResponse { content: "hello".into(), tool_calls: vec![], ..Default::default() },
        );

        // waiting_llm -> send_text
        let send = engine.step(&a1.agent_id, &scope);
        let env = match send {
            Outcome::Send { message, .. } => message,
            other => panic!("expected Send, got {other:?}"),
        };
        assert_eq!(env.to, "root");
        assert_eq!(env.payload["text"], "hello");

        // send_text -> finished
        assert!(matches!(engine.step(&a1.agent_id, &scope), Outcome::Done));
        assert!(!engine.has_runnable_work(&a1.agent_id));
    }

    #[test]
    fn tool_round_trip_ends_with_two_rounds_and_no_error() {
        let (engine, org, conv, _tg, cancel, _dir) = harness();
        let role = org.create_role("worker", "be nice", None, None, None, None).unwrap();
        let a2 = org.create_agent(&role.role_id, "root", None).unwrap();

        engine.ingest_message(
            &a2.agent_id,
            InboundMessage { from: "root".into(), task_id: None, text: "store k=1".into() },
        );
        let scope = cancel.new_scope(&a2.agent_id);
        engine.step(&a2.agent_id, &scope); // init -> need_llm

        let (turn_id, step_id) = match engine.step(&a2.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };
        engine.on_llm_result(
            &a2.agent_id,
            &turn_id,
            step_id,
            LlmResponse {
                content: String::new(),
                tool_calls: vec![RawToolCall {
                    call_id: "c1".into(),
                    tool_name: "put_artifact".into(),
                    arguments_json: r#"{"k":1}"#.into(),
                }],
                ..Default::default()
            },
        );

        // dispatch_tools -> need_tool
        let (tt_id, ts_id, call) = match engine.step(&a2.agent_id, &scope) {
            Outcome::NeedTool { turn_id, step_id, call, .. } => (turn_id, step_id, call),
            other => panic!("{other:?}"),
        };
        assert_eq!(call.tool_name, "put_artifact");
        engine.on_tool_result(&a2.agent_id, &tt_id, ts_id, "c1", Ok(serde_json::json!({"ok": true, "ref": "a1"})));

        // dispatch_tools (no more pending) -> round 1 -> need_llm
        assert!(matches!(engine.step(&a2.agent_id, &scope), Outcome::Done));

        let (turn_id2, step_id2) = match engine.step(&a2.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };
        engine.on_llm_result(
            &a2.agent_id,
            &turn_id2,
            step_id2,
            LlmResponse { content: "done".into(), tool_calls: vec![], ..Default::default() },
        );

        let send = engine.step(&a2.agent_id, &scope);
        assert!(matches!(send, Outcome::Send { .. }));
        assert!(matches!(engine.step(&a2.agent_id, &scope), Outcome::Done));

        let messages = conv.messages(&a2.agent_id);
        // system, user, assistant(tool_calls), tool, assistant(done)
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[2].role, MsgRole::Assistant);
        assert!(!messages[2].tool_calls.is_empty());
        assert_eq!(messages[3].role, MsgRole::Tool);
        assert_eq!(messages[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(messages[4].content, "done");
    }

    #[test]
    fn interruption_merges_into_next_need_llm_with_tag() {
        let (engine, org, _conv, _tg, cancel, _dir) = harness();
        let role = org.create_role("writer", "be nice", None, None, None, None).unwrap();
        let a3 = org.create_agent(&role.role_id, "root", None).unwrap();

        engine.ingest_message(
            &a3.agent_id,
            InboundMessage { from: "root".into(), task_id: None, text: "first".into() },
        );
        let scope = cancel.new_scope(&a3.agent_id);
        engine.step(&a3.agent_id, &scope); // init -> need_llm
        let (turn_id, step_id) = match engine.step(&a3.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };

        let outcome = engine.ingest_message(
            &a3.agent_id,
            InboundMessage { from: "root".into(), task_id: None, text: "second, urgent".into() },
        );
        assert_eq!(outcome, IngestOutcome::Interrupted);

        engine.on_llm_cancelled(&a3.agent_id, &turn_id, step_id);
        // need_llm again: should drain the interruption.
        assert!(matches!(engine.step(&a3.agent_id, &scope), Outcome::Done));
        let req = match engine.step(&a3.agent_id, &scope) {
            Outcome::NeedLlm { request, .. } => request,
            other => panic!("{other:?}"),
        };
        let last = req.messages.last().unwrap();
        assert!(last.is_interruption);
        assert!(last.content.starts_with("【插话消息】"));
        assert!(last.content.contains("second, urgent"));
    }

    #[test]
    fn max_tool_rounds_exceeded_notifies_parent_and_finishes() {
        let (engine, org, _conv, _tg, cancel, _dir) = harness();
        let mut config = RuntimeConfig::default();
        config.turn.max_tool_rounds = 1;
        let engine = TurnEngine::new(org.clone(), {
            let dir = tempfile::tempdir().unwrap();
            ConversationStore::new(dir.path().into(), Arc::new(FixedClock::new(Utc::now())))
        }, Arc::new(ToolGroupRegistry::new()), config);

        let role = org.create_role("worker", "p", None, None, None, None).unwrap();
        let parent = org.create_agent(&role.role_id, "root", None).unwrap();
        let child = org.create_agent(&role.role_id, &parent.agent_id, None).unwrap();

        engine.ingest_message(
            &child.agent_id,
            InboundMessage { from: parent.agent_id.clone(), task_id: None, text: "loop forever".into() },
        );
        let scope = cancel.new_scope(&child.agent_id);
        engine.step(&child.agent_id, &scope); // init -> need_llm
        let (turn_id, step_id) = match engine.step(&child.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };
        engine.on_llm_result(
            &child.agent_id,
            &turn_id,
            step_id,
            LlmResponse {
                content: String::new(),
                tool_calls: vec![RawToolCall {
                    call_id: "c1".into(),
                    tool_name: "noop".into(),
                    arguments_json: "{}".into(),
                }],
                ..Default::default()
            },
        );
        let (tt, ts, call) = match engine.step(&child.agent_id, &scope) {
            Outcome::NeedTool { turn_id, step_id, call, .. } => (turn_id, step_id, call),
            other => panic!("{other:?}"),
        };
        engine.on_tool_result(&child.agent_id, &tt, ts, &call.call_id, Ok(serde_json::json!({})));

        // round becomes 1, equal to cap, not exceeded yet -> need_llm
        assert!(matches!(engine.step(&child.agent_id, &scope), Outcome::Done));
        let (turn_id2, step_id2) = match engine.step(&child.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };
        engine.on_llm_result(
            &child.agent_id,
            &turn_id2,
            step_id2,
            LlmResponse {
                content: String::new(),
                tool_calls: vec![RawToolCall {
                    call_id: "c2".into(),
                    tool_name: "noop".into(),
                    arguments_json: "{}".into(),
                }],
                ..Default::default()
            },
        );
        let (tt2, ts2, call2) = match engine.step(&child.agent_id, &scope) {
            Outcome::NeedTool { turn_id, step_id, call, .. } => (turn_id, step_id, call),
            other => panic!("{other:?}"),
        };
        engine.on_tool_result(&child.agent_id, &tt2, ts2, &call2.call_id, Ok(serde_json::json!({})));

        // round becomes 2 > cap(1): error notification to parent.
        let outcome = engine.step(&child.agent_id, &scope);
        let env = match outcome {
            Outcome::Send { message, .. } => message,
            other => panic!("expected Send, got {other:?}"),
        };
        assert_eq!(env.to, parent.agent_id);
        assert_eq!(env.payload["category"], "max_tool_rounds_exceeded");
    }

    #[test]
    fn llm_error_ends_turn_without_outgoing_message() {
        let (engine, org, conv, _tg, cancel, _dir) = harness();
        let role = org.create_role("writer", "p", None, None, None, None).unwrap();
        let a1 = org.create_agent(&role.role_id, "root", None).unwrap();
        engine.ingest_message(
            &a1.agent_id,
            InboundMessage { from: "root".into(), task_id: None, text: "hi".into() },
        );
        let scope = cancel.new_scope(&a1.agent_id);
        engine.step(&a1.agent_id, &scope);
        let (turn_id, step_id) = match engine.step(&a1.agent_id, &scope) {
            Outcome::NeedLlm { turn_id, step_id, .. } => (turn_id, step_id),
            other => panic!("{other:?}"),
        };
        engine.on_llm_error(&a1.agent_id, &turn_id, step_id, "provider timeout");
        assert!(matches!(engine.step(&a1.agent_id, &scope), Outcome::Done));
        assert!(!engine.has_runnable_work(&a1.agent_id));
        let messages = conv.messages(&a1.agent_id);
        assert!(messages.iter().any(|m| m.content.contains("provider timeout")));
    }
}
