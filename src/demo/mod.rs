//! A scripted `LlmDispatcher`/`ToolExecutor` pair so the CLI can drive the
//! seed scenarios from spec.md §8 end to end without a real model or tool
//! backend. Grounded on the teacher's `ScriptedLlm`/`EchoTools` test
//! doubles in `loom-scheduler`'s own test module — this is that same
//! idea promoted to a small always-available demo backend instead of a
//! throwaway test fixture.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use loom_engine::{LlmRequest, LlmResponse, PendingToolCall, RawToolCall, ToolCallCtx};
use loom_scheduler::{LlmDispatcher, ToolExecutor};

/// Replies to every turn with a short acknowledgement; calls `put_artifact`
/// the first time a round's incoming text contains "remember", so the CLI
/// can demonstrate a tool round trip (spec §8 scenario b) on request.
pub struct ScriptedLlm {
    seen_tool_round: AtomicUsize,
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            seen_tool_round: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmDispatcher for ScriptedLlm {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, String> {
        let last_user_text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.tool_calls.is_empty() && m.tool_call_id.is_none())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        let already_called_tool = request
            .messages
            .iter()
            .any(|m| m.tool_call_id.is_some());

        if !already_called_tool && last_user_text.to_lowercase().contains("remember") {
            self.seen_tool_round.fetch_add(1, Ordering::SeqCst);
            return Ok(LlmResponse {
                content: String::new(),
                tool_calls: vec![RawToolCall {
                    call_id: format!("demo-call-{}", self.seen_tool_round.load(Ordering::SeqCst)),
                    tool_name: "put_artifact".into(),
                    arguments_json: serde_json::json!({ "note": last_user_text }).to_string(),
                }],
            });
        }

        Ok(LlmResponse {
            content: format!("acknowledged: {last_user_text}"),
            tool_calls: vec![],
        })
    }
}

/// Executes every tool call by recording it and echoing the arguments
/// back, standing in for whatever workspace/artifact backend a real
/// deployment would wire in (out of scope per spec.md §1).
#[derive(Default)]
pub struct EchoTools {
    calls: Mutex<Vec<(String, Value)>>,
}

impl EchoTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn call_log(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ToolExecutor for EchoTools {
    async fn execute(&self, ctx: ToolCallCtx, call: PendingToolCall) -> Result<Value, String> {
        tracing::debug!(agent = %ctx.agent_id, tool = %call.tool_name, "demo tool executed");
        self.calls
            .lock()
            .push((call.tool_name.clone(), call.arguments.clone()));
        Ok(serde_json::json!({ "ok": true, "echoed": call.arguments }))
    }
}
