//! Per-agent conversation log, token-usage accounting, and context-window
//! sliding (spec §4.4).
//!
//! Shaped like the teacher's transcript/compaction split
//! (`sa_sessions::transcript` + `crates/gateway/src/runtime/compact.rs`):
//! an in-memory per-agent log backed by atomic JSON files, with a window
//! policy that trims the oldest entries instead of the teacher's
//! LLM-summarizing compaction — the spec's sliding window (§4.4) is a
//! cheaper, summary-free mechanism and this crate implements exactly that,
//! not the teacher's summarization flow.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use loom_domain::clock::Clock;
use loom_domain::config::ContextWindowConfig;
use loom_domain::message::{Message, Role};
use loom_domain::persist;
use loom_domain::usage::{ContextStatus, PromptTokenEstimator, TokenUsage};

/// On-disk shape of `<runtimeDir>/conversations/<agentId>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationDocument {
    agent_id: String,
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_usage: Option<TokenUsage>,
    updated_at: DateTime<Utc>,
}

struct ConversationEntry {
    messages: Vec<Message>,
    token_usage: Option<TokenUsage>,
    estimator: PromptTokenEstimator,
    persisting: Arc<AtomicBool>,
    persist_pending: Arc<AtomicBool>,
}

impl ConversationEntry {
    fn fresh() -> Self {
        Self {
            messages: Vec::new(),
            token_usage: None,
            estimator: PromptTokenEstimator::default(),
            persisting: Arc::new(AtomicBool::new(false)),
            persist_pending: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the per-agent conversation logs. The [`loom_engine::TurnEngine`] is
/// the sole writer of `messages` for a given agent (spec §4.6); this store
/// only enforces the single-system-entry invariant and handles
/// persistence/estimation bookkeeping around those writes.
pub struct ConversationStore {
    conversations_dir: PathBuf,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, ConversationEntry>>,
}

impl ConversationStore {
    pub fn new(conversations_dir: PathBuf, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            conversations_dir,
            clock,
            state: Mutex::new(HashMap::new()),
        })
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.conversations_dir.join(format!("{agent_id}.json"))
    }

    /// Ensure an in-memory conversation exists for `agent_id`, loading it
    /// from disk on first touch. If the loaded (or freshly seeded) system
    /// entry doesn't match `system_prompt`, it's replaced in place —
    /// subsequent history is kept.
    pub fn ensure_conversation(&self, agent_id: &str, system_prompt: &str) {
        let mut state = self.state.lock();
        if state.contains_key(agent_id) {
            self.sync_system_prompt(state.get_mut(agent_id).unwrap(), system_prompt);
            return;
        }

        let loaded = persist::load_json_lenient::<ConversationDocument>(&self.path_for(agent_id));
        let mut entry = ConversationEntry::fresh();
        match loaded {
            Some(doc) => {
                entry.messages = doc.messages;
                entry.token_usage = doc.token_usage;
            }
            None => {
                entry.messages.push(Message::system(system_prompt));
            }
        }
        self.sync_system_prompt(&mut entry, system_prompt);
        state.insert(agent_id.to_string(), entry);
    }

    /// Enforce "exactly one `system` entry, at index 0" (spec §4.4
    /// invariant), replacing its content if it has drifted from the
    /// role's current prompt.
    fn sync_system_prompt(&self, entry: &mut ConversationEntry, system_prompt: &str) {
        match entry.messages.first_mut() {
            Some(m) if m.role == Role::System => {
                if m.content != system_prompt {
                    m.content = system_prompt.to_string();
                }
            }
            _ => {
                entry.messages.insert(0, Message::system(system_prompt));
            }
        }
        // Drop any stray system entries beyond index 0 (defends the
        // invariant even if a caller appended one directly).
        let mut seen_system = false;
        entry.messages.retain(|m| {
            if m.role != Role::System {
                return true;
            }
            if seen_system {
                false
            } else {
                seen_system = true;
                true
            }
        });
    }

    /// Single-writer append: called only from `loom_engine::TurnEngine`.
    pub fn append(&self, agent_id: &str, entry: Message) {
        let mut state = self.state.lock();
        let conv = state
            .entry(agent_id.to_string())
            .or_insert_with(ConversationEntry::fresh);
        conv.messages.push(entry);
    }

    pub fn messages(&self, agent_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .get(agent_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default()
    }

    /// Before an LLM call, drop oldest non-system entries until the
    /// estimator predicts the next prompt fits under
    /// `keep_ratio * max_tokens`, or `max_slide_loops` iterations elapse.
    /// Returns the number of entries dropped.
    pub fn slide_window_if_needed_by_estimate(
        &self,
        agent_id: &str,
        config: &ContextWindowConfig,
    ) -> usize {
        let mut state = self.state.lock();
        let Some(conv) = state.get_mut(agent_id) else {
            return 0;
        };

        let target = (config.max_tokens as f32 * config.keep_ratio) as u32;
        let mut dropped = 0;
        for _ in 0..config.max_slide_loops {
            let chars: usize = conv.messages.iter().map(Message::char_len).sum();
            let predicted = conv.estimator.estimate(chars);
            if predicted <= target {
                break;
            }
            // Oldest non-system entry is always at index 1 once a system
            // entry occupies index 0.
            let drop_at = conv
                .messages
                .iter()
                .position(|m| m.role != Role::System);
            match drop_at {
                Some(idx) => {
                    conv.messages.remove(idx);
                    dropped += 1;
                }
                None => break, // nothing left to drop but the system entry
            }
        }
        if dropped > 0 {
            tracing::debug!(agent_id, dropped, "slid conversation window");
        }
        dropped
    }

    pub fn update_prompt_token_estimator(&self, agent_id: &str, observed_prompt_tokens: u32) {
        let mut state = self.state.lock();
        let Some(conv) = state.get_mut(agent_id) else {
            return;
        };
        let chars: usize = conv.messages.iter().map(Message::char_len).sum();
        conv.estimator.update(observed_prompt_tokens, chars);
    }

    pub fn update_token_usage(&self, agent_id: &str, usage: TokenUsage) {
        let mut state = self.state.lock();
        state
            .entry(agent_id.to_string())
            .or_insert_with(ConversationEntry::fresh)
            .token_usage = Some(usage);
    }

    pub fn get_token_usage(&self, agent_id: &str) -> Option<TokenUsage> {
        self.state.lock().get(agent_id).and_then(|e| e.token_usage)
    }

    pub fn get_context_status(&self, agent_id: &str, max_tokens: u32) -> ContextStatus {
        let used = self
            .get_token_usage(agent_id)
            .map(|u| u.total_tokens)
            .unwrap_or(0);
        ContextStatus::compute(used, max_tokens)
    }

    /// Short note to inject into the next user message when context
    /// status is `near` or `exceeded`; `None` when `ok`.
    pub fn build_context_status_prompt(&self, agent_id: &str, max_tokens: u32) -> Option<String> {
        use loom_domain::usage::ContextHealth;
        let status = self.get_context_status(agent_id, max_tokens);
        match status.status {
            ContextHealth::Ok => None,
            ContextHealth::Near => Some(format!(
                "[context note: conversation is at {:.0}% of the window — keep replies focused]",
                status.usage_percent * 100.0
            )),
            ContextHealth::Exceeded => Some(
                "[context note: conversation exceeds the model's context window — oldest \
                 history has been or will be trimmed]"
                    .to_string(),
            ),
        }
    }

    /// Fire-and-forget atomic persistence, coalesced: if a persist for
    /// this agent is already running, this call just flags a follow-up
    /// write rather than starting a second concurrent one.
    pub fn persist_conversation(self: &Arc<Self>, agent_id: &str) {
        let (persisting, persist_pending) = {
            let state = self.state.lock();
            match state.get(agent_id) {
                Some(conv) => (conv.persisting.clone(), conv.persist_pending.clone()),
                None => return,
            }
        };

        if persisting.swap(true, Ordering::AcqRel) {
            persist_pending.store(true, Ordering::Release);
            return;
        }

        let this = self.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            loop {
                let snapshot = {
                    let state = this.state.lock();
                    state.get(&agent_id).map(|conv| ConversationDocument {
                        agent_id: agent_id.clone(),
                        messages: conv.messages.clone(),
                        token_usage: conv.token_usage,
                        updated_at: this.clock.now(),
                    })
                };
                if let Some(doc) = snapshot {
                    let path = this.path_for(&agent_id);
                    if let Err(e) =
                        tokio::task::spawn_blocking(move || persist::atomic_write_json(&path, &doc))
                            .await
                            .unwrap_or_else(|e| Err(std::io::Error::other(e)))
                    {
                        tracing::warn!(agent_id = %agent_id, error = %e, "failed to persist conversation");
                    }
                }
                if !persist_pending.swap(false, Ordering::AcqRel) {
                    persisting.store(false, Ordering::Release);
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_domain::clock::FixedClock;

    fn store() -> (Arc<ConversationStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationStore::new(
            dir.path().join("conversations"),
            Arc::new(FixedClock::new(Utc::now())),
        );
        (store, dir)
    }

    #[test]
    fn ensure_conversation_seeds_single_system_entry() {
        let (store, _dir) = store();
        store.ensure_conversation("a1", "be helpful");
        let msgs = store.messages("a1");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, "be helpful");
    }

    #[test]
    fn ensure_conversation_replaces_drifted_system_prompt_in_place() {
        let (store, _dir) = store();
        store.ensure_conversation("a1", "old prompt");
        store.append("a1", Message::user("hi"));
        store.ensure_conversation("a1", "new prompt");

        let msgs = store.messages("a1");
        assert_eq!(msgs.len(), 2, "history after system entry is preserved");
        assert_eq!(msgs[0].content, "new prompt");
        assert_eq!(msgs[1].content, "hi");
    }

    #[test]
    fn slide_window_drops_oldest_non_system_first() {
        let (store, _dir) = store();
        store.ensure_conversation("a1", "sys");
        for i in 0..20 {
            store.append("a1", Message::user(format!("message number {i} padded out a bit")));
        }
        // Force a tiny budget so sliding is guaranteed to trigger.
        let mut cfg = ContextWindowConfig {
            max_tokens: 10,
            keep_ratio: 0.5,
            max_slide_loops: 50,
        };
        cfg.max_tokens = 10;
        let dropped = store.slide_window_if_needed_by_estimate("a1", &cfg);
        assert!(dropped > 0);
        let msgs = store.messages("a1");
        assert_eq!(msgs[0].role, Role::System, "system entry is never dropped");
    }

    #[test]
    fn context_status_thresholds_flow_through() {
        let (store, _dir) = store();
        store.ensure_conversation("a1", "sys");
        store.update_token_usage(
            "a1",
            TokenUsage {
                prompt_tokens: 900,
                completion_tokens: 0,
                total_tokens: 900,
            },
        );
        let prompt = store.build_context_status_prompt("a1", 1000);
        assert!(prompt.is_some());
        assert!(prompt.unwrap().contains("context note"));
    }

    #[test]
    fn context_status_ok_has_no_prompt() {
        let (store, _dir) = store();
        store.ensure_conversation("a1", "sys");
        store.update_token_usage(
            "a1",
            TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 0,
                total_tokens: 10,
            },
        );
        assert!(store.build_context_status_prompt("a1", 1000).is_none());
    }

    #[tokio::test]
    async fn persist_conversation_round_trips_to_disk() {
        let (store, dir) = store();
        store.ensure_conversation("a1", "sys");
        store.append("a1", Message::user("hi"));
        store.persist_conversation("a1");
        // Let the spawned persistence task run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let path = dir.path().join("conversations").join("a1.json");
        let raw = std::fs::read_to_string(path).unwrap();
        let doc: ConversationDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc.agent_id, "a1");
        assert_eq!(doc.messages.len(), 2);
    }
}
