//! In-process FIFO message bus with scheduled (delayed) delivery (spec
//! §4.2). Purely in-memory — no persistence, no cross-process delivery.
//!
//! Shaped like the teacher's `SessionStore`: a single `parking_lot::Mutex`
//! around the mutable state, plus a `tokio::sync::Notify` standing in for
//! the "resolves when any queue becomes non-empty" promise the spec
//! describes for `waitForMessage`.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use loom_domain::clock::Clock;

/// A message in flight between two agents (or the well-known `user`
/// endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_delivery_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
}

/// What a caller wants to send; `id` defaults to a fresh uuid if absent.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    pub task_id: Option<String>,
    pub payload: Value,
    pub scheduled_delivery_time: Option<DateTime<Utc>>,
}

/// Spec §4.2: `send(msg) → {messageId, scheduledDeliveryTime?}`.
/// `message_id_is_fresh` is `false` only when `send` rejected a duplicate
/// `(from, id)` pair, in which case `message_id` still names the id that
/// was deduped against.
#[derive(Debug, Clone)]
pub struct SendResult {
    pub message_id: String,
    pub scheduled_delivery_time: Option<DateTime<Utc>>,
    pub message_id_is_fresh: bool,
}

struct DelayedEntry {
    due_at: DateTime<Utc>,
    seq: u64,
    message: BusMessage,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due_at == other.due_at && self.seq == other.seq
    }
}
impl Eq for DelayedEntry {}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest due time (and,
        // on a tie, the earliest insertion) sorts first when popped.
        other
            .due_at
            .cmp(&self.due_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    queues: HashMap<String, VecDeque<BusMessage>>,
    delayed: BinaryHeap<DelayedEntry>,
    seen: HashSet<(String, String)>,
    next_seq: u64,
}

/// FIFO per-recipient message bus.
pub struct MessageBus {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    notify: tokio::sync::Notify,
    delayed_delivery_hooks: Mutex<Vec<Box<dyn Fn(&BusMessage) + Send + Sync>>>,
}

impl MessageBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State {
                queues: HashMap::new(),
                delayed: BinaryHeap::new(),
                seen: HashSet::new(),
                next_seq: 0,
            }),
            notify: tokio::sync::Notify::new(),
            delayed_delivery_hooks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback fired (synchronously, from within
    /// `deliver_due_messages`) for every message that transitions from
    /// scheduled to delivered.
    pub fn on_delayed_delivery(&self, hook: impl Fn(&BusMessage) + Send + Sync + 'static) {
        self.delayed_delivery_hooks.lock().push(Box::new(hook));
    }

    /// Enqueue `msg`. Immediate messages append straight to the
    /// recipient's FIFO; messages with a future `scheduled_delivery_time`
    /// go into the due-time ordered structure instead. A duplicate
    /// `(from, id)` pair is silently dropped.
    pub fn send(&self, msg: OutboundMessage) -> SendResult {
        let mut state = self.state.lock();
        let id = msg.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let key = (msg.from.clone(), id.clone());
        if state.seen.contains(&key) {
            tracing::warn!(from = %msg.from, id = %id, "dropping duplicate message id");
            return SendResult {
                message_id: id,
                scheduled_delivery_time: msg.scheduled_delivery_time,
                message_id_is_fresh: false,
            };
        }
        state.seen.insert(key);

        let now = self.clock.now();
        let bus_msg = BusMessage {
            id: id.clone(),
            from: msg.from,
            to: msg.to.clone(),
            task_id: msg.task_id,
            payload: msg.payload,
            created_at: now,
            scheduled_delivery_time: msg.scheduled_delivery_time,
            delivered_at: None,
        };

        match msg.scheduled_delivery_time {
            Some(due_at) if due_at > now => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.delayed.push(DelayedEntry {
                    due_at,
                    seq,
                    message: bus_msg,
                });
            }
            _ => {
                state.queues.entry(msg.to).or_default().push_back(bus_msg);
                drop(state);
                self.notify.notify_waiters();
                return SendResult {
                    message_id: id,
                    scheduled_delivery_time: None,
                    message_id_is_fresh: true,
                };
            }
        }
        drop(state);
        SendResult {
            message_id: id,
            scheduled_delivery_time: msg.scheduled_delivery_time,
            message_id_is_fresh: true,
        }
    }

    /// Move every scheduled message whose due time has passed into its
    /// recipient's FIFO, firing the delayed-delivery hooks with a copy
    /// stamped `delivered_at` = now.
    pub fn deliver_due_messages(&self) {
        let now = self.clock.now();
        let mut delivered = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(top) = state.delayed.peek() {
                if top.due_at > now {
                    break;
                }
                let entry = state.delayed.pop().expect("peeked Some");
                let mut msg = entry.message;
                msg.delivered_at = Some(now);
                state
                    .queues
                    .entry(msg.to.clone())
                    .or_default()
                    .push_back(msg.clone());
                delivered.push(msg);
            }
            if !delivered.is_empty() {
                drop(state);
                self.notify.notify_waiters();
            }
        }
        if !delivered.is_empty() {
            let hooks = self.delayed_delivery_hooks.lock();
            for msg in &delivered {
                for hook in hooks.iter() {
                    hook(msg);
                }
            }
        }
    }

    /// Pop the oldest queued message for `agent_id`, if any.
    pub fn receive_next(&self, agent_id: &str) -> Option<BusMessage> {
        self.state.lock().queues.get_mut(agent_id)?.pop_front()
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().queues.values().any(|q| !q.is_empty())
    }

    pub fn get_queue_depth(&self, agent_id: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(agent_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn clear_queue(&self, agent_id: &str) {
        if let Some(q) = self.state.lock().queues.get_mut(agent_id) {
            q.clear();
        }
    }

    /// Resolves as soon as any queue becomes non-empty, or after
    /// `timeout_ms` elapses — whichever comes first. Spec §5 bounds
    /// `timeout_ms` to 100 so periodic scheduler work stays on cadence;
    /// callers outside the scheduler loop aren't required to honor that.
    pub async fn wait_for_message(&self, timeout_ms: u64) {
        if self.has_pending() {
            return;
        }
        let notified = self.notify.notified();
        let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), notified).await;
    }
}
