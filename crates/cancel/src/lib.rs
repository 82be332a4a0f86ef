//! Per-agent epoch-based cooperative cancellation (spec §4.3).
//!
//! Generalizes the teacher's `CancelToken`/`CancelMap` (a boolean flag
//! replaced wholesale on `register`) to a monotonic epoch per agent: a
//! scope captured at epoch N stays valid until `abort` bumps the agent
//! past N, at which point `assert_active` starts failing and `cancelled()`
//! resolves. The notify-and-recheck-epoch shape plays the same role the
//! teacher's `Notify`-free boolean flag did, but supports distinguishing
//! "this exact scope went stale" from "a newer scope exists" — callers
//! that raced to grab a new scope right after an abort don't see a
//! stale-looking `false`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use loom_domain::clock::Clock;

/// Why an agent's current epoch was aborted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A higher-priority message preempted the current LLM call.
    MessageInterruption,
    /// Explicit user/operator request.
    UserRequested,
    Other(String),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageInterruption => write!(f, "message_interruption"),
            Self::UserRequested => write!(f, "user_requested"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbortInfo {
    pub reason: CancelReason,
    pub at: DateTime<Utc>,
}

struct AgentEntry {
    epoch: u64,
    notify: Arc<Notify>,
    last_abort: Option<AbortInfo>,
}

impl AgentEntry {
    fn fresh() -> Self {
        Self {
            epoch: 0,
            notify: Arc::new(Notify::new()),
            last_abort: None,
        }
    }
}

/// Tracks a monotonic epoch and abort signal per agent.
pub struct CancelManager {
    clock: Arc<dyn Clock>,
    agents: Mutex<HashMap<String, AgentEntry>>,
}

impl CancelManager {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            agents: Mutex::new(HashMap::new()),
        })
    }

    /// Issue a scope bound to the agent's current epoch.
    pub fn new_scope(self: &Arc<Self>, agent_id: &str) -> CancelScope {
        let mut agents = self.agents.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(AgentEntry::fresh);
        CancelScope {
            manager: self.clone(),
            agent_id: agent_id.to_string(),
            epoch: entry.epoch,
            notify: entry.notify.clone(),
        }
    }

    /// Advance `agent_id` past its current epoch, waking any scope
    /// awaiting `cancelled()` at the prior epoch.
    pub fn abort(&self, agent_id: &str, reason: CancelReason) {
        let mut agents = self.agents.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(AgentEntry::fresh);
        entry.epoch += 1;
        entry.last_abort = Some(AbortInfo {
            reason: reason.clone(),
            at: self.clock.now(),
        });
        let stale_notify = entry.notify.clone();
        entry.notify = Arc::new(Notify::new());
        tracing::debug!(agent_id, epoch = entry.epoch, %reason, "agent epoch aborted");
        stale_notify.notify_waiters();
    }

    pub fn get_epoch(&self, agent_id: &str) -> u64 {
        self.agents.lock().get(agent_id).map(|e| e.epoch).unwrap_or(0)
    }

    pub fn get_last_abort_info(&self, agent_id: &str) -> Option<AbortInfo> {
        self.agents.lock().get(agent_id).and_then(|e| e.last_abort.clone())
    }
}

/// A capability to check whether the in-flight work it was issued for is
/// still the agent's current work.
#[derive(Clone)]
pub struct CancelScope {
    manager: Arc<CancelManager>,
    agent_id: String,
    epoch: u64,
    notify: Arc<Notify>,
}

impl CancelScope {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_active(&self) -> bool {
        self.manager.get_epoch(&self.agent_id) == self.epoch
    }

    /// Panics-free check a caller is expected to run before mutating
    /// shared state on behalf of this scope. Returns `false` once a newer
    /// epoch has been issued for this agent.
    pub fn assert_active(&self) -> bool {
        self.is_active()
    }

    /// Resolves once this scope's epoch has been superseded. Already
    /// resolved immediately if the scope is stale at call time.
    pub async fn cancelled(&self) {
        loop {
            if !self.is_active() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_domain::clock::FixedClock;

    fn manager() -> Arc<CancelManager> {
        CancelManager::new(Arc::new(FixedClock::new(Utc::now())))
    }

    #[test]
    fn fresh_scope_starts_active() {
        let mgr = manager();
        let scope = mgr.new_scope("a1");
        assert_eq!(scope.epoch(), 0);
        assert!(scope.assert_active());
    }

    #[test]
    fn abort_invalidates_prior_scope_but_not_a_fresh_one() {
        let mgr = manager();
        let old_scope = mgr.new_scope("a1");
        mgr.abort("a1", CancelReason::UserRequested);
        assert!(!old_scope.assert_active());

        let new_scope = mgr.new_scope("a1");
        assert_eq!(new_scope.epoch(), 1);
        assert!(new_scope.assert_active());
    }

    #[test]
    fn last_abort_info_records_reason() {
        let mgr = manager();
        mgr.new_scope("a1");
        mgr.abort("a1", CancelReason::MessageInterruption);
        let info = mgr.get_last_abort_info("a1").unwrap();
        assert_eq!(info.reason, CancelReason::MessageInterruption);
    }

    #[test]
    fn unknown_agent_has_epoch_zero_and_no_abort_info() {
        let mgr = manager();
        assert_eq!(mgr.get_epoch("ghost"), 0);
        assert!(mgr.get_last_abort_info("ghost").is_none());
    }

    #[test]
    fn reason_display_matches_spec_vocabulary() {
        assert_eq!(CancelReason::MessageInterruption.to_string(), "message_interruption");
        assert_eq!(CancelReason::UserRequested.to_string(), "user_requested");
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_abort() {
        let mgr = manager();
        let scope = mgr.new_scope("a1");
        let mgr2 = mgr.clone();
        let waiter = tokio::spawn(async move {
            scope.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        mgr2.abort("a1", CancelReason::UserRequested);
        tokio::time::timeout(std::time::Duration::from_millis(500), waiter)
            .await
            .expect("cancelled() should resolve after abort")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_if_already_stale() {
        let mgr = manager();
        let scope = mgr.new_scope("a1");
        mgr.abort("a1", CancelReason::UserRequested);
        tokio::time::timeout(std::time::Duration::from_millis(50), scope.cancelled())
            .await
            .expect("already-stale scope should resolve without waiting");
    }
}
