//! Managed agents and the inventory that tracks them.
//!
//! A managed agent is a provisioned node seen from the consumer's side: it
//! goes online with some executors, runs tasks, idles, and is eventually
//! flagged for deletion by the retention check or an explicit request.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::phone_home::PhoneHomeMonitor;
use crate::plan::RunningNode;
use crate::retention::RetentionTime;

/// Mutable per-agent bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    pub online: bool,
    pub executors: u32,
    pub busy_executors: u32,
    pub idle_since: DateTime<Utc>,
    pub temporarily_offline: bool,
    pub pending_delete: bool,
    pub waiting_for_phone_home: bool,
    pub launch_failed_at: Option<DateTime<Utc>>,
}

impl AgentState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            online: false,
            executors: 0,
            busy_executors: 0,
            idle_since: now,
            temporarily_offline: false,
            pending_delete: false,
            waiting_for_phone_home: false,
            launch_failed_at: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.busy_executors == 0
    }
}

pub struct ManagedAgent {
    name: String,
    node: RunningNode,
    retention: RetentionTime,
    phone_home: Arc<PhoneHomeMonitor>,
    checking: AtomicBool,
    state: Mutex<AgentState>,
}

/// Held while a retention check runs on an agent.
#[must_use]
pub struct CheckGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl ManagedAgent {
    /// The agent is named after the node's host name, which is also what the
    /// node reports when it phones home.
    pub fn new(
        node: RunningNode,
        retention: RetentionTime,
        phone_home: Arc<PhoneHomeMonitor>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: node.node.name.clone(),
            node,
            retention,
            phone_home,
            checking: AtomicBool::new(false),
            state: Mutex::new(AgentState::new(now)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> &RunningNode {
        &self.node
    }

    pub fn cloud_name(&self) -> &str {
        &self.node.cloud_name
    }

    /// Per-instance retention override.
    pub fn retention(&self) -> RetentionTime {
        self.retention
    }

    pub fn phone_home(&self) -> &Arc<PhoneHomeMonitor> {
        &self.phone_home
    }

    pub fn snapshot(&self) -> AgentState {
        self.lock().clone()
    }

    /// Claim the check flag, or `None` if a check is already running.
    pub fn try_begin_check(&self) -> Option<CheckGuard<'_>> {
        self.checking
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| CheckGuard {
                flag: &self.checking,
            })
    }

    pub fn is_checking(&self) -> bool {
        self.checking.load(Ordering::Acquire)
    }

    pub fn connect(&self, executors: u32, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.online = true;
        state.executors = executors;
        state.busy_executors = 0;
        state.idle_since = now;
        state.temporarily_offline = false;
        state.launch_failed_at = None;
        info!(agent = %self.name, executors, "Agent online");
    }

    pub fn disconnect(&self) {
        let mut state = self.lock();
        if state.online {
            info!(agent = %self.name, "Agent disconnected");
        }
        state.online = false;
        state.executors = 0;
    }

    pub fn task_started(&self) {
        let mut state = self.lock();
        state.busy_executors = (state.busy_executors + 1).min(state.executors.max(1));
    }

    pub fn task_finished(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.busy_executors = state.busy_executors.saturating_sub(1);
        if state.busy_executors == 0 {
            state.idle_since = now;
        }
    }

    pub fn set_waiting_for_phone_home(&self, waiting: bool) {
        self.lock().waiting_for_phone_home = waiting;
    }

    pub fn mark_launch_failed(&self, now: DateTime<Utc>) {
        let mut state = self.lock();
        state.online = false;
        state.executors = 0;
        state.launch_failed_at = Some(now);
    }

    pub fn set_temporarily_offline(&self, offline: bool) {
        self.lock().temporarily_offline = offline;
    }

    /// Flag the agent for reclamation. Also interrupts a pending phone-home
    /// wait, since nobody will use the agent anyway.
    pub fn set_pending_delete(&self, pending: bool) {
        let changed = {
            let mut state = self.lock();
            let changed = state.pending_delete != pending;
            state.pending_delete = pending;
            changed
        };
        if pending {
            self.phone_home.interrupt();
        }
        if changed {
            debug!(agent = %self.name, pending_delete = pending, "Pending delete updated");
        }
    }

    pub fn is_pending_delete(&self) -> bool {
        self.lock().pending_delete
    }

    fn lock(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ManagedAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedAgent")
            .field("name", &self.name)
            .field("cloud", &self.node.cloud_name)
            .field("node_id", &self.node.node_id())
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

/// All agents this controller manages, by name.
#[derive(Debug, Default)]
pub struct AgentInventory {
    agents: RwLock<HashMap<String, Arc<ManagedAgent>>>,
}

impl AgentInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an agent, returning any agent it replaced.
    pub fn register(&self, agent: Arc<ManagedAgent>) -> Option<Arc<ManagedAgent>> {
        self.write().insert(agent.name().to_string(), agent)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ManagedAgent>> {
        self.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ManagedAgent>> {
        self.write().remove(name)
    }

    pub fn list(&self) -> Vec<Arc<ManagedAgent>> {
        let mut agents: Vec<_> = self.read().values().cloned().collect();
        agents.sort_by(|a, b| a.name().cmp(b.name()));
        agents
    }

    pub fn pending_delete(&self) -> Vec<Arc<ManagedAgent>> {
        self.list()
            .into_iter()
            .filter(|a| a.is_pending_delete())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ManagedAgent>>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ManagedAgent>>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::driver::{NodeMetadata, NodeStatus};
    use crate::phone_home::PhoneHomeState;
    use crate::plan::Disposal;

    pub(crate) fn running_node(cloud: &str, name: &str) -> RunningNode {
        RunningNode {
            cloud_name: cloud.to_string(),
            template_name: "builder".to_string(),
            disposal: Disposal::Destroy,
            node: NodeMetadata {
                id: format!("i-{name}"),
                name: name.to_string(),
                group: "builder".to_string(),
                status: NodeStatus::Running,
                public_addresses: vec![],
                private_addresses: vec![],
            },
        }
    }

    pub(crate) fn agent(cloud: &str, name: &str, now: DateTime<Utc>) -> Arc<ManagedAgent> {
        Arc::new(ManagedAgent::new(
            running_node(cloud, name),
            RetentionTime::Inherit,
            Arc::new(PhoneHomeMonitor::new(0)),
            now,
        ))
    }

    #[test]
    fn test_check_guard_is_exclusive() {
        let a = agent("aws", "builder-1", Utc::now());
        let guard = a.try_begin_check().unwrap();
        assert!(a.try_begin_check().is_none());
        assert!(a.is_checking());
        drop(guard);
        assert!(a.try_begin_check().is_some());
    }

    #[test]
    fn test_task_tracking_updates_idle_since() {
        let start = Utc::now();
        let a = agent("aws", "builder-1", start);
        a.connect(2, start);

        a.task_started();
        assert!(!a.snapshot().is_idle());

        let later = start + chrono::Duration::minutes(3);
        a.task_finished(later);
        let state = a.snapshot();
        assert!(state.is_idle());
        assert_eq!(state.idle_since, later);
    }

    #[test]
    fn test_pending_delete_interrupts_phone_home() {
        let a = agent("aws", "builder-1", Utc::now());
        a.phone_home().activate(["builder-1"], 0).unwrap();

        a.set_pending_delete(true);
        assert!(a.is_pending_delete());
        assert_eq!(a.phone_home().state(), PhoneHomeState::Interrupted);
    }

    #[test]
    fn test_inventory_pending_delete_filter() {
        let inventory = AgentInventory::new();
        let now = Utc::now();
        let a = agent("aws", "builder-1", now);
        let b = agent("aws", "builder-2", now);
        inventory.register(Arc::clone(&a));
        inventory.register(Arc::clone(&b));

        b.set_pending_delete(true);
        let flagged = inventory.pending_delete();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].name(), "builder-2");

        assert!(inventory.remove("builder-2").is_some());
        assert_eq!(inventory.len(), 1);
    }
}
