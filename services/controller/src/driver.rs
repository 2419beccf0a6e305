//! Cloud driver interface and mock implementation.
//!
//! The driver abstracts the provider's compute API:
//! - Creating nodes from a named template
//! - Querying, suspending and destroying nodes by opaque id
//! - Listing nodes, optionally restricted to a group
//!
//! Provider-specific image, network and credential selection live behind the
//! driver. A mock implementation is provided for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Provider-reported node status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Suspended,
    Terminated,
    Error,
}

/// What the driver knows about a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMetadata {
    /// Opaque provider id; the handle for every later call.
    pub id: String,

    /// Host name; this is what the node's bootstrap reports when it phones home.
    pub name: String,

    /// Group the node was created in (the template name for cloudfleet nodes).
    pub group: String,

    pub status: NodeStatus,
    pub public_addresses: Vec<String>,
    pub private_addresses: Vec<String>,
}

/// Errors returned by a cloud driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Some of the requested nodes were created before the call failed.
    /// The created nodes are live and must be cleaned up by the caller.
    #[error("created {} of {requested} nodes: {message}", created.len())]
    PartialCreate {
        requested: usize,
        created: Vec<NodeMetadata>,
        message: String,
    },

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("operation not supported by this cloud: {0}")]
    Unsupported(&'static str),

    #[error("cloud API error: {0}")]
    Api(String),
}

impl DriverError {
    /// Nodes that exist despite the error.
    pub fn partial_successes(&self) -> &[NodeMetadata] {
        match self {
            Self::PartialCreate { created, .. } => created,
            _ => &[],
        }
    }
}

/// Compute API of one cloud.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Create `count` nodes from the named template.
    async fn create(&self, template: &str, count: usize)
        -> Result<Vec<NodeMetadata>, DriverError>;

    /// Current status of a node, `None` if the provider no longer knows it.
    async fn status(&self, node_id: &str) -> Result<Option<NodeStatus>, DriverError>;

    /// Suspend a node. Providers without suspend return `Unsupported`.
    async fn suspend(&self, node_id: &str) -> Result<(), DriverError>;

    /// Destroy a node.
    async fn destroy(&self, node_id: &str) -> Result<(), DriverError>;

    /// List nodes, optionally only those in `group`.
    async fn list(&self, group: Option<&str>) -> Result<Vec<NodeMetadata>, DriverError>;
}

/// Mock cloud for testing and development.
///
/// Keeps an in-memory node table and counts every create, suspend and destroy
/// so tests can check that nothing leaks.
pub struct MockCloudDriver {
    node_counter: AtomicU64,
    nodes: Mutex<BTreeMap<String, NodeMetadata>>,

    create_calls: AtomicUsize,
    created: AtomicUsize,
    suspended: AtomicUsize,
    destroys: Mutex<HashMap<String, usize>>,

    /// Number of nodes that may still be created before creates start failing.
    create_budget: Option<AtomicUsize>,
    failing_templates: Mutex<HashSet<String>>,
    failing_destroys: Mutex<HashSet<String>>,
    suspend_supported: bool,
    latency: Duration,
}

impl MockCloudDriver {
    /// Create a mock cloud where every call succeeds.
    pub fn new() -> Self {
        Self {
            node_counter: AtomicU64::new(0),
            nodes: Mutex::new(BTreeMap::new()),
            create_calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
            destroys: Mutex::new(HashMap::new()),
            create_budget: None,
            failing_templates: Mutex::new(HashSet::new()),
            failing_destroys: Mutex::new(HashSet::new()),
            suspend_supported: true,
            latency: Duration::ZERO,
        }
    }

    /// Create a mock cloud that fails all creates.
    pub fn failing() -> Self {
        Self::new().fail_creates_after(0)
    }

    /// Allow `n` nodes to be created; every node after that fails.
    pub fn fail_creates_after(mut self, n: usize) -> Self {
        self.create_budget = Some(AtomicUsize::new(n));
        self
    }

    pub fn fail_template(self, template: &str) -> Self {
        self.lock_failing_templates().insert(template.to_string());
        self
    }

    pub fn without_suspend(mut self) -> Self {
        self.suspend_supported = false;
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Seed a node that exists before the controller starts.
    pub fn with_node(self, id: &str, status: NodeStatus) -> Self {
        self.lock_nodes().insert(
            id.to_string(),
            NodeMetadata {
                id: id.to_string(),
                name: id.to_string(),
                group: "seeded".to_string(),
                status,
                public_addresses: vec![],
                private_addresses: vec![],
            },
        );
        self
    }

    /// Make destroys of `node_id` fail (or succeed again).
    pub fn set_destroy_failure(&self, node_id: &str, failing: bool) {
        let mut failing_destroys = self
            .failing_destroys
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if failing {
            failing_destroys.insert(node_id.to_string());
        } else {
            failing_destroys.remove(node_id);
        }
    }

    /// Nodes that are not terminated.
    pub fn live_count(&self) -> usize {
        self.lock_nodes()
            .values()
            .filter(|n| n.status != NodeStatus::Terminated)
            .count()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn suspended_count(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Total successful destroys.
    pub fn destroyed_count(&self) -> usize {
        self.lock_destroys().values().sum()
    }

    /// Successful destroys of one node.
    pub fn destroy_count(&self, node_id: &str) -> usize {
        self.lock_destroys().get(node_id).copied().unwrap_or(0)
    }

    pub fn node(&self, node_id: &str) -> Option<NodeMetadata> {
        self.lock_nodes().get(node_id).cloned()
    }

    fn lock_nodes(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, NodeMetadata>> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_destroys(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.destroys.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_failing_templates(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.failing_templates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn take_create_permit(&self) -> bool {
        match &self.create_budget {
            None => true,
            Some(budget) => budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok(),
        }
    }

    fn next_node(&self, template: &str) -> NodeMetadata {
        let n = self.node_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("i-{n:08x}");
        NodeMetadata {
            name: format!("{template}-{n:04x}"),
            id,
            group: template.to_string(),
            status: NodeStatus::Running,
            public_addresses: vec![format!("203.0.113.{}", n % 250 + 1)],
            private_addresses: vec![format!("10.0.{}.{}", n / 250, n % 250 + 1)],
        }
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockCloudDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudDriver for MockCloudDriver {
    async fn create(
        &self,
        template: &str,
        count: usize,
    ) -> Result<Vec<NodeMetadata>, DriverError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if self.lock_failing_templates().contains(template) {
            return Err(DriverError::Api(format!(
                "[MOCK] template {template} is configured to fail"
            )));
        }

        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            if !self.take_create_permit() {
                if created.is_empty() {
                    return Err(DriverError::Api("[MOCK] create quota exhausted".to_string()));
                }
                return Err(DriverError::PartialCreate {
                    requested: count,
                    created,
                    message: "[MOCK] create quota exhausted".to_string(),
                });
            }
            let node = self.next_node(template);
            self.lock_nodes().insert(node.id.clone(), node.clone());
            self.created.fetch_add(1, Ordering::SeqCst);
            info!(node_id = %node.id, template = %template, "[MOCK] Node created");
            created.push(node);
        }

        Ok(created)
    }

    async fn status(&self, node_id: &str) -> Result<Option<NodeStatus>, DriverError> {
        self.simulate_latency().await;
        Ok(self.lock_nodes().get(node_id).map(|n| n.status))
    }

    async fn suspend(&self, node_id: &str) -> Result<(), DriverError> {
        self.simulate_latency().await;
        if !self.suspend_supported {
            return Err(DriverError::Unsupported("suspend"));
        }

        let mut nodes = self.lock_nodes();
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| DriverError::NotFound(node_id.to_string()))?;
        node.status = NodeStatus::Suspended;
        self.suspended.fetch_add(1, Ordering::SeqCst);
        debug!(node_id = %node_id, "[MOCK] Node suspended");
        Ok(())
    }

    async fn destroy(&self, node_id: &str) -> Result<(), DriverError> {
        self.simulate_latency().await;
        let failing = self
            .failing_destroys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(node_id);
        if failing {
            return Err(DriverError::Api(format!(
                "[MOCK] destroy of {node_id} is configured to fail"
            )));
        }

        if self.lock_nodes().remove(node_id).is_none() {
            return Err(DriverError::NotFound(node_id.to_string()));
        }
        *self.lock_destroys().entry(node_id.to_string()).or_insert(0) += 1;
        debug!(node_id = %node_id, "[MOCK] Node destroyed");
        Ok(())
    }

    async fn list(&self, group: Option<&str>) -> Result<Vec<NodeMetadata>, DriverError> {
        self.simulate_latency().await;
        Ok(self
            .lock_nodes()
            .values()
            .filter(|n| group.is_none_or(|g| n.group == g))
            .cloned()
            .collect())
    }
}
