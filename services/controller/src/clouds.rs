//! Cloud profiles, templates and the registry that binds them to drivers.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::driver::{CloudDriver, DriverError, NodeMetadata, NodeStatus};
use crate::plan::{Disposal, NodeSupplier, TemplateSupplier};
use crate::pool::WorkerPool;
use crate::retention::RetentionTime;

fn default_instance_cap() -> usize {
    usize::MAX
}

fn default_executors() -> u32 {
    1
}

/// A configured cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudProfile {
    pub name: String,

    /// Idle retention applied to agents whose template does not override it.
    #[serde(default)]
    pub retention_minutes: RetentionTime,

    /// How long an agent whose launch failed is kept around for inspection.
    #[serde(default)]
    pub error_retention_minutes: u32,

    /// Maximum number of running nodes in this cloud.
    #[serde(default = "default_instance_cap")]
    pub instance_cap: usize,

    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
}

impl CloudProfile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            retention_minutes: RetentionTime::Inherit,
            error_retention_minutes: 0,
            instance_cap: default_instance_cap(),
            templates: Vec::new(),
        }
    }

    pub fn template(&self, name: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|t| t.name == name)
    }
}

/// A node template within a cloud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,

    /// Executors an agent from this template offers once online.
    #[serde(default = "default_executors")]
    pub executors: u32,

    /// Per-instance retention override.
    #[serde(default)]
    pub retention_minutes: RetentionTime,

    #[serde(default)]
    pub disposal: Disposal,

    /// Wait for the node's bootstrap to phone home before using it.
    #[serde(default)]
    pub wait_phone_home: bool,

    /// Phone-home deadline; 0 waits forever.
    #[serde(default)]
    pub phone_home_timeout_minutes: u32,

    /// CIDR (`10.0.0.0/8`) or single address the connection address should
    /// match. Falls back to the first public, then first private address.
    #[serde(default)]
    pub preferred_address: Option<String>,
}

impl TemplateSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            executors: default_executors(),
            retention_minutes: RetentionTime::Inherit,
            disposal: Disposal::Destroy,
            wait_phone_home: false,
            phone_home_timeout_minutes: 0,
            preferred_address: None,
        }
    }

    /// Pick the address consumers should connect to.
    pub fn connection_address(&self, node: &NodeMetadata) -> Option<String> {
        if let Some(preferred) = self.preferred_address.as_deref().filter(|p| !p.is_empty()) {
            let matched = node
                .public_addresses
                .iter()
                .chain(node.private_addresses.iter())
                .find(|addr| address_matches(addr, preferred));
            if let Some(addr) = matched {
                return Some(addr.clone());
            }
            debug!(
                node_id = %node.id,
                preferred = %preferred,
                "No address matches preferred range, falling back"
            );
        }

        node.public_addresses
            .first()
            .or_else(|| node.private_addresses.first())
            .cloned()
    }
}

/// Does `addr` fall inside `range` (`a.b.c.d/len`, or a bare address)?
fn address_matches(addr: &str, range: &str) -> bool {
    let (network, prefix_len) = match range.split_once('/') {
        Some((network, len)) => match len.parse::<u32>() {
            Ok(len) => (network, Some(len)),
            Err(_) => return false,
        },
        None => (range, None),
    };

    let (Ok(addr), Ok(network)) = (addr.parse::<IpAddr>(), network.parse::<IpAddr>()) else {
        return false;
    };

    match (addr, network) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let len = prefix_len.unwrap_or(32).min(32);
            let mask = u32::MAX.checked_shl(32 - len).unwrap_or(0);
            u32::from(a) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let len = prefix_len.unwrap_or(128).min(128);
            let mask = u128::MAX.checked_shl(128 - len).unwrap_or(0);
            u128::from(a) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

/// Errors from the instance cap check.
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("unknown cloud: {0}")]
    UnknownCloud(String),

    #[error("instance cap for cloud {cloud} reached ({running} running + {requested} requested > {cap})")]
    CapReached {
        cloud: String,
        running: usize,
        requested: usize,
        cap: usize,
    },

    #[error("could not count nodes in cloud {cloud}: {source}")]
    Driver {
        cloud: String,
        #[source]
        source: DriverError,
    },
}

/// A cloud profile bound to its driver.
#[derive(Clone)]
struct CloudHandle {
    profile: CloudProfile,
    driver: Arc<dyn CloudDriver>,
}

/// All clouds known to this controller, by name.
///
/// Driver calls made by the registry itself go through `pool`.
#[derive(Clone, Default)]
pub struct CloudRegistry {
    clouds: BTreeMap<String, CloudHandle>,
    pool: WorkerPool,
}

impl CloudRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, profile: CloudProfile, driver: Arc<dyn CloudDriver>) {
        self.clouds
            .insert(profile.name.clone(), CloudHandle { profile, driver });
    }

    /// Builder-style `insert`.
    pub fn with_cloud(mut self, profile: CloudProfile, driver: Arc<dyn CloudDriver>) -> Self {
        self.insert(profile, driver);
        self
    }

    /// Share the pool that bounds every other driver call.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn driver(&self, cloud: &str) -> Option<Arc<dyn CloudDriver>> {
        self.clouds.get(cloud).map(|c| Arc::clone(&c.driver))
    }

    pub fn profile(&self, cloud: &str) -> Option<&CloudProfile> {
        self.clouds.get(cloud).map(|c| &c.profile)
    }

    pub fn template(&self, cloud: &str, template: &str) -> Option<&TemplateSpec> {
        self.profile(cloud).and_then(|p| p.template(template))
    }

    /// Supplier creating single nodes from `template` in `cloud`.
    pub fn supplier(&self, cloud: &str, template: &str) -> Option<Arc<dyn NodeSupplier>> {
        let handle = self.clouds.get(cloud)?;
        handle.profile.template(template)?;
        Some(Arc::new(TemplateSupplier::new(
            Arc::clone(&handle.driver),
            template,
        )))
    }

    /// Nodes the provider reports as pending or running.
    pub async fn running_count(&self, cloud: &str) -> Result<usize, CapacityError> {
        let handle = self
            .clouds
            .get(cloud)
            .ok_or_else(|| CapacityError::UnknownCloud(cloud.to_string()))?;
        let nodes = self
            .pool
            .run(handle.driver.list(None))
            .await
            .map_err(|source| CapacityError::Driver {
                cloud: cloud.to_string(),
                source,
            })?;
        Ok(nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Running))
            .count())
    }

    /// Fail if starting `requested` more nodes would exceed the cloud's cap.
    pub async fn ensure_capacity(&self, cloud: &str, requested: usize) -> Result<(), CapacityError> {
        let cap = self
            .profile(cloud)
            .ok_or_else(|| CapacityError::UnknownCloud(cloud.to_string()))?
            .instance_cap;
        if cap == usize::MAX {
            return Ok(());
        }

        let running = self.running_count(cloud).await?;
        if running.saturating_add(requested) > cap {
            warn!(cloud = %cloud, running, requested, cap, "Instance cap reached");
            return Err(CapacityError::CapReached {
                cloud: cloud.to_string(),
                running,
                requested,
                cap,
            });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }
}
