//! Supplemental instances for the lifetime of one build.
//!
//! A build asks for a set of nodes up front, gets their addresses as an
//! environment variable, and tears every one of them down when it finishes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use cloudfleet_id::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::clouds::{CapacityError, CloudRegistry};
use crate::ledger::{TerminationReport, Terminator};
use crate::phone_home::{PhoneHomeError, PhoneHomeMonitor, PhoneHomeRegistry};
use crate::plan::{Disposal, NodePlan, RunningNode};
use crate::provision::{Provisioner, ProvisioningFailure};

/// Environment variable carrying the comma-joined instance addresses.
pub const IPS_ENV_VAR: &str = "CLOUDFLEET_IPS";

/// One line of a supplemental instance request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstancesToRun {
    pub cloud: String,
    pub template: String,
    pub count: usize,
    /// What to do with the nodes when the build ends; the template's policy
    /// if unset.
    #[serde(default)]
    pub disposal: Option<Disposal>,
}

impl InstancesToRun {
    pub fn new(cloud: &str, template: &str, count: usize) -> Self {
        Self {
            cloud: cloud.to_string(),
            template: template.to_string(),
            count,
            disposal: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error("template {template} not found in cloud {cloud}")]
    UnknownTemplate { cloud: String, template: String },

    #[error(transparent)]
    Provision(#[from] ProvisioningFailure),

    /// The batch has already been torn down.
    #[error("supplemental instances did not phone home: {0}")]
    PhoneHome(#[source] PhoneHomeError),
}

pub struct SupplementalInstances {
    clouds: Arc<CloudRegistry>,
    provisioner: Arc<Provisioner>,
    phone_home: Arc<PhoneHomeRegistry>,
}

impl SupplementalInstances {
    pub fn new(
        clouds: Arc<CloudRegistry>,
        provisioner: Arc<Provisioner>,
        phone_home: Arc<PhoneHomeRegistry>,
    ) -> Self {
        Self {
            clouds,
            provisioner,
            phone_home,
        }
    }

    /// Provision everything in `requests` as one batch.
    pub async fn set_up(&self, requests: &[InstancesToRun]) -> Result<BuildEnvironment, SessionError> {
        self.validate_instance_caps(requests).await?;
        let plans = self.plan(requests)?;

        let nodes = self.provisioner.provision(&plans).await?;
        let terminator = Arc::clone(self.provisioner.terminator());

        let monitors = match self.wait_phone_home(&nodes).await {
            Ok(monitors) => monitors,
            Err(e) => {
                error!(error = %e, nodes = nodes.len(), "Phone home failed, tearing down supplemental instances");
                let report = terminator.terminate(&nodes).await;
                if !report.is_clean() {
                    error!(failed = report.failures.len(), "Teardown after phone-home failure incomplete");
                }
                return Err(SessionError::PhoneHome(e));
            }
        };

        let addresses = self.addresses(&nodes);
        info!(nodes = nodes.len(), addresses = %addresses.join(","), "Supplemental instances ready");

        Ok(BuildEnvironment {
            nodes,
            addresses,
            monitors,
            terminator,
            phone_home: Arc::clone(&self.phone_home),
        })
    }

    async fn validate_instance_caps(&self, requests: &[InstancesToRun]) -> Result<(), SessionError> {
        let mut per_cloud: BTreeMap<&str, usize> = BTreeMap::new();
        for request in requests {
            *per_cloud.entry(request.cloud.as_str()).or_default() += request.count;
        }
        for (cloud, requested) in per_cloud {
            self.clouds.ensure_capacity(cloud, requested).await?;
        }
        Ok(())
    }

    /// Resolve every template before anything is created.
    fn plan(&self, requests: &[InstancesToRun]) -> Result<Vec<NodePlan>, SessionError> {
        requests
            .iter()
            .map(|request| {
                let unknown = || SessionError::UnknownTemplate {
                    cloud: request.cloud.clone(),
                    template: request.template.clone(),
                };
                let template = self
                    .clouds
                    .template(&request.cloud, &request.template)
                    .ok_or_else(unknown)?;
                let supplier = self
                    .clouds
                    .supplier(&request.cloud, &request.template)
                    .ok_or_else(unknown)?;
                Ok(NodePlan::new(
                    &request.cloud,
                    &request.template,
                    request.count,
                    request.disposal.unwrap_or(template.disposal),
                    supplier,
                ))
            })
            .collect()
    }

    /// Wait for every node whose template asks for it, one monitor per
    /// distinct timeout. Templates without a timeout are not waited for, so
    /// a build can never hang on a node that never reports.
    async fn wait_phone_home(
        &self,
        nodes: &[RunningNode],
    ) -> Result<Vec<Arc<PhoneHomeMonitor>>, PhoneHomeError> {
        let mut by_timeout: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        for node in nodes {
            let Some(template) = self.clouds.template(&node.cloud_name, &node.template_name) else {
                continue;
            };
            if template.wait_phone_home && template.phone_home_timeout_minutes > 0 {
                by_timeout
                    .entry(template.phone_home_timeout_minutes)
                    .or_default()
                    .push(node.node.name.clone());
            }
        }

        let mut monitors = Vec::with_capacity(by_timeout.len());
        for (timeout, names) in by_timeout {
            let monitor = Arc::new(PhoneHomeMonitor::new(timeout));
            self.phone_home.register(Arc::clone(&monitor));
            monitors.push(Arc::clone(&monitor));
            if let Err(e) = monitor.wait_for_phone_home_async(names) {
                self.abort(&monitors);
                return Err(e);
            }
        }

        for monitor in &monitors {
            if let Err(e) = monitor.join().await {
                self.abort(&monitors);
                return Err(e);
            }
        }
        for monitor in &monitors {
            self.phone_home.unregister(monitor);
        }
        Ok(monitors)
    }

    fn abort(&self, monitors: &[Arc<PhoneHomeMonitor>]) {
        for monitor in monitors {
            monitor.interrupt();
            self.phone_home.unregister(monitor);
        }
    }

    fn addresses(&self, nodes: &[RunningNode]) -> Vec<String> {
        nodes
            .iter()
            .filter_map(|node| {
                let template = self.clouds.template(&node.cloud_name, &node.template_name)?;
                let address = template.connection_address(&node.node);
                if address.is_none() {
                    warn!(node_id = %node.node_id(), "Node has no address");
                }
                address
            })
            .collect()
    }
}

/// Nodes held by one build.
pub struct BuildEnvironment {
    nodes: Vec<RunningNode>,
    addresses: Vec<String>,
    monitors: Vec<Arc<PhoneHomeMonitor>>,
    terminator: Arc<Terminator>,
    phone_home: Arc<PhoneHomeRegistry>,
}

impl BuildEnvironment {
    pub fn nodes(&self) -> &[RunningNode] {
        &self.nodes
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Variables to add to the build's environment.
    pub fn env_vars(&self) -> HashMap<String, String> {
        HashMap::from([(IPS_ENV_VAR.to_string(), self.addresses.join(","))])
    }

    /// Terminate every node, each with its own disposal.
    pub async fn tear_down(self) -> TerminationReport {
        for monitor in &self.monitors {
            monitor.interrupt();
            self.phone_home.unregister(monitor);
        }
        info!(nodes = self.nodes.len(), "Tearing down supplemental instances");
        self.terminator.terminate(&self.nodes).await
    }
}

/// Build environments that are set up and not yet torn down.
#[derive(Default)]
pub struct BuildSessions {
    sessions: Mutex<HashMap<SessionId, BuildEnvironment>>,
}

impl BuildSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, env: BuildEnvironment) -> SessionId {
        let id = SessionId::new();
        self.lock().insert(id, env);
        id
    }

    /// Remove a session so it can be torn down. Only one caller gets it.
    pub fn take(&self, id: &SessionId) -> Option<BuildEnvironment> {
        self.lock().remove(id)
    }

    /// Remove every session, for teardown at shutdown.
    pub fn drain(&self) -> Vec<(SessionId, BuildEnvironment)> {
        self.lock().drain().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, BuildEnvironment>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
