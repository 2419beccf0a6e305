//! Launching single managed agents.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentInventory, ManagedAgent};
use crate::clock::Clock;
use crate::clouds::{CapacityError, CloudRegistry};
use crate::phone_home::{PhoneHomeError, PhoneHomeMonitor, PhoneHomeRegistry};
use crate::plan::NodePlan;
use crate::provision::{Provisioner, ProvisioningFailure};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("template {template} not found in cloud {cloud}")]
    UnknownTemplate { cloud: String, template: String },

    #[error(transparent)]
    Capacity(#[from] CapacityError),

    #[error(transparent)]
    Provision(#[from] ProvisioningFailure),

    /// The agent is registered and flagged pending-delete.
    #[error("agent {agent} did not phone home: {source}")]
    PhoneHome {
        agent: String,
        #[source]
        source: PhoneHomeError,
    },

    /// The agent is registered and kept for the cloud's error retention.
    #[error("agent {agent} has no address to connect to")]
    NoAddress { agent: String },
}

pub struct AgentLauncher {
    clouds: Arc<CloudRegistry>,
    provisioner: Arc<Provisioner>,
    inventory: Arc<AgentInventory>,
    phone_home: Arc<PhoneHomeRegistry>,
    clock: Arc<dyn Clock>,
}

impl AgentLauncher {
    pub fn new(
        clouds: Arc<CloudRegistry>,
        provisioner: Arc<Provisioner>,
        inventory: Arc<AgentInventory>,
        phone_home: Arc<PhoneHomeRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            clouds,
            provisioner,
            inventory,
            phone_home,
            clock,
        }
    }

    /// Provision one node from `template`, wait for it to phone home if the
    /// template asks for that, and bring it online.
    pub async fn launch(&self, cloud: &str, template: &str) -> Result<Arc<ManagedAgent>, LaunchError> {
        let unknown = || LaunchError::UnknownTemplate {
            cloud: cloud.to_string(),
            template: template.to_string(),
        };
        let spec = self.clouds.template(cloud, template).ok_or_else(unknown)?.clone();
        let supplier = self.clouds.supplier(cloud, template).ok_or_else(unknown)?;

        self.clouds.ensure_capacity(cloud, 1).await?;

        let plan = NodePlan::new(cloud, template, 1, spec.disposal, supplier);
        let mut nodes = self.provisioner.provision(std::slice::from_ref(&plan)).await?;
        // A successful batch of one holds exactly one node.
        let node = nodes.pop().ok_or_else(unknown)?;

        let address = spec.connection_address(&node.node);
        let monitor = Arc::new(PhoneHomeMonitor::new(spec.phone_home_timeout_minutes));
        let agent = Arc::new(ManagedAgent::new(
            node,
            spec.retention_minutes,
            Arc::clone(&monitor),
            self.clock.now(),
        ));
        self.inventory.register(Arc::clone(&agent));
        info!(agent = %agent.name(), cloud = %cloud, template = %template, "Agent provisioned");

        if spec.wait_phone_home {
            agent.set_waiting_for_phone_home(true);
            self.phone_home.register(Arc::clone(&monitor));
            let waited = match monitor.activate([agent.name()], spec.phone_home_timeout_minutes) {
                Ok(()) => monitor.wait_for_phone_home().await,
                Err(e) => Err(e),
            };
            self.phone_home.unregister(&monitor);
            agent.set_waiting_for_phone_home(false);

            if let Err(source) = waited {
                warn!(agent = %agent.name(), error = %source, "Phone home failed, flagging agent for deletion");
                agent.set_pending_delete(true);
                return Err(LaunchError::PhoneHome {
                    agent: agent.name().to_string(),
                    source,
                });
            }
        }

        let Some(address) = address else {
            warn!(agent = %agent.name(), "No connection address, marking launch failed");
            agent.mark_launch_failed(self.clock.now());
            return Err(LaunchError::NoAddress {
                agent: agent.name().to_string(),
            });
        };

        agent.connect(spec.executors, self.clock.now());
        info!(agent = %agent.name(), address = %address, "Agent launched");
        Ok(agent)
    }
}
