//! Provisioning plans and the handles they turn into.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::driver::{CloudDriver, DriverError, NodeMetadata};

/// What happens to a node when it is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposal {
    Suspend,
    #[default]
    Destroy,
}

impl std::fmt::Display for Disposal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suspend => f.write_str("suspend"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// Produces one node per call.
#[async_trait]
pub trait NodeSupplier: Send + Sync {
    async fn supply(&self) -> Result<NodeMetadata, DriverError>;
}

/// Supplier that creates nodes from a named template.
pub struct TemplateSupplier {
    driver: Arc<dyn CloudDriver>,
    template: String,
}

impl TemplateSupplier {
    pub fn new(driver: Arc<dyn CloudDriver>, template: &str) -> Self {
        Self {
            driver,
            template: template.to_string(),
        }
    }
}

#[async_trait]
impl NodeSupplier for TemplateSupplier {
    async fn supply(&self) -> Result<NodeMetadata, DriverError> {
        let mut nodes = self.driver.create(&self.template, 1).await?;
        match nodes.len() {
            1 => Ok(nodes.remove(0)),
            0 => Err(DriverError::Api(format!(
                "create of template {} returned no node",
                self.template
            ))),
            _ => Err(DriverError::PartialCreate {
                requested: 1,
                message: format!(
                    "create of template {} returned {} nodes",
                    self.template,
                    nodes.len()
                ),
                created: nodes,
            }),
        }
    }
}

/// Request for `count` nodes of one template.
#[derive(Clone)]
pub struct NodePlan {
    pub cloud_name: String,
    pub template_name: String,
    pub count: usize,
    pub disposal: Disposal,
    pub supplier: Arc<dyn NodeSupplier>,
}

impl NodePlan {
    pub fn new(
        cloud_name: &str,
        template_name: &str,
        count: usize,
        disposal: Disposal,
        supplier: Arc<dyn NodeSupplier>,
    ) -> Self {
        Self {
            cloud_name: cloud_name.to_string(),
            template_name: template_name.to_string(),
            count,
            disposal,
            supplier,
        }
    }
}

impl std::fmt::Debug for NodePlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePlan")
            .field("cloud_name", &self.cloud_name)
            .field("template_name", &self.template_name)
            .field("count", &self.count)
            .field("disposal", &self.disposal)
            .finish_non_exhaustive()
    }
}

/// A node created by a successful provisioning batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningNode {
    pub cloud_name: String,
    pub template_name: String,
    pub disposal: Disposal,
    pub node: NodeMetadata,
}

impl RunningNode {
    pub fn node_id(&self) -> &str {
        &self.node.id
    }

    /// Same node, torn down with `disposal` instead of its own policy.
    pub fn with_disposal(mut self, disposal: Disposal) -> Self {
        self.disposal = disposal;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockCloudDriver;

    #[tokio::test]
    async fn test_template_supplier_creates_one_node() {
        let driver = Arc::new(MockCloudDriver::new());
        let supplier = TemplateSupplier::new(driver.clone(), "builder");

        let node = supplier.supply().await.unwrap();
        assert_eq!(node.group, "builder");
        assert_eq!(driver.created_count(), 1);
    }

    #[test]
    fn test_disposal_serde() {
        let json = serde_json::to_string(&Disposal::Suspend).unwrap();
        assert_eq!(json, "\"suspend\"");
        assert_eq!(Disposal::default(), Disposal::Destroy);
    }
}
