//! cloudfleet controller library.
//!
//! Keeps ephemeral cloud build agents from leaking. Nodes are provisioned in
//! all-or-nothing batches, optionally held until their bootstrap phones home,
//! reclaimed once idle past their retention time, and torn down through a
//! crash-safe termination ledger that is replayed at startup.
//!
//! ## Modules
//!
//! - `provision`: batch provisioning with rollback
//! - `phone_home`: cancellable waits for node bootstrap callbacks
//! - `ledger`: persisted termination intents and startup recovery
//! - `retention`: idle-time reclamation policy
//! - `sweeper`: periodic termination of flagged agents
//! - `session` / `launcher`: per-build supplemental nodes and single agents

pub mod agent;
pub mod api;
pub mod clock;
pub mod clouds;
pub mod config;
pub mod driver;
pub mod launcher;
pub mod ledger;
pub mod phone_home;
pub mod plan;
pub mod pool;
pub mod provision;
pub mod retention;
pub mod session;
pub mod sweeper;

// Re-export commonly used types
pub use agent::{AgentInventory, ManagedAgent};
pub use clouds::{CloudProfile, CloudRegistry, TemplateSpec};
pub use driver::{CloudDriver, DriverError, MockCloudDriver, NodeMetadata, NodeStatus};
pub use ledger::{LedgerStore, StartupRecovery, TerminationLedger, Terminator};
pub use phone_home::{PhoneHomeMonitor, PhoneHomeRegistry};
pub use plan::{Disposal, NodePlan, RunningNode};
pub use provision::{Provisioner, ProvisioningFailure};
pub use retention::{RetentionStrategy, RetentionTime};
pub use session::{BuildEnvironment, InstancesToRun, SupplementalInstances};
pub use sweeper::CleanupSweeper;
