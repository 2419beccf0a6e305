//! Idle-based reclamation policy.
//!
//! Each managed agent is checked periodically. An agent that has been idle
//! longer than its retention time is taken offline and flagged
//! pending-delete; the cleanup sweeper does the actual termination.
//!
//! Retention resolves in three steps: the per-instance override, then the
//! cloud's setting, then [`DEFAULT_RETENTION_MINUTES`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument};

use crate::agent::{AgentInventory, ManagedAgent};
use crate::clock::Clock;
use crate::clouds::CloudRegistry;

pub const DEFAULT_RETENTION_MINUTES: u32 = 30;

/// Configured retention, as stored in cloud and template settings.
///
/// Serialized as an integer: `-1` (or any negative value) never expires,
/// `0` inherits, a positive value is minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum RetentionTime {
    Never,
    #[default]
    Inherit,
    Minutes(u32),
}

impl From<i32> for RetentionTime {
    fn from(value: i32) -> Self {
        match value {
            v if v < 0 => Self::Never,
            0 => Self::Inherit,
            v => Self::Minutes(v.unsigned_abs()),
        }
    }
}

impl From<RetentionTime> for i32 {
    fn from(value: RetentionTime) -> Self {
        match value {
            RetentionTime::Never => -1,
            RetentionTime::Inherit => 0,
            RetentionTime::Minutes(m) => i32::try_from(m).unwrap_or(i32::MAX),
        }
    }
}

impl RetentionTime {
    /// `self` unless it inherits, in which case `fallback`.
    pub fn or(self, fallback: RetentionTime) -> RetentionTime {
        match self {
            Self::Inherit => fallback,
            other => other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Global switch; when false no agent is ever flagged.
    pub enabled: bool,
    pub default_minutes: u32,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_minutes: DEFAULT_RETENTION_MINUTES,
        }
    }
}

/// What a single check decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Another check on the same agent is running; nothing was evaluated.
    InProgress,
    Disabled,
    Busy,
    AlreadyPendingDelete,
    WaitingForPhoneHome,
    NeverExpires,
    /// Idle, but not holding executors yet.
    NotOnline,
    Retained,
    /// Idle retention expired; the agent is now pending delete.
    Flagged,
    /// Error retention after a failed launch expired; pending delete.
    ErrorRetentionExpired,
}

pub struct RetentionStrategy {
    clouds: Arc<CloudRegistry>,
    clock: Arc<dyn Clock>,
    settings: RetentionSettings,
}

impl RetentionStrategy {
    pub fn new(
        clouds: Arc<CloudRegistry>,
        clock: Arc<dyn Clock>,
        settings: RetentionSettings,
    ) -> Self {
        Self {
            clouds,
            clock,
            settings,
        }
    }

    /// Effective idle retention for `agent`.
    pub fn resolve(&self, agent: &ManagedAgent) -> RetentionTime {
        let cloud = self
            .clouds
            .profile(agent.cloud_name())
            .map(|p| p.retention_minutes)
            .unwrap_or_default();
        agent
            .retention()
            .or(cloud)
            .or(RetentionTime::Minutes(self.settings.default_minutes))
    }

    /// Check one agent. Never blocks: if a check of the same agent is
    /// already running, returns [`CheckOutcome::InProgress`] at once.
    pub fn check(&self, agent: &ManagedAgent) -> CheckOutcome {
        let Some(_guard) = agent.try_begin_check() else {
            debug!(agent = %agent.name(), "Retention check already running, skipping");
            return CheckOutcome::InProgress;
        };
        self.evaluate(agent)
    }

    fn evaluate(&self, agent: &ManagedAgent) -> CheckOutcome {
        if !self.settings.enabled {
            return CheckOutcome::Disabled;
        }

        let state = agent.snapshot();
        if state.pending_delete {
            return CheckOutcome::AlreadyPendingDelete;
        }
        if !state.is_idle() {
            return CheckOutcome::Busy;
        }
        if state.waiting_for_phone_home {
            return CheckOutcome::WaitingForPhoneHome;
        }

        if let Some(failed_at) = state.launch_failed_at {
            let minutes = self
                .clouds
                .profile(agent.cloud_name())
                .map(|p| p.error_retention_minutes)
                .unwrap_or(0);
            let failed_for = self.clock.now() - failed_at;
            if failed_for > chrono::Duration::minutes(i64::from(minutes)) {
                info!(
                    agent = %agent.name(),
                    error_retention_minutes = minutes,
                    "Error retention expired, flagging agent for deletion"
                );
                agent.set_pending_delete(true);
                return CheckOutcome::ErrorRetentionExpired;
            }
            return CheckOutcome::Retained;
        }

        let minutes = match self.resolve(agent) {
            RetentionTime::Never => return CheckOutcome::NeverExpires,
            RetentionTime::Minutes(m) => m,
            RetentionTime::Inherit => self.settings.default_minutes,
        };

        if state.executors == 0 {
            return CheckOutcome::NotOnline;
        }

        let idle_for = self.clock.now() - state.idle_since;
        if idle_for <= chrono::Duration::minutes(i64::from(minutes)) {
            return CheckOutcome::Retained;
        }

        info!(
            agent = %agent.name(),
            retention_minutes = minutes,
            idle_secs = idle_for.num_seconds(),
            "Retention time expired, flagging agent for deletion"
        );
        agent.set_temporarily_offline(true);
        agent.set_pending_delete(true);
        CheckOutcome::Flagged
    }
}

/// Runs the retention check over the whole inventory on an interval.
pub struct RetentionWorker {
    strategy: Arc<RetentionStrategy>,
    inventory: Arc<AgentInventory>,
    interval: Duration,
}

impl RetentionWorker {
    pub fn new(
        strategy: Arc<RetentionStrategy>,
        inventory: Arc<AgentInventory>,
        interval: Duration,
    ) -> Self {
        Self {
            strategy,
            inventory,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting retention worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_all();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Retention worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One pass over every agent. Returns how many were flagged.
    pub fn check_all(&self) -> usize {
        let flagged = self
            .inventory
            .list()
            .iter()
            .map(|agent| self.strategy.check(agent))
            .filter(|outcome| {
                matches!(
                    outcome,
                    CheckOutcome::Flagged | CheckOutcome::ErrorRetentionExpired
                )
            })
            .count();
        if flagged > 0 {
            info!(flagged, "Retention pass flagged agents");
        }
        flagged
    }
}
