//! Phone-home readiness handshake.
//!
//! A freshly created node runs its bootstrap and then calls back ("phones
//! home") with its host name. A [`PhoneHomeMonitor`] holds the set of names
//! still expected and lets exactly one caller wait until all of them have
//! reported, the deadline passes, or the wait is interrupted.
//!
//! State lives in a `tokio::sync::watch` channel: mutators update it from any
//! thread and the waiter wakes on every change. Rings that reach a monitor
//! before it is activated are remembered, so a monitor can be registered
//! with the endpoint first and activated once the node names are known.

use std::collections::BTreeSet;
use std::future::pending;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a waiter reports the names it is still waiting for.
pub const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhoneHomeState {
    Idle,
    Waiting {
        targets: BTreeSet<String>,
        timeout_minutes: u32,
    },
    Satisfied,
    /// `targets` are the names that never phoned home.
    TimedOut {
        targets: Vec<String>,
        timeout_minutes: u32,
    },
    Interrupted,
}

impl PhoneHomeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Satisfied | Self::TimedOut { .. } | Self::Interrupted
        )
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PhoneHomeError {
    #[error("timed out after {timeout_minutes} minute(s) waiting for phone home from {}", .targets.join(", "))]
    Timeout {
        targets: Vec<String>,
        timeout_minutes: u32,
    },

    #[error("phone-home wait interrupted")]
    Interrupted,

    #[error("phone-home targets must be non-empty names")]
    InvalidTargets,

    #[error("a phone-home wait is already active")]
    AlreadyWaiting,
}

pub struct PhoneHomeMonitor {
    state: watch::Sender<PhoneHomeState>,
    timeout_minutes: u32,
    /// Names rung while idle. Only touched with the state locked.
    early: Mutex<BTreeSet<String>>,
    background: Mutex<Option<JoinHandle<Result<(), PhoneHomeError>>>>,
}

impl PhoneHomeMonitor {
    /// `timeout_minutes` is used by [`Self::wait_for_phone_home_async`]; 0
    /// waits forever.
    pub fn new(timeout_minutes: u32) -> Self {
        let (state, _) = watch::channel(PhoneHomeState::Idle);
        Self {
            state,
            timeout_minutes,
            early: Mutex::new(BTreeSet::new()),
            background: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PhoneHomeState {
        self.state.borrow().clone()
    }

    /// Names that have not phoned home yet.
    pub fn remaining(&self) -> Vec<String> {
        match &*self.state.borrow() {
            PhoneHomeState::Waiting { targets, .. } => targets.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Start expecting `targets`. Names that already rang while the monitor
    /// was idle count as arrived. An interrupted monitor stays interrupted.
    pub fn activate<I, S>(&self, targets: I, timeout_minutes: u32) -> Result<(), PhoneHomeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: BTreeSet<String> = targets.into_iter().map(Into::into).collect();
        if targets.is_empty() || targets.iter().any(|t| t.is_empty()) {
            return Err(PhoneHomeError::InvalidTargets);
        }

        let mut result = Ok(());
        self.state.send_if_modified(|state| match state {
            PhoneHomeState::Waiting { .. } => {
                result = Err(PhoneHomeError::AlreadyWaiting);
                false
            }
            PhoneHomeState::Interrupted => {
                result = Err(PhoneHomeError::Interrupted);
                false
            }
            _ => {
                let mut early = self.lock_early();
                let mut targets = targets.clone();
                targets.retain(|t| !early.contains(t));
                early.clear();

                if targets.is_empty() {
                    debug!("Every target phoned home before the wait started");
                    *state = PhoneHomeState::Satisfied;
                } else {
                    debug!(targets = ?targets, timeout_minutes, "Waiting for phone home");
                    *state = PhoneHomeState::Waiting {
                        targets,
                        timeout_minutes,
                    };
                }
                true
            }
        });
        result
    }

    /// Record that `name` phoned home. Returns true if an active wait was
    /// expecting it; an idle monitor keeps the name for its activation.
    pub fn ring(&self, name: &str) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, PhoneHomeState::Idle) {
                self.lock_early().insert(name.to_string());
                return false;
            }
            let PhoneHomeState::Waiting { targets, .. } = state else {
                return false;
            };
            if !targets.remove(name) {
                return false;
            }
            debug!(name = %name, remaining = targets.len(), "Phone home received");
            if targets.is_empty() {
                *state = PhoneHomeState::Satisfied;
            }
            true
        })
    }

    /// Satisfy the wait regardless of who is still missing.
    pub fn ring_all(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, PhoneHomeState::Waiting { .. }) {
                *state = PhoneHomeState::Satisfied;
                true
            } else {
                false
            }
        })
    }

    /// Cancel the wait. The nodes themselves are untouched.
    pub fn interrupt(&self) {
        self.state.send_if_modified(|state| match state {
            PhoneHomeState::Idle | PhoneHomeState::Waiting { .. } => {
                *state = PhoneHomeState::Interrupted;
                true
            }
            _ => false,
        });
    }

    /// Wait until every target phoned home.
    ///
    /// Returns immediately if the monitor was never activated. The deadline
    /// is measured from this call.
    pub async fn wait_for_phone_home(&self) -> Result<(), PhoneHomeError> {
        let mut rx = self.state.subscribe();
        let started = Instant::now();

        let timeout_minutes = match &*rx.borrow_and_update() {
            PhoneHomeState::Waiting {
                timeout_minutes, ..
            } => *timeout_minutes,
            other => return Self::outcome(other),
        };
        let deadline = (timeout_minutes > 0)
            .then(|| started + Duration::from_secs(u64::from(timeout_minutes) * 60));
        let mut progress = tokio::time::interval_at(
            started + PROGRESS_LOG_INTERVAL,
            PROGRESS_LOG_INTERVAL,
        );

        loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => pending::<()>().await,
                }
            };

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(PhoneHomeError::Interrupted);
                    }
                    let state = rx.borrow_and_update();
                    if !matches!(*state, PhoneHomeState::Waiting { .. }) {
                        return Self::outcome(&state);
                    }
                }
                _ = progress.tick() => {
                    info!(
                        remaining = ?self.remaining(),
                        elapsed_secs = started.elapsed().as_secs(),
                        "Still waiting for phone home"
                    );
                }
                () = expired => {
                    let mut missing = Vec::new();
                    let timed_out = self.state.send_if_modified(|state| {
                        if let PhoneHomeState::Waiting { targets, .. } = state {
                            missing = targets.iter().cloned().collect();
                            *state = PhoneHomeState::TimedOut {
                                targets: missing.clone(),
                                timeout_minutes,
                            };
                            true
                        } else {
                            false
                        }
                    });
                    if timed_out {
                        warn!(missing = ?missing, timeout_minutes, "Phone home timed out");
                        return Err(PhoneHomeError::Timeout {
                            targets: missing,
                            timeout_minutes,
                        });
                    }
                    // Something else finished the wait at the same instant.
                    return Self::outcome(&self.state.borrow());
                }
            }
        }
    }

    /// Activate with this monitor's timeout and wait on a background task.
    /// Collect the result with [`Self::join`].
    pub fn wait_for_phone_home_async<I, S>(self: &Arc<Self>, targets: I) -> Result<(), PhoneHomeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activate(targets, self.timeout_minutes)?;
        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move { monitor.wait_for_phone_home().await });
        *self.lock_background() = Some(handle);
        Ok(())
    }

    /// Wait for the background wait started by
    /// [`Self::wait_for_phone_home_async`], or wait inline if there is none.
    pub async fn join(&self) -> Result<(), PhoneHomeError> {
        let handle = self.lock_background().take();
        match handle {
            Some(handle) => handle.await.unwrap_or(Err(PhoneHomeError::Interrupted)),
            None => self.wait_for_phone_home().await,
        }
    }

    fn outcome(state: &PhoneHomeState) -> Result<(), PhoneHomeError> {
        match state {
            PhoneHomeState::Idle | PhoneHomeState::Satisfied => Ok(()),
            PhoneHomeState::Interrupted => Err(PhoneHomeError::Interrupted),
            PhoneHomeState::TimedOut {
                targets,
                timeout_minutes,
            } => Err(PhoneHomeError::Timeout {
                targets: targets.clone(),
                timeout_minutes: *timeout_minutes,
            }),
            PhoneHomeState::Waiting { .. } => Err(PhoneHomeError::AlreadyWaiting),
        }
    }

    fn lock_early(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.early.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_background(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<JoinHandle<Result<(), PhoneHomeError>>>> {
        self.background.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PhoneHomeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhoneHomeMonitor")
            .field("state", &*self.state.borrow())
            .field("timeout_minutes", &self.timeout_minutes)
            .finish_non_exhaustive()
    }
}

/// Monitors that the phone-home endpoint should ring.
#[derive(Debug, Default)]
pub struct PhoneHomeRegistry {
    monitors: Mutex<Vec<Arc<PhoneHomeMonitor>>>,
}

impl PhoneHomeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, monitor: Arc<PhoneHomeMonitor>) {
        let mut monitors = self.lock();
        if !monitors.iter().any(|m| Arc::ptr_eq(m, &monitor)) {
            monitors.push(monitor);
        }
    }

    pub fn unregister(&self, monitor: &Arc<PhoneHomeMonitor>) {
        self.lock().retain(|m| !Arc::ptr_eq(m, monitor));
    }

    /// Ring `name` on every registered monitor and drop finished ones.
    /// Returns how many monitors were expecting it.
    pub fn ring(&self, name: &str) -> usize {
        let mut monitors = self.lock();
        let rung = monitors.iter().filter(|m| m.ring(name)).count();
        monitors.retain(|m| !m.state().is_terminal());
        rung
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PhoneHomeMonitor>>> {
        self.monitors.lock().unwrap_or_else(|e| e.into_inner())
    }
}
