use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HealthState {
    Healthy,
    Unhealthy { since: Instant },
}

impl HealthState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthState::Healthy)
    }

    /// How long the state has been unhealthy, zero when healthy.
    pub fn unhealthy_for(&self) -> Duration {
        match self {
            HealthState::Healthy => Duration::ZERO,
            HealthState::Unhealthy { since } => since.elapsed(),
        }
    }

    pub fn probe(&self) -> Probe {
        Probe {
            ok: self.is_healthy(),
        }
    }
}

/// Body of the health endpoint.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
pub struct Probe {
    pub ok: bool,
}

#[derive(Debug)]
struct Inner {
    state: HealthState,
    last_cycle: u64,
}

/// Single owner of a [`HealthState`].
///
/// Reports are tagged with the cycle sequence number that produced them, a report older
/// than the last recorded one is dropped so a late success can't hide a newer failure.
#[derive(Debug)]
pub struct HealthMonitor {
    inner: Mutex<Inner>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// A fresh monitor is unhealthy until the first successful cycle.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: HealthState::Unhealthy {
                    since: Instant::now(),
                },
                last_cycle: 0,
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.lock().state
    }

    pub fn unhealthy_for(&self) -> Duration {
        self.state().unhealthy_for()
    }

    /// Record the outcome of cycle `cycle`. Returns false when the report was stale.
    pub fn record_cycle(&self, cycle: u64, success: bool) -> bool {
        let mut inner = self.lock();

        if cycle <= inner.last_cycle {
            warn!(cycle, last_cycle = inner.last_cycle, "ignore stale cycle report");

            return false;
        }

        inner.last_cycle = cycle;

        match (inner.state, success) {
            (HealthState::Unhealthy { since }, true) => {
                info!(cycle, unhealthy_for = ?since.elapsed(), "health restored");

                inner.state = HealthState::Healthy;
            }

            (HealthState::Healthy, false) => {
                warn!(cycle, "became unhealthy");

                inner.state = HealthState::Unhealthy {
                    since: Instant::now(),
                };
            }

            // unhealthy stays unhealthy with the original timestamp
            _ => {}
        }

        true
    }

    /// Mark unhealthy outside of a cycle, e.g. when the controller stops.
    pub fn mark_unhealthy(&self) {
        let mut inner = self.lock();

        if inner.state.is_healthy() {
            inner.state = HealthState::Unhealthy {
                since: Instant::now(),
            };
        }
    }

    pub fn mark_healthy(&self) {
        self.lock().state = HealthState::Healthy;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // the guarded data is plain state, a poisoned lock still holds a valid value
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
