use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use futures_util::future;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

pub use health::{HealthMonitor, HealthState, Probe};
pub use state::ControllerState;
pub use updater::Updater;

use crate::error::{Error, FailureReason, UpdaterFailure};
use crate::feed::SnapshotFeed;
use crate::metrics::Metrics;
use crate::snapshot::IngressSnapshot;

mod health;
mod state;
mod updater;

pub struct ControllerConfig {
    pub feed: SnapshotFeed,
    /// Started in this order, stopped in reverse.
    pub updaters: Vec<Arc<dyn Updater>>,
    /// Upper bound of a single `Updater::update` call.
    pub update_deadline: Duration,
    /// How often to reconcile when the snapshot doesn't change.
    pub resync_interval: Duration,
}

struct CycleLoop {
    stop: oneshot::Sender<()>,
    task: JoinHandle<SnapshotFeed>,
}

struct Lifecycle {
    feed: Option<SnapshotFeed>,
    cycle_loop: Option<CycleLoop>,
}

/// Drives reconcile cycles over a fixed, ordered set of [`Updater`]s.
pub struct Controller {
    updaters: Arc<Vec<Arc<dyn Updater>>>,
    health: Arc<HealthMonitor>,
    state: StdMutex<ControllerState>,
    // serializes start and stop
    lifecycle: Mutex<Lifecycle>,
    update_deadline: Duration,
    resync_interval: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Controller {
    pub fn new(config: ControllerConfig) -> Result<Self, Error> {
        let ControllerConfig {
            feed,
            updaters,
            update_deadline,
            resync_interval,
        } = config;

        if updaters.is_empty() {
            return Err(Error::construction("at least one updater is required"));
        }

        if update_deadline.is_zero() {
            return Err(Error::construction("update deadline must be positive"));
        }

        if resync_interval.is_zero() {
            return Err(Error::construction("resync interval must be positive"));
        }

        Ok(Self {
            updaters: Arc::new(updaters),
            health: Arc::new(HealthMonitor::new()),
            state: StdMutex::new(ControllerState::Created),
            lifecycle: Mutex::new(Lifecycle {
                feed: Some(feed),
                cycle_loop: None,
            }),
            update_deadline,
            resync_interval,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);

        self
    }

    pub fn state(&self) -> ControllerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Aggregated health of the last completed cycle, never triggers a cycle.
    pub fn health(&self) -> HealthState {
        self.health.state()
    }

    /// Health as reported by each updater, in registration order.
    pub fn updater_health(&self) -> Vec<(String, HealthState)> {
        self.updaters
            .iter()
            .map(|updater| (updater.name().to_string(), updater.health()))
            .collect()
    }

    #[instrument(err, skip(self))]
    pub async fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state != ControllerState::Created {
            return Err(Error::InvalidState {
                operation: "start",
                state,
            });
        }

        self.set_state(ControllerState::Starting);

        for (index, updater) in self.updaters.iter().enumerate() {
            if let Err(err) = updater.start().await {
                error!(updater = updater.name(), %err, "start updater failed, abort startup");

                let started = &self.updaters[..index];
                for failure in stop_updaters(started).await {
                    warn!(%failure, "stop started updater after startup failure failed");
                }

                if let Some(mut feed) = lifecycle.feed.take() {
                    feed.release();
                }

                self.set_state(ControllerState::Stopped);

                return Err(Error::Startup {
                    updater: updater.name().to_string(),
                    source: err,
                });
            }

            info!(updater = updater.name(), "updater started");
        }

        let feed = match lifecycle.feed.take() {
            Some(feed) => feed,
            None => {
                self.set_state(ControllerState::Stopped);

                return Err(Error::construction("snapshot feed is already released"));
            }
        };

        let (stop, stop_receiver) = oneshot::channel();
        let cycles = Cycles {
            updaters: self.updaters.clone(),
            health: self.health.clone(),
            update_deadline: self.update_deadline,
            metrics: self.metrics.clone(),
        };

        let task = tokio::spawn(
            cycles
                .run(feed, self.resync_interval, stop_receiver)
                .instrument(info_span!("reconcile loop")),
        );

        lifecycle.cycle_loop = Some(CycleLoop { stop, task });

        self.set_state(ControllerState::Running);

        info!(updaters = self.updaters.len(), "controller running");

        Ok(())
    }

    /// Stop the loop, then every updater in reverse order, then the snapshot watch.
    ///
    /// An in-flight cycle is allowed to finish first. Calling it again is a no-op.
    #[instrument(err, skip(self))]
    pub async fn stop(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ControllerState::Stopping | ControllerState::Stopped => {
                debug!("controller already stopped");

                return Ok(());
            }

            ControllerState::Created => {
                if let Some(mut feed) = lifecycle.feed.take() {
                    feed.release();
                }

                self.set_state(ControllerState::Stopped);

                info!("controller stopped before start");

                return Ok(());
            }

            state @ ControllerState::Starting => {
                return Err(Error::InvalidState {
                    operation: "stop",
                    state,
                });
            }

            ControllerState::Running => {}
        }

        self.set_state(ControllerState::Stopping);

        if let Some(CycleLoop { stop, task }) = lifecycle.cycle_loop.take() {
            // the loop may already be gone, awaiting the task covers both cases
            let _ = stop.send(());

            match task.await {
                Ok(feed) => lifecycle.feed = Some(feed),
                Err(err) => error!(%err, "reconcile loop task failed"),
            }
        }

        info!("reconcile loop stopped");

        let failures = stop_updaters(&self.updaters).await;

        if let Some(mut feed) = lifecycle.feed.take() {
            feed.release();
        }

        self.health.mark_unhealthy();
        self.set_state(ControllerState::Stopped);

        if failures.is_empty() {
            info!("controller stopped");

            Ok(())
        } else {
            Err(Error::Shutdown(failures))
        }
    }

    fn set_state(&self, next: ControllerState) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !state.can_transition_to(next) {
            error!(current = %*state, %next, "unexpected controller state transition");
        }

        debug!(from = %*state, to = %next, "controller state changed");

        *state = next;
    }
}

async fn stop_updaters(updaters: &[Arc<dyn Updater>]) -> Vec<UpdaterFailure> {
    let mut failures = vec![];

    for updater in updaters.iter().rev() {
        match updater.stop().await {
            Ok(()) => info!(updater = updater.name(), "updater stopped"),

            Err(err) => {
                error!(updater = updater.name(), %err, "stop updater failed");

                failures.push(UpdaterFailure::new(
                    updater.name(),
                    FailureReason::Failed(err),
                ));
            }
        }
    }

    failures
}

/// State owned by the background reconcile loop.
struct Cycles {
    updaters: Arc<Vec<Arc<dyn Updater>>>,
    health: Arc<HealthMonitor>,
    update_deadline: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Cycles {
    async fn run(
        self,
        mut feed: SnapshotFeed,
        resync_interval: Duration,
        mut stop: oneshot::Receiver<()>,
    ) -> SnapshotFeed {
        let mut resync = time::interval(resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycle = 0u64;

        loop {
            let next = tokio::select! {
                biased;

                _ = &mut stop => {
                    info!("stop requested, leave reconcile loop");

                    break;
                }

                next = feed.next(&mut resync) => next,
            };

            cycle += 1;
            let started = Instant::now();

            let result = match next {
                Ok(snapshot) => self.run_cycle(cycle, snapshot).await,

                Err(err) => Err(Error::Cycle(vec![UpdaterFailure::new(
                    "snapshot-feed",
                    FailureReason::Failed(err.into()),
                )])),
            };

            let success = result.is_ok();
            self.health.record_cycle(cycle, success);

            if let Some(metrics) = &self.metrics {
                metrics.observe_cycle(success, started.elapsed());

                if let Err(Error::Cycle(failures)) = &result {
                    for failure in failures {
                        metrics.updater_failed(&failure.updater);
                    }
                }
            }

            match result {
                Ok(()) => debug!(cycle, elapsed = ?started.elapsed(), "cycle finished"),
                Err(err) => error!(cycle, %err, "cycle failed"),
            }
        }

        feed
    }

    #[instrument(skip(self, snapshot), fields(version = snapshot.version(), entries = snapshot.len()))]
    async fn run_cycle(&self, cycle: u64, snapshot: Arc<IngressSnapshot>) -> Result<(), Error> {
        let calls = self.updaters.iter().map(|updater| {
            call_update(updater.clone(), snapshot.clone(), self.update_deadline)
        });

        let failures = future::join_all(calls)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect::<Vec<_>>();

        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            warn!(cycle, %failure, timed_out = failure.is_timeout(), "updater failed");
        }

        Err(Error::Cycle(failures))
    }
}

/// Run one update on its own task, so a panic or an overrun only affects this updater.
async fn call_update(
    updater: Arc<dyn Updater>,
    snapshot: Arc<IngressSnapshot>,
    deadline: Duration,
) -> Result<(), UpdaterFailure> {
    let name = updater.name().to_string();
    let span = info_span!("update", updater = %name);

    let mut task = tokio::spawn(async move { updater.update(&snapshot).await }.instrument(span));

    match time::timeout(deadline, &mut task).await {
        Ok(Ok(Ok(()))) => Ok(()),

        Ok(Ok(Err(err))) => Err(UpdaterFailure::new(name, FailureReason::Failed(err))),

        Ok(Err(err)) => Err(UpdaterFailure::new(
            name,
            FailureReason::Panicked(err.to_string()),
        )),

        Err(_) => {
            task.abort();

            // wait until the abandoned call is really gone
            let _ = task.await;

            Err(UpdaterFailure::new(name, FailureReason::TimedOut(deadline)))
        }
    }
}
