//! Turns termination signals into a bounded [`Controller::stop`].

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info, warn};

use crate::controller::Controller;
use crate::error::Error;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TerminationSignal {
    Terminate,
    Interrupt,
    Requested,
}

impl Display for TerminationSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Terminate => f.write_str("SIGTERM"),
            TerminationSignal::Interrupt => f.write_str("SIGINT"),
            TerminationSignal::Requested => f.write_str("requested"),
        }
    }
}

/// Requests termination without a process signal.
#[derive(Debug, Clone)]
pub struct TerminationHandle {
    requested: Arc<Notify>,
}

impl TerminationHandle {
    pub fn request(&self) {
        self.requested.notify_one();
    }
}

pub struct Termination {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sigint: tokio::signal::unix::Signal,
    requested: Arc<Notify>,
}

impl Termination {
    /// Register the signal handlers, must be called before the controller starts so an
    /// early SIGTERM or SIGINT doesn't kill the process before it is stopped.
    pub fn install() -> anyhow::Result<Self> {
        #[cfg(unix)]
        let (sigterm, sigint) = {
            use tokio::signal::unix::{signal, SignalKind};

            (
                signal(SignalKind::terminate())?,
                signal(SignalKind::interrupt())?,
            )
        };

        Ok(Self {
            #[cfg(unix)]
            sigterm,
            #[cfg(unix)]
            sigint,
            requested: Arc::new(Notify::new()),
        })
    }

    pub fn handle(&self) -> TerminationHandle {
        TerminationHandle {
            requested: self.requested.clone(),
        }
    }

    pub async fn recv(&mut self) -> TerminationSignal {
        #[cfg(unix)]
        let (sigterm, sigint) = (self.sigterm.recv(), self.sigint.recv());

        #[cfg(not(unix))]
        let (sigterm, sigint) = (std::future::pending::<Option<()>>(), async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(%err, "listen ctrl-c failed");

                return None;
            }

            Some(())
        });

        tokio::select! {
            biased;

            _ = self.requested.notified() => TerminationSignal::Requested,

            _ = sigterm => TerminationSignal::Terminate,

            _ = sigint => TerminationSignal::Interrupt,
        }
    }

    /// Wait for a termination signal, then stop `controller` within `grace`.
    ///
    /// Stop failures of single updaters are only logged, running out of `grace` is an
    /// error.
    pub async fn shutdown(
        mut self,
        controller: &Controller,
        grace: Duration,
    ) -> anyhow::Result<TerminationSignal> {
        let signal = self.recv().await;

        info!(%signal, ?grace, "termination requested, stop controller");

        match time::timeout(grace, controller.stop()).await {
            Ok(Ok(())) => {
                info!("controller stopped gracefully");
            }

            Ok(Err(err @ Error::Shutdown(_))) => {
                warn!(%err, "controller stopped with errors");
            }

            Ok(Err(err)) => return Err(err.into()),

            Err(_) => {
                error!(?grace, "controller did not stop within grace period");

                return Err(anyhow::anyhow!(
                    "controller did not stop within {:?}",
                    grace
                ));
            }
        }

        Ok(signal)
    }
}
