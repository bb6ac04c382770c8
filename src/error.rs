use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

use crate::controller::ControllerState;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Construction(String),

    #[error("updater {updater} failed to start: {source}")]
    Startup {
        updater: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("reconcile cycle failed: {}", .0.iter().join("; "))]
    Cycle(Vec<UpdaterFailure>),

    #[error("stop controller failed: {}", .0.iter().join("; "))]
    Shutdown(Vec<UpdaterFailure>),

    #[error("can't {operation} controller in state {state}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },
}

impl Error {
    pub(crate) fn construction(msg: impl Into<String>) -> Self {
        Self::Construction(msg.into())
    }
}

/// Why a single updater call did not succeed.
#[derive(Debug)]
pub enum FailureReason {
    Failed(anyhow::Error),
    TimedOut(Duration),
    Panicked(String),
}

#[derive(Debug)]
pub struct UpdaterFailure {
    pub updater: String,
    pub reason: FailureReason,
}

impl UpdaterFailure {
    pub fn new(updater: impl Into<String>, reason: FailureReason) -> Self {
        Self {
            updater: updater.into(),
            reason,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.reason, FailureReason::TimedOut(_))
    }
}

impl Display for UpdaterFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.reason {
            FailureReason::Failed(err) => write!(f, "{}: {:#}", self.updater, err),
            FailureReason::TimedOut(deadline) => {
                write!(f, "{}: not finished within {:?}", self.updater, deadline)
            }
            FailureReason::Panicked(msg) => write!(f, "{}: panicked: {}", self.updater, msg),
        }
    }
}
