use std::fmt::{self, Debug, Display, Formatter};

/// Lifecycle of a [`Controller`](super::Controller). Transitions only move forward.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum ControllerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ControllerState {
    pub(super) fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;

        matches!(
            (self, next),
            (Created, Starting)
                | (Created, Stopped)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

impl Display for ControllerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}
