//! Connection state machine
//!
//! Two states: the link is either usable or being replaced. There is no
//! terminal state; the machine cycles for as long as the manager lives.

use std::fmt;

/// Lifecycle state of the managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// The current handle passed its last dial or probe
    #[default]
    Connected,
    /// A probe failed and the handle is being replaced
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The health probe returned an error
    ProbeFailed,
    /// A redial produced a fresh handle
    Redialed,
}

/// Snapshot published to observers of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Completed reconnection episodes since construction
    pub reconnects: u64,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionResult {
    Success(ConnectionState),
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

#[derive(Debug, Default)]
pub struct LinkStateMachine {
    status: LinkStatus,
}

impl LinkStateMachine {
    /// Create a new state machine in the Connected state
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.state
    }

    pub fn status(&self) -> LinkStatus {
        self.status
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.status.state, event) {
            (Connected, ProbeFailed) => {
                self.status.state = Reconnecting;
                TransitionResult::Success(Reconnecting)
            }
            (Reconnecting, Redialed) => {
                self.status.state = Connected;
                self.status.reconnects += 1;
                TransitionResult::Success(Connected)
            }
            (from, event) => TransitionResult::Invalid { from, event },
        }
    }
}
