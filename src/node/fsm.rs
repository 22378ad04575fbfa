//! Binary Star failover coordinator
//!
//! Two replicas start as `Primary` and `Backup` and earn `Active`/`Passive`
//! by exchanging state heartbeats. Only an accepting replica may serve
//! sensors. The transition table is explicit: every `(state, event)` pair
//! maps to exactly one [`Transition`], and illegal combinations map to a
//! typed [`FatalCondition`] instead of a sentinel value.

use crate::common::NodeRole;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Replica state. The numeric codes are the heartbeat payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Primary,
    Backup,
    Active,
    Passive,
}

impl State {
    pub fn code(self) -> u8 {
        match self {
            State::Primary => 1,
            State::Backup => 2,
            State::Active => 3,
            State::Passive => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(State::Primary),
            2 => Some(State::Backup),
            3 => Some(State::Active),
            4 => Some(State::Passive),
            _ => None,
        }
    }

    /// Can a replica in this state serve sensor traffic?
    pub fn accepts_clients(self) -> bool {
        matches!(self, State::Primary | State::Active)
    }
}

impl From<NodeRole> for State {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::Primary => State::Primary,
            NodeRole::Backup => State::Backup,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Primary => write!(f, "primary"),
            State::Backup => write!(f, "backup"),
            State::Active => write!(f, "active"),
            State::Passive => write!(f, "passive"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PeerPrimary,
    PeerBackup,
    PeerActive,
    PeerPassive,
    ClientRequest,
}

impl Event {
    /// The event raised by observing the peer in `state`.
    pub fn from_peer(state: State) -> Self {
        match state {
            State::Primary => Event::PeerPrimary,
            State::Backup => Event::PeerBackup,
            State::Active => Event::PeerActive,
            State::Passive => Event::PeerPassive,
        }
    }

    pub fn is_peer(self) -> bool {
        !matches!(self, Event::ClientRequest)
    }
}

/// Unrecoverable conditions. Once raised the coordinator stays halted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalCondition {
    #[error("dual active replicas (split brain)")]
    DualActive,

    #[error("dual passive replicas")]
    DualPassive,

    #[error("backup received client traffic before contacting its peer")]
    BackupServedBeforePeer,
}

/// Entry of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// No state change
    Stay,
    Move(State),
    /// Become active only once the peer is presumed dead
    TakeOverIfPeerExpired,
    Fatal(FatalCondition),
}

/// The Binary Star transition table.
pub fn transition(state: State, event: Event) -> Transition {
    use Event::*;
    use State::*;

    match (state, event) {
        (Primary, PeerBackup) => Transition::Move(Active),
        (Primary, PeerActive) => Transition::Move(Passive),
        (Backup, PeerActive) => Transition::Move(Passive),
        (Backup, ClientRequest) => Transition::Fatal(FatalCondition::BackupServedBeforePeer),
        (Active, PeerActive) => Transition::Fatal(FatalCondition::DualActive),
        (Passive, PeerPrimary) | (Passive, PeerBackup) => Transition::Move(Active),
        (Passive, PeerPassive) => Transition::Fatal(FatalCondition::DualPassive),
        (Passive, ClientRequest) => Transition::TakeOverIfPeerExpired,
        _ => Transition::Stay,
    }
}

/// Result of feeding one event to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub from: State,
    pub to: State,
    /// For client requests: may the request be served?
    pub serve: bool,
}

impl Outcome {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }

    /// Passive -> Active: the replica must restore state before serving.
    pub fn took_over(&self) -> bool {
        self.from == State::Passive && self.to == State::Active
    }
}

pub struct FailoverCoordinator {
    state: State,
    /// Unix millis after which the peer is presumed dead
    peer_expiry: u64,
    heartbeat_interval_ms: u64,
    halted: Option<FatalCondition>,
}

impl FailoverCoordinator {
    pub fn new(role: NodeRole, heartbeat_interval_ms: u64) -> Self {
        Self {
            state: role.into(),
            peer_expiry: 0,
            heartbeat_interval_ms,
            halted: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn peer_expiry(&self) -> u64 {
        self.peer_expiry
    }

    pub fn halted(&self) -> Option<FatalCondition> {
        self.halted
    }

    /// Run one event through the table at time `now_ms`.
    pub fn handle(&mut self, event: Event, now_ms: u64) -> Result<Outcome, FatalCondition> {
        if let Some(condition) = self.halted {
            return Err(condition);
        }

        let from = self.state;
        let (to, serve) = match transition(from, event) {
            Transition::Stay => (from, from.accepts_clients()),
            Transition::Move(next) => (next, next.accepts_clients()),
            Transition::TakeOverIfPeerExpired => {
                if now_ms > self.peer_expiry {
                    (State::Active, true)
                } else {
                    (from, false)
                }
            }
            Transition::Fatal(condition) => {
                self.halted = Some(condition);
                return Err(condition);
            }
        };

        self.state = to;
        if event.is_peer() {
            self.peer_expiry = now_ms + 2 * self.heartbeat_interval_ms;
        }

        Ok(Outcome {
            from,
            to,
            serve: serve && !event.is_peer(),
        })
    }
}
