use std::fmt;

use thiserror::Error;

use crate::error::PairingError;

/// Decision recorded on a resolved session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Approved,
    Rejected,
}

/// Lifecycle of a pairing session.
///
/// `Resolved` and `Expired` are final: nothing transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Created,
    AwaitingApproval,
    Resolved(Resolution),
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid pairing transition {from} -> {to}")]
pub struct SessionStateError {
    pub from: PairingState,
    pub to: PairingState,
}

impl From<SessionStateError> for PairingError {
    fn from(err: SessionStateError) -> Self {
        PairingError::InvalidState(err.to_string())
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PairingState::Created => f.write_str("created"),
            PairingState::AwaitingApproval => f.write_str("awaiting-approval"),
            PairingState::Resolved(Resolution::Approved) => f.write_str("approved"),
            PairingState::Resolved(Resolution::Rejected) => f.write_str("rejected"),
            PairingState::Expired => f.write_str("expired"),
        }
    }
}

impl PairingState {
    pub fn transition(self, next: PairingState) -> Result<PairingState, SessionStateError> {
        use PairingState::*;
        match (self, next) {
            (Created, AwaitingApproval)
            | (AwaitingApproval, Resolved(_))
            | (Created, Expired)
            | (AwaitingApproval, Expired) => Ok(next),
            (from, to) => Err(SessionStateError { from, to }),
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, PairingState::Resolved(_) | PairingState::Expired)
    }

    /// Whether an attestation device can still read or decide the session.
    pub fn is_open(&self) -> bool {
        matches!(self, PairingState::AwaitingApproval)
    }
}
