//! Connection lifecycle.
//!
//! ```text
//! Idle -> Dialing -> Open            (initiator)
//! Idle -> AwaitingAccept -> Open     (responder)
//! any non-terminal -> Closed | Errored
//! ```
//!
//! Terminal states are never left; the session builds a fresh machine instead.

use std::fmt;

use crate::{CoreError, PeerIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Dialing,
    AwaitingAccept,
    Open,
    Closed,
    Errored,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Closed | CallState::Errored)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "idle",
            CallState::Dialing => "dialing",
            CallState::AwaitingAccept => "awaiting-accept",
            CallState::Open => "open",
            CallState::Closed => "closed",
            CallState::Errored => "errored",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// An inbound call waiting for the local user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub remote_identity: PeerIdentity,
}

#[derive(Debug, Clone)]
pub struct CallStateMachine {
    state: CallState,
    remote: Option<PeerIdentity>,
    role: Option<Role>,
    pending: Option<CallRequest>,
}

impl Default for CallStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self {
            state: CallState::Idle,
            remote: None,
            role: None,
            pending: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn remote_identity(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    pub fn pending_request(&self) -> Option<&CallRequest> {
        self.pending.as_ref()
    }

    pub fn dial(&mut self, remote_identity: &str) -> Result<(), CoreError> {
        self.expect_state("dial", CallState::Idle)?;
        self.remote = Some(remote_identity.to_owned());
        self.state = CallState::Dialing;
        Ok(())
    }

    /// Signaling could not resolve the remote; no channel was ever created.
    pub fn dial_failed(&mut self) -> Result<(), CoreError> {
        self.expect_state("dial_failed", CallState::Dialing)?;
        self.remote = None;
        self.state = CallState::Idle;
        Ok(())
    }

    pub fn on_incoming(&mut self, remote_identity: &str) -> Result<CallRequest, CoreError> {
        self.expect_state("on_incoming", CallState::Idle)?;
        let request = CallRequest {
            remote_identity: remote_identity.to_owned(),
        };
        self.remote = Some(remote_identity.to_owned());
        self.pending = Some(request.clone());
        self.state = CallState::AwaitingAccept;
        Ok(request)
    }

    /// Channel open signal. Only a dialing machine reacts; the responder stays
    /// gated on `accept`.
    pub fn on_channel_open(&mut self) -> Option<Role> {
        if self.state != CallState::Dialing {
            return None;
        }
        self.state = CallState::Open;
        self.role = Some(Role::Initiator);
        self.role
    }

    pub fn accept(&mut self) -> Result<Role, CoreError> {
        self.expect_state("accept", CallState::AwaitingAccept)?;
        self.pending = None;
        self.state = CallState::Open;
        self.role = Some(Role::Responder);
        Ok(Role::Responder)
    }

    pub fn reject(&mut self) -> Result<(), CoreError> {
        self.expect_state("reject", CallState::AwaitingAccept)?;
        self.pending = None;
        self.state = CallState::Closed;
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), CoreError> {
        if self.state.is_terminal() {
            return Err(CoreError::InvalidState {
                operation: "close",
                state: self.state,
            });
        }
        self.pending = None;
        self.state = CallState::Closed;
        Ok(())
    }

    /// Adapter-originated close. Returns whether a transition happened.
    pub fn on_channel_closed(&mut self) -> bool {
        self.force(CallState::Closed)
    }

    /// Adapter-originated error. Returns whether a transition happened.
    pub fn on_channel_error(&mut self) -> bool {
        self.force(CallState::Errored)
    }

    fn force(&mut self, target: CallState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.pending = None;
        self.state = target;
        true
    }

    fn expect_state(&self, operation: &'static str, expected: CallState) -> Result<(), CoreError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CoreError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}
