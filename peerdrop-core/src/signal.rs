//! Rendezvous messages exchanged with the signaling server.
//!
//! The server only maps identities to listen addresses; file bytes never pass
//! through it.

use serde::{Deserialize, Serialize};

use crate::{
    CoreError, PeerIdentity,
    frame::{from_json, to_json, unwrap, wrap},
};

const SIGNAL_KIND: u8 = 0x10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Register {
    #[serde(default)]
    pub desired_identity: Option<PeerIdentity>,
    /// `None` registers an identity that cannot be dialed.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAddress {
    pub identity: PeerIdentity,
    pub listen_addr: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalErrorKind {
    IdentityUnavailable,
    DialFailed,
    InvalidRequest,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalError {
    pub kind: SignalErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum SignalMessage {
    Register(Register),
    Registered { identity: PeerIdentity },
    Lookup { identity: PeerIdentity },
    PeerAddress(PeerAddress),
    Error(SignalError),
}

impl SignalError {
    /// Converts a server-reported failure into the matching core error.
    pub fn into_core(self, identity: &str) -> CoreError {
        match self.kind {
            SignalErrorKind::IdentityUnavailable => {
                CoreError::IdentityUnavailable(identity.to_owned())
            }
            SignalErrorKind::DialFailed | SignalErrorKind::RateLimited => CoreError::DialFailed {
                remote: identity.to_owned(),
                reason: self.message,
            },
            SignalErrorKind::InvalidRequest => CoreError::InvalidIdentity(self.message),
        }
    }
}

pub fn encode_signal(message: &SignalMessage) -> Result<Vec<u8>, CoreError> {
    wrap(SIGNAL_KIND, &to_json(message)?)
}

pub fn decode_signal(frame: &[u8]) -> Result<SignalMessage, CoreError> {
    let (kind, payload) = unwrap(frame)?;
    if kind != SIGNAL_KIND {
        return Err(CoreError::UnsupportedFrameKind(kind));
    }
    from_json(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_roundtrip() {
        let message = SignalMessage::Register(Register {
            desired_identity: Some("4821".to_owned()),
            listen_addr: Some("192.168.1.20:40000".to_owned()),
        });
        let decoded = decode_signal(&encode_signal(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn json_shape_is_tagged() {
        let message = SignalMessage::Lookup {
            identity: "4821".to_owned(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "Lookup");
        assert_eq!(json["data"]["identity"], "4821");
    }

    #[test]
    fn peer_frames_are_not_signal_messages() {
        let frame = crate::frame::encode_frame(&crate::frame::Frame::Accepted).unwrap();
        assert!(matches!(
            decode_signal(&frame),
            Err(CoreError::UnsupportedFrameKind(1))
        ));
    }

    #[test]
    fn errors_map_to_core_errors() {
        let taken = SignalError {
            kind: SignalErrorKind::IdentityUnavailable,
            message: "taken".to_owned(),
        };
        assert!(matches!(
            taken.into_core("4821"),
            CoreError::IdentityUnavailable(id) if id == "4821"
        ));

        let unknown = SignalError {
            kind: SignalErrorKind::DialFailed,
            message: "no such peer".to_owned(),
        };
        assert!(matches!(
            unknown.into_core("9999"),
            CoreError::DialFailed { remote, .. } if remote == "9999"
        ));
    }
}
