use std::fmt;

use serde::Deserialize;

use crate::envelope::EnvelopeType;
use crate::peer::Route;
use crate::ProtoError;

/// Envelope types a client may send. `id` is stamped by the relay only, so a
/// client frame claiming it fails to parse like any unknown type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayedType {
    Ready,
    Offer,
    Answer,
    Candidate,
    Hangup,
}

impl RelayedType {
    pub fn as_str(self) -> &'static str {
        EnvelopeType::from(self).as_str()
    }
}

impl From<RelayedType> for EnvelopeType {
    fn from(kind: RelayedType) -> Self {
        match kind {
            RelayedType::Ready => EnvelopeType::Ready,
            RelayedType::Offer => EnvelopeType::Offer,
            RelayedType::Answer => EnvelopeType::Answer,
            RelayedType::Candidate => EnvelopeType::Candidate,
            RelayedType::Hangup => EnvelopeType::Hangup,
        }
    }
}

impl fmt::Display for RelayedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only part of an envelope the relay reads.
///
/// Everything besides `type` and `target` is ignored and the received frame
/// is forwarded byte-for-byte, so the relay can never rewrite `data`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoutingHeader {
    #[serde(rename = "type")]
    pub kind: RelayedType,
    #[serde(default, with = "crate::peer::wire_target")]
    pub target: Route,
}

impl RoutingHeader {
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        let header: RoutingHeader = serde_json::from_str(text).map_err(ProtoError::Decode)?;
        Ok(header)
    }
}
