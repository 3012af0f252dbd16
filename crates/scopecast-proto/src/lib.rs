//! Shared protocol definitions for relay ↔ publisher/viewer signaling.
//! Kept in a dedicated crate so the relay can route envelopes without
//! pulling in any of the client-side session machinery.

mod envelope;
mod peer;
mod routing;

pub use envelope::{Envelope, EnvelopeType, SignalKind, SignalPayload};
pub use peer::{PeerId, Route};
pub use routing::{RelayedType, RoutingHeader};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}
