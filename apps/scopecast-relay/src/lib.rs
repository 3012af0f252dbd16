//! Identity & relay hub for scopecast signaling.
//!
//! Each WebSocket connection is assigned a fresh [`scopecast_proto::PeerId`]
//! and may then send envelopes that are routed by their `target` header,
//! either to one named peer or to every other live peer.

pub mod config;
pub mod probe;
pub mod registry;
pub mod server;
pub mod telemetry;

pub use config::{IdScheme, LogFormat, RelayConfig, ServeArgs, SlowPeerPolicy};
pub use registry::PeerRegistry;
pub use server::{Relay, RelayError};
