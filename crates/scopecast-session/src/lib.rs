//! Client side of scopecast: the publisher (camera) and viewer (display)
//! session controllers, the signaling link they use to reach the relay, and
//! the contracts they expect from media capture and the negotiation engine.

pub mod camera;
pub mod config;
pub mod engine;
mod error;
mod event;
pub mod media;
pub mod publisher;
#[cfg(feature = "webrtc")]
pub mod rtc;
pub mod signaling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod viewer;

pub use camera::{select_device, CameraDevice, FacingMode, MediaPreferences};
pub use config::{SessionConfig, SignalingConfig};
pub use engine::{
    EngineConnectionState, EngineEvent, EngineEventKind, EngineFactory, EngineRole, EngineSink,
    EngineSpec, NegotiationEngine,
};
pub use error::{EngineError, MediaError, SessionError};
pub use event::SessionEvent;
pub use media::{MediaSource, MediaStream, StreamHandle};
pub use publisher::{PublisherController, PublisherHandle, PublisherState};
pub use signaling::{connect, SignalingLink};
pub use viewer::{ViewerController, ViewerHandle, ViewerState};
