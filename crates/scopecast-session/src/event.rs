use scopecast_proto::PeerId;

use crate::engine::EngineConnectionState;
use crate::error::EngineError;
use crate::media::StreamHandle;

/// What a controller reports to its owner, in the order it happened.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    IdentityAssigned(PeerId),
    RemoteSelected {
        remote: PeerId,
    },
    /// Viewer only: the engine produced the incoming stream.
    RemoteStream {
        generation: u64,
        stream: StreamHandle,
    },
    ConnectionState {
        generation: u64,
        state: EngineConnectionState,
    },
    /// The engine did not report `Connected` within the negotiation timeout.
    NegotiationStalled {
        generation: u64,
        remote: Option<PeerId>,
    },
    RemoteHangup {
        remote: PeerId,
    },
    EngineFailed(EngineError),
}
