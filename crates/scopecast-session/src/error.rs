use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error("negotiation engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("session closed")]
    Closed,
}

/// Failures reported by a [`crate::MediaSource`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("invalid negotiation payload: {0}")]
    InvalidPayload(String),
}
