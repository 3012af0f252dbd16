use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::camera::MediaPreferences;
use crate::error::MediaError;

/// A live audio/video stream, local (camera) or remote (received).
///
/// Controllers only pass streams around by handle; what a stream is made of
/// is up to the media source and the negotiation engine that consume it.
pub trait MediaStream: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Release the underlying capture. Must tolerate repeated calls.
    fn stop(&self);

    fn as_any(&self) -> &dyn Any;
}

pub type StreamHandle = Arc<dyn MediaStream>;

/// Camera access.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, preferences: &MediaPreferences) -> Result<StreamHandle, MediaError>;
}
