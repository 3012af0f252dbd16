//! In-memory media source and negotiation engines for exercising the
//! controllers without a browser or a network stack.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use scopecast_proto::SignalPayload;
use serde_json::json;

use crate::camera::MediaPreferences;
use crate::engine::{
    EngineConnectionState, EngineFactory, EngineRole, EngineSink, EngineSpec, NegotiationEngine,
};
use crate::error::{EngineError, MediaError};
use crate::media::{MediaSource, MediaStream, StreamHandle};

#[derive(Debug)]
pub struct FakeStream {
    id: String,
    stopped: AtomicBool,
}

impl FakeStream {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for FakeStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out one [`FakeStream`] per call, or a canned failure.
#[derive(Default)]
pub struct FakeMediaSource {
    failure: Option<MediaError>,
    acquisitions: AtomicUsize,
    last: Mutex<Option<Arc<FakeStream>>>,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: MediaError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn last_stream(&self) -> Option<Arc<FakeStream>> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, _preferences: &MediaPreferences) -> Result<StreamHandle, MediaError> {
        let count = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let stream = FakeStream::new(format!("camera-{count}"));
        *self.last.lock() = Some(Arc::clone(&stream));
        Ok(stream)
    }
}

/// Observation handle for one engine built by [`FakeEngineFactory`].
#[derive(Clone)]
pub struct FakeEngineHandle {
    pub role: EngineRole,
    pub generation: u64,
    pub local_stream: Option<StreamHandle>,
    sink: EngineSink,
    fed: Arc<Mutex<Vec<SignalPayload>>>,
    destroyed: Arc<AtomicUsize>,
}

impl FakeEngineHandle {
    pub fn fed(&self) -> Vec<SignalPayload> {
        self.fed.lock().clone()
    }

    pub fn destroy_count(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn emit_signal(&self, payload: serde_json::Value) -> bool {
        self.sink.signal(payload.into())
    }

    pub fn emit_remote_stream(&self, stream: StreamHandle) -> bool {
        self.sink.remote_stream(stream)
    }

    pub fn emit_state(&self, state: EngineConnectionState) -> bool {
        self.sink.connection_state(state)
    }
}

struct FakeEngine {
    handle: FakeEngineHandle,
    scripted: bool,
    destroyed: bool,
}

impl NegotiationEngine for FakeEngine {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Setup("engine already destroyed".into()));
        }
        let kind = payload
            .as_value()
            .get("type")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        self.handle.fed.lock().push(payload);
        if !self.scripted {
            return Ok(());
        }

        let handle = &self.handle;
        match (handle.role, kind.as_deref()) {
            (EngineRole::Responder, Some("offer")) => {
                handle.emit_signal(json!({
                    "type": "answer",
                    "sdp": format!("fake-answer-{}", handle.generation),
                }));
                handle.emit_signal(json!({
                    "candidate": {"candidate": format!("candidate:responder-{}", handle.generation)},
                }));
                handle.emit_state(EngineConnectionState::Connected);
                handle.emit_remote_stream(FakeStream::new(format!(
                    "remote-{}",
                    handle.generation
                )));
            }
            (EngineRole::Initiator, Some("answer")) => {
                handle.emit_state(EngineConnectionState::Connected);
            }
            _ => {}
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.handle.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every engine it builds.
///
/// A scripted factory additionally plays a minimal negotiation: initiators
/// emit an offer and a candidate on construction, responders answer an offer
/// and immediately surface a remote stream.
#[derive(Default)]
pub struct FakeEngineFactory {
    scripted: bool,
    engines: Mutex<Vec<FakeEngineHandle>>,
}

impl FakeEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted() -> Self {
        Self {
            scripted: true,
            engines: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.engines.lock().len()
    }

    pub fn engine(&self, index: usize) -> Option<FakeEngineHandle> {
        self.engines.lock().get(index).cloned()
    }

    pub fn last(&self) -> Option<FakeEngineHandle> {
        self.engines.lock().last().cloned()
    }

    pub fn all(&self) -> Vec<FakeEngineHandle> {
        self.engines.lock().clone()
    }
}

impl EngineFactory for FakeEngineFactory {
    fn create(
        &self,
        spec: EngineSpec,
        sink: EngineSink,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        let handle = FakeEngineHandle {
            role: spec.role,
            generation: spec.generation,
            local_stream: spec.local_stream,
            sink,
            fed: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(AtomicUsize::new(0)),
        };
        if self.scripted && handle.role == EngineRole::Initiator {
            handle.emit_signal(json!({
                "type": "offer",
                "sdp": format!("fake-offer-{}", handle.generation),
            }));
            handle.emit_signal(json!({
                "candidate": {"candidate": format!("candidate:initiator-{}", handle.generation)},
            }));
        }
        self.engines.lock().push(handle.clone());
        Ok(Box::new(FakeEngine {
            handle,
            scripted: self.scripted,
            destroyed: false,
        }))
    }
}
