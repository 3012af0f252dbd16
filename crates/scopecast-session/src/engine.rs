//! Contract with the negotiation engine, plus the per-controller slot that
//! owns the current engine instance and its generation tag.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use scopecast_proto::SignalPayload;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::media::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything an engine needs at construction time.
#[derive(Clone)]
pub struct EngineSpec {
    pub role: EngineRole,
    pub generation: u64,
    pub local_stream: Option<StreamHandle>,
    pub ice_servers: Vec<String>,
}

impl fmt::Debug for EngineSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSpec")
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("local_stream", &self.local_stream.as_ref().map(|s| s.id()))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum EngineEventKind {
    Signal(SignalPayload),
    RemoteStream(StreamHandle),
    ConnectionState(EngineConnectionState),
}

#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub generation: u64,
    pub kind: EngineEventKind,
}

/// Callback side of an engine. Every event is stamped with the generation the
/// engine was built for, so the owning controller can discard output from an
/// engine it has already replaced.
#[derive(Debug, Clone)]
pub struct EngineSink {
    generation: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the controller is gone.
    pub fn signal(&self, payload: SignalPayload) -> bool {
        self.emit(EngineEventKind::Signal(payload))
    }

    pub fn remote_stream(&self, stream: StreamHandle) -> bool {
        self.emit(EngineEventKind::RemoteStream(stream))
    }

    pub fn connection_state(&self, state: EngineConnectionState) -> bool {
        self.emit(EngineEventKind::ConnectionState(state))
    }

    fn emit(&self, kind: EngineEventKind) -> bool {
        self.tx
            .send(EngineEvent {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// One negotiation attempt.
///
/// `signal` only hands the payload over; the engine may finish processing it
/// at any later point and reports back through its [`EngineSink`].
pub trait NegotiationEngine: Send {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), EngineError>;

    /// Tear down the attempt. Safe to call more than once.
    fn destroy(&mut self);
}

pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        spec: EngineSpec,
        sink: EngineSink,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError>;
}

struct LiveEngine {
    generation: u64,
    engine: Box<dyn NegotiationEngine>,
    deadline: Option<Instant>,
}

/// Holds at most one engine and hands out strictly increasing generations.
pub(crate) struct EngineSlot {
    factory: Arc<dyn EngineFactory>,
    ice_servers: Vec<String>,
    negotiation_timeout: Option<Duration>,
    events: mpsc::UnboundedSender<EngineEvent>,
    generation: u64,
    current: Option<LiveEngine>,
}

impl EngineSlot {
    pub(crate) fn new(
        factory: Arc<dyn EngineFactory>,
        ice_servers: Vec<String>,
        negotiation_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            factory,
            ice_servers,
            negotiation_timeout,
            events,
            generation: 0,
            current: None,
        }
    }

    /// Destroys whatever engine is live and builds a new one.
    pub(crate) fn replace(
        &mut self,
        role: EngineRole,
        local_stream: Option<StreamHandle>,
    ) -> Result<u64, EngineError> {
        self.destroy();
        self.generation += 1;
        let generation = self.generation;
        let spec = EngineSpec {
            role,
            generation,
            local_stream,
            ice_servers: self.ice_servers.clone(),
        };
        let engine = self
            .factory
            .create(spec, EngineSink::new(generation, self.events.clone()))?;
        self.current = Some(LiveEngine {
            generation,
            engine,
            deadline: self
                .negotiation_timeout
                .map(|timeout| Instant::now() + timeout),
        });
        Ok(generation)
    }

    pub(crate) fn destroy(&mut self) {
        if let Some(mut live) = self.current.take() {
            live.engine.destroy();
        }
    }

    pub(crate) fn is_live(&self) -> bool {
        self.current.is_some()
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.current
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    /// Feeds the live engine. `None` when there is no engine to feed.
    pub(crate) fn feed(&mut self, payload: SignalPayload) -> Option<Result<(), EngineError>> {
        self.current
            .as_mut()
            .map(|live| live.engine.signal(payload))
    }

    pub(crate) fn mark_connected(&mut self, generation: u64) {
        if let Some(live) = self.current.as_mut() {
            if live.generation == generation {
                live.deadline = None;
            }
        }
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().and_then(|live| live.deadline)
    }

    /// Clears an elapsed deadline and returns the generation it belonged to.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Option<u64> {
        let live = self.current.as_mut()?;
        match live.deadline {
            Some(deadline) if deadline <= now => {
                live.deadline = None;
                Some(live.generation)
            }
            _ => None,
        }
    }
}

impl Drop for EngineSlot {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Resolves at `deadline`, or never.
pub(crate) async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
