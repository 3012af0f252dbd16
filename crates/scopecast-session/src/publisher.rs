//! Camera side of a session.
//!
//! The publisher owns the camera stream for its whole lifetime and swaps
//! negotiation engines underneath it: every `ready` from a viewer replaces the
//! engine, but the capture is never restarted.

use std::sync::Arc;

use scopecast_proto::{Envelope, PeerId, Route, SignalPayload};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::engine::{
    self, EngineConnectionState, EngineEvent, EngineEventKind, EngineFactory, EngineRole,
    EngineSlot,
};
use crate::error::SessionError;
use crate::event::SessionEvent;
use crate::media::{MediaSource, StreamHandle};
use crate::signaling::SignalingLink;

const TARGET: &str = "scopecast::publisher";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherState {
    Idle,
    AcquiringMedia,
    AwaitingIdentity,
    /// Initiator engine live, offering to whoever is listening.
    Broadcasting,
    /// An answer arrived; the engine is bound to one viewer.
    Streaming,
    /// A viewer announced itself and a fresh engine is offering to it.
    Reconnecting,
    Closed,
}

pub struct PublisherController;

impl PublisherController {
    /// Acquires the camera, then hands the session to a background task.
    ///
    /// Media failure is returned here and nothing else happens: no engine is
    /// built and the link is dropped.
    pub async fn start(
        config: SessionConfig,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn EngineFactory>,
        link: SignalingLink,
    ) -> Result<PublisherHandle, SessionError> {
        let (state_tx, state_rx) = watch::channel(PublisherState::Idle);
        state_tx.send_replace(PublisherState::AcquiringMedia);

        let local_stream = match media.acquire(&config.media).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "camera acquisition failed");
                state_tx.send_replace(PublisherState::Closed);
                return Err(SessionError::MediaAcquisition(err));
            }
        };
        tracing::info!(target: TARGET, stream = local_stream.id(), "camera acquired");
        state_tx.send_replace(PublisherState::AwaitingIdentity);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let session = PublisherSession {
            slot: EngineSlot::new(
                engines,
                config.ice_servers.clone(),
                config.negotiation_timeout,
                engine_tx,
            ),
            local_stream: Arc::clone(&local_stream),
            self_id: None,
            remote: None,
            pending_ready: None,
            link,
            engine_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            events: events_tx,
        };
        let task = tokio::spawn(session.run());

        Ok(PublisherHandle {
            state: state_rx,
            events: events_rx,
            local_stream,
            shutdown: shutdown_tx,
            task,
        })
    }
}

pub struct PublisherHandle {
    state: watch::Receiver<PublisherState>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    local_stream: StreamHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PublisherHandle {
    pub fn state(&self) -> watch::Receiver<PublisherState> {
        self.state.clone()
    }

    pub fn local_stream(&self) -> &StreamHandle {
        &self.local_stream
    }

    /// Sends a best-effort `hangup`, destroys the engine, releases the
    /// camera and waits for the session task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct PublisherSession {
    slot: EngineSlot,
    local_stream: StreamHandle,
    self_id: Option<PeerId>,
    remote: Option<PeerId>,
    /// A `ready` seen before our own id arrived.
    pending_ready: Option<PeerId>,
    link: SignalingLink,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: oneshot::Receiver<()>,
    state: watch::Sender<PublisherState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl PublisherSession {
    async fn run(mut self) {
        loop {
            let deadline = self.slot.deadline();
            tokio::select! {
                _ = &mut self.shutdown => {
                    self.close(true);
                    break;
                }
                inbound = self.link.inbound.recv() => match inbound {
                    Some(envelope) => self.on_envelope(envelope),
                    None => {
                        tracing::info!(target: TARGET, "hub link closed");
                        self.close(false);
                        break;
                    }
                },
                Some(event) = self.engine_rx.recv() => self.on_engine_event(event),
                _ = engine::sleep_until(deadline) => self.on_deadline(),
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Id { id } => self.on_identity(id),
            Envelope::Ready { from, .. } => self.on_ready(from),
            Envelope::Answer { from, data, .. } => self.on_answer(from, data),
            Envelope::Candidate { from, data, .. } => {
                if self.is_superseded(&from) {
                    tracing::debug!(target: TARGET, from = %from, "candidate from superseded viewer; dropping");
                    return;
                }
                self.feed(data);
            }
            Envelope::Hangup { from, .. } => self.on_hangup(from),
            Envelope::Offer { from, .. } => {
                tracing::debug!(target: TARGET, from = %from, "ignoring offer");
            }
        }
    }

    fn on_identity(&mut self, id: PeerId) {
        if let Some(existing) = &self.self_id {
            tracing::warn!(target: TARGET, existing = %existing, ignored = %id, "duplicate id envelope");
            return;
        }
        tracing::info!(target: TARGET, self_id = %id, "identity assigned");
        self.self_id = Some(id.clone());
        self.emit(SessionEvent::IdentityAssigned(id));

        match self.pending_ready.take() {
            Some(viewer) => self.retarget(viewer),
            None => self.start_engine(PublisherState::Broadcasting),
        }
    }

    fn on_ready(&mut self, from: PeerId) {
        if self.self_id.as_ref() == Some(&from) {
            return;
        }
        if self.self_id.is_none() {
            tracing::debug!(target: TARGET, viewer = %from, "ready before identity; deferring");
            self.pending_ready = Some(from);
            return;
        }
        self.retarget(from);
    }

    /// Drops the current engine and offers afresh to `viewer` on the same stream.
    fn retarget(&mut self, viewer: PeerId) {
        tracing::info!(
            target: TARGET,
            previous = ?self.remote.as_ref().map(PeerId::as_str),
            viewer = %viewer,
            "viewer ready; renegotiating"
        );
        self.set_remote(viewer);
        self.start_engine(PublisherState::Reconnecting);
    }

    fn on_answer(&mut self, from: PeerId, data: SignalPayload) {
        if !self.slot.is_live() {
            tracing::debug!(target: TARGET, from = %from, "answer with no live engine; dropping");
            return;
        }
        if self.is_superseded(&from) {
            tracing::debug!(
                target: TARGET,
                from = %from,
                remote = ?self.remote.as_ref().map(PeerId::as_str),
                "answer from superseded viewer; dropping"
            );
            return;
        }
        self.set_remote(from);
        self.feed(data);
        self.set_state(PublisherState::Streaming);
    }

    /// Once the engine is bound to a viewer, signaling from anyone else
    /// belongs to an engine that no longer exists.
    fn is_superseded(&self, from: &PeerId) -> bool {
        matches!(
            *self.state.borrow(),
            PublisherState::Reconnecting | PublisherState::Streaming
        ) && self.remote.as_ref().is_some_and(|remote| remote != from)
    }

    fn on_hangup(&mut self, from: Option<PeerId>) {
        let Some(from) = from else {
            return;
        };
        if self.remote.as_ref() != Some(&from) {
            tracing::debug!(target: TARGET, from = %from, "hangup from non-remote peer; ignoring");
            return;
        }
        tracing::info!(target: TARGET, remote = %from, "remote hung up; back to broadcasting");
        self.slot.destroy();
        self.remote = None;
        self.emit(SessionEvent::RemoteHangup { remote: from });
        self.start_engine(PublisherState::Broadcasting);
    }

    fn feed(&mut self, data: SignalPayload) {
        match self.slot.feed(data) {
            None => tracing::debug!(target: TARGET, "no live engine; dropping payload"),
            Some(Err(err)) => tracing::warn!(target: TARGET, error = %err, "engine rejected payload"),
            Some(Ok(())) => {}
        }
    }

    fn start_engine(&mut self, next: PublisherState) {
        match self
            .slot
            .replace(EngineRole::Initiator, Some(Arc::clone(&self.local_stream)))
        {
            Ok(generation) => {
                tracing::debug!(
                    target: TARGET,
                    generation,
                    remote = ?self.remote.as_ref().map(PeerId::as_str),
                    "initiator engine started"
                );
                self.set_state(next);
            }
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "failed to build initiator engine");
                self.emit(SessionEvent::EngineFailed(err));
            }
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        if !self.slot.is_current(event.generation) {
            tracing::debug!(target: TARGET, generation = event.generation, "stale engine event dropped");
            return;
        }
        match event.kind {
            EngineEventKind::Signal(payload) => {
                let Some(self_id) = self.self_id.clone() else {
                    return;
                };
                let route = Route::from(self.remote.clone());
                self.send(Envelope::from_engine_payload(self_id, route, payload));
            }
            EngineEventKind::ConnectionState(state) => {
                if state == EngineConnectionState::Connected {
                    self.slot.mark_connected(event.generation);
                }
                if matches!(
                    state,
                    EngineConnectionState::Failed | EngineConnectionState::Disconnected
                ) {
                    tracing::warn!(target: TARGET, generation = event.generation, ?state, "engine lost connection");
                }
                self.emit(SessionEvent::ConnectionState {
                    generation: event.generation,
                    state,
                });
            }
            EngineEventKind::RemoteStream(stream) => {
                tracing::debug!(target: TARGET, stream = stream.id(), "ignoring remote stream");
            }
        }
    }

    fn on_deadline(&mut self) {
        if let Some(generation) = self.slot.take_expired(Instant::now()) {
            tracing::warn!(
                target: TARGET,
                generation,
                remote = ?self.remote.as_ref().map(PeerId::as_str),
                "negotiation stalled"
            );
            self.emit(SessionEvent::NegotiationStalled {
                generation,
                remote: self.remote.clone(),
            });
        }
    }

    fn close(&mut self, notify_remote: bool) {
        if notify_remote {
            self.send(Envelope::Hangup {
                from: self.self_id.clone(),
                target: Route::from(self.remote.clone()),
            });
        }
        self.slot.destroy();
        self.local_stream.stop();
        self.set_state(PublisherState::Closed);
        tracing::info!(target: TARGET, "publisher closed");
    }

    fn set_remote(&mut self, remote: PeerId) {
        if self.remote.as_ref() != Some(&remote) {
            self.remote = Some(remote.clone());
            self.emit(SessionEvent::RemoteSelected { remote });
        }
    }

    fn set_state(&self, next: PublisherState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(target: TARGET, ?previous, ?next, "state change");
        }
    }

    fn send(&self, envelope: Envelope) {
        if self.link.outbound.send(envelope).is_err() {
            tracing::debug!(target: TARGET, "hub link closed; dropping outbound envelope");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
