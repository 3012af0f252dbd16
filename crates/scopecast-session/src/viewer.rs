//! Display side of a session.

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
use crate::event::SessionEvent;
use crate::signaling::SignalingLink;

const TARGET: &str = "scopecast::viewer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewerState {
    Idle,
    AwaitingIdentity,
    /// `ready` has been broadcast; no offer seen yet.
    Announced,
    /// The previous publisher hung up; waiting for the next offer.
    AwaitingOffer,
    Negotiating,
    Receiving,
    Closed,
}

pub struct ViewerController;

impl ViewerController {
    pub fn start(
        config: SessionConfig,
        engines: Arc<dyn EngineFactory>,
        link: SignalingLink,
    ) -> ViewerHandle {
        let (state_tx, state_rx) = watch::channel(ViewerState::Idle);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        state_tx.send_replace(ViewerState::AwaitingIdentity);
        let session = ViewerSession {
            slot: EngineSlot::new(
                engines,
                config.ice_servers,
                config.negotiation_timeout,
                engine_tx,
            ),
            self_id: None,
            remote: None,
            link,
            engine_rx,
            shutdown: shutdown_rx,
            state: state_tx,
            events: events_tx,
        };
        let task = tokio::spawn(session.run());

        ViewerHandle {
            state: state_rx,
            events: events_rx,
            shutdown: shutdown_tx,
            task,
        }
    }
}

pub struct ViewerHandle {
    state: watch::Receiver<ViewerState>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ViewerHandle {
    pub fn state(&self) -> watch::Receiver<ViewerState> {
        self.state.clone()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct ViewerSession {
    slot: EngineSlot,
    self_id: Option<PeerId>,
    remote: Option<PeerId>,
    link: SignalingLink,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    shutdown: oneshot::Receiver<()>,
    state: watch::Sender<ViewerState>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ViewerSession {
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
            Envelope::Offer { from, data, .. } => self.on_offer(from, data),
            Envelope::Candidate { data, .. } => match self.slot.feed(data) {
                None => tracing::debug!(target: TARGET, "candidate with no live engine; dropping"),
                Some(Err(err)) => {
                    tracing::warn!(target: TARGET, error = %err, "engine rejected candidate")
                }
                Some(Ok(())) => {}
            },
            Envelope::Hangup { from, .. } => self.on_hangup(from),
            Envelope::Ready { .. } | Envelope::Answer { .. } => {}
        }
    }

    /// Announces exactly once, the moment the identity is known.
    fn on_identity(&mut self, id: PeerId) {
        if let Some(existing) = &self.self_id {
            tracing::warn!(target: TARGET, existing = %existing, ignored = %id, "duplicate id envelope");
            return;
        }
        tracing::info!(target: TARGET, self_id = %id, "identity assigned; announcing");
        self.self_id = Some(id.clone());
        self.emit(SessionEvent::IdentityAssigned(id.clone()));
        self.send(Envelope::Ready {
            from: id,
            target: Route::Broadcast,
        });
        self.set_state(ViewerState::Announced);
    }

    /// Any offer, at any time, replaces the current engine.
    fn on_offer(&mut self, from: PeerId, data: SignalPayload) {
        if self.self_id.is_none() {
            tracing::debug!(target: TARGET, from = %from, "offer before identity; dropping");
            return;
        }
        tracing::info!(
            target: TARGET,
            publisher = %from,
            replacing = self.slot.is_live(),
            "offer received"
        );
        if self.remote.as_ref() != Some(&from) {
            self.remote = Some(from.clone());
            self.emit(SessionEvent::RemoteSelected { remote: from });
        }
        match self.slot.replace(EngineRole::Responder, None) {
            Ok(generation) => {
                tracing::debug!(target: TARGET, generation, "responder engine started");
                self.set_state(ViewerState::Negotiating);
                if let Some(Err(err)) = self.slot.feed(data) {
                    tracing::warn!(target: TARGET, error = %err, "engine rejected offer");
                }
            }
            Err(err) => {
                tracing::warn!(target: TARGET, error = %err, "failed to build responder engine");
                self.emit(SessionEvent::EngineFailed(err));
            }
        }
    }

    fn on_hangup(&mut self, from: Option<PeerId>) {
        let Some(from) = from else {
            return;
        };
        if self.remote.as_ref() != Some(&from) {
            return;
        }
        tracing::info!(target: TARGET, remote = %from, "publisher hung up");
        self.slot.destroy();
        self.remote = None;
        self.emit(SessionEvent::RemoteHangup { remote: from });
        self.set_state(ViewerState::AwaitingOffer);
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        if !self.slot.is_current(event.generation) {
            tracing::debug!(target: TARGET, generation = event.generation, "stale engine event dropped");
            return;
        }
        match event.kind {
            EngineEventKind::Signal(payload) => {
                let (Some(self_id), Some(remote)) = (self.self_id.clone(), self.remote.clone())
                else {
                    return;
                };
                self.send(Envelope::from_engine_payload(
                    self_id,
                    Route::Unicast(remote),
                    payload,
                ));
            }
            EngineEventKind::RemoteStream(stream) => {
                tracing::info!(
                    target: TARGET,
                    generation = event.generation,
                    stream = stream.id(),
                    "receiving remote stream"
                );
                self.set_state(ViewerState::Receiving);
                self.emit(SessionEvent::RemoteStream {
                    generation: event.generation,
                    stream,
                });
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
        }
    }

    fn on_deadline(&mut self) {
        if let Some(generation) = self.slot.take_expired(Instant::now()) {
            tracing::warn!(target: TARGET, generation, "negotiation stalled");
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
        self.set_state(ViewerState::Closed);
        tracing::info!(target: TARGET, "viewer closed");
    }

    fn set_state(&self, next: ViewerState) {
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
