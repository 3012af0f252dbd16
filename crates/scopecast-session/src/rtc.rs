//! [`EngineFactory`] backed by webrtc-rs.
//!
//! Payloads use the JSON shapes browsers exchange through simple-peer:
//! `{"type":"offer","sdp":…}`, `{"type":"answer","sdp":…}` and
//! `{"candidate":{"candidate":…,"sdpMid":…,"sdpMLineIndex":…}}`.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use scopecast_proto::SignalPayload;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::engine::{
    EngineConnectionState, EngineFactory, EngineRole, EngineSink, EngineSpec, NegotiationEngine,
};
use crate::error::EngineError;
use crate::media::MediaStream;

const TARGET: &str = "scopecast::rtc";

/// Camera output as a VP8 sample track. The capture pipeline writes samples
/// into [`RtcLocalStream::track`]; the engine only attaches it.
pub struct RtcLocalStream {
    id: String,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl RtcLocalStream {
    pub fn vp8(stream_id: impl Into<String>) -> Arc<Self> {
        let id = stream_id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            id.clone(),
        ));
        Arc::new(Self {
            id,
            track,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RtcLocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcLocalStream").field("id", &self.id).finish()
    }
}

impl MediaStream for RtcLocalStream {
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

/// First inbound track of a responder engine.
pub struct RtcRemoteStream {
    id: String,
    track: Arc<TrackRemote>,
}

impl RtcRemoteStream {
    pub fn track(&self) -> Arc<TrackRemote> {
        Arc::clone(&self.track)
    }
}

impl fmt::Debug for RtcRemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcRemoteStream").field("id", &self.id).finish()
    }
}

impl MediaStream for RtcRemoteStream {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {}

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct WireCandidate {
    candidate: String,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Description {
        #[serde(rename = "type")]
        kind: SdpKind,
        sdp: String,
    },
    Candidate {
        candidate: WireCandidate,
    },
}

impl WirePayload {
    fn parse(payload: SignalPayload) -> Result<Self, EngineError> {
        serde_json::from_value(payload.into_value())
            .map_err(|err| EngineError::InvalidPayload(err.to_string()))
    }

    fn into_payload(self) -> Result<SignalPayload, EngineError> {
        serde_json::to_value(self)
            .map(SignalPayload::new)
            .map_err(|err| EngineError::InvalidPayload(err.to_string()))
    }
}

impl From<RTCIceCandidateInit> for WireCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

impl From<WireCandidate> for RTCIceCandidateInit {
    fn from(wire: WireCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: wire.candidate,
            sdp_mid: wire.sdp_mid,
            sdp_mline_index: wire.sdp_mline_index,
            username_fragment: None,
        }
    }
}

pub struct RtcEngineFactory {
    api: Arc<API>,
}

impl RtcEngineFactory {
    pub fn new() -> Result<Self, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(setup_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

impl EngineFactory for RtcEngineFactory {
    fn create(
        &self,
        spec: EngineSpec,
        sink: EngineSink,
    ) -> Result<Box<dyn NegotiationEngine>, EngineError> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(Arc::clone(&self.api), spec, sink, command_rx));
        Ok(Box::new(RtcEngine {
            commands,
            task: Some(task),
        }))
    }
}

enum Command {
    Signal(SignalPayload),
    Close,
}

/// Handle to one peer connection running on its own task.
pub struct RtcEngine {
    commands: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl NegotiationEngine for RtcEngine {
    fn signal(&mut self, payload: SignalPayload) -> Result<(), EngineError> {
        if self.task.is_none() {
            return Err(EngineError::Setup("engine already destroyed".into()));
        }
        self.commands
            .send(Command::Signal(payload))
            .map_err(|_| EngineError::Setup("engine task exited".into()))
    }

    fn destroy(&mut self) {
        // The task closes the peer connection on its way out.
        if self.task.take().is_some() {
            let _ = self.commands.send(Command::Close);
        }
    }
}

impl Drop for RtcEngine {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn drive(
    api: Arc<API>,
    spec: EngineSpec,
    sink: EngineSink,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let generation = spec.generation;
    let peer = match connect(&api, &spec).await {
        Ok(peer) => peer,
        Err(err) => {
            tracing::warn!(target: TARGET, generation, error = %err, "peer connection setup failed");
            sink.connection_state(EngineConnectionState::Failed);
            return;
        }
    };
    let candidates = Arc::new(LocalCandidates::new(sink.clone()));
    if let Err(err) = prepare(&peer, &spec, &sink, &candidates).await {
        tracing::warn!(target: TARGET, generation, error = %err, "peer connection setup failed");
        close(&peer, generation).await;
        sink.connection_state(EngineConnectionState::Failed);
        return;
    }

    let mut negotiation = Negotiation {
        peer: Arc::clone(&peer),
        sink,
        candidates,
        role: spec.role,
        remote_described: false,
        pending: Vec::new(),
    };
    while let Some(command) = commands.recv().await {
        match command {
            Command::Signal(payload) => {
                if let Err(err) = negotiation.apply(payload).await {
                    tracing::warn!(target: TARGET, generation, error = %err, "failed to apply payload");
                }
            }
            Command::Close => break,
        }
    }

    close(&peer, generation).await;
    tracing::debug!(target: TARGET, generation, "engine stopped");
}

async fn close(peer: &RTCPeerConnection, generation: u64) {
    if let Err(err) = peer.close().await {
        tracing::debug!(target: TARGET, generation, error = %err, "peer connection close failed");
    }
}

async fn connect(api: &API, spec: &EngineSpec) -> Result<Arc<RTCPeerConnection>, EngineError> {
    let config = RTCConfiguration {
        ice_servers: spec
            .ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    };
    let peer = api.new_peer_connection(config).await.map_err(setup_error)?;
    Ok(Arc::new(peer))
}

/// Local ICE candidates, held back until our own description has gone out.
///
/// `set_local_description` starts gathering, and the remote side cannot use a
/// candidate that reaches it before the offer or answer it belongs to.
struct LocalCandidates {
    sink: EngineSink,
    gate: Mutex<CandidateGate>,
}

#[derive(Default)]
struct CandidateGate {
    released: bool,
    held: Vec<SignalPayload>,
}

impl LocalCandidates {
    fn new(sink: EngineSink) -> Self {
        Self {
            sink,
            gate: Mutex::new(CandidateGate::default()),
        }
    }

    fn push(&self, payload: SignalPayload) {
        let mut gate = self.gate.lock();
        if gate.released {
            self.sink.signal(payload);
        } else {
            gate.held.push(payload);
        }
    }

    /// Call after the local description has been signaled.
    fn release(&self) {
        let mut gate = self.gate.lock();
        gate.released = true;
        for payload in gate.held.drain(..) {
            self.sink.signal(payload);
        }
    }
}

async fn prepare(
    peer: &Arc<RTCPeerConnection>,
    spec: &EngineSpec,
    sink: &EngineSink,
    candidates: &Arc<LocalCandidates>,
) -> Result<(), EngineError> {
    let gathered = Arc::clone(candidates);
    peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let gathered = Arc::clone(&gathered);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            let payload = candidate
                .to_json()
                .map_err(setup_error)
                .and_then(|init| {
                    WirePayload::Candidate {
                        candidate: init.into(),
                    }
                    .into_payload()
                });
            match payload {
                Ok(payload) => gathered.push(payload),
                Err(err) => {
                    tracing::debug!(target: TARGET, error = %err, "skipping local candidate");
                }
            }
        })
    }));

    let state_sink = sink.clone();
    peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let sink = state_sink.clone();
        Box::pin(async move {
            if let Some(state) = map_state(state) {
                sink.connection_state(state);
            }
        })
    }));

    match spec.role {
        EngineRole::Initiator => {
            let track = spec
                .local_stream
                .as_ref()
                .and_then(|stream| stream.as_any().downcast_ref::<RtcLocalStream>())
                .map(RtcLocalStream::track);
            match track {
                Some(track) => {
                    peer.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                        .await
                        .map_err(setup_error)?;
                }
                None => {
                    tracing::warn!(
                        target: TARGET,
                        generation = spec.generation,
                        "local stream has no rtc track; offering a bare video transceiver"
                    );
                    peer.add_transceiver_from_kind(RTPCodecType::Video, None)
                        .await
                        .map_err(setup_error)?;
                }
            }
            let offer = peer.create_offer(None).await.map_err(setup_error)?;
            peer.set_local_description(offer.clone())
                .await
                .map_err(setup_error)?;
            let payload = WirePayload::Description {
                kind: SdpKind::Offer,
                sdp: offer.sdp,
            }
            .into_payload()?;
            sink.signal(payload);
            candidates.release();
        }
        EngineRole::Responder => {
            let track_sink = sink.clone();
            let delivered = Arc::new(AtomicBool::new(false));
            peer.on_track(Box::new(
                move |track: Arc<TrackRemote>,
                      _receiver: Arc<RTCRtpReceiver>,
                      _transceiver: Arc<RTCRtpTransceiver>| {
                    if !delivered.swap(true, Ordering::SeqCst) {
                        let stream = RtcRemoteStream {
                            id: track.stream_id(),
                            track,
                        };
                        track_sink.remote_stream(Arc::new(stream));
                    }
                    Box::pin(async {})
                },
            ));
        }
    }

    Ok(())
}

struct Negotiation {
    peer: Arc<RTCPeerConnection>,
    sink: EngineSink,
    candidates: Arc<LocalCandidates>,
    role: EngineRole,
    remote_described: bool,
    /// Candidates that arrived before the remote description.
    pending: Vec<RTCIceCandidateInit>,
}

impl Negotiation {
    async fn apply(&mut self, payload: SignalPayload) -> Result<(), EngineError> {
        match WirePayload::parse(payload)? {
            WirePayload::Description { kind, sdp } => self.describe(kind, sdp).await,
            WirePayload::Candidate { candidate } => {
                let init = RTCIceCandidateInit::from(candidate);
                if self.remote_described {
                    self.peer
                        .add_ice_candidate(init)
                        .await
                        .map_err(|err| EngineError::InvalidPayload(err.to_string()))
                } else {
                    self.pending.push(init);
                    Ok(())
                }
            }
        }
    }

    async fn describe(&mut self, kind: SdpKind, sdp: String) -> Result<(), EngineError> {
        let description = match (self.role, kind) {
            (EngineRole::Responder, SdpKind::Offer) => RTCSessionDescription::offer(sdp),
            (EngineRole::Initiator, SdpKind::Answer) => RTCSessionDescription::answer(sdp),
            (role, kind) => {
                return Err(EngineError::InvalidPayload(format!(
                    "{kind:?} is not valid for a {role:?} engine"
                )))
            }
        }
        .map_err(|err| EngineError::InvalidPayload(err.to_string()))?;

        self.peer
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::InvalidPayload(err.to_string()))?;
        self.remote_described = true;

        for init in self.pending.drain(..) {
            if let Err(err) = self.peer.add_ice_candidate(init).await {
                tracing::debug!(target: TARGET, error = %err, "dropping buffered candidate");
            }
        }

        if self.role == EngineRole::Responder {
            let answer = self.peer.create_answer(None).await.map_err(setup_error)?;
            self.peer
                .set_local_description(answer.clone())
                .await
                .map_err(setup_error)?;
            let payload = WirePayload::Description {
                kind: SdpKind::Answer,
                sdp: answer.sdp,
            }
            .into_payload()?;
            self.sink.signal(payload);
            self.candidates.release();
        }
        Ok(())
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<EngineConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(EngineConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(EngineConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(EngineConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(EngineConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(EngineConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(EngineConnectionState::Closed),
        _ => None,
    }
}

fn setup_error(err: webrtc::Error) -> EngineError {
    EngineError::Setup(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineEvent, EngineEventKind};
    use crate::media::StreamHandle;
    use scopecast_proto::SignalKind;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test_timeout::timeout]
    fn parses_browser_payload_shapes() {
        let offer = WirePayload::parse(json!({"type": "offer", "sdp": "v=0"}).into()).unwrap();
        assert_eq!(
            offer,
            WirePayload::Description {
                kind: SdpKind::Offer,
                sdp: "v=0".into()
            }
        );

        let candidate = WirePayload::parse(
            json!({"candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}})
                .into(),
        )
        .unwrap();
        match candidate {
            WirePayload::Candidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("expected candidate, got {other:?}"),
        }
    }

    #[test_timeout::timeout]
    fn rejects_unknown_shapes() {
        assert!(WirePayload::parse(json!({"type": "renegotiate"}).into()).is_err());
        assert!(WirePayload::parse(json!({"sdp": "v=0"}).into()).is_err());
    }

    #[test_timeout::timeout]
    fn serialized_candidate_uses_camel_case_keys() {
        let payload = WirePayload::Candidate {
            candidate: WireCandidate {
                candidate: "candidate:x".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        }
        .into_payload()
        .unwrap();
        assert_eq!(payload.as_value()["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(payload.kind(), scopecast_proto::SignalKind::Candidate);
    }

    #[test_timeout::timeout]
    fn local_candidates_wait_for_release() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let candidates = LocalCandidates::new(EngineSink::new(3, tx));

        candidates.push(json!({"candidate": {"candidate": "first"}}).into());
        candidates.push(json!({"candidate": {"candidate": "second"}}).into());
        assert!(rx.try_recv().is_err());

        candidates.release();
        candidates.push(json!({"candidate": {"candidate": "third"}}).into());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.generation, 3);
            match event.kind {
                EngineEventKind::Signal(payload) => {
                    seen.push(payload.as_value()["candidate"]["candidate"].clone())
                }
                other => panic!("expected signal, got {other:?}"),
            }
        }
        assert_eq!(seen, vec![json!("first"), json!("second"), json!("third")]);
    }

    fn spec(role: EngineRole, generation: u64, local_stream: Option<StreamHandle>) -> EngineSpec {
        EngineSpec {
            role,
            generation,
            local_stream,
            ice_servers: Vec::new(),
        }
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> SignalPayload {
        loop {
            let event = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("engine went quiet")
                .expect("engine sink dropped");
            match event.kind {
                EngineEventKind::Signal(payload) => return payload,
                EngineEventKind::ConnectionState(EngineConnectionState::Failed) => {
                    panic!("engine failed during setup")
                }
                _ => {}
            }
        }
    }

    #[test_timeout::timeout(60)]
    fn loopback_engines_negotiate_and_connect() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let factory = RtcEngineFactory::new().unwrap();
            let camera: StreamHandle = RtcLocalStream::vp8("camera");
            let (initiator_tx, mut initiator_rx) = mpsc::unbounded_channel();
            let (responder_tx, mut responder_rx) = mpsc::unbounded_channel();
            let mut initiator = factory
                .create(
                    spec(EngineRole::Initiator, 1, Some(camera)),
                    EngineSink::new(1, initiator_tx),
                )
                .unwrap();
            let mut responder = factory
                .create(
                    spec(EngineRole::Responder, 2, None),
                    EngineSink::new(2, responder_tx),
                )
                .unwrap();

            // The offer always precedes the initiator's candidates.
            let offer = next_signal(&mut initiator_rx).await;
            assert_eq!(offer.kind(), SignalKind::Offer);
            let first_candidate = next_signal(&mut initiator_rx).await;
            assert_eq!(first_candidate.kind(), SignalKind::Candidate);

            // Out of order on purpose: the responder has to hold this
            // candidate until the offer is applied.
            responder.signal(first_candidate).unwrap();
            responder.signal(offer).unwrap();

            let answer = next_signal(&mut responder_rx).await;
            assert_eq!(answer.kind(), SignalKind::Answer);
            initiator.signal(answer).unwrap();

            let mut connected = (false, false);
            let pump = async {
                while !(connected.0 && connected.1) {
                    tokio::select! {
                        Some(event) = initiator_rx.recv() => match event.kind {
                            EngineEventKind::Signal(payload) => responder.signal(payload).unwrap(),
                            EngineEventKind::ConnectionState(state) => {
                                assert_ne!(state, EngineConnectionState::Failed);
                                connected.0 |= state == EngineConnectionState::Connected;
                            }
                            EngineEventKind::RemoteStream(_) => {}
                        },
                        Some(event) = responder_rx.recv() => match event.kind {
                            EngineEventKind::Signal(payload) => initiator.signal(payload).unwrap(),
                            EngineEventKind::ConnectionState(state) => {
                                assert_ne!(state, EngineConnectionState::Failed);
                                connected.1 |= state == EngineConnectionState::Connected;
                            }
                            EngineEventKind::RemoteStream(_) => {}
                        },
                    }
                }
            };
            timeout(Duration::from_secs(30), pump)
                .await
                .expect("engines never connected");

            initiator.destroy();
            initiator.destroy();
            assert!(initiator.signal(json!({"type": "answer", "sdp": "late"}).into()).is_err());
            responder.destroy();

            // Ends on `Closed`, or when the task exits and drops its sink.
            let closed = async {
                while let Some(event) = initiator_rx.recv().await {
                    if matches!(
                        event.kind,
                        EngineEventKind::ConnectionState(EngineConnectionState::Closed)
                    ) {
                        return;
                    }
                }
            };
            timeout(Duration::from_secs(10), closed)
                .await
                .expect("initiator task never shut down");
        });
    }
}
