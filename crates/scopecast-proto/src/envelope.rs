use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::{PeerId, Route};
use crate::ProtoError;

/// One routed signaling message.
///
/// The relay stamps nothing except the initial [`Envelope::Id`]; every other
/// variant is produced by a publisher or viewer and relayed verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Relay → new connection, exactly once, before anything else.
    Id { id: PeerId },
    /// A viewer (re)announcing itself so publishers (re)offer.
    Ready {
        from: PeerId,
        #[serde(
            default,
            with = "crate::peer::wire_target",
            skip_serializing_if = "Route::is_broadcast"
        )]
        target: Route,
    },
    Offer {
        from: PeerId,
        #[serde(default, with = "crate::peer::wire_target")]
        target: Route,
        data: SignalPayload,
    },
    Answer {
        from: PeerId,
        #[serde(default, with = "crate::peer::wire_target")]
        target: Route,
        data: SignalPayload,
    },
    Candidate {
        from: PeerId,
        #[serde(default, with = "crate::peer::wire_target")]
        target: Route,
        data: SignalPayload,
    },
    /// Best-effort goodbye. Older pages send it without `from`.
    Hangup {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(
            default,
            with = "crate::peer::wire_target",
            skip_serializing_if = "Route::is_broadcast"
        )]
        target: Route,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    Id,
    Ready,
    Offer,
    Answer,
    Candidate,
    Hangup,
}

impl EnvelopeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeType::Id => "id",
            EnvelopeType::Ready => "ready",
            EnvelopeType::Offer => "offer",
            EnvelopeType::Answer => "answer",
            EnvelopeType::Candidate => "candidate",
            EnvelopeType::Hangup => "hangup",
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three envelope types that carry negotiation-engine payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl From<SignalKind> for EnvelopeType {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::Offer => EnvelopeType::Offer,
            SignalKind::Answer => EnvelopeType::Answer,
            SignalKind::Candidate => EnvelopeType::Candidate,
        }
    }
}

/// Negotiation-engine payload. Opaque to the relay and to the controllers;
/// only the optional `type` discriminator is ever inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalPayload(Value);

impl SignalPayload {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// The payload's own discriminator, falling back to `Candidate`.
    ///
    /// Engines emit many candidates and at most one offer/answer per attempt,
    /// so only `offer` and `answer` are honoured; anything else travels as a
    /// candidate and is handed back to the engine untouched.
    pub fn kind(&self) -> SignalKind {
        match self.0.get("type").and_then(Value::as_str) {
            Some("offer") => SignalKind::Offer,
            Some("answer") => SignalKind::Answer,
            _ => SignalKind::Candidate,
        }
    }
}

impl From<Value> for SignalPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl Envelope {
    pub fn signal(kind: SignalKind, from: PeerId, target: Route, data: SignalPayload) -> Self {
        match kind {
            SignalKind::Offer => Envelope::Offer { from, target, data },
            SignalKind::Answer => Envelope::Answer { from, target, data },
            SignalKind::Candidate => Envelope::Candidate { from, target, data },
        }
    }

    /// Wrap an outbound engine payload, typed by the payload's discriminator.
    pub fn from_engine_payload(from: PeerId, target: Route, data: SignalPayload) -> Self {
        Self::signal(data.kind(), from, target, data)
    }

    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::Id { .. } => EnvelopeType::Id,
            Envelope::Ready { .. } => EnvelopeType::Ready,
            Envelope::Offer { .. } => EnvelopeType::Offer,
            Envelope::Answer { .. } => EnvelopeType::Answer,
            Envelope::Candidate { .. } => EnvelopeType::Candidate,
            Envelope::Hangup { .. } => EnvelopeType::Hangup,
        }
    }

    pub fn from_peer(&self) -> Option<&PeerId> {
        match self {
            Envelope::Id { .. } => None,
            Envelope::Ready { from, .. }
            | Envelope::Offer { from, .. }
            | Envelope::Answer { from, .. }
            | Envelope::Candidate { from, .. } => Some(from),
            Envelope::Hangup { from, .. } => from.as_ref(),
        }
    }

    pub fn route(&self) -> Route {
        match self {
            Envelope::Id { .. } => Route::Broadcast,
            Envelope::Ready { target, .. }
            | Envelope::Offer { target, .. }
            | Envelope::Answer { target, .. }
            | Envelope::Candidate { target, .. }
            | Envelope::Hangup { target, .. } => target.clone(),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(ProtoError::Encode)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(ProtoError::Decode)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(ProtoError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn id_envelope_matches_wire_shape() {
        let text = Envelope::Id { id: "p1".into() }.to_text().unwrap();
        assert_eq!(text, r#"{"type":"id","id":"p1"}"#);
    }

    #[test_timeout::timeout]
    fn ready_and_hangup_omit_broadcast_target() {
        let ready = Envelope::Ready {
            from: "p2".into(),
            target: Route::Broadcast,
        };
        assert_eq!(ready.to_text().unwrap(), r#"{"type":"ready","from":"p2"}"#);

        let hangup = Envelope::Hangup {
            from: Some("p1".into()),
            target: Route::Unicast("p2".into()),
        };
        let value: Value = serde_json::from_str(&hangup.to_text().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "hangup", "from": "p1", "target": "p2"}));
    }

    #[test_timeout::timeout]
    fn offer_serializes_null_target_for_broadcast() {
        let offer = Envelope::Offer {
            from: "p1".into(),
            target: Route::Broadcast,
            data: json!({"type": "offer", "sdp": "v=0"}).into(),
        };
        let value: Value = serde_json::from_str(&offer.to_text().unwrap()).unwrap();
        assert_eq!(value["target"], Value::Null);
        assert_eq!(value["data"]["sdp"], "v=0");
    }

    #[test_timeout::timeout]
    fn missing_null_and_empty_targets_all_broadcast() {
        for text in [
            r#"{"type":"candidate","from":"p1","data":{}}"#,
            r#"{"type":"candidate","from":"p1","target":null,"data":{}}"#,
            r#"{"type":"candidate","from":"p1","target":"","data":{}}"#,
        ] {
            let envelope = Envelope::from_text(text).unwrap();
            assert_eq!(envelope.route(), Route::Broadcast, "{text}");
        }

        let unicast =
            Envelope::from_text(r#"{"type":"answer","from":"p2","target":"p1","data":{}}"#)
                .unwrap();
        assert_eq!(unicast.route(), Route::Unicast("p1".into()));
    }

    #[test_timeout::timeout]
    fn hangup_without_sender_still_decodes() {
        let envelope = Envelope::from_text(r#"{"type":"hangup"}"#).unwrap();
        assert_eq!(envelope.kind(), EnvelopeType::Hangup);
        assert!(envelope.from_peer().is_none());
    }

    #[test_timeout::timeout]
    fn engine_payload_type_drives_envelope_type() {
        let from = PeerId::from("p1");
        let offer = Envelope::from_engine_payload(
            from.clone(),
            Route::Broadcast,
            json!({"type": "offer", "sdp": "x"}).into(),
        );
        assert_eq!(offer.kind(), EnvelopeType::Offer);

        let answer = Envelope::from_engine_payload(
            from.clone(),
            Route::Unicast("p2".into()),
            json!({"type": "answer", "sdp": "y"}).into(),
        );
        assert_eq!(answer.kind(), EnvelopeType::Answer);

        let untagged = Envelope::from_engine_payload(
            from.clone(),
            Route::Broadcast,
            json!({"candidate": {"candidate": "candidate:1 1 udp"}}).into(),
        );
        assert_eq!(untagged.kind(), EnvelopeType::Candidate);

        let renegotiate = Envelope::from_engine_payload(
            from,
            Route::Broadcast,
            json!({"type": "renegotiate"}).into(),
        );
        assert_eq!(renegotiate.kind(), EnvelopeType::Candidate);
    }

    #[test_timeout::timeout]
    fn unknown_type_is_rejected() {
        assert!(Envelope::from_text(r#"{"type":"bogus","from":"p1"}"#).is_err());
        assert!(Envelope::from_text("not json").is_err());
    }
}
