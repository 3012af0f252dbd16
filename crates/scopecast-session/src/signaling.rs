//! WebSocket link between a controller and the relay hub.

use futures_util::{SinkExt, StreamExt};
use scopecast_proto::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use crate::config::SignalingConfig;
use crate::error::SessionError;

/// Envelope channels to and from the hub.
///
/// Dropping the link stops the socket reader at once; the writer drains what
/// was already queued (a final `hangup`, typically) and then closes the
/// socket. Controllers treat the inbound side closing as the hub going away.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub inbound: mpsc::UnboundedReceiver<Envelope>,
    reader: Option<JoinHandle<()>>,
}

/// The hub's side of an in-memory [`SignalingLink`].
pub struct RemoteEnd {
    pub to_client: mpsc::UnboundedSender<Envelope>,
    pub from_client: mpsc::UnboundedReceiver<Envelope>,
}

impl SignalingLink {
    pub fn from_channels(
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    /// A link wired to plain channels instead of a socket.
    pub fn in_memory() -> (Self, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self::from_channels(out_tx, in_rx),
            RemoteEnd {
                to_client: in_tx,
                from_client: out_rx,
            },
        )
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

pub async fn connect(config: &SignalingConfig) -> Result<SignalingLink, SessionError> {
    let url = Url::parse(&config.hub_url).map_err(|err| {
        SessionError::Signaling(format!("invalid hub url {}: {err}", config.hub_url))
    })?;
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| SessionError::Signaling(format!("websocket connect failed: {err}")))?;
    tracing::debug!(
        target: "scopecast::signaling",
        url = %url,
        "hub websocket connected"
    );
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Envelope>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Envelope>();

    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let text = match envelope.to_text() {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(target: "scopecast::signaling", error = %err, "dropping unencodable envelope");
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            let decoded = match frame {
                Ok(Message::Text(text)) => Envelope::from_text(&text),
                Ok(Message::Binary(data)) => Envelope::from_slice(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target: "scopecast::signaling", "hub websocket closed: {err}");
                        }
                        _ => {
                            tracing::warn!(target: "scopecast::signaling", "hub websocket error: {err}");
                        }
                    }
                    break;
                }
            };
            match decoded {
                Ok(envelope) => {
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(target: "scopecast::signaling", error = %err, "dropping unparseable envelope");
                }
            }
        }
    });

    Ok(SignalingLink {
        outbound: out_tx,
        inbound: in_rx,
        reader: Some(reader),
    })
}
