use anyhow::{anyhow, Context, Result};
use clap::Args;
use futures_util::{SinkExt, StreamExt};
use scopecast_proto::{Envelope, PeerId, Route};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

/// Connect to a running relay, report the assigned identity and print the
/// envelopes that arrive.
#[derive(Debug, Clone, Args)]
pub struct ProbeArgs {
    /// Relay WebSocket URL.
    #[arg(short, long, env = "SCOPECAST_HUB_URL", default_value = "ws://127.0.0.1:8000/ws")]
    pub url: String,

    /// Broadcast a `ready` once the identity arrives, as a viewer would.
    #[arg(long)]
    pub announce: bool,

    /// How long to keep listening after the identity arrives.
    #[arg(long, default_value_t = 10)]
    pub listen_secs: u64,
}

pub async fn run(args: ProbeArgs) -> Result<()> {
    debug!(url = %args.url, "connecting to relay");
    let (ws, _) = match timeout(Duration::from_secs(5), connect_async(args.url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            error!(url = %args.url, error = %err, "failed to connect");
            return Err(anyhow!("connection failed: {err}"));
        }
        Err(_) => {
            return Err(anyhow!("connection timeout - is the relay running?"));
        }
    };
    let (mut write, mut read) = ws.split();

    let self_id = timeout(Duration::from_secs(5), async {
        while let Some(frame) = read.next().await {
            if let Message::Text(text) = frame? {
                if let Envelope::Id { id } = Envelope::from_text(&text)? {
                    return Ok::<PeerId, anyhow::Error>(id);
                }
            }
        }
        Err(anyhow!("relay closed the connection before assigning an id"))
    })
    .await
    .context("timed out waiting for id envelope")??;
    println!("assigned id: {self_id}");

    if args.announce {
        let ready = Envelope::Ready {
            from: self_id.clone(),
            target: Route::Broadcast,
        };
        write.send(Message::Text(ready.to_text()?)).await?;
        println!("sent ready");
    }

    let deadline = Instant::now() + Duration::from_secs(args.listen_secs);
    loop {
        let frame = match tokio::time::timeout_at(deadline, read.next()).await {
            Ok(Some(frame)) => frame?,
            Ok(None) => {
                println!("relay closed the connection");
                break;
            }
            Err(_) => break,
        };
        match frame {
            Message::Text(text) => match Envelope::from_text(&text) {
                Ok(envelope) => println!(
                    "{} from={} target={}",
                    envelope.kind(),
                    envelope
                        .from_peer()
                        .map(PeerId::as_str)
                        .unwrap_or("-"),
                    envelope.route()
                ),
                Err(err) => println!("unparseable frame: {err}"),
            },
            Message::Close(frame) => {
                println!("relay sent close: {frame:?}");
                break;
            }
            _ => {}
        }
    }

    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
