use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, ValueEnum};

/// What to do with a peer whose outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SlowPeerPolicy {
    /// Discard the oldest queued envelope to make room.
    #[default]
    DropOldest,
    /// Close the connection with a policy-violation close frame.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum IdScheme {
    /// `p1`, `p2`, ... in connection order.
    #[default]
    Sequential,
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SCOPECAST_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Envelopes buffered per peer before the slow-peer policy applies.
    #[arg(long, env = "SCOPECAST_OUTBOUND_BUFFER", default_value_t = 64)]
    pub outbound_buffer: usize,

    #[arg(
        long,
        env = "SCOPECAST_SLOW_PEER_POLICY",
        value_enum,
        default_value_t = SlowPeerPolicy::DropOldest
    )]
    pub slow_peer_policy: SlowPeerPolicy,

    /// Interval between WebSocket pings sent to every peer.
    #[arg(long, env = "SCOPECAST_PING_INTERVAL_SECS", default_value_t = 20)]
    pub ping_interval_secs: u64,

    /// Connections silent for longer than this are closed and deregistered.
    #[arg(long, env = "SCOPECAST_IDLE_TIMEOUT_SECS", default_value_t = 90)]
    pub idle_timeout_secs: u64,

    #[arg(
        long,
        env = "SCOPECAST_ID_SCHEME",
        value_enum,
        default_value_t = IdScheme::Sequential
    )]
    pub id_scheme: IdScheme,

    #[arg(
        long,
        env = "SCOPECAST_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text
    )]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub outbound_buffer: usize,
    pub slow_peer_policy: SlowPeerPolicy,
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub id_scheme: IdScheme,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            outbound_buffer: 64,
            slow_peer_policy: SlowPeerPolicy::default(),
            ping_interval: Duration::from_secs(20),
            idle_timeout: Duration::from_secs(90),
            id_scheme: IdScheme::default(),
        }
    }
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one envelope");
        }
        if args.ping_interval_secs == 0 {
            bail!("ping interval must be at least one second");
        }
        if args.idle_timeout_secs <= args.ping_interval_secs {
            bail!(
                "idle timeout ({}s) must be longer than the ping interval ({}s)",
                args.idle_timeout_secs,
                args.ping_interval_secs
            );
        }
        Ok(RelayConfig {
            listen_addr,
            outbound_buffer: args.outbound_buffer,
            slow_peer_policy: args.slow_peer_policy,
            ping_interval: Duration::from_secs(args.ping_interval_secs),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            id_scheme: args.id_scheme,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        serve: ServeArgs,
    }

    fn parse(args: &[&str]) -> anyhow::Result<RelayConfig> {
        let harness = Harness::try_parse_from(std::iter::once("relay").chain(args.iter().copied()))?;
        RelayConfig::try_from(harness.serve)
    }

    #[test_timeout::timeout]
    fn defaults_match_documented_values() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, SocketAddr::from(([0, 0, 0, 0], 8000)));
        assert_eq!(config.outbound_buffer, 64);
        assert_eq!(config.slow_peer_policy, SlowPeerPolicy::DropOldest);
        assert_eq!(config.ping_interval, Duration::from_secs(20));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.id_scheme, IdScheme::Sequential);
    }

    #[test_timeout::timeout]
    fn parses_kebab_case_policies() {
        let config = parse(&[
            "--slow-peer-policy",
            "disconnect",
            "--id-scheme",
            "uuid",
            "--listen-addr",
            "127.0.0.1:9000",
        ])
        .unwrap();
        assert_eq!(config.slow_peer_policy, SlowPeerPolicy::Disconnect);
        assert_eq!(config.id_scheme, IdScheme::Uuid);
        assert_eq!(config.listen_addr.port(), 9000);
    }

    #[test_timeout::timeout]
    fn rejects_unusable_values() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--outbound-buffer", "0"]).is_err());
        assert!(parse(&["--ping-interval-secs", "30", "--idle-timeout-secs", "30"]).is_err());
    }
}
