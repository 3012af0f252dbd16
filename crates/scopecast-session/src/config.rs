use std::env;
use std::time::Duration;

use crate::camera::{FacingMode, MediaPreferences};

pub const DEFAULT_ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
pub const DEFAULT_HUB_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 30;

/// Settings shared by the publisher and viewer controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub ice_servers: Vec<String>,
    /// How long an engine may take to report `Connected` before the
    /// controller flags the attempt as stalled. `None` disables the check.
    pub negotiation_timeout: Option<Duration>,
    pub media: MediaPreferences,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            negotiation_timeout: Some(Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS)),
            media: MediaPreferences::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let ice_servers = lookup("SCOPECAST_ICE_SERVERS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or(defaults.ice_servers);
        let negotiation_timeout = match lookup("SCOPECAST_NEGOTIATION_TIMEOUT_SECS")
            .and_then(|val| val.trim().parse::<u64>().ok())
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.negotiation_timeout,
        };
        let facing = match lookup("SCOPECAST_CAMERA_FACING").as_deref() {
            Some("user") | Some("front") => FacingMode::User,
            _ => FacingMode::Environment,
        };

        Self {
            ice_servers,
            negotiation_timeout,
            media: MediaPreferences {
                facing,
                device_id: lookup("SCOPECAST_CAMERA_DEVICE").filter(|id| !id.is_empty()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    pub hub_url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_string(),
        }
    }
}

impl SignalingConfig {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
        }
    }

    pub fn from_env() -> Self {
        env::var("SCOPECAST_HUB_URL")
            .map(Self::new)
            .unwrap_or_default()
    }
}
