use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned identifier of one live connection.
///
/// Only meaningful inside the relay's current connection table; a value is
/// never handed out twice during the lifetime of a relay process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where an envelope should go. On the wire this is the nullable `target`
/// field; nothing outside the serde boundary ever looks at the null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Route {
    /// Every live connection except the sender.
    #[default]
    Broadcast,
    Unicast(PeerId),
}

impl Route {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Route::Broadcast)
    }

    pub fn peer(&self) -> Option<&PeerId> {
        match self {
            Route::Broadcast => None,
            Route::Unicast(peer) => Some(peer),
        }
    }
}

impl From<Option<PeerId>> for Route {
    fn from(value: Option<PeerId>) -> Self {
        match value {
            // Browsers treat an empty target as falsy, so it broadcasts too.
            Some(peer) if !peer.as_str().is_empty() => Route::Unicast(peer),
            _ => Route::Broadcast,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Broadcast => f.write_str("*"),
            Route::Unicast(peer) => write!(f, "{peer}"),
        }
    }
}

/// Serde adapter mapping `Route` to the wire's nullable `target`.
pub(crate) mod wire_target {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{PeerId, Route};

    pub fn serialize<S>(route: &Route, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match route {
            Route::Broadcast => serializer.serialize_none(),
            Route::Unicast(peer) => serializer.serialize_some(peer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Route, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<PeerId>::deserialize(deserializer).map(Route::from)
    }
}
