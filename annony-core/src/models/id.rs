use nanoid::nanoid;
use serde::{Deserialize, Serialize};

const CONNECTION_ID_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate a 12-character nanoid for persisted records
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Per-attach connection identifier (16 lowercase alphanumerics).
///
/// A fresh id is drawn for every attach. Registries refuse an id that is
/// currently attached; retired ids are not tracked, reuse is left to the
/// 16-character random draw being practically collision-free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(nanoid!(16, &CONNECTION_ID_ALPHABET))
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Anonymous display label, e.g. `Anon-a1b2`.
    #[must_use]
    pub fn sender_label(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("Anon-{prefix}")
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}
