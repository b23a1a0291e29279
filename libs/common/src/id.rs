use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let jti = realm_common::id::prefixed_ulid(realm_common::id::prefix::TOKEN);
/// assert!(jti.starts_with("tok_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    pub const CONNECTION: &str = "conn";
    pub const TOKEN: &str = "tok";
}

/// Process-unique identity of one live gateway connection.
///
/// Backed by a 128-bit ULID (80 random bits per millisecond), so ids minted by
/// [`ConnectionId::new`] are never reused within a process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Ulid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", prefix::CONNECTION, self.0)
    }
}

impl FromStr for ConnectionId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s
            .strip_prefix(prefix::CONNECTION)
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(s);
        Ulid::from_string(raw).map(Self)
    }
}
