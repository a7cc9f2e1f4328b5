//! Session identifier type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;

/// Longest accepted session kind.
pub const MAX_KIND_LEN: usize = 32;

/// Length of the simple-form UUID after the kind.
const UNIQUE_LEN: usize = 32;

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

/// Check that `kind` can be used as a session-id prefix.
///
/// Kinds are 1 to 32 characters of lowercase ASCII letters, digits and `-`.
pub fn validate_kind(kind: &str) -> crate::Result<()> {
    let valid = !kind.is_empty()
        && kind.len() <= MAX_KIND_LEN
        && kind
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(RelayError::Configuration(format!(
            "invalid session kind '{}'",
            kind
        )))
    }
}

/// Unique identifier for a session.
///
/// Displayed as `<kind>_<unique>` where `<unique>` is the simple form of a
/// random UUID. The id is minted once at creation and never rewritten, so
/// it is safe to use as the primary key for both the session row and its
/// event log.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Mint a new id for the given kind.
    pub fn new(kind: &str) -> crate::Result<Self> {
        validate_kind(kind)?;
        Ok(Self(format!("{}_{}", kind, Uuid::new_v4().simple())))
    }

    /// The kind prefix.
    pub fn kind(&self) -> &str {
        self.0.split_once('_').map(|(kind, _)| kind).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RelayError::InvalidSessionId(s.to_string());
        let (kind, unique) = s.split_once('_').ok_or_else(invalid)?;
        validate_kind(kind).map_err(|_| invalid())?;
        if unique.len() != UNIQUE_LEN || !unique.bytes().all(is_lower_hex) {
            return Err(invalid());
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = RelayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
