//! Identity Module - Process-lifetime node identifiers
//!
//! Every running node picks a random identifier at startup. Peers are told
//! apart by this token, never by their network address, and a node uses its
//! own identifier to ignore its own announcements.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Longest identifier accepted from the wire
pub const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identifier is empty")]
    Empty,

    #[error("Identifier too long: {0} bytes")]
    TooLong(usize),

    #[error("Identifier contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
}

/// Opaque token identifying one running node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeIdentifier(String);

impl NodeIdentifier {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Validate an identifier received from a peer or from configuration.
    ///
    /// The announcement format is colon-delimited, so a colon can never be
    /// part of an identifier; whitespace and control characters are refused
    /// as well.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.is_empty() {
            return Err(IdentityError::Empty);
        }
        if s.len() > MAX_IDENTIFIER_LEN {
            return Err(IdentityError::TooLong(s.len()));
        }
        if let Some(c) = s
            .chars()
            .find(|c| *c == ':' || c.is_whitespace() || c.is_control())
        {
            return Err(IdentityError::ForbiddenCharacter(c));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeIdentifier {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for NodeIdentifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeIdentifier {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}
