//! Peer identity
//!
//! Identities are opaque strings handed out by the relay when a client
//! connects. They are transient: a reconnect yields a new identity, and nothing
//! in this crate tries to carry one across connections.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Maximum identity length accepted on the wire
pub const MAX_PEER_ID_LENGTH: usize = 256;

/// Identity errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The relay assigned an empty identity
    #[error("Relay assigned an empty identity")]
    Empty,

    /// Identity exceeds [`MAX_PEER_ID_LENGTH`]
    #[error("Identity too long: {0} bytes")]
    TooLong(usize),

    /// An identity was already assigned on this connection
    #[error("Identity already assigned: {0}")]
    AlreadyAssigned(PeerId),
}

/// Relay-assigned identity of a client
///
/// Serializes as a bare string so it can sit directly in relay messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create an identity from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identity is the empty string
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that the identity can be used as a message address
    ///
    /// # Errors
    ///
    /// Returns error if the identity is empty or too long
    pub fn validate(&self) -> Result<(), IdentityError> {
        if self.0.is_empty() {
            return Err(IdentityError::Empty);
        }
        if self.0.len() > MAX_PEER_ID_LENGTH {
            return Err(IdentityError::TooLong(self.0.len()));
        }
        Ok(())
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identity of this client for the lifetime of one relay connection
///
/// Written exactly once, when the relay pushes `identity-assigned`.
#[derive(Debug, Default)]
pub struct LocalIdentity {
    cell: OnceCell<PeerId>,
}

impl LocalIdentity {
    /// Create an unassigned identity slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the identity pushed by the relay
    ///
    /// # Errors
    ///
    /// Returns error if the identity is invalid or one was already assigned
    pub fn assign(&self, id: PeerId) -> Result<(), IdentityError> {
        id.validate()?;
        if let Some(existing) = self.cell.get() {
            return Err(IdentityError::AlreadyAssigned(existing.clone()));
        }
        self.cell
            .set(id)
            .map_err(IdentityError::AlreadyAssigned)
    }

    /// Get the assigned identity, if any
    pub fn get(&self) -> Option<&PeerId> {
        self.cell.get()
    }

    /// Whether the relay has assigned an identity yet
    pub fn is_assigned(&self) -> bool {
        self.cell.get().is_some()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_and_parse() {
        let id: PeerId = "a1".parse().unwrap();
        assert_eq!(id.to_string(), "a1");
        assert_eq!(id.as_str(), "a1");
        assert!(!id.is_empty());
        assert!(PeerId::default().is_empty());
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let id = PeerId::new("b2");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"b2\"");
        let back: PeerId = serde_json::from_str("\"b2\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_peer_id_validation() {
        assert_eq!(PeerId::new("").validate(), Err(IdentityError::Empty));
        let long = PeerId::new("x".repeat(MAX_PEER_ID_LENGTH + 1));
        assert_eq!(
            long.validate(),
            Err(IdentityError::TooLong(MAX_PEER_ID_LENGTH + 1))
        );
        assert!(PeerId::new("x".repeat(MAX_PEER_ID_LENGTH)).validate().is_ok());
    }

    #[test]
    fn test_local_identity_is_set_once() {
        let local = LocalIdentity::new();
        assert!(!local.is_assigned());
        assert!(local.get().is_none());

        local.assign(PeerId::new("a1")).unwrap();
        assert_eq!(local.get(), Some(&PeerId::new("a1")));

        let second = local.assign(PeerId::new("zz"));
        assert_eq!(
            second,
            Err(IdentityError::AlreadyAssigned(PeerId::new("a1")))
        );
        assert_eq!(local.get(), Some(&PeerId::new("a1")));
    }

    #[test]
    fn test_local_identity_rejects_empty() {
        let local = LocalIdentity::new();
        assert_eq!(local.assign(PeerId::new("")), Err(IdentityError::Empty));
        assert!(!local.is_assigned());
    }
}
