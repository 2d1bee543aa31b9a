//! Client identity for a task-progress channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one session's channel.
///
/// Generated once when a session starts and reused across every reconnect
/// within that session, so the server keeps routing task frames for the
/// same client to whichever physical connection is currently open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Generate a fresh identity of the form `client_<uuid>`.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("client_{}", Uuid::new_v4().simple()))
    }

    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Identity {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identities_are_unique() {
        let a = Identity::generate();
        let b = Identity::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client_"));
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = Identity::new("client_abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"client_abc\"");
    }
}
