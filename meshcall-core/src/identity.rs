//! User identity
//!
//! Users are identified by an opaque string assigned by the application's
//! account system. Identities are totally ordered so that two peers can agree
//! on a tie-break without talking to each other (see glare handling in
//! [`crate::peer`]).

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Identifier of a user taking part in calls
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this side wins an offer collision against `other`
    ///
    /// The lexicographically smaller id keeps its offer.
    pub fn wins_glare_against(&self, other: &UserId) -> bool {
        self < other
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Profile of the user running this engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    /// User identifier
    pub id: UserId,
    /// Name shown to other participants
    pub display_name: String,
    /// Optional avatar location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl LocalUser {
    /// Create a profile with no avatar
    pub fn new(id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            avatar_url: None,
        }
    }
}

impl Default for LocalUser {
    fn default() -> Self {
        Self::new("anonymous", "Anonymous")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_glare_tie_break_is_antisymmetric() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        assert!(alice.wins_glare_against(&bob));
        assert!(!bob.wins_glare_against(&alice));
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("carol");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
