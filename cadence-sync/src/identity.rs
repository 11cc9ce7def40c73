//! Room and participant identity.
//!
//! Room ids arrive from links and text input, so they are validated once at
//! the boundary and carried as [`RoomId`] afterwards. Display names are
//! free text and are sanitized rather than rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Longest accepted room id, in characters.
pub const MAX_ROOM_ID_LEN: usize = 20;

/// Longest display name kept after sanitizing, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 50;

/// Reasons a room id is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomIdError {
    #[error("room id is empty")]
    Empty,
    #[error("room id is longer than {MAX_ROOM_ID_LEN} characters")]
    TooLong,
    #[error("room id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Validated room name: ASCII letters, digits, `-` and `_`, at most 20 chars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        if raw.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(RoomIdError::InvalidChar(bad));
        }
        if raw.chars().count() > MAX_ROOM_ID_LEN {
            return Err(RoomIdError::TooLong);
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl std::str::FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Make a user-supplied display name safe to echo into any roster view.
///
/// Angle brackets are escaped, quotes dropped, whitespace trimmed and the
/// result capped at [`MAX_DISPLAY_NAME_LEN`] characters.
pub fn sanitize_display_name(raw: &str) -> String {
    let escaped: String = raw
        .chars()
        .filter(|c| *c != '"' && *c != '\'')
        .map(|c| match c {
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            other => other.to_string(),
        })
        .collect();
    escaped.trim().chars().take(MAX_DISPLAY_NAME_LEN).collect()
}

/// Fresh participant id, stable for the lifetime of one session.
pub fn new_participant_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_accepts_allowed_charset() {
        let id = RoomId::parse("tavern_night-2").unwrap();
        assert_eq!(id.as_str(), "tavern_night-2");
        assert_eq!(id.to_string(), "tavern_night-2");
    }

    #[test]
    fn test_room_id_rejects_empty() {
        assert_eq!(RoomId::parse(""), Err(RoomIdError::Empty));
    }

    #[test]
    fn test_room_id_rejects_too_long() {
        let long = "a".repeat(MAX_ROOM_ID_LEN + 1);
        assert_eq!(RoomId::parse(&long), Err(RoomIdError::TooLong));
        assert!(RoomId::parse(&"a".repeat(MAX_ROOM_ID_LEN)).is_ok());
    }

    #[test]
    fn test_room_id_rejects_bad_chars() {
        assert_eq!(RoomId::parse("room 1"), Err(RoomIdError::InvalidChar(' ')));
        assert_eq!(RoomId::parse("a/b"), Err(RoomIdError::InvalidChar('/')));
        assert!(RoomId::parse("sala-ñ").is_err());
    }

    #[test]
    fn test_room_id_from_str() {
        let id: RoomId = "dungeon".parse().unwrap();
        assert_eq!(id.as_ref(), "dungeon");
    }

    #[test]
    fn test_sanitize_escapes_and_trims() {
        assert_eq!(
            sanitize_display_name("  <b>Gandalf</b> "),
            "&lt;b&gt;Gandalf&lt;/b&gt;"
        );
        assert_eq!(sanitize_display_name("O'Brien \"the bard\""), "OBrien the bard");
    }

    #[test]
    fn test_sanitize_truncates() {
        let name = "x".repeat(80);
        assert_eq!(sanitize_display_name(&name).chars().count(), MAX_DISPLAY_NAME_LEN);
    }

    #[test]
    fn test_participant_ids_are_unique() {
        assert_ne!(new_participant_id(), new_participant_id());
    }
}
