//! Participant identity and the shared rendezvous key.
//!
//! `ParticipantId` is generated randomly per process instance and addresses
//! the private signal path of a participant. It displays as a 16-character
//! hex string but accepts any non-empty string when parsed, since ids are
//! opaque to everything except equality.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentError {
    #[error("Path segment cannot be empty")]
    Empty,
    #[error("Invalid character {0:?} in path segment")]
    InvalidCharacter(char),
}

/// Characters the rendezvous store cannot accept inside a single path segment.
const RESERVED_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

/// Opaque identifier of one participant.
///
/// # Examples
/// ```
/// use rendezvous_core::ParticipantId;
///
/// let id = ParticipantId::generate();
/// assert_eq!(id.as_str().len(), 16);
///
/// let parsed: ParticipantId = "A".parse().unwrap();
/// assert_eq!(parsed.as_str(), "A");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(String);

impl ParticipantId {
    /// Generate a new random participant ID.
    ///
    /// Never returns the all-zero id.
    pub fn generate() -> Self {
        use rand::Rng;
        loop {
            let id: u64 = rand::rng().random();
            if id != 0 {
                return Self(format!("{id:016x}"));
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ParticipantId {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_segment(s)?;
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = SegmentError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        validate_segment(&s)?;
        Ok(Self(s))
    }
}

// Serialize as a plain string so announcement records stay `{ "id": "..." }`
impl serde::Serialize for ParticipantId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ParticipantId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::try_from(s).map_err(serde::de::Error::custom)
    }
}

/// Key both participants agree on out-of-band; names the announcement path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SharedKey(String);

impl SharedKey {
    pub fn new(key: impl Into<String>) -> Result<Self, SegmentError> {
        let key = key.into();
        validate_segment(&key)?;
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SharedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SharedKey {
    type Err = SegmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Both ids and keys become single path segments in the store.
fn validate_segment(s: &str) -> Result<(), SegmentError> {
    if s.is_empty() {
        return Err(SegmentError::Empty);
    }
    match s.chars().find(|c| RESERVED_CHARS.contains(c)) {
        Some(c) => Err(SegmentError::InvalidCharacter(c)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_16_hex_chars() {
        let id = ParticipantId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_unique() {
        let a = ParticipantId::generate();
        let b = ParticipantId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_not_zero() {
        for _ in 0..1000 {
            assert_ne!(ParticipantId::generate().as_str(), "0000000000000000");
        }
    }

    #[test]
    fn test_parse_opaque_string() {
        let id: ParticipantId = "B".parse().unwrap();
        assert_eq!(id.to_string(), "B");
    }

    #[test]
    fn test_reject_empty() {
        assert_eq!("".parse::<ParticipantId>(), Err(SegmentError::Empty));
        assert_eq!(SharedKey::new(""), Err(SegmentError::Empty));
    }

    #[test]
    fn test_reject_path_separators() {
        assert_eq!(
            "a/b".parse::<ParticipantId>(),
            Err(SegmentError::InvalidCharacter('/'))
        );
        assert_eq!(
            SharedKey::new("room.1"),
            Err(SegmentError::InvalidCharacter('.'))
        );
    }

    #[test]
    fn test_key_error_describes_segment() {
        let err = SharedKey::new("a#b").unwrap_err();
        assert_eq!(err.to_string(), "Invalid character '#' in path segment");
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a: ParticipantId = "A".parse().unwrap();
        let b: ParticipantId = "B".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_serde_as_plain_string() {
        let id: ParticipantId = "a1b2c3".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1b2c3\"");
        let parsed: ParticipantId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_serde_rejects_empty() {
        assert!(serde_json::from_str::<ParticipantId>("\"\"").is_err());
    }
}
