//! Wire format of records written to the rendezvous store.
//!
//! Two kinds of record exist:
//! - `Announcement` (`{ "id": "..." }`) on the shared announcement path
//! - `SignalMessage` on a participant's private signal path, stored as a JSON
//!   string holding either `{ "sdp": { "type", "sdp" } }` or
//!   `{ "ice": { "candidate", "sdpMLineIndex", "sdpMid" } }`

use crate::ParticipantId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Signal is neither sdp nor ice")]
    NeitherSdpNorIce,

    #[error("Unexpected record shape: {0}")]
    UnexpectedShape(String),
}

pub type Result<T> = std::result::Result<T, SignalError>;

/// Kind of session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description produced by `create_offer` / `create_answer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A reachability candidate discovered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
}

/// Negotiation message sent to the remote participant's signal path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalMessage {
    Sdp(SessionDescription),
    Ice(IceCandidate),
}

/// Decoding view: both fields optional so a record carrying neither can be
/// reported as a protocol violation rather than a parse error.
#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(default)]
    sdp: Option<SessionDescription>,
    #[serde(default)]
    ice: Option<IceCandidate>,
}

impl SignalMessage {
    /// Message type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Sdp(desc) => match desc.sdp_type {
                SdpType::Offer => "offer",
                SdpType::Answer => "answer",
                SdpType::Pranswer => "pranswer",
                SdpType::Rollback => "rollback",
            },
            SignalMessage::Ice(_) => "ice",
        }
    }

    /// Encode as a store record: the JSON text of the message, as a string value.
    pub fn to_record(&self) -> Result<Value> {
        Ok(Value::String(serde_json::to_string(self)?))
    }

    /// Decode a store record.
    ///
    /// Accepts the string form written by `to_record` as well as an inline
    /// JSON object. When both `sdp` and `ice` are present, `sdp` wins.
    pub fn from_record(record: &Value) -> Result<Self> {
        let raw: RawSignal = match record {
            Value::String(text) => serde_json::from_str(text)?,
            Value::Object(_) => serde_json::from_value(record.clone())?,
            other => return Err(SignalError::UnexpectedShape(other.to_string())),
        };

        match (raw.sdp, raw.ice) {
            (Some(desc), _) => Ok(SignalMessage::Sdp(desc)),
            (None, Some(candidate)) => Ok(SignalMessage::Ice(candidate)),
            (None, None) => Err(SignalError::NeitherSdpNorIce),
        }
    }
}

/// Presence record on the shared announcement path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub id: ParticipantId,
}

impl Announcement {
    pub fn new(id: ParticipantId) -> Self {
        Self { id }
    }

    pub fn to_record(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_record(record: &Value) -> Result<Self> {
        Ok(serde_json::from_value(record.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate() -> IceCandidate {
        IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54400 typ host".into(),
            sdp_m_line_index: Some(0),
            sdp_mid: Some("0".into()),
        }
    }

    #[test]
    fn test_sdp_wire_shape() {
        let msg = SignalMessage::Sdp(SessionDescription::offer("v=0"));
        let Value::String(text) = msg.to_record().unwrap() else {
            panic!("signal records are strings");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({ "sdp": { "type": "offer", "sdp": "v=0" } }));
    }

    #[test]
    fn test_ice_wire_shape() {
        let msg = SignalMessage::Ice(candidate());
        let Value::String(text) = msg.to_record().unwrap() else {
            panic!("signal records are strings");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["ice"]["sdpMLineIndex"], 0);
        assert_eq!(value["ice"]["sdpMid"], "0");
    }

    #[test]
    fn test_decode_string_record() {
        let record = SignalMessage::Ice(candidate()).to_record().unwrap();
        let decoded = SignalMessage::from_record(&record).unwrap();
        assert_eq!(decoded, SignalMessage::Ice(candidate()));
    }

    #[test]
    fn test_decode_object_record() {
        let record = json!({ "sdp": { "type": "answer", "sdp": "v=0" } });
        let decoded = SignalMessage::from_record(&record).unwrap();
        assert_eq!(decoded.kind(), "answer");
    }

    #[test]
    fn test_sdp_takes_priority_over_ice() {
        let record = json!({
            "sdp": { "type": "offer", "sdp": "v=0" },
            "ice": { "candidate": "c" }
        });
        let decoded = SignalMessage::from_record(&record).unwrap();
        assert!(matches!(decoded, SignalMessage::Sdp(_)));
    }

    #[test]
    fn test_candidate_without_optional_fields() {
        let record = json!({ "ice": { "candidate": "c" } });
        let SignalMessage::Ice(c) = SignalMessage::from_record(&record).unwrap() else {
            panic!("expected ice");
        };
        assert_eq!(c.sdp_m_line_index, None);
        assert_eq!(c.sdp_mid, None);
    }

    #[test]
    fn test_neither_sdp_nor_ice() {
        let record = json!({ "hello": "world" });
        assert!(matches!(
            SignalMessage::from_record(&record),
            Err(SignalError::NeitherSdpNorIce)
        ));
    }

    #[test]
    fn test_invalid_json_text() {
        let record = Value::String("not json".into());
        assert!(matches!(
            SignalMessage::from_record(&record),
            Err(SignalError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_object_record() {
        assert!(matches!(
            SignalMessage::from_record(&json!(42)),
            Err(SignalError::UnexpectedShape(_))
        ));
    }

    #[test]
    fn test_announcement_record() {
        let announcement = Announcement::new("A".parse().unwrap());
        let record = announcement.to_record().unwrap();
        assert_eq!(record, json!({ "id": "A" }));
        assert_eq!(Announcement::from_record(&record).unwrap(), announcement);
    }

    #[test]
    fn test_announcement_missing_id() {
        assert!(Announcement::from_record(&json!({ "name": "A" })).is_err());
    }
}
