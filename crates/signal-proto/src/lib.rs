//! Message shapes exchanged over the beach signaling relay.
//!
//! Peers and the relay both speak JSON objects carrying at most one payload:
//! a session description, an ICE candidate, or relay-originated control
//! metadata. The relay never interprets descriptions or candidates beyond
//! counting them; the negotiation controller on each peer does.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SDP description kind, serialized with the lowercase names browsers use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
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

    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }

    /// Value of the first `a=ice-ufrag:` attribute, if present.
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
            .map(str::trim)
            .filter(|ufrag| !ufrag.is_empty())
    }
}

/// ICE candidate in the `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Self::default()
        }
    }

    fn attribute_tokens(&self) -> impl Iterator<Item = &str> {
        let attribute = self
            .candidate
            .strip_prefix("candidate:")
            .unwrap_or(&self.candidate);
        attribute.split_whitespace()
    }

    /// Transport protocol, the third field of the candidate attribute.
    pub fn protocol(&self) -> Option<String> {
        self.attribute_tokens()
            .nth(2)
            .map(|proto| proto.to_ascii_lowercase())
    }

    /// Candidate type following the `typ` keyword (host, srflx, prflx, relay).
    pub fn candidate_type(&self) -> Option<&str> {
        self.value_after("typ")
    }

    pub fn tcp_type(&self) -> Option<&str> {
        self.value_after("tcptype")
    }

    fn value_after(&self, key: &str) -> Option<&str> {
        let mut tokens = self.attribute_tokens();
        while let Some(token) = tokens.next() {
            if token == key {
                return tokens.next();
            }
        }
        None
    }
}

/// Diagnostic details of one relay connection, as listed in rosters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote: String,
    pub user_agent: String,
    pub created: DateTime<Utc>,
}

/// Relay-originated metadata: politeness and the current membership roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<Vec<ConnectionInfo>>,
}

impl ControlMessage {
    pub fn member_ids(&self) -> Vec<u64> {
        self.connections
            .as_ref()
            .map(|connections| connections.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Description,
    Candidate,
    Control,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Description => "description",
            MessageKind::Candidate => "candidate",
            MessageKind::Control => "control",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed signaling payload: {0}")]
    Malformed(String),
    #[error("signaling message carries no payload")]
    Empty,
    #[error("signaling message carries {0} payloads, expected one")]
    MultiplePayloads(usize),
    #[error("binary frame is not valid utf-8")]
    InvalidUtf8,
}

impl ProtocolError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            ProtocolError::Malformed(_) => "malformed",
            ProtocolError::Empty => "empty",
            ProtocolError::MultiplePayloads(_) => "multiple_payloads",
            ProtocolError::InvalidUtf8 => "invalid_utf8",
        }
    }
}

/// One signaling frame. At most one of the fields is populated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SignalingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<ControlMessage>,
}

impl SignalingMessage {
    pub fn description(description: SessionDescription) -> Self {
        Self {
            description: Some(description),
            ..Self::default()
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::default()
        }
    }

    pub fn control(control: ControlMessage) -> Self {
        Self {
            control: Some(control),
            ..Self::default()
        }
    }

    fn payload_count(&self) -> usize {
        usize::from(self.description.is_some())
            + usize::from(self.candidate.is_some())
            + usize::from(self.control.is_some())
    }

    /// Kind of the single populated payload.
    pub fn kind(&self) -> Result<MessageKind, ProtocolError> {
        match self.payload_count() {
            0 => Err(ProtocolError::Empty),
            1 => Ok(if self.description.is_some() {
                MessageKind::Description
            } else if self.candidate.is_some() {
                MessageKind::Candidate
            } else {
                MessageKind::Control
            }),
            n => Err(ProtocolError::MultiplePayloads(n)),
        }
    }

    /// Parses and validates a text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let message: SignalingMessage =
            serde_json::from_str(text).map_err(|err| ProtocolError::Malformed(err.to_string()))?;
        message.kind()?;
        Ok(message)
    }

    /// Binary frames are accepted when they hold UTF-8 JSON.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::from_json(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for SignalingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(description) = &self.description {
            write!(f, "description({})", description.sdp_type)
        } else if let Some(candidate) = &self.candidate {
            write!(f, "candidate({})", candidate.candidate)
        } else if let Some(control) = &self.control {
            write!(
                f,
                "control(polite={:?}, id={:?}, members={:?})",
                control.polite,
                control.connection_id,
                control.member_ids()
            )
        } else {
            f.write_str("empty")
        }
    }
}

/// Entry of the relay's read-only sessions listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub name: String,
    pub created: DateTime<Utc>,
    pub connections: Vec<ConnectionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_CANDIDATE: &str =
        "candidate:1966762134 1 udp 2130706431 192.168.1.20 50012 typ host generation 0";

    #[test_timeout::timeout]
    fn description_uses_browser_field_names() {
        let message = SignalingMessage::description(SessionDescription::offer("v=0\r\n"));
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["description"]["type"], "offer");
        assert_eq!(value["description"]["sdp"], "v=0\r\n");
        assert!(value.get("candidate").is_none());
        assert!(value.get("control").is_none());
    }

    #[test_timeout::timeout]
    fn candidate_accepts_rtc_ice_candidate_init_json() {
        let text = format!(
            r#"{{"candidate":{{"candidate":"{HOST_CANDIDATE}","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}}}"#
        );
        let message = SignalingMessage::from_json(&text).unwrap();
        let candidate = message.candidate.unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
        assert_eq!(candidate.candidate_type(), Some("host"));
        assert_eq!(candidate.protocol().as_deref(), Some("udp"));
        assert_eq!(candidate.tcp_type(), None);
    }

    #[test_timeout::timeout]
    fn tcp_candidate_reports_tcp_type() {
        let candidate = IceCandidate::new(
            "candidate:2 1 TCP 1518280447 10.0.0.2 9 typ host tcptype active generation 0",
        );
        assert_eq!(candidate.protocol().as_deref(), Some("tcp"));
        assert_eq!(candidate.tcp_type(), Some("active"));
    }

    #[test_timeout::timeout]
    fn control_message_uses_camel_case() {
        let created = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let message = SignalingMessage::control(ControlMessage {
            polite: Some(true),
            connection_id: Some(1),
            connections: Some(vec![ConnectionInfo {
                id: 1,
                remote: "127.0.0.1:4000".into(),
                user_agent: "curl".into(),
                created,
            }]),
        });
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["control"]["polite"], true);
        assert_eq!(value["control"]["connectionId"], 1);
        assert_eq!(value["control"]["connections"][0]["userAgent"], "curl");
        assert_eq!(message.control.unwrap().member_ids(), vec![1]);
    }

    #[test_timeout::timeout]
    fn empty_and_multi_payload_messages_are_rejected() {
        assert_eq!(SignalingMessage::from_json("{}"), Err(ProtocolError::Empty));

        let both = r#"{"description":{"type":"answer","sdp":""},"candidate":{"candidate":""}}"#;
        assert_eq!(
            SignalingMessage::from_json(both),
            Err(ProtocolError::MultiplePayloads(2))
        );

        let err = SignalingMessage::from_json("not json").unwrap_err();
        assert_eq!(err.metric_label(), "malformed");
    }

    #[test_timeout::timeout]
    fn null_control_is_treated_as_absent() {
        let text = r#"{"description":{"type":"answer","sdp":"x"},"control":null}"#;
        let message = SignalingMessage::from_json(text).unwrap();
        assert_eq!(message.kind(), Ok(MessageKind::Description));
    }

    #[test_timeout::timeout]
    fn binary_frames_must_be_utf8() {
        assert_eq!(
            SignalingMessage::from_json_bytes(&[0xff, 0xfe]),
            Err(ProtocolError::InvalidUtf8)
        );
        let message = SignalingMessage::from_json_bytes(br#"{"candidate":{"candidate":"x"}}"#)
            .unwrap();
        assert_eq!(message.kind(), Ok(MessageKind::Candidate));
    }

    #[test_timeout::timeout]
    fn ice_ufrag_is_read_from_sdp() {
        let description =
            SessionDescription::offer("v=0\r\na=group:BUNDLE 0\r\na=ice-ufrag:Xy12\r\n");
        assert_eq!(description.ice_ufrag(), Some("Xy12"));
        assert_eq!(SessionDescription::rollback().ice_ufrag(), None);
    }
}
