use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire-level envelope. Every frame exchanged with a client takes this shape;
/// the payload is kept as a raw JSON value so a malformed payload for a known
/// tag fails at the point the variant is actually used, not at decode time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default)]
    pub payload: Value,
}

/// A session description, as exchanged in SDP offer/answer negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// A single trickled ICE candidate, in the shape the browser's
/// `RTCPeerConnection.onicecandidate` callback produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// The signaling message set exchanged between a client, the signaling
/// worker, and the peer worker. `IceRestart` never crosses the client
/// socket — it is server-internal, carried only on the rtc bus.
///
/// `Sdp` and `IceCandidate` keep their payload as a raw `Value` rather than
/// an already-parsed struct: the tag alone is enough to route a message
/// between workers, so nothing downstream is forced to materialize a
/// `SessionDescription`/`IceCandidate` until the code that actually consumes
/// one asks for it via `parse_sdp`/`parse_ice_candidate`. A message may be
/// routed (and even dropped) without ever being fully parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    StartRtc,
    Sdp(Value),
    IceCandidate(Value),
    IceRestart,
    PcFailed(Option<String>),
}

impl Message {
    pub fn tag(&self) -> &'static str {
        match self {
            Message::StartRtc => "startrtc",
            Message::Sdp(_) => "sdp",
            Message::IceCandidate(_) => "icecandidate",
            Message::IceRestart => "icerestart",
            Message::PcFailed(_) => "pcfailed",
        }
    }

    pub fn sdp(description: &SessionDescription) -> Self {
        Message::Sdp(
            serde_json::to_value(description).expect("SessionDescription serialization is infallible"),
        )
    }

    pub fn ice_candidate(candidate: &IceCandidate) -> Self {
        Message::IceCandidate(
            serde_json::to_value(candidate).expect("IceCandidate serialization is infallible"),
        )
    }

    /// Parse this message's raw payload as a session description. Only
    /// meaningful on `Sdp`; any other variant is a caller bug.
    pub fn parse_sdp(&self) -> Result<SessionDescription, MessageError> {
        let Message::Sdp(payload) = self else {
            panic!("parse_sdp called on a non-Sdp message");
        };
        serde_json::from_value(payload.clone())
            .map_err(|source| MessageError::InvalidPayload { tag: "sdp", source })
    }

    /// Parse this message's raw payload as an ICE candidate. Only meaningful
    /// on `IceCandidate`; any other variant is a caller bug.
    pub fn parse_ice_candidate(&self) -> Result<IceCandidate, MessageError> {
        let Message::IceCandidate(payload) = self else {
            panic!("parse_ice_candidate called on a non-IceCandidate message");
        };
        serde_json::from_value(payload.clone()).map_err(|source| MessageError::InvalidPayload {
            tag: "icecandidate",
            source,
        })
    }

    /// Serialize to a wire frame: `{"type": "...", "payload": ...}`.
    pub fn to_json(&self) -> String {
        let envelope: Envelope = self.clone().into();
        serde_json::to_string(&envelope).expect("Envelope serialization is infallible")
    }

    /// Parse a wire frame. Fails on invalid JSON or an unrecognized tag.
    /// A recognized tag whose payload doesn't match its expected shape is
    /// not rejected here — the raw payload is kept and only fails once
    /// `parse_sdp`/`parse_ice_candidate` is actually called on it.
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        envelope.try_into()
    }
}

impl From<Message> for Envelope {
    fn from(msg: Message) -> Self {
        let tag = msg.tag().to_string();
        let payload = match msg {
            Message::StartRtc | Message::IceRestart => Value::Null,
            Message::Sdp(payload) | Message::IceCandidate(payload) => payload,
            Message::PcFailed(text) => match text {
                Some(t) => Value::String(t),
                None => Value::Null,
            },
        };
        Envelope { tag, payload }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = MessageError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        match envelope.tag.as_str() {
            "startrtc" => Ok(Message::StartRtc),
            "icerestart" => Ok(Message::IceRestart),
            "sdp" => Ok(Message::Sdp(envelope.payload)),
            "icecandidate" => Ok(Message::IceCandidate(envelope.payload)),
            "pcfailed" => match envelope.payload {
                Value::Null => Ok(Message::PcFailed(None)),
                Value::String(s) => Ok(Message::PcFailed(Some(s))),
                other => Err(MessageError::InvalidPayload {
                    tag: "pcfailed",
                    source: serde::de::Error::custom(format!(
                        "expected null or string, got {other}"
                    )),
                }),
            },
            other => Err(MessageError::UnknownTag(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownTag(String),
    #[error("invalid payload for '{tag}' frame: {source}")]
    InvalidPayload {
        tag: &'static str,
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_rtc_roundtrip() {
        let json = Message::StartRtc.to_json();
        assert!(json.contains(r#""type":"startrtc""#));
        assert!(json.contains(r#""payload":null"#));
        assert_eq!(Message::from_json(&json).unwrap(), Message::StartRtc);
    }

    #[test]
    fn sdp_roundtrip() {
        let msg = Message::sdp(&SessionDescription {
            sdp_type: "offer".to_string(),
            sdp: "v=0\r\n...".to_string(),
        });
        let json = msg.to_json();
        assert!(json.contains(r#""type":"sdp""#));
        assert!(json.contains(r#""type":"offer""#));
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn sdp_payload_is_kept_raw_until_parsed() {
        // A structurally-valid envelope with a bad-shaped sdp payload
        // decodes fine — the tag alone is enough to route it. Parsing only
        // fails once something actually asks for the typed value.
        let msg = Message::from_json(r#"{"type":"sdp","payload":"not-sdp"}"#).unwrap();
        assert!(matches!(msg, Message::Sdp(Value::String(ref s)) if s == "not-sdp"));
        let err = msg.parse_sdp().unwrap_err();
        assert!(matches!(err, MessageError::InvalidPayload { tag: "sdp", .. }));
    }

    #[test]
    fn ice_candidate_uses_sdp_mline_index_casing() {
        let msg = Message::ice_candidate(&IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        });
        let json = msg.to_json();
        assert!(json.contains(r#""type":"icecandidate""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
        assert!(!json.contains("sdp_mline_index"));
        assert_eq!(Message::from_json(&json).unwrap(), msg);
        assert_eq!(msg.parse_ice_candidate().unwrap().sdp_mline_index, Some(0));
    }

    #[test]
    fn pcfailed_empty_payload_is_none() {
        let msg = Message::PcFailed(None);
        let json = msg.to_json();
        assert!(json.contains(r#""type":"pcfailed""#));
        assert_eq!(Message::from_json(&json).unwrap(), Message::PcFailed(None));
    }

    #[test]
    fn pcfailed_carries_error_text() {
        let msg = Message::PcFailed(Some("ICE connection failed".to_string()));
        let json = msg.to_json();
        assert!(json.contains("ICE connection failed"));
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = Message::from_json(r#"{"type":"bogus","payload":null}"#).unwrap_err();
        assert!(matches!(err, MessageError::UnknownTag(t) if t == "bogus"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = Message::from_json("not json at all").unwrap_err();
        assert!(matches!(err, MessageError::Malformed(_)));
    }

    #[test]
    fn icerestart_has_no_client_facing_payload() {
        let json = Message::IceRestart.to_json();
        assert!(json.contains(r#""type":"icerestart""#));
    }
}
