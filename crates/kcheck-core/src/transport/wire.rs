//! Channel wire format: signed JSON frames, one per line.
//!
//! Every frame is a single JSON object terminated by `\n`:
//!
//! ```text
//! {"header":{..},"parent_header":{..},"metadata":{..},"content":{..},"signature":"<hex>"}
//! ```
//!
//! The signature is HMAC-SHA256 over the compact serialization of
//! `header`, `parent_header`, `metadata` and `content`, concatenated in that
//! order. An empty key disables signing: frames are sent with an empty
//! signature and incoming signatures are not checked.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::TransportError;
use crate::event::{Envelope, Event, KernelState, Origin, TurnId};

type HmacSha256 = Hmac<Sha256>;

/// Messaging protocol version stamped on outgoing headers.
pub const PROTOCOL_VERSION: &str = "5.3";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Frame header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msg_id: String,
    pub msg_type: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: String,
}

impl Header {
    pub fn new(msg_type: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            msg_type: msg_type.into(),
            session: session.into(),
            username: "kcheck".to_string(),
            date: Some(Utc::now()),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A decoded, authenticated frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    /// Header of the message this one responds to; `{}` when unsolicited.
    pub parent_header: Value,
    pub metadata: Value,
    pub content: Value,
}

impl Message {
    /// Build a message, optionally parented to `parent`.
    pub fn new(header: Header, parent: Option<&Header>, content: Value) -> Self {
        let parent_header = match parent {
            Some(h) => serde_json::to_value(h).unwrap_or_else(|_| empty_object()),
            None => empty_object(),
        };
        Self {
            header,
            parent_header,
            metadata: empty_object(),
            content,
        }
    }

    /// `msg_id` of the parent header, if present.
    pub fn parent_msg_id(&self) -> Option<&str> {
        self.parent_header.get("msg_id").and_then(Value::as_str)
    }

    /// What the parent header points at. Ids that are not UUIDs cannot be
    /// ours and are kept verbatim.
    pub fn parent_origin(&self) -> Origin {
        match self.parent_msg_id() {
            None | Some("") => Origin::Unattributed,
            Some(id) => match Uuid::parse_str(id) {
                Ok(uuid) => Origin::Turn(TurnId::from_uuid(uuid)),
                Err(_) => Origin::Foreign(id.to_string()),
            },
        }
    }
}

/// Raw frame layout on the wire. Parts stay as `Value` so the signature is
/// checked against exactly what was received.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    header: Value,
    #[serde(default = "empty_object")]
    parent_header: Value,
    #[serde(default = "empty_object")]
    metadata: Value,
    #[serde(default = "empty_object")]
    content: Value,
    #[serde(default)]
    signature: String,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Signs and verifies frames with the connection key.
#[derive(Clone)]
pub struct Signer {
    key: Vec<u8>,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Signer {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    /// A signer with an empty key; signs nothing and accepts anything.
    pub fn disabled() -> Self {
        Self { key: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.key.is_empty()
    }

    fn mac(&self, parts: [&Value; 4]) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        for part in parts {
            mac.update(part.to_string().as_bytes());
        }
        mac
    }

    fn sign_parts(&self, parts: [&Value; 4]) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        hex::encode(self.mac(parts).finalize().into_bytes())
    }

    fn verify_parts(&self, parts: [&Value; 4], signature: &str) -> Result<(), TransportError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let provided = hex::decode(signature)
            .map_err(|e| TransportError::Decode(format!("invalid hex in signature: {e}")))?;
        self.mac(parts)
            .verify_slice(&provided)
            .map_err(|_| TransportError::Decode("frame signature mismatch".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Encode / decode
// ---------------------------------------------------------------------------

/// Serialize and sign a message as a single line (without the trailing
/// newline).
pub fn encode_frame(message: &Message, signer: &Signer) -> Result<String, TransportError> {
    let header = serde_json::to_value(&message.header)
        .map_err(|e| TransportError::Decode(format!("unserializable header: {e}")))?;
    let signature = signer.sign_parts([
        &header,
        &message.parent_header,
        &message.metadata,
        &message.content,
    ]);
    let frame = Frame {
        header,
        parent_header: message.parent_header.clone(),
        metadata: message.metadata.clone(),
        content: message.content.clone(),
        signature,
    };
    serde_json::to_string(&frame)
        .map_err(|e| TransportError::Decode(format!("unserializable frame: {e}")))
}

/// Parse and authenticate one line of input.
pub fn decode_frame(line: &str, signer: &Signer) -> Result<Message, TransportError> {
    let frame: Frame = serde_json::from_str(line)
        .map_err(|e| TransportError::Decode(format!("malformed JSON frame: {e}")))?;
    signer.verify_parts(
        [
            &frame.header,
            &frame.parent_header,
            &frame.metadata,
            &frame.content,
        ],
        &frame.signature,
    )?;
    let header: Header = serde_json::from_value(frame.header)
        .map_err(|e| TransportError::Decode(format!("malformed header: {e}")))?;
    Ok(Message {
        header,
        parent_header: frame.parent_header,
        metadata: frame.metadata,
        content: frame.content,
    })
}

// ---------------------------------------------------------------------------
// Message -> Event
// ---------------------------------------------------------------------------

/// Translate a broadcast or reply message into an [`Envelope`].
///
/// Known kinds with missing fields decode leniently (empty strings); a
/// status with an unrecognised state and any unmodelled kind become
/// [`Event::Unknown`] so validators can decide their relevance.
pub fn message_to_envelope(message: &Message) -> Envelope {
    let content = &message.content;
    let str_field = |name: &str| {
        content
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let event = match message.header.msg_type.as_str() {
        "stream" => Event::Stream {
            name: str_field("name"),
            text: str_field("text"),
        },
        "display_data" | "update_display_data" => Event::DisplayPayload {
            data: mime_bundle(content),
        },
        "execute_result" => Event::ExecuteResult {
            execution_count: content.get("execution_count").and_then(Value::as_u64),
            data: mime_bundle(content),
        },
        "error" => Event::Error {
            kind: str_field("ename"),
            message: str_field("evalue"),
        },
        "status" => match content
            .get("execution_state")
            .and_then(Value::as_str)
            .and_then(KernelState::parse)
        {
            Some(state) => Event::Status { state },
            None => unknown(message),
        },
        "execute_input" => Event::ExecuteInput {
            code: str_field("code"),
        },
        "execute_reply" => Event::Reply {
            status: str_field("status"),
        },
        _ => unknown(message),
    };

    Envelope {
        origin: message.parent_origin(),
        event,
    }
}

fn unknown(message: &Message) -> Event {
    Event::Unknown {
        kind: message.header.msg_type.clone(),
        content: message.content.clone(),
    }
}

fn mime_bundle(content: &Value) -> BTreeMap<String, Value> {
    content
        .get("data")
        .and_then(Value::as_object)
        .map(|data| data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}
