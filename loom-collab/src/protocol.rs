//! Binary wire protocol shared by clients and relays.
//!
//! Every frame starts with a lib0 variable-length unsigned integer tag,
//! followed by a tag-specific payload:
//! ```text
//! ┌─────────────┬───────────────────────────────────────────────┐
//! │ tag varuint │ payload                                       │
//! ├─────────────┼───────────────────────────────────────────────┤
//! │ 0 SYNC      │ sub-type varuint │ varUint8Array (sv/update)  │
//! │ 1 AWARENESS │ varUint8Array (encoded awareness diff)        │
//! │ 2 AUTH      │ 0 (denied) varuint │ varString reason         │
//! │ 3 QUERY_AW. │ (empty)                                       │
//! └─────────────┴───────────────────────────────────────────────┘
//! ```
//!
//! The lib0 primitives come from `yrs::encoding`; frames are written into a
//! plain `Vec<u8>` and read back through a [`Cursor`].

use yrs::encoding::read::{self, Cursor, Read};
use yrs::encoding::write::Write;
use yrs::sync::protocol::{
    MSG_AUTH, MSG_AWARENESS, MSG_QUERY_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2,
    MSG_SYNC_UPDATE, PERMISSION_DENIED,
};

/// Message-type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Document sync handshake and incremental updates
    Sync = MSG_SYNC,
    /// Awareness (presence) diff
    Awareness = MSG_AWARENESS,
    /// Authorization outcome
    Auth = MSG_AUTH,
    /// Request for a full awareness broadcast
    QueryAwareness = MSG_QUERY_AWARENESS,
}

impl MessageType {
    /// Wire tag for this message type.
    pub fn tag(self) -> u64 {
        self as u64
    }

    /// Resolve a wire tag.
    pub fn from_tag(tag: u64) -> Result<Self, ProtocolError> {
        match u8::try_from(tag) {
            Ok(MSG_SYNC) => Ok(MessageType::Sync),
            Ok(MSG_AWARENESS) => Ok(MessageType::Awareness),
            Ok(MSG_AUTH) => Ok(MessageType::Auth),
            Ok(MSG_QUERY_AWARENESS) => Ok(MessageType::QueryAwareness),
            _ => Err(ProtocolError::UnknownMessageType(tag)),
        }
    }

    /// Read the leading tag of a frame.
    pub fn read(cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let tag: u64 = cursor.read_var()?;
        Self::from_tag(tag)
    }
}

/// Sync sub-protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Encoded state vector of the sender
    Step1(Vec<u8>),
    /// Update covering what the receiver of step 1 is missing
    Step2(Vec<u8>),
    /// A newly produced update
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn encode_into<W: Write>(&self, encoder: &mut W) {
        let (sub_type, payload) = match self {
            SyncMessage::Step1(sv) => (MSG_SYNC_STEP_1, sv),
            SyncMessage::Step2(update) => (MSG_SYNC_STEP_2, update),
            SyncMessage::Update(update) => (MSG_SYNC_UPDATE, update),
        };
        encoder.write_var(sub_type);
        encoder.write_buf(payload);
    }

    pub fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let sub_type: u64 = cursor.read_var()?;
        let payload = cursor.read_buf()?.to_vec();
        match u8::try_from(sub_type) {
            Ok(MSG_SYNC_STEP_1) => Ok(SyncMessage::Step1(payload)),
            Ok(MSG_SYNC_STEP_2) => Ok(SyncMessage::Step2(payload)),
            Ok(MSG_SYNC_UPDATE) => Ok(SyncMessage::Update(payload)),
            _ => Err(ProtocolError::UnknownSyncType(sub_type)),
        }
    }
}

/// Authorization frame. Only denial is carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMessage {
    PermissionDenied { reason: String },
}

impl AuthMessage {
    pub fn encode_into<W: Write>(&self, encoder: &mut W) {
        match self {
            AuthMessage::PermissionDenied { reason } => {
                encoder.write_var(PERMISSION_DENIED);
                encoder.write_string(reason);
            }
        }
    }

    pub fn decode_from(cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        let sub_type: u64 = cursor.read_var()?;
        if sub_type != u64::from(PERMISSION_DENIED) {
            return Err(ProtocolError::UnknownAuthType(sub_type));
        }
        Ok(AuthMessage::PermissionDenied {
            reason: read_utf8(cursor)?,
        })
    }
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    Awareness(Vec<u8>),
    Auth(AuthMessage),
    QueryAwareness,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Sync(_) => MessageType::Sync,
            Message::Awareness(_) => MessageType::Awareness,
            Message::Auth(_) => MessageType::Auth,
            Message::QueryAwareness => MessageType::QueryAwareness,
        }
    }

    /// Encode to a standalone frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Vec::with_capacity(32);
        encoder.write_var(self.message_type().tag());
        match self {
            Message::Sync(sync) => sync.encode_into(&mut encoder),
            Message::Awareness(update) => encoder.write_buf(update),
            Message::Auth(auth) => auth.encode_into(&mut encoder),
            Message::QueryAwareness => {}
        }
        encoder
    }

    /// Decode a complete frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let message_type = MessageType::read(&mut cursor)?;
        Self::decode_body(message_type, &mut cursor)
    }

    /// Decode the payload that follows an already-read tag.
    pub fn decode_body(message_type: MessageType, cursor: &mut Cursor<'_>) -> Result<Self, ProtocolError> {
        match message_type {
            MessageType::Sync => Ok(Message::Sync(SyncMessage::decode_from(cursor)?)),
            MessageType::Awareness => Ok(Message::Awareness(cursor.read_buf()?.to_vec())),
            MessageType::Auth => Ok(Message::Auth(AuthMessage::decode_from(cursor)?)),
            MessageType::QueryAwareness => Ok(Message::QueryAwareness),
        }
    }
}

/// Read a varString, rejecting invalid UTF-8.
pub fn read_utf8(cursor: &mut Cursor<'_>) -> Result<String, ProtocolError> {
    let bytes = cursor.read_buf()?;
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame ended in the middle of a field
    UnexpectedEnd,
    /// Malformed variable-length integer
    InvalidVarInt,
    /// String field is not valid UTF-8
    InvalidUtf8,
    /// Unknown top-level tag
    UnknownMessageType(u64),
    /// Unknown sync sub-type
    UnknownSyncType(u64),
    /// Unknown auth sub-type
    UnknownAuthType(u64),
    /// Payload rejected by the document engine
    Document(String),
    /// Any other lib0 decoding failure
    Malformed(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::UnexpectedEnd => write!(f, "Unexpected end of frame"),
            ProtocolError::InvalidVarInt => write!(f, "Invalid variable-length integer"),
            ProtocolError::InvalidUtf8 => write!(f, "Invalid UTF-8 string"),
            ProtocolError::UnknownMessageType(t) => write!(f, "Unknown message type: {t}"),
            ProtocolError::UnknownSyncType(t) => write!(f, "Unknown sync message type: {t}"),
            ProtocolError::UnknownAuthType(t) => write!(f, "Unknown auth message type: {t}"),
            ProtocolError::Document(e) => write!(f, "Document error: {e}"),
            ProtocolError::Malformed(e) => write!(f, "Malformed frame: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<read::Error> for ProtocolError {
    fn from(e: read::Error) -> Self {
        match e {
            read::Error::EndOfBuffer(_) => ProtocolError::UnexpectedEnd,
            read::Error::InvalidVarInt => ProtocolError::InvalidVarInt,
            other => ProtocolError::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_match_lib0_layout() {
        assert_eq!(MessageType::Sync.tag(), 0);
        assert_eq!(MessageType::QueryAwareness.tag(), 3);
        assert_eq!(MessageType::from_tag(300), Err(ProtocolError::UnknownMessageType(300)));
    }

    #[test]
    fn test_var_uint_overflow_rejected() {
        let bytes = [0xFF; 11];
        assert_eq!(Message::decode(&bytes), Err(ProtocolError::InvalidVarInt));
    }

    #[test]
    fn test_sync_step1_layout() {
        let msg = Message::Sync(SyncMessage::Step1(vec![9, 8]));
        assert_eq!(msg.encode(), vec![0, 0, 2, 9, 8]);
    }

    #[test]
    fn test_long_payload_length_prefix() {
        let msg = Message::Awareness(vec![1; 300]);
        let bytes = msg.encode();
        // 300 = 0xAC 0x02 as a varuint
        assert_eq!(&bytes[..3], &[1, 0xAC, 0x02]);
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_sync_update_decode() {
        let decoded = Message::decode(&[0, 2, 3, 1, 2, 3]).unwrap();
        assert_eq!(decoded, Message::Sync(SyncMessage::Update(vec![1, 2, 3])));
    }

    #[test]
    fn test_auth_denied_decode() {
        let msg = Message::Auth(AuthMessage::PermissionDenied {
            reason: "no access".into(),
        });
        assert_eq!(msg.encode()[..2], [2, 0]);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_query_awareness_is_tag_only() {
        assert_eq!(Message::QueryAwareness.encode(), vec![3]);
        assert_eq!(Message::decode(&[3]).unwrap(), Message::QueryAwareness);
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(Message::decode(&[42]), Err(ProtocolError::UnknownMessageType(42)));
    }

    #[test]
    fn test_unknown_sync_type_rejected() {
        assert_eq!(Message::decode(&[0, 7, 0]), Err(ProtocolError::UnknownSyncType(7)));
    }

    #[test]
    fn test_unknown_auth_type_rejected() {
        assert_eq!(Message::decode(&[2, 1]), Err(ProtocolError::UnknownAuthType(1)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        // Declares 5 bytes, carries 2
        assert_eq!(Message::decode(&[1, 5, 1, 2]), Err(ProtocolError::UnexpectedEnd));
        assert_eq!(Message::decode(&[]), Err(ProtocolError::UnexpectedEnd));
    }

    #[test]
    fn test_invalid_utf8_reason() {
        assert_eq!(Message::decode(&[2, 0, 2, 0xC3, 0x28]), Err(ProtocolError::InvalidUtf8));
    }
}
