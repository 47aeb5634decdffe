//! Envelope and message type definitions for the secure chat transport.
//!
//! Every unit exchanged on the wire is an [`Envelope`]: a fixed 36-byte
//! header, an opaque payload, and a CRC-32 trailer over the payload.  The
//! transport never looks inside the payload except for the four handshake
//! types it owns.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Frame magic, ASCII `"CHAT"`.
pub const MAGIC: [u8; 4] = *b"CHAT";

/// Current protocol version byte.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Total size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 36;

/// Size of the CRC-32 trailer that follows the payload.
pub const CHECKSUM_SIZE: usize = 4;

/// Largest payload a peer may declare (10 MiB).
///
/// Anything above this is treated as a corrupt stream rather than buffered.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Identifier correlating a request with its reply.
pub type MessageId = Uuid;

// ── Message type codes ────────────────────────────────────────────────────────

/// All message type codes carried in the 2-byte `message_type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum MessageType {
    // Handshake family (0x0001–0x000F); always travels in clear.
    HandshakeRequest = 0x0001,
    HandshakeResponse = 0x0002,
    KeyExchangeRequest = 0x0003,
    KeyExchangeResponse = 0x0004,
    // Session (0x0010–0x00FF)
    SessionValidateRequest = 0x0010,
    SessionValidateResponse = 0x0011,
    // Authentication (0x0100–0x01FF)
    AuthLoginRequest = 0x0100,
    AuthLoginResponse = 0x0101,
    AuthRegisterRequest = 0x0102,
    AuthRegisterResponse = 0x0103,
    AuthLogoutRequest = 0x0104,
    AuthLogoutResponse = 0x0105,
    // Chats (0x0200–0x02FF)
    ChatCreateRequest = 0x0200,
    ChatCreateResponse = 0x0201,
    ChatListRequest = 0x0202,
    ChatListResponse = 0x0203,
    // Messages (0x0300–0x03FF)
    MessageSendRequest = 0x0300,
    MessageSendResponse = 0x0301,
    MessageHistoryRequest = 0x0302,
    MessageHistoryResponse = 0x0303,
    // Server-initiated and generic
    Notification = 0x0400,
    Error = 0x0F00,
}

impl MessageType {
    /// Returns `true` for the four types used by the key exchange.
    ///
    /// These are never encrypted: they exist to establish the key.
    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            MessageType::HandshakeRequest
                | MessageType::HandshakeResponse
                | MessageType::KeyExchangeRequest
                | MessageType::KeyExchangeResponse
        )
    }

    /// Returns `true` for the two handshake reply types.
    ///
    /// Inbound envelopes of these types are routed to the key exchange
    /// correlation table instead of application dispatch.
    pub fn is_handshake_response(self) -> bool {
        matches!(
            self,
            MessageType::HandshakeResponse | MessageType::KeyExchangeResponse
        )
    }

    /// The reply type paired with a request type, if this is a request.
    pub fn response_type(self) -> Option<MessageType> {
        use MessageType::*;
        match self {
            HandshakeRequest => Some(HandshakeResponse),
            KeyExchangeRequest => Some(KeyExchangeResponse),
            SessionValidateRequest => Some(SessionValidateResponse),
            AuthLoginRequest => Some(AuthLoginResponse),
            AuthRegisterRequest => Some(AuthRegisterResponse),
            AuthLogoutRequest => Some(AuthLogoutResponse),
            ChatCreateRequest => Some(ChatCreateResponse),
            ChatListRequest => Some(ChatListResponse),
            MessageSendRequest => Some(MessageSendResponse),
            MessageHistoryRequest => Some(MessageHistoryResponse),
            _ => None,
        }
    }

    /// Returns `true` if a reply is expected for this type.
    pub fn is_request(self) -> bool {
        self.response_type().is_some()
    }
}

impl TryFrom<u16> for MessageType {
    type Error = ();

    fn try_from(value: u16) -> Result<Self, ()> {
        use MessageType::*;
        match value {
            0x0001 => Ok(HandshakeRequest),
            0x0002 => Ok(HandshakeResponse),
            0x0003 => Ok(KeyExchangeRequest),
            0x0004 => Ok(KeyExchangeResponse),
            0x0010 => Ok(SessionValidateRequest),
            0x0011 => Ok(SessionValidateResponse),
            0x0100 => Ok(AuthLoginRequest),
            0x0101 => Ok(AuthLoginResponse),
            0x0102 => Ok(AuthRegisterRequest),
            0x0103 => Ok(AuthRegisterResponse),
            0x0104 => Ok(AuthLogoutRequest),
            0x0105 => Ok(AuthLogoutResponse),
            0x0200 => Ok(ChatCreateRequest),
            0x0201 => Ok(ChatCreateResponse),
            0x0202 => Ok(ChatListRequest),
            0x0203 => Ok(ChatListResponse),
            0x0300 => Ok(MessageSendRequest),
            0x0301 => Ok(MessageSendResponse),
            0x0302 => Ok(MessageHistoryRequest),
            0x0303 => Ok(MessageHistoryResponse),
            0x0400 => Ok(Notification),
            0x0F00 => Ok(Error),
            _ => Err(()),
        }
    }
}

// ── Flags ─────────────────────────────────────────────────────────────────────

/// Envelope flag bitmask (1 byte on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    /// The payload is `IV || tag || ciphertext` under the session key.
    pub const ENCRYPTED: u8 = 0x01;
    /// Hint for the receiver; the transport does not reorder on it.
    pub const URGENT: u8 = 0x02;

    pub fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    pub fn is_encrypted(self) -> bool {
        self.contains(Self::ENCRYPTED)
    }

    pub fn is_urgent(self) -> bool {
        self.contains(Self::URGENT)
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// The framed unit exchanged on the wire.
///
/// `payload_length` is not stored: it is always `payload.len()`, which makes
/// the length invariant impossible to violate in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identifies how the payload should be interpreted.
    pub message_type: MessageType,
    /// Protocol version; [`PROTOCOL_VERSION`] for locally built envelopes.
    pub version: u8,
    /// `ENCRYPTED` / `URGENT` bits.
    pub flags: MessageFlags,
    /// Caller-assigned correlation identifier. Never rewritten by the transport.
    pub message_id: MessageId,
    /// Milliseconds since the Unix epoch at construction time.
    pub timestamp_ms: u64,
    /// Opaque payload bytes (ciphertext while `ENCRYPTED` is set).
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Builds an envelope with a fresh random message ID and the current time.
    pub fn new(message_type: MessageType, payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(message_type, Uuid::new_v4(), payload)
    }

    /// Builds an envelope with a caller-chosen message ID.
    pub fn with_id(
        message_type: MessageType,
        message_id: MessageId,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            message_type,
            version: PROTOCOL_VERSION,
            flags: MessageFlags::default(),
            message_id,
            timestamp_ms: now_millis(),
            payload: payload.into(),
        }
    }

    /// Builds a reply that carries the same message ID as `request`.
    pub fn reply_to(
        request: &Envelope,
        message_type: MessageType,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_id(message_type, request.message_id, payload)
    }

    /// Marks the envelope as urgent.
    pub fn urgent(mut self) -> Self {
        self.flags.set(MessageFlags::URGENT);
        self
    }

    /// Length of the payload as written into the header.
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// Total encoded size: header + payload + checksum.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }
}

// ── Inbound delivery ──────────────────────────────────────────────────────────

/// Which peer sent an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// A decrypted envelope handed to application code.
///
/// Carries only what the application needs; flags, version and timestamp
/// stay inside the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub message_type: MessageType,
    pub message_id: MessageId,
    pub payload: Vec<u8>,
    pub origin: Direction,
}

impl InboundMessage {
    pub fn from_envelope(env: Envelope, origin: Direction) -> Self {
        Self {
            message_type: env.message_type,
            message_id: env.message_id,
            payload: env.payload,
            origin,
        }
    }
}

/// Current wall-clock time in epoch milliseconds; 0 if the clock is before 1970.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_message_keeps_type_id_and_payload() {
        // Arrange
        let env = Envelope::new(MessageType::Notification, b"hi".to_vec()).urgent();

        // Act
        let msg = InboundMessage::from_envelope(env.clone(), Direction::ServerToClient);

        // Assert
        assert_eq!(msg.message_type, env.message_type);
        assert_eq!(msg.message_id, env.message_id);
        assert_eq!(msg.payload, b"hi".to_vec());
        assert_eq!(msg.origin, Direction::ServerToClient);
    }

    const ALL_TYPES: [MessageType; 22] = [
        MessageType::HandshakeRequest,
        MessageType::HandshakeResponse,
        MessageType::KeyExchangeRequest,
        MessageType::KeyExchangeResponse,
        MessageType::SessionValidateRequest,
        MessageType::SessionValidateResponse,
        MessageType::AuthLoginRequest,
        MessageType::AuthLoginResponse,
        MessageType::AuthRegisterRequest,
        MessageType::AuthRegisterResponse,
        MessageType::AuthLogoutRequest,
        MessageType::AuthLogoutResponse,
        MessageType::ChatCreateRequest,
        MessageType::ChatCreateResponse,
        MessageType::ChatListRequest,
        MessageType::ChatListResponse,
        MessageType::MessageSendRequest,
        MessageType::MessageSendResponse,
        MessageType::MessageHistoryRequest,
        MessageType::MessageHistoryResponse,
        MessageType::Notification,
        MessageType::Error,
    ];

    #[test]
    fn test_message_type_code_round_trips_through_u16() {
        for t in ALL_TYPES {
            assert_eq!(MessageType::try_from(t as u16), Ok(t));
        }
    }

    #[test]
    fn test_unknown_message_type_code_is_rejected() {
        assert_eq!(MessageType::try_from(0xBEEF), Err(()));
    }

    #[test]
    fn test_exactly_four_types_belong_to_handshake_family() {
        let count = ALL_TYPES.iter().filter(|t| t.is_handshake()).count();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_handshake_responses_are_subset_of_handshake_family() {
        for t in ALL_TYPES.iter().filter(|t| t.is_handshake_response()) {
            assert!(t.is_handshake());
        }
        assert!(!MessageType::HandshakeRequest.is_handshake_response());
    }

    #[test]
    fn test_response_type_maps_requests_only() {
        assert_eq!(
            MessageType::ChatListRequest.response_type(),
            Some(MessageType::ChatListResponse)
        );
        assert_eq!(MessageType::ChatListResponse.response_type(), None);
        assert!(!MessageType::Notification.is_request());
    }

    #[test]
    fn test_flags_set_and_clear_are_independent() {
        // Arrange
        let mut flags = MessageFlags::default();

        // Act
        flags.set(MessageFlags::ENCRYPTED);
        flags.set(MessageFlags::URGENT);
        flags.clear(MessageFlags::ENCRYPTED);

        // Assert
        assert!(!flags.is_encrypted());
        assert!(flags.is_urgent());
    }

    #[test]
    fn test_reply_to_preserves_message_id() {
        let request = Envelope::new(MessageType::AuthLoginRequest, b"alice".to_vec());
        let reply = Envelope::reply_to(&request, MessageType::AuthLoginResponse, Vec::new());
        assert_eq!(reply.message_id, request.message_id);
        assert_eq!(reply.message_type, MessageType::AuthLoginResponse);
    }

    #[test]
    fn test_new_envelopes_get_distinct_ids() {
        let a = Envelope::new(MessageType::ChatListRequest, Vec::new());
        let b = Envelope::new(MessageType::ChatListRequest, Vec::new());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_frame_len_includes_header_and_checksum() {
        let env = Envelope::new(MessageType::Notification, vec![0u8; 10]);
        assert_eq!(env.frame_len(), HEADER_SIZE + 10 + CHECKSUM_SIZE);
        assert_eq!(env.payload_length(), 10);
    }
}
