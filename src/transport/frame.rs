//! Frame encoding and decoding for the NEARLINK transport layer.
//!
//! Generic frames use a 2-byte header followed by the payload:
//!
//! ```text
//! +----------------------------------------+----------+-----------------+
//! | type:3 | version:2 | RES | REQ | MORE  | sequence | payload         |
//! | 1 byte                                 | 1 byte   | 0..n bytes      |
//! +----------------------------------------+----------+-----------------+
//! ```
//!
//! Two control exchanges do not use the header: the channel-select command and
//! the keep-alive probe injected by readers. They are recognized by their fixed
//! bytes before the header is consulted.

use crate::core::FrameError;
use crate::core::constants::{
    FLAG_HAS_MORE_FRAGMENTS, FLAG_MASK, FLAG_REQUEST, FLAG_RESUME, HEADER_SIZE,
    KEEP_ALIVE_PROBE, MAX_VERSION_FIELD, PROTOCOL_VERSION, SELECT_APDU, SESSION_ID_PAYLOAD_SIZE,
    TYPE_SHIFT, VERSION_SHIFT,
};

/// Frame type identifiers (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Application data (possibly one fragment of a run).
    Default = 0,
    /// Fatal error; the payload carries a detail string.
    Error = 1,
    /// Channel selection and its acknowledgement.
    ChannelSelect = 2,
    /// Ask the peer for the next fragment of its run.
    GetNextFragment = 3,
    /// Session handshake carrying the session id and max frame size.
    SessionId = 4,
    /// Keep-alive probe and its acknowledgement.
    KeepAlive = 5,
    /// Deferred-response polling.
    Polling = 6,
    /// Ask the peer to resend its last frame. Occupies the formerly unused slot.
    Retransmit = 7,
}

impl FrameType {
    /// The type code historically left unused; retransmit requests occupy it.
    pub const UNUSED: Self = Self::Retransmit;

    /// Parse a frame type from its 3-bit code. Only the low 3 bits are read.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b111 {
            0 => Self::Default,
            1 => Self::Error,
            2 => Self::ChannelSelect,
            3 => Self::GetNextFragment,
            4 => Self::SessionId,
            5 => Self::KeepAlive,
            6 => Self::Polling,
            _ => Self::Retransmit,
        }
    }

    /// Get the 3-bit code.
    pub fn as_bits(self) -> u8 {
        self as u8
    }

    /// Check if frames of this type may close a fragment run.
    pub fn carries_data(self) -> bool {
        matches!(self, Self::Default | Self::Error)
    }
}

/// Frame flags (3 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Session is being resumed.
    pub const RESUME: Self = Self(FLAG_RESUME);
    /// Frame is a request.
    pub const REQUEST: Self = Self(FLAG_REQUEST);
    /// More fragments follow in the same run.
    pub const HAS_MORE_FRAGMENTS: Self = Self(FLAG_HAS_MORE_FRAGMENTS);

    /// Create flags from the low bits of a header byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & FLAG_MASK)
    }

    /// Get the raw bits.
    pub fn as_bits(self) -> u8 {
        self.0
    }

    /// Check if RESUME is set.
    pub fn is_resume(self) -> bool {
        self.0 & FLAG_RESUME != 0
    }

    /// Check if REQUEST is set.
    pub fn is_request(self) -> bool {
        self.0 & FLAG_REQUEST != 0
    }

    /// Check if HAS_MORE_FRAGMENTS is set.
    pub fn has_more_fragments(self) -> bool {
        self.0 & FLAG_HAS_MORE_FRAGMENTS != 0
    }

    /// Set or clear RESUME.
    pub fn with_resume(self, on: bool) -> Self {
        self.set(FLAG_RESUME, on)
    }

    /// Set or clear REQUEST.
    pub fn with_request(self, on: bool) -> Self {
        self.set(FLAG_REQUEST, on)
    }

    /// Set or clear HAS_MORE_FRAGMENTS.
    pub fn with_more_fragments(self, on: bool) -> Self {
        self.set(FLAG_HAS_MORE_FRAGMENTS, on)
    }

    fn set(self, bit: u8, on: bool) -> Self {
        if on { Self(self.0 | bit) } else { Self(self.0 & !bit) }
    }
}

/// SESSION_ID handshake parameters.
///
/// Wire format (10 bytes):
/// ```text
/// +------------------------+-------------------+
/// | Session ID             | Max Frame Size    |
/// | 8 bytes (BE64)         | 2 bytes (BE16)    |
/// +------------------------+-------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Identity of the initiator's conversation.
    pub session_id: u64,
    /// Largest frame the initiator's channel carries.
    pub max_frame_size: u16,
}

impl SessionParams {
    /// Serialize to bytes.
    pub fn to_bytes(&self) -> [u8; SESSION_ID_PAYLOAD_SIZE] {
        let mut buf = [0u8; SESSION_ID_PAYLOAD_SIZE];
        buf[0..8].copy_from_slice(&self.session_id.to_be_bytes());
        buf[8..10].copy_from_slice(&self.max_frame_size.to_be_bytes());
        buf
    }

    /// Parse from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < SESSION_ID_PAYLOAD_SIZE {
            return Err(FrameError::TooShort {
                expected: SESSION_ID_PAYLOAD_SIZE,
                actual: bytes.len(),
            });
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[0..8]);

        Ok(Self {
            session_id: u64::from_be_bytes(id),
            max_frame_size: u16::from_be_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// One wire-format protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Protocol version of the sender (2 bits).
    pub version: u8,
    /// Frame flags.
    pub flags: FrameFlags,
    /// Sequence number in `0..=254`.
    pub sequence: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create an empty frame of the given type at our protocol version.
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            version: PROTOCOL_VERSION,
            flags: FrameFlags::NONE,
            sequence: 0,
            payload: Vec::new(),
        }
    }

    /// Create a DEFAULT frame carrying `payload`.
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            payload,
            ..Self::new(FrameType::Default)
        }
    }

    /// Create an ERROR frame with a detail message.
    pub fn error(detail: &str) -> Self {
        Self {
            payload: detail.as_bytes().to_vec(),
            ..Self::new(FrameType::Error)
        }
    }

    /// The fixed channel-select command.
    pub fn channel_select() -> Self {
        Self::new(FrameType::ChannelSelect).with_flags(FrameFlags::REQUEST)
    }

    /// Acknowledgement of the channel-select command, advertising our version.
    pub fn channel_select_ack() -> Self {
        Self::new(FrameType::ChannelSelect)
    }

    /// The fixed keep-alive probe.
    pub fn keep_alive_probe() -> Self {
        Self::new(FrameType::KeepAlive).with_flags(FrameFlags::REQUEST)
    }

    /// Acknowledgement of the keep-alive probe.
    pub fn keep_alive_ack() -> Self {
        Self::new(FrameType::KeepAlive)
    }

    /// Request for the next fragment of the peer's run.
    pub fn get_next_fragment() -> Self {
        Self::new(FrameType::GetNextFragment)
    }

    /// Polling frame; `request` alternates between consecutive polls.
    pub fn polling(request: bool) -> Self {
        Self::new(FrameType::Polling).with_flags(FrameFlags::NONE.with_request(request))
    }

    /// Request for the peer to resend its last frame.
    pub fn retransmit() -> Self {
        Self::new(FrameType::Retransmit)
    }

    /// SESSION_ID handshake request.
    pub fn session_id(params: SessionParams, resume: bool) -> Self {
        Self {
            flags: FrameFlags::REQUEST.with_resume(resume),
            payload: params.to_bytes().to_vec(),
            ..Self::new(FrameType::SessionId)
        }
    }

    /// SESSION_ID handshake reply.
    pub fn session_ack(resume: bool) -> Self {
        Self::new(FrameType::SessionId).with_flags(FrameFlags::NONE.with_resume(resume))
    }

    /// Replace the flags.
    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Replace the sequence number.
    pub fn with_sequence(mut self, sequence: u8) -> Self {
        self.sequence = sequence;
        self
    }

    /// Check if REQUEST is set.
    pub fn is_request(&self) -> bool {
        self.flags.is_request()
    }

    /// Check if more fragments follow.
    pub fn has_more_fragments(&self) -> bool {
        self.flags.has_more_fragments()
    }

    /// Check if this is the fixed channel-select command.
    pub fn is_channel_select(&self) -> bool {
        self.frame_type == FrameType::ChannelSelect && self.is_request()
    }

    /// Check if this is the fixed keep-alive probe.
    pub fn is_keep_alive_probe(&self) -> bool {
        self.frame_type == FrameType::KeepAlive && self.is_request()
    }

    /// Packed header byte.
    pub fn header_byte(&self) -> u8 {
        (self.frame_type.as_bits() << TYPE_SHIFT)
            | ((self.version & MAX_VERSION_FIELD) << VERSION_SHIFT)
            | self.flags.as_bits()
    }

    /// Number of bytes `encode` produces.
    pub fn encoded_len(&self) -> usize {
        if self.is_channel_select() {
            SELECT_APDU.len()
        } else if self.is_keep_alive_probe() {
            KEEP_ALIVE_PROBE.len()
        } else {
            HEADER_SIZE + self.payload.len()
        }
    }

    /// Check that the frame fits in `max_frame_size` bytes on the wire.
    pub fn check_size(&self, max_frame_size: usize) -> Result<(), FrameError> {
        if self.encoded_len() > max_frame_size {
            return Err(FrameError::PayloadTooLarge {
                size: self.payload.len(),
                max: max_frame_size.saturating_sub(HEADER_SIZE),
            });
        }
        Ok(())
    }

    /// Serialize to wire bytes.
    ///
    /// The two control commands always serialize to their fixed byte form.
    pub fn encode(&self) -> Vec<u8> {
        if self.is_channel_select() {
            return SELECT_APDU.to_vec();
        }
        if self.is_keep_alive_probe() {
            return KEEP_ALIVE_PROBE.to_vec();
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.push(self.header_byte());
        buf.push(self.sequence);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse wire bytes.
    ///
    /// Never panics; buffers shorter than the header are reported as
    /// [`FrameError::TooShort`].
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if is_select_command(bytes) {
            return Ok(Self::channel_select());
        }
        if bytes == KEEP_ALIVE_PROBE {
            return Ok(Self::keep_alive_probe());
        }
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let header = bytes[0];
        Ok(Self {
            frame_type: FrameType::from_bits(header >> TYPE_SHIFT),
            version: (header >> VERSION_SHIFT) & MAX_VERSION_FIELD,
            flags: FrameFlags::from_bits(header),
            sequence: bytes[1],
            payload: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Match the SELECT command with or without its trailing Le byte.
fn is_select_command(bytes: &[u8]) -> bool {
    let without_le = &SELECT_APDU[..SELECT_APDU.len() - 1];
    bytes == SELECT_APDU || bytes == without_le
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_type_roundtrip() {
        for bits in 0..8u8 {
            assert_eq!(FrameType::from_bits(bits).as_bits(), bits);
        }
        assert_eq!(FrameType::UNUSED, FrameType::Retransmit);
    }

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::NONE;
        assert!(!flags.is_resume());
        assert!(!flags.is_request());
        assert!(!flags.has_more_fragments());

        let flags = FrameFlags::NONE.with_resume(true).with_more_fragments(true);
        assert!(flags.is_resume());
        assert!(flags.has_more_fragments());
        assert!(!flags.is_request());

        let flags = flags.with_resume(false);
        assert!(!flags.is_resume());
        assert!(flags.has_more_fragments());

        // Non-flag bits are dropped
        assert_eq!(FrameFlags::from_bits(0xF8), FrameFlags::NONE);
    }

    #[test]
    fn test_header_byte_layout() {
        let frame = Frame::data(vec![])
            .with_flags(FrameFlags::REQUEST.with_more_fragments(true))
            .with_sequence(7);
        // type 0, version 1, REQUEST | MORE
        assert_eq!(frame.encode(), hex::decode("0b07").unwrap());

        let frame = Frame::retransmit().with_sequence(3);
        // type 7, version 1
        assert_eq!(frame.encode(), hex::decode("e803").unwrap());
    }

    #[test]
    fn test_encode_decode_generic() {
        let frame = Frame::data(vec![0xDE, 0xAD, 0xBE, 0xEF])
            .with_flags(FrameFlags::HAS_MORE_FRAGMENTS)
            .with_sequence(254);

        let bytes = frame.encode();
        assert_eq!(bytes.len(), frame.encoded_len());

        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_control_frames_use_fixed_bytes() {
        let select = Frame::channel_select().with_sequence(9);
        assert_eq!(select.encode(), SELECT_APDU.to_vec());

        let probe = Frame {
            payload: vec![1, 2, 3],
            ..Frame::keep_alive_probe()
        };
        assert_eq!(probe.encode(), KEEP_ALIVE_PROBE.to_vec());
    }

    #[test]
    fn test_decode_control_frames() {
        let frame = Frame::decode(&SELECT_APDU).unwrap();
        assert!(frame.is_channel_select());

        let frame = Frame::decode(&SELECT_APDU[..12]).unwrap();
        assert!(frame.is_channel_select());

        let frame = Frame::decode(&KEEP_ALIVE_PROBE).unwrap();
        assert!(frame.is_keep_alive_probe());
    }

    #[test]
    fn test_acknowledgements_are_generic_frames() {
        let ack = Frame::channel_select_ack();
        let bytes = ack.encode();
        assert_eq!(bytes.len(), 2);

        let decoded = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.frame_type, FrameType::ChannelSelect);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert!(!decoded.is_channel_select());

        let decoded = Frame::decode(&Frame::keep_alive_ack().encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::KeepAlive);
        assert!(!decoded.is_keep_alive_probe());
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            Frame::decode(&[]),
            Err(FrameError::TooShort { expected: 2, actual: 0 })
        );
        assert_eq!(
            Frame::decode(&[0x08]),
            Err(FrameError::TooShort { expected: 2, actual: 1 })
        );
    }

    #[test]
    fn test_check_size() {
        let frame = Frame::data(vec![0; 6]);
        assert!(frame.check_size(8).is_ok());
        assert_eq!(
            frame.check_size(7),
            Err(FrameError::PayloadTooLarge { size: 6, max: 5 })
        );
    }

    #[test]
    fn test_decode_reads_newer_version() {
        // type 0, version 3
        let frame = Frame::decode(&[0x18, 0x01]).unwrap();
        assert_eq!(frame.version, 3);
        assert_eq!(frame.frame_type, FrameType::Default);
    }

    #[test]
    fn test_session_params_roundtrip() {
        let params = SessionParams {
            session_id: 0x0102_0304_0506_0708,
            max_frame_size: 245,
        };
        let frame = Frame::session_id(params, true);
        assert!(frame.flags.is_resume());
        assert!(frame.is_request());

        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(SessionParams::from_bytes(&decoded.payload).unwrap(), params);
        assert_eq!(
            hex::encode(&decoded.payload),
            "010203040506070800f5"
        );
    }

    #[test]
    fn test_session_params_too_short() {
        assert!(matches!(
            SessionParams::from_bytes(&[0u8; 9]),
            Err(FrameError::TooShort { expected: 10, actual: 9 })
        ));
    }
}
