//! Frame header encoding/decoding for the multiplexing protocol
//!
//! Every frame starts with a fixed 12-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! | Version|  Type  |     Flags (2B)  |
//! +--------+--------+--------+--------+
//! |           Stream ID (4B)          |
//! +--------+--------+--------+--------+
//! |            Length (4B)            |
//! +--------+--------+--------+--------+
//! ```
//!
//! `Length` is the body byte count for `Data` frames, the credit delta for
//! `WindowUpdate` frames, an opaque value for `Ping`, and a reason code for
//! `GoAway`. Only `Data` frames carry a body.

use super::MuxError;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Protocol version carried in every header
pub const PROTO_VERSION: u8 = 0;

/// First outbound frame of a locally initiated stream
pub const FLAG_SYN: u16 = 0x1;
/// Acknowledges SYN (on stream frames) or a ping (on `Ping` frames)
pub const FLAG_ACK: u16 = 0x2;
/// Half-closes the sender's direction
pub const FLAG_FIN: u16 = 0x4;
/// Hard stream reset
pub const FLAG_RST: u16 = 0x8;

/// GoAway reason: clean session shutdown
pub const GOAWAY_NORMAL: u32 = 0;
/// GoAway reason: the peer violated the protocol
pub const GOAWAY_PROTOCOL_ERROR: u32 = 1;
/// GoAway reason: internal failure
pub const GOAWAY_INTERNAL_ERROR: u32 = 2;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream payload bytes
    Data = 0x0,
    /// Flow-control credit grant; also the carrier for FIN/RST
    WindowUpdate = 0x1,
    /// Keepalive probe and reply
    Ping = 0x2,
    /// Session teardown notice
    GoAway = 0x3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(FrameType::Data),
            0x1 => Ok(FrameType::WindowUpdate),
            0x2 => Ok(FrameType::Ping),
            0x3 => Ok(FrameType::GoAway),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// A decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type
    pub frame_type: FrameType,
    /// Flags bitmap
    pub flags: u16,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    /// Body length, credit delta, ping value, or goaway code
    pub length: u32,
}

impl Header {
    /// Create a data frame header
    pub fn data(stream_id: u32, flags: u16, length: u32) -> Self {
        Self {
            frame_type: FrameType::Data,
            flags,
            stream_id,
            length,
        }
    }

    /// Create a window update header carrying a credit delta
    pub fn window_update(stream_id: u32, flags: u16, delta: u32) -> Self {
        Self {
            frame_type: FrameType::WindowUpdate,
            flags,
            stream_id,
            length: delta,
        }
    }

    /// Create a ping header carrying an opaque value
    pub fn ping(flags: u16, value: u32) -> Self {
        Self {
            frame_type: FrameType::Ping,
            flags,
            stream_id: 0,
            length: value,
        }
    }

    /// Create a goaway header carrying a reason code
    pub fn go_away(code: u32) -> Self {
        Self {
            frame_type: FrameType::GoAway,
            flags: 0,
            stream_id: 0,
            length: code,
        }
    }

    /// Check whether a flag bit is set
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }

    /// Encode the header to its wire representation
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = PROTO_VERSION;
        buf[1] = self.frame_type as u8;
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Decode a header from its wire representation
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, MuxError> {
        if buf[0] != PROTO_VERSION {
            return Err(MuxError::InvalidVersion(buf[0]));
        }
        let frame_type = FrameType::try_from(buf[1])?;
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let length = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self {
            frame_type,
            flags,
            stream_id,
            length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let original = Header::data(42, FLAG_SYN | FLAG_FIN, 4096);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_window_update_roundtrip() {
        let original = Header::window_update(7, FLAG_ACK, 131_072);
        let decoded = Header::decode(&original.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.length, 131_072);
        assert!(decoded.has_flag(FLAG_ACK));
        assert!(!decoded.has_flag(FLAG_SYN));
    }

    #[test]
    fn test_session_frames_use_stream_zero() {
        assert_eq!(Header::ping(FLAG_SYN, 9).stream_id, 0);
        assert_eq!(Header::go_away(GOAWAY_NORMAL).stream_id, 0);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut buf = Header::ping(0, 1).encode();
        buf[0] = 3;
        assert!(matches!(
            Header::decode(&buf),
            Err(MuxError::InvalidVersion(3))
        ));
    }

    #[test]
    fn test_rejects_unknown_frame_type() {
        let mut buf = Header::ping(0, 1).encode();
        buf[1] = 0x9;
        assert!(matches!(
            Header::decode(&buf),
            Err(MuxError::InvalidFrameType(0x9))
        ));
    }
}
