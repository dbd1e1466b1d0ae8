//! Bit-exact builder and parser for Autel VCI frames.
//!
//! Wire layout (all integers little-endian):
//!
//! ```text
//! 55 55 AA AA | total_length | session_id | message_counter |
//! payload_length | session_id | flags | command | sub_command |
//! payload ... | crc32
//! ```
//!
//! `total_length` counts everything after itself plus its own 4 bytes
//! minus the magic, i.e. `32 + payload len` (the whole frame minus 8).
//! `payload_length` stores the payload length plus 8, counting the
//! command and sub-command words with the payload. The CRC32 covers
//! everything from the magic through the payload. Response frames may
//! carry one leading `00` byte before the magic.

use log::warn;

use crate::crc32;

use super::{DEFAULT_FLAGS, FRAME_MAGIC, STATUS_SUCCESS, STRING_TRAILER_MAGIC};

/// Byte offset of the payload within a frame (magic + 8 header words)
pub const HEADER_LEN: usize = 36;

/// Smallest complete frame: empty payload plus CRC trailer
pub const MIN_FRAME_LEN: usize = HEADER_LEN + 4;

/// Upper bound on a sane frame; larger announced lengths are treated as
/// corruption rather than waited for
pub const MAX_FRAME_LEN: usize = 0x1_0000;

/// A parsed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutelPacket {
    /// Value of the total_length header field
    pub total_length: u32,
    /// Conversation id
    pub session_id: u32,
    /// Monotonic per-session counter
    pub message_counter: u32,
    /// Value of the payload_length header field (payload + 8)
    pub payload_length: u32,
    /// Header flags word
    pub flags: u32,
    /// Request command, or status code on the response path
    pub command: u32,
    /// Operation selector
    pub sub_command: u32,
    /// Payload bytes between header and CRC
    pub payload: Vec<u8>,
    /// CRC32 from the frame trailer
    pub crc: u32,
}

impl AutelPacket {
    /// On the response path the command field doubles as a status code;
    /// zero is success
    pub fn is_success(&self) -> bool {
        self.command == STATUS_SUCCESS
    }

    /// Reads a little-endian u32 out of the payload at `offset`
    pub fn payload_u32(&self, offset: usize) -> Option<u32> {
        let b = self.payload.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// The payload as a NUL-terminated string, up to the first NUL
    pub fn payload_str(&self) -> String {
        let end = self
            .payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(self.payload.len());
        String::from_utf8_lossy(&self.payload[..end]).into_owned()
    }
}

/// Encodes one complete frame
pub fn encode_frame(
    session_id: u32,
    message_counter: u32,
    command: u32,
    sub_command: u32,
    payload: &[u8],
) -> Vec<u8> {
    let total_length = 32 + payload.len() as u32;
    let payload_length = payload.len() as u32 + 8;

    let mut buf = Vec::with_capacity(MIN_FRAME_LEN + payload.len());
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&total_length.to_le_bytes());
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.extend_from_slice(&message_counter.to_le_bytes());
    buf.extend_from_slice(&payload_length.to_le_bytes());
    buf.extend_from_slice(&session_id.to_le_bytes());
    buf.extend_from_slice(&DEFAULT_FLAGS.to_le_bytes());
    buf.extend_from_slice(&command.to_le_bytes());
    buf.extend_from_slice(&sub_command.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32::compute(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// NUL-terminates and pads a device string so the payload length is a
/// multiple of 4 with a full padding word to spare. When the padding runs
/// to 5 or more bytes the last four are the trailer magic, exactly as the
/// real dongle frames it.
pub fn pad_device_string(s: &str) -> Vec<u8> {
    let raw_len = s.len() + 1; // Including NUL
    let padded_len = (raw_len + 3) / 4 * 4 + 4;
    let mut buf = Vec::with_capacity(padded_len);
    buf.extend_from_slice(s.as_bytes());
    buf.resize(padded_len, 0x00);
    if padded_len - raw_len >= 5 {
        buf[padded_len - 4..].copy_from_slice(&STRING_TRAILER_MAGIC);
    }
    buf
}

/// Result of scanning a receive buffer for one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus {
    /// A complete, CRC-valid frame. `consumed` bytes (including any `00`
    /// prefix) should be drained from the buffer
    Frame {
        /// The parsed frame
        packet: AutelPacket,
        /// Bytes this frame occupied
        consumed: usize,
    },
    /// Not enough bytes yet; `expected` is the total frame size announced
    /// by the header (or the minimum frame size if the header itself is
    /// incomplete)
    NeedMoreBytes {
        /// Total bytes the frame will occupy
        expected: usize,
    },
    /// The buffer holds garbage: `consumed` bytes should be dropped and
    /// scanning resumed
    Bad {
        /// Bytes to discard
        consumed: usize,
        /// What was wrong with them
        reason: crate::FramingError,
    },
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}

/// Scans `buf` for one frame, tolerating a single leading `00` byte in
/// front of the magic (seen on the response path).
pub fn parse_frame(buf: &[u8]) -> ParseStatus {
    // Optional 00 prefix
    let prefix = usize::from(buf.first() == Some(&0x00));
    let frame = &buf[prefix..];

    if frame.len() < 4 {
        return ParseStatus::NeedMoreBytes {
            expected: prefix + MIN_FRAME_LEN,
        };
    }
    if frame[..4] != FRAME_MAGIC {
        // Drop up to the next plausible frame start
        let skip = buf
            .iter()
            .skip(1)
            .position(|b| *b == FRAME_MAGIC[0])
            .map(|p| p + 1)
            .unwrap_or(buf.len());
        return ParseStatus::Bad {
            consumed: skip,
            reason: crate::FramingError::BadMagic,
        };
    }
    if frame.len() < HEADER_LEN {
        return ParseStatus::NeedMoreBytes {
            expected: prefix + MIN_FRAME_LEN,
        };
    }

    let total_length = read_u32(frame, 4) as usize;
    let frame_len = total_length + 8; // Magic + total_length field
    if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&frame_len) {
        return ParseStatus::Bad {
            consumed: prefix + 4,
            reason: crate::FramingError::Truncated {
                have: frame.len(),
                need: frame_len.min(MAX_FRAME_LEN),
            },
        };
    }
    if frame.len() < frame_len {
        return ParseStatus::NeedMoreBytes {
            expected: prefix + frame_len,
        };
    }

    let frame = &frame[..frame_len];
    if !crc32::verify_trailing(frame) {
        let computed = crc32::compute(&frame[..frame_len - 4]);
        let found = read_u32(frame, frame_len - 4);
        warn!("autel frame CRC mismatch: stored {found:08X}, computed {computed:08X}");
        return ParseStatus::Bad {
            consumed: prefix + frame_len,
            reason: crate::FramingError::BadCrc { found, computed },
        };
    }

    let packet = AutelPacket {
        total_length: total_length as u32,
        session_id: read_u32(frame, 8),
        message_counter: read_u32(frame, 12),
        payload_length: read_u32(frame, 16),
        flags: read_u32(frame, 24),
        command: read_u32(frame, 28),
        sub_command: read_u32(frame, 32),
        payload: frame[HEADER_LEN..frame_len - 4].to_vec(),
        crc: read_u32(frame, frame_len - 4),
    };
    ParseStatus::Frame {
        packet,
        consumed: prefix + frame_len,
    }
}

/// Strict parse for callers holding exactly one complete frame (a test
/// vector, a captured packet). Truncation and corruption are errors here,
/// where the streaming [parse_frame] path would wait or resynchronize.
pub fn decode_frame(buf: &[u8]) -> crate::DiagServerResult<AutelPacket> {
    match parse_frame(buf) {
        ParseStatus::Frame { packet, .. } => Ok(packet),
        ParseStatus::NeedMoreBytes { expected } => Err(crate::DiagError::ProtocolFraming(
            crate::FramingError::Truncated {
                have: buf.len(),
                need: expected,
            },
        )),
        ParseStatus::Bad { reason, .. } => Err(crate::DiagError::ProtocolFraming(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FramingError;

    #[test]
    fn identify_frame_layout() {
        let frame = encode_frame(
            0x1234_5678,
            7,
            super::super::REQUEST_COMMAND,
            super::super::sub_command::IDENTIFY,
            &pad_device_string(super::super::IDENTIFY_DEVICE_STRING),
        );
        assert_eq!(&frame[..4], &[0x55, 0x55, 0xAA, 0xAA]);
        let total_length = read_u32(&frame, 4) as usize;
        assert_eq!(total_length, frame.len() - 8);
        assert!(crc32::verify_trailing(&frame));
    }

    #[test]
    fn device_string_padding_carries_trailer() {
        // 18 chars + NUL = 19, padded to 24 -> 5 padding bytes, trailer
        let p = pad_device_string("J2534-1:MAXI FLASH");
        assert_eq!(p.len(), 24);
        assert_eq!(p.len() % 4, 0);
        assert_eq!(&p[20..], &STRING_TRAILER_MAGIC);
        assert_eq!(p[18], 0x00); // NUL terminator
        assert_eq!(p[19], 0x00); // Padding before the trailer

        // 19 chars + NUL = 20, padded to 24 -> 4 padding bytes, no trailer
        let p = pad_device_string("J2534-1:MAXIFLASH19");
        assert_eq!(p.len(), 24);
        assert_eq!(&p[20..], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn payload_round_trip() {
        for payload in [&b""[..], &b"\x01"[..], &b"some longer payload 123"[..]] {
            let frame = encode_frame(0xAABBCCDD, 99, 1, 0x10007, payload);
            match parse_frame(&frame) {
                ParseStatus::Frame { packet, consumed } => {
                    assert_eq!(consumed, frame.len());
                    assert_eq!(packet.payload, payload);
                    assert_eq!(packet.session_id, 0xAABBCCDD);
                    assert_eq!(packet.message_counter, 99);
                    assert_eq!(packet.payload_length, payload.len() as u32 + 8);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn zero_prefix_tolerated() {
        let mut frame = vec![0x00];
        frame.extend_from_slice(&encode_frame(1, 2, 0, 0x10007, &[0xAB]));
        match parse_frame(&frame) {
            ParseStatus::Frame { packet, consumed } => {
                assert_eq!(consumed, frame.len());
                assert!(packet.is_success());
                assert_eq!(packet.payload, vec![0xAB]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_input_reports_expected_length() {
        let frame = encode_frame(1, 2, 1, 0x10007, &[1, 2, 3, 4]);
        match parse_frame(&frame[..10]) {
            ParseStatus::NeedMoreBytes { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
        match parse_frame(&frame[..frame.len() - 1]) {
            ParseStatus::NeedMoreBytes { expected } => assert_eq!(expected, frame.len()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let mut frame = encode_frame(1, 2, 1, 0x10007, &[1, 2, 3, 4]);
        let end = frame.len();
        frame[end - 1] ^= 0xFF;
        match parse_frame(&frame) {
            ParseStatus::Bad {
                consumed,
                reason: FramingError::BadCrc { .. },
            } => assert_eq!(consumed, frame.len()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bad_magic_resyncs() {
        let mut buf = vec![0xDE, 0xAD];
        let frame = encode_frame(1, 2, 1, 0x10007, &[]);
        buf.extend_from_slice(&frame);
        match parse_frame(&buf) {
            ParseStatus::Bad {
                consumed,
                reason: FramingError::BadMagic,
            } => {
                // Skips to the first 0x55
                assert_eq!(consumed, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_frame(&buf[2..]) {
            ParseStatus::Frame { .. } => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
