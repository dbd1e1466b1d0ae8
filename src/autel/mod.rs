//! Module for the Autel VCI wire protocol.
//!
//! Autel MaxiFlash-family dongles frame every exchange in a proprietary
//! session-based packet format: magic header, 36 byte little-endian
//! header, payload, CRC32 trailer. The payloads are SAE J2534 (PassThru)
//! calls, making the dongle a remote PassThru device.
//!
//! * [packet] - bit-exact frame builder and parser
//! * [AutelSession] - per-conversation session id and message counter
//! * [vci::AutelVci] - the full PassThru conversation over a byte transport

use j2534_rust::FilterType;
use rand::Rng;

pub mod packet;
pub mod vci;

pub use packet::{AutelPacket, ParseStatus};
pub use vci::{AutelVci, VciOptions};

/// Frame magic: every packet starts with these bytes
pub const FRAME_MAGIC: [u8; 4] = [0x55, 0x55, 0xAA, 0xAA];

/// Trailer magic closing padded device-string payloads. Observed on the
/// wire; preserved bit-for-bit
pub const STRING_TRAILER_MAGIC: [u8; 4] = [0x99, 0x99, 0x66, 0x66];

/// Default value of the header flags field
pub const DEFAULT_FLAGS: u32 = 0xFFFF_FFFF;

/// Command field value of every request packet
pub const REQUEST_COMMAND: u32 = 0x01;

/// Command (status) field value of a successful response
pub const STATUS_SUCCESS: u32 = 0x00;

/// Device string sent in the identify request
pub const IDENTIFY_DEVICE_STRING: &str = "J2534-1:MAXI FLASH";

/// Vendor string expected in the identify response
pub const IDENTIFY_VENDOR_STRING: &str = "AUTEL:SAE J2534";

/// Sub-command ids selecting the operation a request carries
pub mod sub_command {
    /// Device identification handshake
    pub const IDENTIFY: u32 = 0x0001;
    /// Firmware/protocol version query
    pub const GET_VERSION: u32 = 0x0002;
    /// Ends the session with the dongle
    pub const DISCONNECT: u32 = 0x0003;
    /// PassThruOpen
    pub const PT_OPEN: u32 = 0x10004;
    /// PassThruClose
    pub const PT_CLOSE: u32 = 0x10005;
    /// PassThruConnect
    pub const PT_CONNECT: u32 = 0x10006;
    /// PassThruReadMsgs
    pub const PT_READ_MSGS: u32 = 0x10007;
    /// PassThruWriteMsgs
    pub const PT_WRITE_MSGS: u32 = 0x10008;
    /// PassThruStartMsgFilter
    pub const PT_START_MSG_FILTER: u32 = 0x10009;
    /// PassThruStopMsgFilter
    pub const PT_STOP_MSG_FILTER: u32 = 0x1000A;
    /// PassThruIoctl
    pub const PT_IOCTL: u32 = 0x1000B;
}

/// A built request frame together with the identifiers a response will
/// echo back for correlation
#[derive(Debug, Clone)]
pub struct AutelRequest {
    /// The complete wire frame
    pub bytes: Vec<u8>,
    /// Session id the response must carry
    pub session_id: u32,
    /// Message counter the response must carry
    pub message_counter: u32,
    /// Operation the frame requests
    pub sub_command: u32,
}

/// Per-conversation framing state: a random 32-bit session id and a
/// monotonically increasing message counter.
///
/// Counters are instance-scoped. Two concurrent sessions never share
/// state, and a new logical conversation gets a fresh session id via
/// [AutelSession::renew].
#[derive(Debug)]
pub struct AutelSession {
    session_id: u32,
    message_counter: u32,
}

impl Default for AutelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AutelSession {
    /// Creates a session with a uniformly random session id and the
    /// counter at zero
    pub fn new() -> Self {
        Self {
            session_id: rand::thread_rng().r#gen(),
            message_counter: 0,
        }
    }

    /// Starts a new logical conversation: fresh random session id, counter
    /// reset
    pub fn renew(&mut self) {
        self.session_id = rand::thread_rng().r#gen();
        self.message_counter = 0;
        log::debug!("autel session renewed, id {:08X}", self.session_id);
    }

    /// The current session id
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Builds a request frame for `sub_cmd` carrying `payload`, consuming
    /// one message counter value (wrapping mod 2^32)
    pub fn build(&mut self, sub_cmd: u32, payload: &[u8]) -> AutelRequest {
        let counter = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);
        AutelRequest {
            bytes: packet::encode_frame(
                self.session_id,
                counter,
                REQUEST_COMMAND,
                sub_cmd,
                payload,
            ),
            session_id: self.session_id,
            message_counter: counter,
            sub_command: sub_cmd,
        }
    }

    /// `identify` request: announces this client to the dongle with the
    /// null-terminated, padded device string
    pub fn identify(&mut self) -> AutelRequest {
        self.build(
            sub_command::IDENTIFY,
            &packet::pad_device_string(IDENTIFY_DEVICE_STRING),
        )
    }

    /// `get_version` request
    pub fn get_version(&mut self) -> AutelRequest {
        self.build(sub_command::GET_VERSION, &[0u8; 4])
    }

    /// `disconnect` request, ending the session
    pub fn disconnect(&mut self) -> AutelRequest {
        self.build(sub_command::DISCONNECT, &[0u8; 4])
    }

    /// `PassThruOpen` for the given J2534 protocol id
    pub fn pass_thru_open(&mut self, protocol_id: u32) -> AutelRequest {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&protocol_id.to_le_bytes());
        p.extend_from_slice(&0u32.to_le_bytes());
        self.build(sub_command::PT_OPEN, &p)
    }

    /// `PassThruClose` for an open channel
    pub fn pass_thru_close(&mut self, channel_id: u32) -> AutelRequest {
        self.build(sub_command::PT_CLOSE, &channel_id.to_le_bytes())
    }

    /// `PassThruConnect` configuring the bus link
    pub fn pass_thru_connect(&mut self, protocol_id: u32, flags: u32, baudrate: u32) -> AutelRequest {
        let mut p = Vec::with_capacity(12);
        p.extend_from_slice(&protocol_id.to_le_bytes());
        p.extend_from_slice(&flags.to_le_bytes());
        p.extend_from_slice(&baudrate.to_le_bytes());
        self.build(sub_command::PT_CONNECT, &p)
    }

    /// `PassThruReadMsgs`, polling the channel's receive queue
    pub fn pass_thru_read_msgs(
        &mut self,
        channel_id: u32,
        num_msgs: u32,
        timeout_ms: u32,
    ) -> AutelRequest {
        let mut p = Vec::with_capacity(12);
        p.extend_from_slice(&channel_id.to_le_bytes());
        p.extend_from_slice(&num_msgs.to_le_bytes());
        p.extend_from_slice(&timeout_ms.to_le_bytes());
        self.build(sub_command::PT_READ_MSGS, &p)
    }

    /// `PassThruWriteMsgs` carrying one message of `data`
    pub fn pass_thru_write_msgs(
        &mut self,
        channel_id: u32,
        data: &[u8],
        timeout_ms: u32,
    ) -> AutelRequest {
        let mut p = Vec::with_capacity(16 + data.len());
        p.extend_from_slice(&channel_id.to_le_bytes());
        p.extend_from_slice(&1u32.to_le_bytes()); // num_msgs
        p.extend_from_slice(&timeout_ms.to_le_bytes());
        p.extend_from_slice(&(data.len() as u32).to_le_bytes());
        p.extend_from_slice(data);
        self.build(sub_command::PT_WRITE_MSGS, &p)
    }

    /// `PassThruStartMsgFilter` installing a mask/pattern(/flow control)
    /// filter on the channel
    pub fn pass_thru_start_msg_filter(
        &mut self,
        channel_id: u32,
        filter_type: FilterType,
        mask: &[u8],
        pattern: &[u8],
        flow_control: &[u8],
    ) -> AutelRequest {
        let mut p = Vec::with_capacity(20 + mask.len() + pattern.len() + flow_control.len());
        p.extend_from_slice(&channel_id.to_le_bytes());
        p.extend_from_slice(&(filter_type as u32).to_le_bytes());
        p.extend_from_slice(&(mask.len() as u32).to_le_bytes());
        p.extend_from_slice(&(pattern.len() as u32).to_le_bytes());
        p.extend_from_slice(&(flow_control.len() as u32).to_le_bytes());
        p.extend_from_slice(mask);
        p.extend_from_slice(pattern);
        p.extend_from_slice(flow_control);
        self.build(sub_command::PT_START_MSG_FILTER, &p)
    }

    /// `PassThruStopMsgFilter` removing a previously installed filter
    pub fn pass_thru_stop_msg_filter(&mut self, channel_id: u32, filter_id: u32) -> AutelRequest {
        let mut p = Vec::with_capacity(8);
        p.extend_from_slice(&channel_id.to_le_bytes());
        p.extend_from_slice(&filter_id.to_le_bytes());
        self.build(sub_command::PT_STOP_MSG_FILTER, &p)
    }

    /// `PassThruIoctl` with a raw input block
    pub fn pass_thru_ioctl(&mut self, channel_id: u32, ioctl_id: u32, input: &[u8]) -> AutelRequest {
        let mut p = Vec::with_capacity(12 + input.len());
        p.extend_from_slice(&channel_id.to_le_bytes());
        p.extend_from_slice(&ioctl_id.to_le_bytes());
        p.extend_from_slice(&(input.len() as u32).to_le_bytes());
        p.extend_from_slice(input);
        self.build(sub_command::PT_IOCTL, &p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_per_frame() {
        let mut s = AutelSession::new();
        let a = s.identify();
        let b = s.get_version();
        assert_eq!(b.message_counter, a.message_counter + 1);
        assert_eq!(a.session_id, b.session_id);
    }

    #[test]
    fn counter_wraps() {
        let mut s = AutelSession::new();
        s.message_counter = u32::MAX;
        let a = s.get_version();
        assert_eq!(a.message_counter, u32::MAX);
        let b = s.get_version();
        assert_eq!(b.message_counter, 0);
    }

    #[test]
    fn sessions_do_not_share_state() {
        let mut a = AutelSession::new();
        let mut b = AutelSession::new();
        a.get_version();
        a.get_version();
        let fb = b.get_version();
        assert_eq!(fb.message_counter, 0);
    }

    #[test]
    fn renew_changes_session_id() {
        let mut s = AutelSession::new();
        let before = s.session_id();
        s.get_version();
        s.renew();
        assert_eq!(s.get_version().message_counter, 0);
        // Colliding 32-bit randoms are possible but not twice in a row
        let after = s.session_id();
        s.renew();
        assert!(before != after || after != s.session_id());
    }

    #[test]
    fn pass_thru_open_payload() {
        let mut s = AutelSession::new();
        let req = s.pass_thru_open(6);
        let pkt = packet::decode_frame(&req.bytes).unwrap();
        assert_eq!(pkt.command, REQUEST_COMMAND);
        assert_eq!(pkt.sub_command, 0x10004);
        assert_eq!(&pkt.payload[..4], &[0x06, 0x00, 0x00, 0x00]);
        assert_eq!(&pkt.payload[4..8], &[0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn write_msgs_payload_layout() {
        let mut s = AutelSession::new();
        let req = s.pass_thru_write_msgs(2, &[0xAA, 0xBB], 1000);
        let pkt = packet::decode_frame(&req.bytes).unwrap();
        assert_eq!(&pkt.payload[0..4], &2u32.to_le_bytes());
        assert_eq!(&pkt.payload[4..8], &1u32.to_le_bytes());
        assert_eq!(&pkt.payload[8..12], &1000u32.to_le_bytes());
        assert_eq!(&pkt.payload[12..16], &2u32.to_le_bytes());
        assert_eq!(&pkt.payload[16..], &[0xAA, 0xBB]);
    }

    #[test]
    fn strict_decode_rejects_truncation() {
        let mut s = AutelSession::new();
        let req = s.get_version();
        assert!(packet::decode_frame(&req.bytes).is_ok());
        let err = packet::decode_frame(&req.bytes[..req.bytes.len() - 2]);
        assert!(matches!(
            err,
            Err(crate::DiagError::ProtocolFraming(
                crate::FramingError::Truncated { .. }
            ))
        ));
    }
}
