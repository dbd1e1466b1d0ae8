//! The Autel VCI session: J2534 PassThru conversations over a byte
//! transport.
//!
//! A dedicated reader thread drains the transport, reassembles Autel
//! frames and routes them: responses matching the in-flight request's
//! `(session_id, message_counter)` wake the caller, everything else goes
//! to the out-of-band event channel. Diagnostic payloads ride ISO-TP CAN
//! frames inside `PassThruWriteMsgs`/`PassThruReadMsgs` calls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use j2534_rust::{FilterType, IoctlID, Protocol};
use log::{debug, info, warn};

use crate::channel::{BROADCAST_ADDR, DiagChannel, RESPONSE_ADDR_OFFSET};
use crate::isotp::{self, Assembly, IsoTpAssembler, IsoTpFrame};
use crate::transport::{ByteTransport, TransportError};
use crate::uds::is_response_pending;
use crate::{DiagError, DiagServerResult};

use super::packet::{AutelPacket, ParseStatus, parse_frame};
use super::{AutelRequest, AutelSession, IDENTIFY_VENDOR_STRING};

/// VCI session configuration
#[derive(Debug, Copy, Clone)]
pub struct VciOptions {
    /// J2534 protocol opened on the dongle
    pub protocol: Protocol,
    /// Bus baud rate handed to `PassThruConnect`
    pub baudrate: u32,
    /// Deadline for the identify/open/connect conversation
    pub connect_timeout_ms: u32,
    /// Deadline for one PassThru call round trip
    pub request_timeout_ms: u32,
    /// Device-side poll timeout passed to `PassThruReadMsgs`
    pub read_poll_ms: u32,
}

impl Default for VciOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::ISO15765,
            baudrate: 500_000,
            connect_timeout_ms: 15000,
            request_timeout_ms: 5000,
            read_poll_ms: 50,
        }
    }
}

const RESPONSE_PENDING_EXTENSION: Duration = Duration::from_secs(5);
const MAX_PENDING_EXTENSIONS: u32 = 3;

/// A diagnostic channel over an Autel VCI dongle.
///
/// The transport is owned exclusively by this session; the reader thread
/// and the command path share it behind one lock. All commands are
/// serialized through `&mut self`.
#[derive(Debug)]
pub struct AutelVci {
    transport: Arc<Mutex<Box<dyn ByteTransport>>>,
    session: AutelSession,
    opts: VciOptions,
    channel_id: Option<u32>,
    filter_id: Option<u32>,
    version: Option<String>,
    packets_rx: Option<mpsc::Receiver<AutelPacket>>,
    oob_tx: mpsc::Sender<AutelPacket>,
    oob_rx: Option<mpsc::Receiver<AutelPacket>>,
    running: Arc<AtomicBool>,
}

impl AutelVci {
    /// Creates a session over `transport` with default options
    pub fn new(transport: Box<dyn ByteTransport>) -> Self {
        Self::with_options(transport, VciOptions::default())
    }

    /// Creates a session with explicit options
    pub fn with_options(transport: Box<dyn ByteTransport>, opts: VciOptions) -> Self {
        let (oob_tx, oob_rx) = mpsc::channel();
        Self {
            transport: Arc::new(Mutex::new(transport)),
            session: AutelSession::new(),
            opts,
            channel_id: None,
            filter_id: None,
            version: None,
            packets_rx: None,
            oob_tx,
            oob_rx: Some(oob_rx),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dongle firmware/protocol version from `get_version`, once connected
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Hands out the receiver for unsolicited frames (asynchronous errors,
    /// unmatched responses). Can be taken once.
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<AutelPacket>> {
        self.oob_rx.take()
    }

    fn spawn_reader(&mut self) {
        let (tx, rx) = mpsc::channel::<AutelPacket>();
        self.packets_rx = Some(rx);
        self.running.store(true, Ordering::Relaxed);

        let transport = self.transport.clone();
        let running = self.running.clone();
        std::thread::spawn(move || {
            let mut buf: Vec<u8> = Vec::new();
            while running.load(Ordering::Relaxed) {
                let chunk = {
                    let mut t = match transport.lock() {
                        Ok(t) => t,
                        Err(_) => break,
                    };
                    t.recv(20)
                };
                match chunk {
                    Ok(bytes) => buf.extend_from_slice(&bytes),
                    Err(TransportError::ReadTimeout) | Err(TransportError::BufferEmpty) => {}
                    Err(TransportError::NotOpen) => {
                        info!("vci transport closed, reader exiting");
                        break;
                    }
                    Err(e) => {
                        warn!("vci transport read failed: {e}");
                        break;
                    }
                }
                loop {
                    match parse_frame(&buf) {
                        ParseStatus::Frame { packet, consumed } => {
                            buf.drain(..consumed);
                            if tx.send(packet).is_err() {
                                return;
                            }
                        }
                        ParseStatus::NeedMoreBytes { .. } => break,
                        ParseStatus::Bad { consumed, reason } => {
                            // Dropped silently at this layer; the request
                            // side will time out if this was its response
                            warn!("dropping {consumed} bytes of bad frame data: {reason}");
                            buf.drain(..consumed.max(1));
                        }
                    }
                }
            }
            running.store(false, Ordering::Relaxed);
        });
    }

    /// Sends one built request and waits for its correlated response.
    /// Unmatched frames arriving meanwhile go out of band.
    fn roundtrip(&mut self, req: AutelRequest, timeout_ms: u32) -> DiagServerResult<AutelPacket> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(DiagError::NotConnected);
        }
        debug!(
            "vci tx sub_command 0x{:X} counter {}",
            req.sub_command, req.message_counter
        );
        self.transport
            .lock()
            .map_err(|_| DiagError::SessionClosed)?
            .send(&req.bytes, timeout_ms)?;

        let rx = self.packets_rx.as_ref().ok_or(DiagError::NotConnected)?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon_request();
                return Err(DiagError::Timeout);
            }
            match rx.recv_timeout(remaining) {
                Ok(packet) => {
                    if packet.session_id == req.session_id
                        && packet.message_counter == req.message_counter
                    {
                        if !packet.is_success() {
                            warn!(
                                "vci rejected sub_command 0x{:X} with status 0x{:X}",
                                req.sub_command, packet.command
                            );
                            return Err(DiagError::Bus(format!(
                                "VCI status 0x{:X}",
                                packet.command
                            )));
                        }
                        return Ok(packet);
                    }
                    debug!(
                        "unsolicited frame (session {:08X} counter {})",
                        packet.session_id, packet.message_counter
                    );
                    let _ = self.oob_tx.send(packet);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    self.abandon_request();
                    return Err(DiagError::Timeout);
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(DiagError::NotConnected);
                }
            }
        }
    }

    /// Clears buffered response data after an abandoned request so the
    /// next command starts clean
    fn abandon_request(&self) {
        if let Ok(mut t) = self.transport.lock() {
            let _ = t.clear_rx_buffer();
        }
        if let Some(rx) = &self.packets_rx {
            while rx.try_recv().is_ok() {}
        }
    }

    fn channel_id(&self) -> DiagServerResult<u32> {
        self.channel_id.ok_or(DiagError::NotConnected)
    }

    /// Writes one CAN frame (4 byte big-endian id + data, padded to 8
    /// data bytes) through `PassThruWriteMsgs`
    fn write_can_frame(&mut self, addr: u32, frame: &[u8]) -> DiagServerResult<()> {
        let channel = self.channel_id()?;
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&addr.to_be_bytes());
        data.extend_from_slice(frame);
        data.resize(12, 0x00); // Pad the CAN frame to 8 data bytes
        let req = self
            .session
            .pass_thru_write_msgs(channel, &data, self.opts.request_timeout_ms);
        self.roundtrip(req, self.opts.request_timeout_ms).map(|_| ())
    }

    /// Polls `PassThruReadMsgs` once and decodes the returned messages
    /// into `(can_id, frame_data)` pairs
    fn read_can_frames(&mut self) -> DiagServerResult<Vec<(u32, Vec<u8>)>> {
        let channel = self.channel_id()?;
        let req = self
            .session
            .pass_thru_read_msgs(channel, 16, self.opts.read_poll_ms);
        let resp = self.roundtrip(req, self.opts.request_timeout_ms)?;

        let mut frames = Vec::new();
        let num = resp.payload_u32(0).unwrap_or(0) as usize;
        let mut offset = 4;
        for _ in 0..num {
            let Some(len) = resp.payload_u32(offset) else {
                break;
            };
            offset += 4;
            let Some(data) = resp.payload.get(offset..offset + len as usize) else {
                break;
            };
            offset += len as usize;
            if data.len() >= 4 {
                let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                frames.push((id, data[4..].to_vec()));
            }
        }
        Ok(frames)
    }

    /// True when `id` is a response address this request would accept
    fn is_response_addr(request_addr: u32, id: u32) -> bool {
        if request_addr == BROADCAST_ADDR {
            (0x7E8..=0x7EF).contains(&id)
        } else {
            id == request_addr + RESPONSE_ADDR_OFFSET
        }
    }

    /// Sends `payload` to `addr` as ISO-TP and reassembles the response
    fn isotp_request(
        &mut self,
        addr: u32,
        payload: &[u8],
        timeout_ms: u32,
    ) -> DiagServerResult<Vec<u8>> {
        if payload.len() > isotp::MAX_PAYLOAD {
            return Err(DiagError::InvalidResponseLength);
        }
        let frames = isotp::segment(payload);
        self.write_can_frame(addr, &frames[0])?;

        if frames.len() > 1 {
            // Wait for the ECU's flow control before the consecutive frames
            let fc_deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
            let (mut block_size, mut st_min) = (0u8, 0u8);
            'fc: loop {
                if Instant::now() >= fc_deadline {
                    return Err(DiagError::Timeout);
                }
                for (id, data) in self.read_can_frames()? {
                    if !Self::is_response_addr(addr, id) {
                        continue;
                    }
                    if let Some(IsoTpFrame::FlowControl {
                        status: 0,
                        block_size: bs,
                        st_min: st,
                    }) = isotp::parse_frame(&data)
                    {
                        block_size = bs;
                        st_min = st;
                        break 'fc;
                    }
                }
            }
            let mut sent_in_block = 0u8;
            for cf in &frames[1..] {
                self.write_can_frame(addr, cf)?;
                if st_min > 0 {
                    std::thread::sleep(Duration::from_millis(st_min.min(0x7F) as u64));
                }
                sent_in_block += 1;
                if block_size > 0 && sent_in_block >= block_size {
                    sent_in_block = 0;
                    // The ECU releases the next block with another FC;
                    // reuse its previous pacing if it stays silent
                    let _ = self.read_can_frames();
                }
            }
        }

        // Collect the response, reassembling multi-frame transfers and
        // answering first frames with our own flow control
        let mut assembler = IsoTpAssembler::new();
        let mut deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut extensions = 0u32;
        let mut responder: Option<u32> = None;
        loop {
            if Instant::now() >= deadline {
                return Err(DiagError::Timeout);
            }
            for (id, data) in self.read_can_frames()? {
                if !Self::is_response_addr(addr, id) || responder.is_some_and(|r| r != id) {
                    continue;
                }
                match assembler.push_frame(&data) {
                    Assembly::Complete(resp) => {
                        if is_response_pending(&resp) && extensions < MAX_PENDING_EXTENSIONS {
                            extensions += 1;
                            deadline = Instant::now() + RESPONSE_PENDING_EXTENSION;
                            debug!("response pending, extension {extensions}");
                            assembler.reset();
                            responder = None;
                            continue;
                        }
                        return Ok(resp);
                    }
                    Assembly::SendFlowControl => {
                        responder = Some(id);
                        self.write_can_frame(id - RESPONSE_ADDR_OFFSET, &isotp::CLEAR_TO_SEND)?;
                    }
                    Assembly::Pending => {
                        responder = Some(id);
                    }
                }
            }
        }
    }
}

impl DiagChannel for AutelVci {
    fn initialize(&mut self) -> DiagServerResult<()> {
        self.transport
            .lock()
            .map_err(|_| DiagError::SessionClosed)?
            .open()?;
        self.spawn_reader();
        self.session.renew();

        let connect_timeout = self.opts.connect_timeout_ms;

        let req = self.session.identify();
        let resp = self.roundtrip(req, connect_timeout)?;
        let vendor = resp.payload_str();
        if !vendor.contains(IDENTIFY_VENDOR_STRING) {
            warn!("unexpected identify response {vendor:?}");
            return Err(DiagError::Bus(format!("unexpected VCI identity {vendor:?}")));
        }
        info!("vci identified: {vendor}");

        let req = self.session.get_version();
        let resp = self.roundtrip(req, connect_timeout)?;
        self.version = Some(resp.payload_str());

        let req = self.session.pass_thru_open(self.opts.protocol as u32);
        let resp = self.roundtrip(req, connect_timeout)?;
        let channel = resp.payload_u32(0).ok_or(DiagError::InvalidResponseLength)?;
        self.channel_id = Some(channel);

        let req =
            self.session
                .pass_thru_connect(self.opts.protocol as u32, 0, self.opts.baudrate);
        self.roundtrip(req, connect_timeout)?;

        // Flow control filter covering the whole broadcast response range
        let req = self.session.pass_thru_start_msg_filter(
            channel,
            FilterType::FLOW_CONTROL_FILTER,
            &0xFFFF_FFF8u32.to_be_bytes(),
            &0x0000_07E8u32.to_be_bytes(),
            &0x0000_07E0u32.to_be_bytes(),
        );
        let resp = self.roundtrip(req, connect_timeout)?;
        self.filter_id = resp.payload_u32(0);

        info!(
            "vci channel {channel} connected at {} baud",
            self.opts.baudrate
        );
        Ok(())
    }

    fn request(&mut self, addr: u32, payload: &[u8], timeout_ms: u32) -> DiagServerResult<Vec<u8>> {
        self.isotp_request(addr, payload, timeout_ms)
    }

    fn read_battery_voltage(&mut self) -> DiagServerResult<Option<f32>> {
        let channel = self.channel_id()?;
        let req = self
            .session
            .pass_thru_ioctl(channel, IoctlID::READ_VBATT as u32, &[]);
        let resp = self.roundtrip(req, self.opts.request_timeout_ms)?;
        Ok(resp.payload_u32(0).map(|mv| mv as f32 / 1000.0))
    }

    fn protocol_name(&self) -> &'static str {
        "Autel J2534"
    }

    fn shutdown(&mut self) -> DiagServerResult<()> {
        if let Some(channel) = self.channel_id.take() {
            if let Some(filter) = self.filter_id.take() {
                let req = self.session.pass_thru_stop_msg_filter(channel, filter);
                let _ = self.roundtrip(req, self.opts.request_timeout_ms);
            }
            let req = self.session.pass_thru_close(channel);
            let _ = self.roundtrip(req, self.opts.request_timeout_ms);
            let req = self.session.disconnect();
            let _ = self.roundtrip(req, self.opts.request_timeout_ms);
        }
        self.running.store(false, Ordering::Relaxed);
        self.transport
            .lock()
            .map_err(|_| DiagError::SessionClosed)?
            .close()?;
        Ok(())
    }
}
