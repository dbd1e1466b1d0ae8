//! ELM327 interpreter dialect (AT command set + hex request/response)
//! and a [crate::channel::DiagChannel] built on top of it.
//!
//! The ELM327 speaks ASCII over an arbitrary byte pipe. Requests are either
//! `AT` commands controlling the interpreter itself or hex strings that are
//! framed onto the vehicle bus. Responses terminate with the `>` prompt
//! (or a bare CR LF on some clones).

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::channel::{BROADCAST_ADDR, DiagChannel};
use crate::isotp::{Assembly, IsoTpAssembler};
use crate::transport::{ByteTransport, TransportError};
use crate::{DiagError, DiagServerResult};

/// The interpreter's command prompt
pub const PROMPT: u8 = b'>';

/// Returns true when every byte is printable ASCII (or line control),
/// which is how inbound data is classified as ELM327 traffic rather than
/// binary framing
pub fn is_ascii_text(data: &[u8]) -> bool {
    !data.is_empty()
        && data
            .iter()
            .all(|b| (0x20..=0x7E).contains(b) || *b == b'\r' || *b == b'\n')
}

/// Returns true once `buf` holds a complete interpreter response: either
/// the `>` prompt has arrived or the line was terminated with CR LF
pub fn response_complete(buf: &[u8]) -> bool {
    buf.contains(&PROMPT) || buf.ends_with(&[0x0D, 0x0A])
}

/// A parsed interpreter command. Produced by [ElmCommand::parse]; consumed
/// by the simulator and anything else that has to *be* an ELM327.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmCommand {
    /// `ATZ` - full reset
    Reset,
    /// `ATE0`/`ATE1` - echo off/on
    Echo(bool),
    /// `ATL0`/`ATL1` - linefeeds off/on
    Linefeeds(bool),
    /// `ATS0`/`ATS1` - spaces in responses off/on
    Spaces(bool),
    /// `ATH0`/`ATH1` - headers off/on
    Headers(bool),
    /// `ATSP n` - select protocol (0 = automatic)
    SetProtocol(u8),
    /// `ATSH xyz` - set the request header (CAN id)
    SetHeader(u32),
    /// `ATI` - identify interpreter version
    Info,
    /// `ATRV` - read battery voltage
    ReadVoltage,
    /// `ATDP` - describe current protocol
    DescribeProtocol,
    /// `ATDPN` - describe current protocol as a number
    DescribeProtocolNumber,
    /// `ATST xx` - set response timeout
    SetTimeout(u8),
    /// `ATAT n` - adaptive timing mode
    AdaptiveTiming(u8),
    /// An OBD/UDS hex request destined for the bus
    Payload(Vec<u8>),
}

impl ElmCommand {
    /// Parses one command line (without terminator). Returns `None` for
    /// lines that are neither a recognized AT command nor plain hex.
    pub fn parse(line: &str) -> Option<Self> {
        let cleaned: String = line
            .trim()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        if cleaned.is_empty() {
            return None;
        }
        if let Some(at) = cleaned.strip_prefix("AT") {
            return match at {
                "Z" => Some(ElmCommand::Reset),
                "E0" => Some(ElmCommand::Echo(false)),
                "E1" => Some(ElmCommand::Echo(true)),
                "L0" => Some(ElmCommand::Linefeeds(false)),
                "L1" => Some(ElmCommand::Linefeeds(true)),
                "S0" => Some(ElmCommand::Spaces(false)),
                "S1" => Some(ElmCommand::Spaces(true)),
                "H0" => Some(ElmCommand::Headers(false)),
                "H1" => Some(ElmCommand::Headers(true)),
                "I" => Some(ElmCommand::Info),
                "RV" => Some(ElmCommand::ReadVoltage),
                "DP" => Some(ElmCommand::DescribeProtocol),
                "DPN" => Some(ElmCommand::DescribeProtocolNumber),
                _ => {
                    if let Some(n) = at.strip_prefix("SP") {
                        n.parse().ok().map(ElmCommand::SetProtocol)
                    } else if let Some(h) = at.strip_prefix("SH") {
                        u32::from_str_radix(h, 16).ok().map(ElmCommand::SetHeader)
                    } else if let Some(t) = at.strip_prefix("ST") {
                        u8::from_str_radix(t, 16).ok().map(ElmCommand::SetTimeout)
                    } else if let Some(a) = at.strip_prefix("AT") {
                        a.parse().ok().map(ElmCommand::AdaptiveTiming)
                    } else {
                        None
                    }
                }
            };
        }
        hex_to_bytes(&cleaned).map(ElmCommand::Payload)
    }
}

/// Parses a spaced or unspaced hex string into bytes. `None` when the
/// string is not an even run of hex digits.
pub fn hex_to_bytes(s: &str) -> Option<Vec<u8>> {
    let digits: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.is_empty() || digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

/// Formats bytes as uppercase hex, optionally space separated (the `ATS1`
/// presentation)
pub fn bytes_to_hex(data: &[u8], spaces: bool) -> String {
    let sep = if spaces { " " } else { "" };
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(sep)
}

/// ELM327 channel configuration
#[derive(Debug, Copy, Clone)]
pub struct ElmOptions {
    /// Settle delay after `ATZ` before the interpreter accepts commands
    pub reset_settle_ms: u64,
    /// Deadline for ordinary request/response round trips
    pub default_timeout_ms: u32,
    /// Deadline for protocol search and multi-frame reads (VIN)
    pub long_timeout_ms: u32,
    /// `ATSP` argument. 0 lets the interpreter search
    pub protocol: u8,
}

impl Default for ElmOptions {
    fn default() -> Self {
        Self {
            reset_settle_ms: 500,
            default_timeout_ms: 5000,
            long_timeout_ms: 15000,
            protocol: 0,
        }
    }
}

/// A [DiagChannel] over an ELM327-compatible interpreter.
///
/// Owns its transport exclusively. All requests are strictly serialized;
/// response correlation is positional (one request in flight at a time),
/// which is the only correlation the ELM327 offers.
#[derive(Debug)]
pub struct Elm327Channel {
    transport: Box<dyn ByteTransport>,
    opts: ElmOptions,
    /// Header currently programmed with `ATSH`. `None` means the power-on
    /// default (functional broadcast).
    current_header: Option<u32>,
    version: Option<String>,
}

impl Elm327Channel {
    /// Creates a channel over `transport`. Nothing is sent until
    /// [DiagChannel::initialize].
    pub fn new(transport: Box<dyn ByteTransport>, opts: ElmOptions) -> Self {
        Self {
            transport,
            opts,
            current_header: None,
            version: None,
        }
    }

    /// Interpreter version string from the `ATZ` banner, once initialized
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Sends one command line and collects the complete response text.
    /// The trailing prompt and any echo of the command are stripped.
    fn command(&mut self, cmd: &str, timeout_ms: u32) -> DiagServerResult<String> {
        debug!("elm327 tx: {cmd}");
        self.transport
            .send(format!("{cmd}\r").as_bytes(), timeout_ms)?;
        self.collect_response(cmd, timeout_ms)
    }

    /// Collects one prompt-terminated response without sending anything
    /// (the interpreter keeps listening after a response-pending reply)
    fn collect_response(&mut self, cmd: &str, timeout_ms: u32) -> DiagServerResult<String> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Abandon the partial response so the next request starts
                // from a clean buffer
                self.transport.clear_rx_buffer()?;
                return Err(DiagError::Timeout);
            }
            match self.transport.recv(remaining.as_millis() as u32) {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(TransportError::ReadTimeout) | Err(TransportError::BufferEmpty) => {
                    self.transport.clear_rx_buffer()?;
                    return Err(DiagError::Timeout);
                }
                Err(TransportError::NotOpen) => return Err(DiagError::NotConnected),
                Err(e) => return Err(e.into()),
            }
            if response_complete(&buf) {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        let mut cleaned = text.replace('>', "");
        // Echo comes back before ATE0 takes effect
        if let Some(stripped) = cleaned.trim_start().strip_prefix(cmd) {
            cleaned = stripped.to_string();
        }
        let cleaned = cleaned.trim().to_string();
        debug!("elm327 rx: {cleaned:?}");
        Ok(cleaned)
    }

    /// Interprets the response text of a bus-bound request as payload
    /// bytes. Multi-frame responses arrive as one ISO-TP frame per line
    /// and are reassembled here.
    fn decode_response(&mut self, text: &str) -> DiagServerResult<Vec<u8>> {
        let mut hex_lines: Vec<Vec<u8>> = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let upper = line.to_ascii_uppercase();
            if upper.contains("SEARCHING") {
                continue;
            }
            if upper == "NO DATA" {
                return Ok(Vec::new());
            }
            if upper == "OK" {
                return Ok(Vec::new());
            }
            if upper == "?" {
                return Err(DiagError::Unsupported);
            }
            if upper.contains("BUS INIT")
                || upper.contains("BUS ERROR")
                || upper.contains("CAN ERROR")
                || upper.contains("UNABLE TO CONNECT")
                || upper.contains("STOPPED")
            {
                return Err(DiagError::Bus(line.to_string()));
            }
            match hex_to_bytes(line) {
                Some(bytes) => hex_lines.push(bytes),
                None => warn!("elm327: ignoring unrecognized line {line:?}"),
            }
        }

        if hex_lines.is_empty() {
            return Ok(Vec::new());
        }
        // A response-pending line followed by the real answer in the same
        // response: only the answer matters
        if hex_lines.len() > 1 {
            hex_lines.retain(|l| !crate::uds::is_response_pending(l));
        }
        // Multi-frame responses come through as raw ISO-TP frames, one per
        // line. A plain payload line starts with the response SID, whose
        // high nibble (>= 4) can never be an ISO-TP PCI type.
        if hex_lines[0][0] & 0xF0 == 0x10 {
            let mut assembler = IsoTpAssembler::new();
            for frame in &hex_lines {
                match assembler.push_frame(frame) {
                    Assembly::Complete(payload) => return Ok(payload),
                    Assembly::SendFlowControl | Assembly::Pending => {}
                }
            }
            warn!("elm327: incomplete multi-frame response");
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(hex_lines.swap_remove(0))
    }

    fn set_header(&mut self, addr: u32) -> DiagServerResult<()> {
        if self.current_header == Some(addr) {
            return Ok(());
        }
        let resp = self.command(&format!("ATSH{addr:03X}"), self.opts.default_timeout_ms)?;
        if !resp.to_ascii_uppercase().contains("OK") {
            return Err(DiagError::Bus(resp));
        }
        self.current_header = Some(addr);
        Ok(())
    }
}

impl DiagChannel for Elm327Channel {
    fn initialize(&mut self) -> DiagServerResult<()> {
        self.transport.open()?;
        self.current_header = None;

        let banner = self.command("ATZ", self.opts.default_timeout_ms)?;
        self.version = Some(banner.trim().to_string());
        std::thread::sleep(Duration::from_millis(self.opts.reset_settle_ms));

        for cmd in ["ATE0", "ATL0", "ATS0", "ATH0"] {
            self.command(cmd, self.opts.default_timeout_ms)?;
        }
        self.command(
            &format!("ATSP{}", self.opts.protocol),
            self.opts.default_timeout_ms,
        )?;

        // First real request makes the interpreter search for the bus
        // protocol; a long deadline covers the search
        let text = self.command("0100", self.opts.long_timeout_ms)?;
        let resp = self.decode_response(&text)?;
        if resp.is_empty() {
            warn!("elm327: no ECU answered 0100 during init");
            return Err(DiagError::Bus("no response to 0100".into()));
        }
        Ok(())
    }

    fn request(&mut self, addr: u32, payload: &[u8], timeout_ms: u32) -> DiagServerResult<Vec<u8>> {
        if addr != BROADCAST_ADDR || self.current_header.is_some() {
            self.set_header(addr)?;
        }
        let cmd = bytes_to_hex(payload, false);
        let text = self.command(&cmd, timeout_ms)?;
        let mut resp = self.decode_response(&text)?;

        // A UDS response-pending keeps the request alive: the ECU's real
        // answer follows without another request, with an extended deadline
        let mut extensions = 0;
        while crate::uds::is_response_pending(&resp) && extensions < 3 {
            extensions += 1;
            debug!("response pending, waiting (extension {extensions})");
            let text = self.collect_response(&cmd, 5000)?;
            resp = self.decode_response(&text)?;
        }
        Ok(resp)
    }

    fn read_battery_voltage(&mut self) -> DiagServerResult<Option<f32>> {
        let resp = self.command("ATRV", self.opts.default_timeout_ms)?;
        Ok(resp.trim_end_matches(['V', 'v']).parse::<f32>().ok())
    }

    fn protocol_name(&self) -> &'static str {
        "ELM327"
    }

    fn shutdown(&mut self) -> DiagServerResult<()> {
        self.transport.close()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_ascii() {
        assert!(is_ascii_text(b"ATZ\r"));
        assert!(is_ascii_text(b"0100"));
        assert!(!is_ascii_text(&[0x55, 0x55, 0xAA, 0xAA]));
        assert!(!is_ascii_text(b""));
    }

    #[test]
    fn completion_detection() {
        assert!(response_complete(b"41 0C 1A F8\r\r>"));
        assert!(response_complete(b"OK\r\n"));
        assert!(!response_complete(b"41 0C"));
    }

    #[test]
    fn parse_at_commands() {
        assert_eq!(ElmCommand::parse("ATZ"), Some(ElmCommand::Reset));
        assert_eq!(ElmCommand::parse("ate0"), Some(ElmCommand::Echo(false)));
        assert_eq!(ElmCommand::parse("AT H1"), Some(ElmCommand::Headers(true)));
        assert_eq!(ElmCommand::parse("ATSP0"), Some(ElmCommand::SetProtocol(0)));
        assert_eq!(
            ElmCommand::parse("ATSH7E0"),
            Some(ElmCommand::SetHeader(0x7E0))
        );
        assert_eq!(ElmCommand::parse("ATRV"), Some(ElmCommand::ReadVoltage));
        assert_eq!(ElmCommand::parse("ATST32"), Some(ElmCommand::SetTimeout(0x32)));
        assert_eq!(ElmCommand::parse("ATAT2"), Some(ElmCommand::AdaptiveTiming(2)));
    }

    #[test]
    fn parse_payload_command() {
        assert_eq!(
            ElmCommand::parse("010C"),
            Some(ElmCommand::Payload(vec![0x01, 0x0C]))
        );
        assert_eq!(
            ElmCommand::parse("22 F1 94"),
            Some(ElmCommand::Payload(vec![0x22, 0xF1, 0x94]))
        );
        assert_eq!(ElmCommand::parse("01 0"), None);
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(hex_to_bytes("410C1AF8"), Some(vec![0x41, 0x0C, 0x1A, 0xF8]));
        assert_eq!(hex_to_bytes("41 0C"), Some(vec![0x41, 0x0C]));
        assert_eq!(hex_to_bytes("GG"), None);
        assert_eq!(bytes_to_hex(&[0x41, 0x0C], true), "41 0C");
        assert_eq!(bytes_to_hex(&[0x41, 0x0C], false), "410C");
    }
}
