//! Module for OBD2 (SAE J1979 / ISO15031-5)
//!
//! Service mode requests and response decoding for the modes a diagnostic
//! client uses: live data (01), stored DTCs (03), clear DTCs (04), pending
//! DTCs (07) and vehicle information (09). The ELM327 interpreter dialect
//! that usually carries these lives in [elm327].

use crate::dtc::Dtc;
use crate::{DiagError, DiagServerResult};

pub mod elm327;
mod pids;

pub use pids::DataPid;

/// A decoded parameter value. The decode formula of each PID fixes which
/// variant it produces, so accessors return `Option` only to keep callers
/// honest at the type level.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ObdValue {
    /// Integral value (counts, seconds)
    Int(i64),
    /// Scaled engineering value
    Float(f32),
    /// Text value (VIN, calibration ID)
    Text(String),
    /// Raw bytes (bitmaps, undecoded payloads)
    Bytes(Vec<u8>),
}

impl ObdValue {
    /// Integral value, if that is what this is
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ObdValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Float value; integral values convert losslessly
    pub fn as_float(&self) -> Option<f32> {
        match self {
            ObdValue::Float(f) => Some(*f),
            ObdValue::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    /// Text value, if that is what this is
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ObdValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes, if that is what this is
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ObdValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObdValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObdValue::Int(i) => write!(f, "{i}"),
            ObdValue::Float(v) => write!(f, "{v:.1}"),
            ObdValue::Text(s) => write!(f, "{s}"),
            ObdValue::Bytes(b) => write!(f, "{b:02X?}"),
        }
    }
}

/// OBD2 service modes used by this client
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Obd2Service {
    /// Show current data
    CurrentData = 0x01,
    /// Show stored (confirmed) DTCs
    StoredDtcs = 0x03,
    /// Clear DTCs and reset monitor status
    ClearDtcs = 0x04,
    /// Show pending DTCs
    PendingDtcs = 0x07,
    /// Request vehicle information
    VehicleInfo = 0x09,
}

impl Obd2Service {
    /// SID of a positive response to this mode
    pub fn positive_sid(&self) -> u8 {
        *self as u8 | 0x40
    }
}

/// Mode 09 vehicle-information PIDs
pub mod info_pid {
    /// Supported mode 09 PIDs
    pub const SUPPORTED: u8 = 0x00;
    /// VIN message count
    pub const VIN_COUNT: u8 = 0x01;
    /// Vehicle identification number
    pub const VIN: u8 = 0x02;
    /// Calibration identifications
    pub const CALIBRATION_ID: u8 = 0x04;
    /// Calibration verification numbers
    pub const CVN: u8 = 0x06;
}

/// Decodes a supported-PID bitmap response (`01 00/20/40/60`).
///
/// Bit `i` of the 4 data bytes, MSB first, announces support for PID
/// `base + i + 1`. Returns the supported PID bytes in ascending order.
pub fn decode_supported_pids(base: u8, data: &[u8]) -> Vec<u8> {
    let mut supported = Vec::new();
    for (byte_idx, b) in data.iter().take(4).enumerate() {
        let mut mask: u8 = 0b1000_0000;
        for bit in 0..8 {
            if b & mask != 0 {
                supported.push(base + (byte_idx * 8 + bit) as u8 + 1);
            }
            mask >>= 1;
        }
    }
    supported
}

/// One readiness monitor of the mode 01 PID 01 response
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReadinessMonitor {
    /// Monitor name
    pub name: &'static str,
    /// The vehicle is equipped with this monitor
    pub available: bool,
    /// The monitor has completed since DTCs were last cleared
    pub complete: bool,
}

/// Decoded mode 01 PID 01 (monitor status since DTCs cleared)
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MonitorStatus {
    /// Malfunction indicator lamp commanded on
    pub mil_on: bool,
    /// Number of confirmed emissions DTCs
    pub dtc_count: u8,
    /// Compression ignition (diesel) monitor set selected
    pub compression_ignition: bool,
    /// Continuous and non-continuous monitors
    pub monitors: Vec<ReadinessMonitor>,
}

const CONTINUOUS_MONITORS: [&str; 3] = ["Misfire", "Fuel system", "Components"];

const SPARK_MONITORS: [&str; 8] = [
    "Catalyst",
    "Heated catalyst",
    "Evaporative system",
    "Secondary air system",
    "A/C refrigerant",
    "Oxygen sensor",
    "Oxygen sensor heater",
    "EGR system",
];

const COMPRESSION_MONITORS: [&str; 8] = [
    "NMHC catalyst",
    "NOx/SCR monitor",
    "Reserved",
    "Boost pressure",
    "Reserved",
    "Exhaust gas sensor",
    "PM filter monitoring",
    "EGR and/or VVT system",
];

/// Parses the 4 data bytes of a mode 01 PID 01 response
pub fn decode_monitor_status(data: &[u8]) -> DiagServerResult<MonitorStatus> {
    if data.len() < 4 {
        return Err(DiagError::InvalidResponseLength);
    }
    let mil_on = data[0] & 0x80 != 0;
    let dtc_count = data[0] & 0x7F;
    let compression = data[1] & 0x08 != 0;

    let mut monitors = Vec::with_capacity(11);
    for (i, name) in CONTINUOUS_MONITORS.iter().copied().enumerate() {
        monitors.push(ReadinessMonitor {
            name,
            available: data[1] & (1 << i) != 0,
            // Bits 4..6 are "incomplete" flags
            complete: data[1] & (1 << (i + 4)) == 0,
        });
    }
    let table = if compression {
        &COMPRESSION_MONITORS
    } else {
        &SPARK_MONITORS
    };
    for (i, name) in table.iter().copied().enumerate() {
        if name == "Reserved" {
            continue;
        }
        monitors.push(ReadinessMonitor {
            name,
            available: data[2] & (1 << i) != 0,
            complete: data[3] & (1 << i) == 0,
        });
    }

    Ok(MonitorStatus {
        mil_on,
        dtc_count,
        compression_ignition: compression,
        monitors,
    })
}

/// Parses a mode 03/07 positive response (`43`/`47` ...) into trouble
/// codes. Handles the CAN format where the first data byte is the DTC
/// count followed by 2-byte codewords. An all-zero codeword is padding.
pub fn decode_dtc_response(service: Obd2Service, resp: &[u8]) -> DiagServerResult<Vec<Dtc>> {
    if resp.is_empty() {
        return Ok(Vec::new());
    }
    if resp[0] != service.positive_sid() {
        return Err(DiagError::WrongMessage);
    }
    let data = &resp[1..];
    if data.is_empty() {
        return Ok(Vec::new());
    }
    let count = data[0] as usize;
    let words = &data[1..];
    let mut out = Vec::with_capacity(count);
    for pair in words.chunks_exact(2).take(count) {
        let word = ((pair[0] as u16) << 8) | pair[1] as u16;
        if word == 0 {
            continue;
        }
        out.push(Dtc::from_word(word));
    }
    Ok(out)
}

/// Extracts the VIN string from an assembled mode 09 PID 02 payload
/// (`49 02 <count> <vin bytes>`), keeping only printable ASCII.
pub fn decode_vin(payload: &[u8]) -> DiagServerResult<String> {
    if payload.len() < 3 || payload[0] != Obd2Service::VehicleInfo.positive_sid() {
        return Err(DiagError::WrongMessage);
    }
    if payload[1] != info_pid::VIN {
        return Err(DiagError::WrongMessage);
    }
    Ok(sanitize_ascii(&payload[3..]))
}

/// Keeps the printable ASCII subset of a byte string, dropping padding
/// nulls and control characters that some ECUs pack around identifiers
pub fn sanitize_ascii(data: &[u8]) -> String {
    data.iter()
        .filter(|b| (0x20..=0x7E).contains(*b))
        .map(|b| *b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_pid_bitmap() {
        // 0xBE1FA813: PIDs 01,03,04,05,06,07,0C,0D,0E,0F,10,11,13,15,1C,1F,20
        let pids = decode_supported_pids(0x00, &[0xBE, 0x1F, 0xA8, 0x13]);
        assert!(pids.contains(&0x01));
        assert!(!pids.contains(&0x02));
        assert!(pids.contains(&0x0C));
        assert!(pids.contains(&0x20));
        assert_eq!(pids.len(), 17);
    }

    #[test]
    fn dtc_mode_03() {
        // One stored DTC: P0300
        let resp = [0x43, 0x01, 0x03, 0x00];
        let dtcs = decode_dtc_response(Obd2Service::StoredDtcs, &resp).unwrap();
        assert_eq!(dtcs.len(), 1);
        assert_eq!(dtcs[0].code(), "P0300");
    }

    #[test]
    fn dtc_mode_03_multiple_with_padding() {
        let resp = [0x43, 0x02, 0x03, 0x00, 0x01, 0x71, 0x00, 0x00];
        let dtcs = decode_dtc_response(Obd2Service::StoredDtcs, &resp).unwrap();
        assert_eq!(dtcs.len(), 2);
        assert_eq!(dtcs[0].code(), "P0300");
        assert_eq!(dtcs[1].code(), "P0171");
    }

    #[test]
    fn dtc_empty_response() {
        let dtcs = decode_dtc_response(Obd2Service::StoredDtcs, &[0x43, 0x00]).unwrap();
        assert!(dtcs.is_empty());
        let dtcs = decode_dtc_response(Obd2Service::PendingDtcs, &[]).unwrap();
        assert!(dtcs.is_empty());
    }

    #[test]
    fn monitor_status_spark() {
        // MIL on, 3 DTCs, spark ignition, misfire available+incomplete
        let st = decode_monitor_status(&[0x83, 0x11, 0x01, 0x01]).unwrap();
        assert!(st.mil_on);
        assert_eq!(st.dtc_count, 3);
        assert!(!st.compression_ignition);
        let misfire = &st.monitors[0];
        assert_eq!(misfire.name, "Misfire");
        assert!(misfire.available);
        assert!(!misfire.complete);
        assert!(st.monitors.iter().any(|m| m.name == "Catalyst"));
    }

    #[test]
    fn monitor_status_compression() {
        let st = decode_monitor_status(&[0x00, 0x08, 0x00, 0x00]).unwrap();
        assert!(st.compression_ignition);
        assert!(st.monitors.iter().any(|m| m.name == "NOx/SCR monitor"));
        assert!(!st.monitors.iter().any(|m| m.name == "Catalyst"));
    }

    #[test]
    fn vin_sanitize() {
        let mut payload = vec![0x49, 0x02, 0x01];
        payload.extend_from_slice(b"WVWZZZ\x001JZ3W386752\x7f");
        let vin = decode_vin(&payload).unwrap();
        assert_eq!(vin, "WVWZZZ1JZ3W386752");
    }
}
