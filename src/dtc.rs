//! Module for common Diagnostic trouble code data

use std::fmt;

bitflags::bitflags! {
    /// ISO14229 DTC status byte. OBD2 mode 03/07 responses carry no status,
    /// in which case the empty set is stored.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DtcStatus: u8 {
        /// Most recent test of this DTC failed
        const TEST_FAILED = 0x01;
        /// Test failed at some point during the current operation cycle
        const TEST_FAILED_THIS_CYCLE = 0x02;
        /// DTC is pending (failed, not yet confirmed)
        const PENDING = 0x04;
        /// DTC is confirmed and stored
        const CONFIRMED = 0x08;
        /// Test has not completed since DTCs were last cleared
        const TEST_NOT_COMPLETED_SINCE_CLEAR = 0x10;
        /// Test failed at least once since DTCs were last cleared
        const TEST_FAILED_SINCE_CLEAR = 0x20;
        /// Test has not completed during the current operation cycle
        const TEST_NOT_COMPLETED_THIS_CYCLE = 0x40;
        /// The DTC requests warning indicator (MIL) illumination
        const WARNING_INDICATOR = 0x80;
    }
}

/// System prefix of a trouble code, from the top two bits of the first
/// encoded byte (ISO15031-6)
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DtcSystem {
    /// P - Powertrain
    Powertrain,
    /// C - Chassis
    Chassis,
    /// B - Body
    Body,
    /// U - Network / communication
    Network,
}

impl DtcSystem {
    /// Prefix letter used in the 5 character display form
    pub fn letter(&self) -> char {
        match self {
            DtcSystem::Powertrain => 'P',
            DtcSystem::Chassis => 'C',
            DtcSystem::Body => 'B',
            DtcSystem::Network => 'U',
        }
    }

    fn from_bits(b: u8) -> Self {
        match b & 0x03 {
            0x00 => DtcSystem::Powertrain,
            0x01 => DtcSystem::Chassis,
            0x02 => DtcSystem::Body,
            _ => DtcSystem::Network,
        }
    }
}

/// A diagnostic trouble code.
///
/// Stored as the raw 16-bit codeword from the wire; the familiar 5
/// character form (`P0300`) is derived per ISO15031-6:
/// bits 15..14 select the system prefix, bits 13..12 the first digit,
/// then three hex nibbles.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Dtc {
    raw: u16,
    /// UDS status byte of the DTC. Empty for OBD2-sourced codes
    pub status: DtcStatus,
}

impl Dtc {
    /// Builds a DTC from the two encoded wire bytes (no status)
    pub fn from_bytes(high: u8, low: u8) -> Self {
        Self::from_word(((high as u16) << 8) | low as u16)
    }

    /// Builds a DTC from a raw 16-bit codeword
    pub fn from_word(raw: u16) -> Self {
        Self {
            raw,
            status: DtcStatus::empty(),
        }
    }

    /// Attaches a UDS status byte
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = DtcStatus::from_bits_retain(status);
        self
    }

    /// The raw 16-bit codeword as it appears on the wire
    pub fn to_word(&self) -> u16 {
        self.raw
    }

    /// System group of the code
    pub fn system(&self) -> DtcSystem {
        DtcSystem::from_bits((self.raw >> 14) as u8)
    }

    /// The 5 character display form, e.g. `"P0300"`
    pub fn code(&self) -> String {
        format!(
            "{}{}{:X}{:X}{:X}",
            self.system().letter(),
            (self.raw >> 12) & 0x03,
            (self.raw >> 8) & 0x0F,
            (self.raw >> 4) & 0x0F,
            self.raw & 0x0F,
        )
    }

    /// Parses a 5 character display form back into a DTC. Returns `None`
    /// for anything that is not `[PCBU]` + digit 0-3 + 3 hex digits.
    pub fn from_code(code: &str) -> Option<Self> {
        let mut chars = code.chars();
        let sys = match chars.next()? {
            'P' | 'p' => 0u16,
            'C' | 'c' => 1,
            'B' | 'b' => 2,
            'U' | 'u' => 3,
            _ => return None,
        };
        let d1 = chars.next()?.to_digit(4)? as u16;
        let d2 = chars.next()?.to_digit(16)? as u16;
        let d3 = chars.next()?.to_digit(16)? as u16;
        let d4 = chars.next()?.to_digit(16)? as u16;
        if chars.next().is_some() {
            return None;
        }
        Some(Self::from_word(
            (sys << 14) | (d1 << 12) | (d2 << 8) | (d3 << 4) | d4,
        ))
    }

    /// True when the warning-indicator (MIL) bit of the status byte is set
    pub fn mil_on(&self) -> bool {
        self.status.contains(DtcStatus::WARNING_INDICATOR)
    }

    /// True when the DTC is confirmed (or carries no status at all, as with
    /// OBD2 mode 03 where everything reported is stored)
    pub fn is_confirmed(&self) -> bool {
        self.status.is_empty() || self.status.contains(DtcStatus::CONFIRMED)
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_known_codes() {
        assert_eq!(Dtc::from_bytes(0x03, 0x00).code(), "P0300");
        assert_eq!(Dtc::from_bytes(0x01, 0x01).code(), "P0101");
        assert_eq!(Dtc::from_bytes(0x41, 0x23).code(), "C0123");
        assert_eq!(Dtc::from_bytes(0x81, 0x00).code(), "B0100");
        assert_eq!(Dtc::from_bytes(0xC1, 0x00).code(), "U0100");
        // Hex digits in positions 3..5
        assert_eq!(Dtc::from_bytes(0x1F, 0xAB).code(), "P1FAB");
    }

    #[test]
    fn word_round_trip() {
        // Every 16-bit codeword survives decode -> encode
        for w in 0..=u16::MAX {
            let dtc = Dtc::from_word(w);
            assert_eq!(dtc.to_word(), w);
            assert_eq!(Dtc::from_code(&dtc.code()), Some(dtc));
        }
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(Dtc::from_code("X0300").is_none());
        assert!(Dtc::from_code("P4300").is_none()); // first digit above 3
        assert!(Dtc::from_code("P03000").is_none()); // too long
        assert!(Dtc::from_code("P030").is_none()); // too short
    }

    #[test]
    fn status_flags() {
        let dtc = Dtc::from_bytes(0x03, 0x00).with_status(0x8C);
        assert!(dtc.mil_on());
        assert!(dtc.status.contains(DtcStatus::CONFIRMED));
        assert!(dtc.status.contains(DtcStatus::PENDING));
        assert!(!dtc.status.contains(DtcStatus::TEST_FAILED));
    }
}
