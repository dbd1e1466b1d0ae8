//! Data model for discovered modules and diagnostic sessions

use std::time::SystemTime;

use strum_macros::{Display, EnumIter, EnumString};

use crate::channel::RESPONSE_ADDR_OFFSET;
use crate::dtc::Dtc;
use crate::obd2::{MonitorStatus, ObdValue};
use crate::uds::diagnostic_session_control::UdsSessionType;

/// Functional grouping of vehicle modules, in display order
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Display, EnumIter, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModuleCategory {
    /// Engine and transmission controllers
    Powertrain,
    /// Brakes, steering, suspension
    Chassis,
    /// Body electronics, comfort, lighting
    Body,
    /// Gateways and network nodes
    Network,
    /// Anything not classified
    Unknown,
}

impl ModuleCategory {
    /// Sort index: categories order before addresses in scan reports
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Coarse classification of the standard 11-bit diagnostic address map
    pub fn from_address(addr: u32) -> Self {
        match addr {
            0x7E0..=0x7E7 => ModuleCategory::Powertrain,
            0x713..=0x71F | 0x730..=0x73F => ModuleCategory::Chassis,
            0x740..=0x75F => ModuleCategory::Body,
            0x710..=0x712 | 0x760..=0x77F => ModuleCategory::Network,
            _ => ModuleCategory::Unknown,
        }
    }
}

/// Identification strings read from a module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModuleIdentification {
    /// Application software id (DID 0xF194)
    pub software_version: Option<String>,
    /// ECU serial number (DID 0xF18C)
    pub serial_number: Option<String>,
    /// Manufacturer part number (DID 0xF187)
    pub part_number: Option<String>,
}

/// An ECU discovered on the diagnostic bus
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleModule {
    /// 11-bit CAN request address
    pub address: u32,
    /// Address the module answers from
    pub response_address: u32,
    /// Functional grouping
    pub category: ModuleCategory,
    /// Identification strings, where the module offered them
    pub identification: ModuleIdentification,
    /// Trouble codes read from the module
    pub dtcs: Vec<Dtc>,
    /// Services the module answered positively during the scan
    pub supported_services: Vec<u8>,
    /// Security access has been unlocked in this conversation
    pub security_unlocked: bool,
    /// Diagnostic session the module is currently in
    pub session: UdsSessionType,
}

impl VehicleModule {
    /// Creates an empty record for the module at `address`, with the
    /// conventional `address + 8` response address
    pub fn new(address: u32) -> Self {
        Self {
            address,
            response_address: address + RESPONSE_ADDR_OFFSET,
            category: ModuleCategory::from_address(address),
            identification: ModuleIdentification::default(),
            dtcs: Vec::new(),
            supported_services: Vec::new(),
            security_unlocked: false,
            session: UdsSessionType::Default,
        }
    }
}

/// One live-data sample delivered by the streaming reader
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LiveDataSample {
    /// The PID this sample belongs to
    pub pid: crate::obd2::DataPid,
    /// Decoded value
    pub value: ObdValue,
    /// When the response arrived
    pub timestamp: SystemTime,
}

/// Vehicle-level information captured at session start
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleInfo {
    /// Vehicle identification number
    pub vin: Option<String>,
    /// Protocol the session runs over
    pub protocol: String,
    /// Battery voltage at connect time
    pub battery_voltage: Option<f32>,
}

/// A recorded diagnostic session. Mutable while open; [DiagnosticSession::end]
/// freezes it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DiagnosticSession {
    /// Session identifier (unique per process run)
    pub id: u32,
    /// Wall-clock session start
    pub started_at: SystemTime,
    /// Wall-clock session end; `None` while the session is open
    pub ended_at: Option<SystemTime>,
    /// Vehicle-level info
    pub vehicle: VehicleInfo,
    /// DTC snapshot taken during the session
    pub dtcs: Vec<Dtc>,
    /// Live-data readings collected during the session
    pub readings: Vec<LiveDataSample>,
    /// Readiness monitor snapshot
    pub readiness: Option<MonitorStatus>,
}

impl DiagnosticSession {
    /// Opens a new session record
    pub fn new(id: u32, vehicle: VehicleInfo) -> Self {
        Self {
            id,
            started_at: SystemTime::now(),
            ended_at: None,
            vehicle,
            dtcs: Vec::new(),
            readings: Vec::new(),
            readiness: None,
        }
    }

    /// True until [DiagnosticSession::end] is called
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Records a DTC snapshot. Ignored once the session has ended.
    pub fn record_dtcs(&mut self, dtcs: Vec<Dtc>) {
        if self.is_open() {
            self.dtcs = dtcs;
        }
    }

    /// Appends a live-data sample. Ignored once the session has ended.
    pub fn record_sample(&mut self, sample: LiveDataSample) {
        if self.is_open() {
            self.readings.push(sample);
        }
    }

    /// Records the readiness snapshot. Ignored once the session has ended.
    pub fn record_readiness(&mut self, status: MonitorStatus) {
        if self.is_open() {
            self.readiness = Some(status);
        }
    }

    /// Closes the session. All record operations become no-ops.
    pub fn end(&mut self) {
        if self.ended_at.is_none() {
            self.ended_at = Some(SystemTime::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_ordering() {
        assert!(ModuleCategory::Powertrain.index() < ModuleCategory::Chassis.index());
        assert!(ModuleCategory::Body.index() < ModuleCategory::Unknown.index());
    }

    #[test]
    fn category_from_address() {
        assert_eq!(ModuleCategory::from_address(0x7E0), ModuleCategory::Powertrain);
        assert_eq!(ModuleCategory::from_address(0x735), ModuleCategory::Chassis);
        assert_eq!(ModuleCategory::from_address(0x746), ModuleCategory::Body);
        assert_eq!(ModuleCategory::from_address(0x700), ModuleCategory::Unknown);
    }

    #[test]
    fn response_address_default() {
        assert_eq!(VehicleModule::new(0x7E0).response_address, 0x7E8);
    }

    #[test]
    fn ended_session_is_immutable() {
        let mut s = DiagnosticSession::new(1, VehicleInfo::default());
        s.record_dtcs(vec![Dtc::from_word(0x0300)]);
        s.end();
        let frozen = s.dtcs.clone();
        s.record_dtcs(vec![]);
        s.record_readiness(MonitorStatus {
            mil_on: false,
            dtc_count: 0,
            compression_ignition: false,
            monitors: vec![],
        });
        assert_eq!(s.dtcs, frozen);
        assert!(s.readiness.is_none());
        assert!(!s.is_open());
    }
}
