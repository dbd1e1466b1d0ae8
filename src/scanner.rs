//! ECU address sweeps: probing the diagnostic address range, identifying
//! responding modules and collecting their trouble codes.
//!
//! Each probe is one TesterPresent round trip through the orchestrator's
//! serialized command queue. A module is present when it answers at all -
//! positively, or negatively with anything other than service-not-supported
//! (a gateway saying "no" is still a module).

use log::{debug, info};

use crate::orchestrator::DiagnosticOrchestrator;
use crate::uds::read_dtc_information::parse_dtc_report;
use crate::uds::{NEGATIVE_RESPONSE_SID, UdsCommand};
use crate::vehicle::VehicleModule;
use crate::{DiagError, DiagServerResult, obd2::sanitize_ascii, uds::data_by_identifier::did};

/// Address range selection for a scan
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScanMode {
    /// The priority range `0x7E0..=0x7EF` where emissions-relevant
    /// modules answer
    Quick,
    /// The whole 11-bit diagnostic range `0x700..=0x7FF`
    Full,
}

impl ScanMode {
    fn addresses(&self) -> std::ops::RangeInclusive<u32> {
        match self {
            ScanMode::Quick => 0x7E0..=0x7EF,
            ScanMode::Full => 0x700..=0x7FF,
        }
    }
}

/// Scan configuration
#[derive(Debug, Copy, Clone)]
pub struct ScanOptions {
    /// Address range to sweep
    pub mode: ScanMode,
    /// Per-probe deadline. Kept short: silence is the common case
    pub probe_timeout_ms: u32,
    /// Deadline for identification and DTC reads on present modules
    pub ident_timeout_ms: u32,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Quick,
            probe_timeout_ms: 150,
            ident_timeout_ms: 1000,
        }
    }
}

/// Progress snapshot emitted after every probed address
#[derive(Debug, Clone)]
pub struct ScanProgress {
    /// Address just probed
    pub current_address: u32,
    /// Addresses probed so far
    pub scanned: usize,
    /// Addresses in the sweep
    pub total: usize,
    /// Modules found so far
    pub found: usize,
    /// Human readable status line
    pub message: String,
    /// True on the final event
    pub complete: bool,
}

/// Sweeps the diagnostic address range over `orchestrator`, invoking
/// `progress` after each probe.
///
/// Results are ordered by module category, then numeric address.
pub fn scan_modules(
    orchestrator: &DiagnosticOrchestrator,
    opts: ScanOptions,
    mut progress: impl FnMut(ScanProgress),
) -> DiagServerResult<Vec<VehicleModule>> {
    let addresses: Vec<u32> = opts.mode.addresses().collect();
    let total = addresses.len();
    let mut modules: Vec<VehicleModule> = Vec::new();

    info!("scanning {total} addresses ({:?} mode)", opts.mode);
    for (scanned, addr) in addresses.into_iter().enumerate() {
        let present = probe_module(orchestrator, addr, opts.probe_timeout_ms)?;
        if present {
            debug!("module present at 0x{addr:03X}");
            let module = identify_module(orchestrator, addr, opts.ident_timeout_ms);
            modules.push(module);
        }
        progress(ScanProgress {
            current_address: addr,
            scanned: scanned + 1,
            total,
            found: modules.len(),
            message: if present {
                format!("Found module at 0x{addr:03X}")
            } else {
                format!("Probed 0x{addr:03X}")
            },
            complete: false,
        });
    }

    modules.sort_by_key(|m| (m.category.index(), m.address));
    progress(ScanProgress {
        current_address: 0,
        scanned: total,
        total,
        found: modules.len(),
        message: format!("Scan complete, {} modules", modules.len()),
        complete: true,
    });
    Ok(modules)
}

/// Sends TesterPresent to `addr` and decides presence from the reply
fn probe_module(
    orchestrator: &DiagnosticOrchestrator,
    addr: u32,
    timeout_ms: u32,
) -> DiagServerResult<bool> {
    match orchestrator.request(addr, &[UdsCommand::TesterPresent as u8, 0x00], timeout_ms) {
        Ok(resp) if resp.is_empty() => Ok(false),
        Ok(resp) => {
            if resp[0] == NEGATIVE_RESPONSE_SID {
                // Anything but service-not-supported still proves a module
                Ok(resp.get(2) != Some(&0x11))
            } else {
                Ok(true)
            }
        }
        Err(DiagError::Timeout) | Err(DiagError::Bus(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads identification DIDs and stored DTCs from a present module.
/// Individual read failures leave the field empty rather than failing the
/// scan.
fn identify_module(
    orchestrator: &DiagnosticOrchestrator,
    addr: u32,
    timeout_ms: u32,
) -> VehicleModule {
    let mut module = VehicleModule::new(addr);
    module.supported_services.push(UdsCommand::TesterPresent as u8);

    let read_did = |identifier: u16| -> Option<String> {
        let mut req = vec![UdsCommand::ReadDataByIdentifier as u8];
        req.extend_from_slice(&identifier.to_be_bytes());
        match orchestrator.request(addr, &req, timeout_ms) {
            Ok(resp) if resp.len() > 3 && resp[0] == 0x62 => {
                let s = sanitize_ascii(&resp[3..]);
                (!s.is_empty()).then_some(s)
            }
            _ => None,
        }
    };

    module.identification.software_version = read_did(did::APPLICATION_SOFTWARE_ID);
    module.identification.serial_number = read_did(did::ECU_SERIAL_NUMBER);
    module.identification.part_number = read_did(did::MANUFACTURER_PART_NUMBER);
    if module.identification != Default::default() {
        module
            .supported_services
            .push(UdsCommand::ReadDataByIdentifier as u8);
    }

    if let Ok(resp) = orchestrator.request(addr, &[0x19, 0x02, 0xFF], timeout_ms) {
        if resp.first() == Some(&0x59) {
            if let Ok(dtcs) = parse_dtc_report(&resp) {
                module.dtcs = dtcs;
                module
                    .supported_services
                    .push(UdsCommand::ReadDtcInformation as u8);
            }
        }
    }

    module
}
