//! Provides methods to reset the ECU, simulating power cycling or
//! re-initializing memory regions

use crate::{DiagError, DiagServerResult};

use super::{UdsClient, UdsCommand};

/// Options for resetting the ECU
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetType {
    /// Forceful power off/on cycle. Both volatile and non-volatile memory
    /// may be re-initialized
    HardReset,
    /// Simulated key off/on cycle. Non-volatile memory is preserved
    KeyOffReset,
    /// Reboot of the running application only
    SoftReset,
    /// Other OEM defined reset mode
    Other(u8),
}

impl From<ResetType> for u8 {
    fn from(r: ResetType) -> u8 {
        match r {
            ResetType::HardReset => 0x01,
            ResetType::KeyOffReset => 0x02,
            ResetType::SoftReset => 0x03,
            ResetType::Other(x) => x,
        }
    }
}

/// Asks the ECU to perform the given reset.
///
/// ## Returns
/// The power-down time in seconds, when the ECU announces one. A value of
/// 0xFF ("not available") is treated as absent.
pub fn ecu_reset(client: &mut UdsClient, reset: ResetType) -> DiagServerResult<Option<u8>> {
    let resp = client.execute_command_with_response(UdsCommand::EcuReset, &[reset.into()])?;
    if resp.len() < 2 {
        return Err(DiagError::InvalidResponseLength);
    }
    Ok(resp.get(2).copied().filter(|t| *t != 0xFF))
}
