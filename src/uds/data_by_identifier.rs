//! Read/write access to ECU values by 16-bit data identifier (services
//! 0x22 and 0x2E), including the identification DIDs the module scanner
//! relies on

use crate::obd2::sanitize_ascii;
use crate::{DiagError, DiagServerResult};

use super::{UdsClient, UdsCommand};

/// Commonly used data identifiers
pub mod did {
    /// Application software identification
    pub const APPLICATION_SOFTWARE_ID: u16 = 0xF194;
    /// ECU serial number
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    /// Vehicle manufacturer ECU part number
    pub const MANUFACTURER_PART_NUMBER: u16 = 0xF187;
    /// ECU hardware version
    pub const ECU_HARDWARE_VERSION: u16 = 0xF193;
    /// Vehicle identification number
    pub const VIN: u16 = 0xF190;
    /// Active diagnostic session
    pub const ACTIVE_SESSION: u16 = 0xF186;
}

/// Reads the raw value of `identifier`
pub fn read_data_by_identifier(client: &mut UdsClient, identifier: u16) -> DiagServerResult<Vec<u8>> {
    let mut resp = client.execute_command_with_response(
        UdsCommand::ReadDataByIdentifier,
        &identifier.to_be_bytes(),
    )?;
    if resp.len() < 3 {
        return Err(DiagError::InvalidResponseLength);
    }
    let echoed = u16::from_be_bytes([resp[1], resp[2]]);
    if echoed != identifier {
        log::error!(
            "DID mismatch: requested 0x{:04X}, ECU answered 0x{:04X}",
            identifier,
            echoed
        );
        return Err(DiagError::WrongMessage);
    }
    resp.drain(0..3);
    Ok(resp)
}

/// Reads `identifier` and renders the value as printable ASCII, the way
/// identification strings (part numbers, serials, software ids) are stored
pub fn read_ident_string(client: &mut UdsClient, identifier: u16) -> DiagServerResult<String> {
    let raw = read_data_by_identifier(client, identifier)?;
    Ok(sanitize_ascii(&raw))
}

/// Writes `value` to `identifier` (service 0x2E). Most DIDs require a
/// prior security unlock.
pub fn write_data_by_identifier(
    client: &mut UdsClient,
    identifier: u16,
    value: &[u8],
) -> DiagServerResult<()> {
    let mut args = Vec::with_capacity(value.len() + 2);
    args.extend_from_slice(&identifier.to_be_bytes());
    args.extend_from_slice(value);
    client
        .execute_command_with_response(UdsCommand::WriteDataByIdentifier, &args)
        .map(|_| ())
}
