//! Provides methods for clearing DTCs from ECU memory (service 0x14)

use crate::DiagServerResult;

use super::{UdsClient, UdsCommand};

/// Group-of-DTC value selecting every emissions and non-emissions code
pub const ALL_DTCS: u32 = 0x00FF_FFFF;

/// Clears the DTCs in `group` (a 3 byte group-of-DTC value; use
/// [ALL_DTCS] for everything)
pub fn clear_diagnostic_information(client: &mut UdsClient, group: u32) -> DiagServerResult<()> {
    let bytes = group.to_be_bytes();
    client
        .execute_command_with_response(
            UdsCommand::ClearDiagnosticInformation,
            &[bytes[1], bytes[2], bytes[3]],
        )
        .map(|_| ())
}
