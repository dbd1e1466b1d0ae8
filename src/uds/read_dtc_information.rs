//! Provides methods to read and count DTCs stored on the ECU

use crate::dtc::Dtc;
use crate::{DiagError, DiagServerResult};

use super::{UdsClient, UdsCommand};

/// ReadDTCInformation sub-function definitions used by this client
#[derive(Debug, Copy, Clone)]
#[repr(u8)]
pub enum DtcSubFunction {
    /// Takes a 1 byte DTCStatusMask, returns a count
    ReportNumberOfDtcByStatusMask = 0x01,
    /// Takes a 1 byte DTCStatusMask, returns the matching DTCs
    ReportDtcByStatusMask = 0x02,
}

/// Returns the number of DTCs matching `status_mask`, together with the
/// status availability mask the ECU reports
pub fn get_number_of_dtcs_by_status_mask(
    client: &mut UdsClient,
    status_mask: u8,
) -> DiagServerResult<(u8, u16)> {
    let resp = client.execute_command_with_response(
        UdsCommand::ReadDtcInformation,
        &[
            DtcSubFunction::ReportNumberOfDtcByStatusMask as u8,
            status_mask,
        ],
    )?;
    if resp.len() != 6 {
        Err(DiagError::InvalidResponseLength)
    } else {
        Ok((resp[2], u16::from_be_bytes([resp[4], resp[5]])))
    }
}

/// Returns the DTCs matching `status_mask`.
///
/// The response after SID, sub-function echo and availability mask is a
/// run of `[hi | mid | lo | status]` quartets; `hi`/`mid` carry the
/// displayable trouble code. Duplicate codes are collapsed, keeping the
/// first status seen.
pub fn get_dtcs_by_status_mask(
    client: &mut UdsClient,
    status_mask: u8,
) -> DiagServerResult<Vec<Dtc>> {
    let resp = client.execute_command_with_response(
        UdsCommand::ReadDtcInformation,
        &[DtcSubFunction::ReportDtcByStatusMask as u8, status_mask],
    )?;
    parse_dtc_report(&resp)
}

/// Parses a complete `59 02` positive response into trouble codes
pub fn parse_dtc_report(resp: &[u8]) -> DiagServerResult<Vec<Dtc>> {
    if resp.len() < 7 {
        return Ok(vec![]); // No stored DTCs
    }

    let quartets = &resp[3..]; // Past SID, sub-function, availability mask
    if quartets.len() % 4 != 0 {
        return Err(DiagError::InvalidResponseLength); // Each DTC is 4 bytes
    }

    let mut result: Vec<Dtc> = Vec::with_capacity(quartets.len() / 4);
    for quartet in quartets.chunks_exact(4) {
        let dtc = Dtc::from_bytes(quartet[0], quartet[1]).with_status(quartet[3]);
        if !result.iter().any(|d| d.to_word() == dtc.to_word()) {
            result.push(dtc);
        }
    }
    Ok(result)
}
