//! Provides methods to start, stop and poll ECU-internal routines
//! (service 0x31): actuator tests, self-tests and other bi-directional
//! controls

use crate::{DiagError, DiagServerResult};

use super::{UdsClient, UdsCommand};

/// Routine control sub-functions
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RoutineOperation {
    /// Starts the routine
    Start,
    /// Stops the routine
    Stop,
    /// Requests the routine's results
    RequestResults,
}

impl From<RoutineOperation> for u8 {
    fn from(r: RoutineOperation) -> u8 {
        match r {
            RoutineOperation::Start => 0x01,
            RoutineOperation::Stop => 0x02,
            RoutineOperation::RequestResults => 0x03,
        }
    }
}

fn routine_request(
    client: &mut UdsClient,
    op: RoutineOperation,
    routine_id: u16,
    payload: &[u8],
) -> DiagServerResult<Vec<u8>> {
    let mut args = Vec::with_capacity(payload.len() + 3);
    args.push(op.into());
    args.extend_from_slice(&routine_id.to_be_bytes());
    args.extend_from_slice(payload);
    let mut resp = client.execute_command_with_response(UdsCommand::RoutineControl, &args)?;
    if resp.len() < 4 {
        return Err(DiagError::InvalidResponseLength);
    }
    let echoed = u16::from_be_bytes([resp[2], resp[3]]);
    if echoed != routine_id {
        return Err(DiagError::WrongMessage);
    }
    resp.drain(0..4);
    Ok(resp) // Routine status record, if any
}

/// Starts routine `routine_id` with an optional option record. Returns
/// the routine status record from the response.
pub fn start_routine(
    client: &mut UdsClient,
    routine_id: u16,
    options: &[u8],
) -> DiagServerResult<Vec<u8>> {
    routine_request(client, RoutineOperation::Start, routine_id, options)
}

/// Stops routine `routine_id`
pub fn stop_routine(client: &mut UdsClient, routine_id: u16) -> DiagServerResult<Vec<u8>> {
    routine_request(client, RoutineOperation::Stop, routine_id, &[])
}

/// Requests the results of routine `routine_id`
pub fn request_routine_results(
    client: &mut UdsClient,
    routine_id: u16,
) -> DiagServerResult<Vec<u8>> {
    routine_request(client, RoutineOperation::RequestResults, routine_id, &[])
}
