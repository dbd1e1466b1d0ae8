//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! Request/response framing for the services a diagnostic client needs.
//! Requests are `SID | sub-function? | parameters`; a positive response
//! echoes `SID + 0x40`, a negative response is `7F | SID | NRC`.

use crate::channel::DiagChannel;
use crate::{DiagError, DiagServerResult};

pub mod clear_diagnostic_information;
pub mod data_by_identifier;
pub mod diagnostic_session_control;
pub mod ecu_reset;
pub mod read_dtc_information;
pub mod routine_control;
pub mod security_access;

/// UDS Command Service IDs supported by this client
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UdsCommand {
    /// Diagnostic session control. See [diagnostic_session_control]
    DiagnosticSessionControl = 0x10,
    /// ECU Reset. See [ecu_reset]
    EcuReset = 0x11,
    /// Clears stored diagnostic trouble codes
    ClearDiagnosticInformation = 0x14,
    /// Reads DTC information. See [read_dtc_information]
    ReadDtcInformation = 0x19,
    /// Reads a value by its 16-bit data identifier
    ReadDataByIdentifier = 0x22,
    /// Security access seed/key handshake. See [security_access]
    SecurityAccess = 0x27,
    /// Writes a value by its 16-bit data identifier
    WriteDataByIdentifier = 0x2E,
    /// Starts/stops ECU-internal routines. See [routine_control]
    RoutineControl = 0x31,
    /// Keeps a non-default session alive
    TesterPresent = 0x3E,
    /// Enables or disables DTC storage
    ControlDtcSetting = 0x85,
}

/// UDS negative response codes, narrowed to the set a diagnostic client
/// acts on. Everything else lands in [UdsError::IsoSaeReserved].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum UdsError {
    /// ECU rejected the request with no specific reason
    GeneralReject,
    /// Service is not supported by the ECU
    ServiceNotSupported,
    /// Sub function is not supported by the ECU
    SubFunctionNotSupported,
    /// Request message was an invalid length or badly formed
    IncorrectMessageLengthOrInvalidFormat,
    /// The ECU is busy; the request should be repeated
    BusyRepeatRequest,
    /// Prerequisite conditions for the request are not met
    ConditionsNotCorrect,
    /// Requests were sent in the wrong order (e.g. key before seed)
    RequestSequenceError,
    /// A parameter in the request is outside its valid range
    RequestOutOfRange,
    /// Security access has not been granted for this operation
    SecurityAccessDenied,
    /// The key sent after a seed request was wrong
    InvalidKey,
    /// Too many wrong keys; the ECU has locked the security service
    ExceedNumberOfAttempts,
    /// The mandatory delay after a failed unlock has not yet expired
    RequiredTimeDelayNotExpired,
    /// Request accepted, response still being prepared. Extends the
    /// client's deadline instead of failing the request
    RequestCorrectlyReceivedResponsePending,
    /// The sub function is not available in the active session
    SubFunctionNotSupportedInActiveSession,
    /// The service is not available in the active session
    ServiceNotSupportedInActiveSession,
    /// Any other reserved code
    IsoSaeReserved(u8),
}

impl From<u8> for UdsError {
    fn from(p: u8) -> Self {
        match p {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrInvalidFormat,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceedNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x78 => Self::RequestCorrectlyReceivedResponsePending,
            0x7E => Self::SubFunctionNotSupportedInActiveSession,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            x => Self::IsoSaeReserved(x),
        }
    }
}

impl From<UdsError> for u8 {
    fn from(e: UdsError) -> u8 {
        match e {
            UdsError::GeneralReject => 0x10,
            UdsError::ServiceNotSupported => 0x11,
            UdsError::SubFunctionNotSupported => 0x12,
            UdsError::IncorrectMessageLengthOrInvalidFormat => 0x13,
            UdsError::BusyRepeatRequest => 0x21,
            UdsError::ConditionsNotCorrect => 0x22,
            UdsError::RequestSequenceError => 0x24,
            UdsError::RequestOutOfRange => 0x31,
            UdsError::SecurityAccessDenied => 0x33,
            UdsError::InvalidKey => 0x35,
            UdsError::ExceedNumberOfAttempts => 0x36,
            UdsError::RequiredTimeDelayNotExpired => 0x37,
            UdsError::RequestCorrectlyReceivedResponsePending => 0x78,
            UdsError::SubFunctionNotSupportedInActiveSession => 0x7E,
            UdsError::ServiceNotSupportedInActiveSession => 0x7F,
            UdsError::IsoSaeReserved(x) => x,
        }
    }
}

/// Negative response service id
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Builds the request bytes for `sid` with `args`
pub fn make_request(sid: UdsCommand, args: &[u8]) -> Vec<u8> {
    let mut b = Vec::with_capacity(args.len() + 1);
    b.push(sid as u8);
    b.extend_from_slice(args);
    b
}

/// Returns true when `resp` is `7F <sid> 78` (response pending)
pub fn is_response_pending(resp: &[u8]) -> bool {
    resp.len() >= 3 && resp[0] == NEGATIVE_RESPONSE_SID && resp[2] == 0x78
}

/// Validates a response to `sid`, mapping negative responses onto the
/// crate error taxonomy. The full positive response (starting with
/// `sid + 0x40`) is returned.
pub fn process_response(sid: UdsCommand, resp: Vec<u8>) -> DiagServerResult<Vec<u8>> {
    if resp.is_empty() {
        return Err(DiagError::Timeout);
    }
    if resp[0] == NEGATIVE_RESPONSE_SID {
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        let nrc = UdsError::from(resp[2]);
        log::warn!("uds negative response to {:02X?}: {:?}", sid, nrc);
        return Err(match nrc {
            UdsError::ServiceNotSupported => DiagError::Unsupported,
            UdsError::SecurityAccessDenied => DiagError::SecurityDenied,
            UdsError::InvalidKey => DiagError::InvalidKey,
            other => DiagError::UdsNegative(other),
        });
    }
    if resp[0] != sid as u8 + 0x40 {
        log::error!(
            "uds SID mismatch: requested 0x{:02X}, response started 0x{:02X}",
            sid as u8,
            resp[0]
        );
        return Err(DiagError::WrongMessage);
    }
    Ok(resp)
}

/// A UDS conversation with one ECU over a [DiagChannel].
///
/// Thin and stateless apart from addressing and deadline; the per-service
/// modules add typed operations on top of [UdsClient::execute_command_with_response].
#[derive(Debug)]
pub struct UdsClient<'a> {
    channel: &'a mut dyn DiagChannel,
    address: u32,
    /// Response deadline applied to every request
    pub timeout_ms: u32,
}

impl<'a> UdsClient<'a> {
    /// Creates a client talking to the ECU at `address` with the default
    /// 5 second deadline
    pub fn new(channel: &'a mut dyn DiagChannel, address: u32) -> Self {
        Self {
            channel,
            address,
            timeout_ms: 5000,
        }
    }

    /// Overrides the response deadline
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// The ECU address this client converses with
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Sends `sid` + `args` and returns the validated positive response
    /// (starting with `sid + 0x40`)
    pub fn execute_command_with_response(
        &mut self,
        sid: UdsCommand,
        args: &[u8],
    ) -> DiagServerResult<Vec<u8>> {
        let req = make_request(sid, args);
        let resp = self.channel.request(self.address, &req, self.timeout_ms)?;
        process_response(sid, resp)
    }

    /// Sends a TesterPresent to keep a non-default session alive
    pub fn tester_present(&mut self) -> DiagServerResult<()> {
        self.execute_command_with_response(UdsCommand::TesterPresent, &[0x00])
            .map(|_| ())
    }

    /// Switches DTC storage on or off (service 0x85)
    pub fn control_dtc_setting(&mut self, storage_on: bool) -> DiagServerResult<()> {
        let sub = if storage_on { 0x01 } else { 0x02 };
        self.execute_command_with_response(UdsCommand::ControlDtcSetting, &[sub])
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        assert_eq!(
            make_request(UdsCommand::ReadDataByIdentifier, &[0xF1, 0x94]),
            vec![0x22, 0xF1, 0x94]
        );
        assert_eq!(make_request(UdsCommand::TesterPresent, &[0x00]), vec![0x3E, 0x00]);
    }

    #[test]
    fn positive_response_accepted() {
        let r = process_response(UdsCommand::TesterPresent, vec![0x7E, 0x00]).unwrap();
        assert_eq!(r, vec![0x7E, 0x00]);
    }

    #[test]
    fn negative_response_mapping() {
        let e = process_response(UdsCommand::SecurityAccess, vec![0x7F, 0x27, 0x35]);
        assert!(matches!(e, Err(DiagError::InvalidKey)));

        let e = process_response(UdsCommand::SecurityAccess, vec![0x7F, 0x27, 0x33]);
        assert!(matches!(e, Err(DiagError::SecurityDenied)));

        let e = process_response(UdsCommand::TesterPresent, vec![0x7F, 0x3E, 0x11]);
        assert!(matches!(e, Err(DiagError::Unsupported)));

        let e = process_response(UdsCommand::ReadDataByIdentifier, vec![0x7F, 0x22, 0x31]);
        assert!(matches!(
            e,
            Err(DiagError::UdsNegative(UdsError::RequestOutOfRange))
        ));
    }

    #[test]
    fn mismatched_sid_rejected() {
        let e = process_response(UdsCommand::TesterPresent, vec![0x50, 0x01]);
        assert!(matches!(e, Err(DiagError::WrongMessage)));
    }

    #[test]
    fn nrc_byte_round_trip() {
        for b in [0x10u8, 0x11, 0x12, 0x13, 0x22, 0x31, 0x33, 0x35, 0x36, 0x37, 0x78, 0x7F] {
            assert_eq!(u8::from(UdsError::from(b)), b);
        }
    }
}
