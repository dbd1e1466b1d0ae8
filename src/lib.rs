#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_imports,
    unused_import_braces,
    unused_qualifications
)]

//! A crate implementing the client side of modern vehicle diagnostics:
//! the protocol and transport stack between a diagnostic application and a
//! Vehicle Communication Interface (VCI) dongle.
//!
//! ## Protocol support
//!
//! ### Autel VCI framing
//! Autel MaxiFlash-family dongles speak a proprietary session-based packet
//! protocol which carries SAE J2534 (PassThru) calls. The [autel] module
//! implements the bit-exact frame codec (magic header, little-endian fields,
//! CRC32) and a [autel::AutelVci] session which drives the PassThru
//! open/connect/filter/read/write sequence over any byte transport.
//!
//! ### OBD2 over ELM327
//! The ubiquitous ELM327 interpreter ASCII dialect, plus OBD2 (SAE J1979)
//! service modes 01/03/04/07/09 with PID decoding. See [obd2].
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 request/response framing for the services a diagnostic client
//! needs: session control, ECU reset, DTC read/clear, read/write data by
//! identifier, security access, routine control and tester present. See [uds].
//!
//! ## Higher layers
//!
//! * [orchestrator] - serialized command execution, live data streaming,
//!   DTC operations and VIN readout over any [channel::DiagChannel]
//! * [scanner] - ECU address sweeps with per-module identification
//! * [simulator] - an in-process vehicle answering the full ELM327 + UDS
//!   surface, indistinguishable from a real transport to the layers above

use transport::TransportError;
use uds::UdsError;

pub mod autel;
pub mod channel;
pub mod crc32;
pub mod dtc;
pub mod isotp;
pub mod obd2;
pub mod orchestrator;
pub mod scanner;
pub mod simulator;
pub mod transport;
pub mod uds;
pub mod vehicle;

/// Diagnostic operation result
pub type DiagServerResult<T> = Result<T, DiagError>;

/// Errors surfaced by the diagnostic stack
#[derive(Debug, thiserror::Error)]
pub enum DiagError {
    /// The transport is not connected to a VCI
    #[error("transport is not connected")]
    NotConnected,
    /// The request timed out waiting for a response
    #[error("request timed out")]
    Timeout,
    /// A frame failed low-level validation (bad magic, bad CRC, truncation)
    #[error("protocol framing error: {0}")]
    ProtocolFraming(FramingError),
    /// The vehicle bus reported an error (`BUS INIT`, `CAN ERROR`, ...)
    #[error("bus error: {0}")]
    Bus(String),
    /// The ECU rejected the request with a UDS negative response code
    #[error("ECU negative response: {0:?}")]
    UdsNegative(UdsError),
    /// The ECU denied security access for the requested operation
    #[error("security access denied")]
    SecurityDenied,
    /// The security key computed from the seed was rejected
    #[error("security key rejected by ECU")]
    InvalidKey,
    /// The request is not supported by this ECU or channel
    #[error("request not supported")]
    Unsupported,
    /// The response was shorter than the service definition requires
    #[error("response message was of invalid length")]
    InvalidResponseLength,
    /// The ECU responded, but not to the request that was sent
    #[error("response did not match the request")]
    WrongMessage,
    /// The session worker has terminated and can accept no more commands
    #[error("diagnostic session is no longer running")]
    SessionClosed,
    /// Error in the underlying byte transport
    #[error("transport error: {0}")]
    TransportIO(#[from] TransportError),
}

/// Low-level frame validation failures. Frames failing validation are
/// dropped at the codec layer; this type only surfaces when a caller asks
/// to parse an explicit byte buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The buffer does not start with the expected magic bytes
    #[error("bad magic bytes")]
    BadMagic,
    /// The trailing CRC32 did not match the frame contents
    #[error("CRC mismatch (frame {found:08X}, computed {computed:08X})")]
    BadCrc {
        /// CRC stored in the frame trailer
        found: u32,
        /// CRC computed over the frame contents
        computed: u32,
    },
    /// The buffer ended before the length announced in the header
    #[error("truncated frame ({have} of {need} bytes)")]
    Truncated {
        /// Bytes available
        have: usize,
        /// Bytes the header says the full frame occupies
        need: usize,
    },
}

