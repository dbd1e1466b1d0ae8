//! Module for logical diagnostic channels with the vehicle
//!
//! A [DiagChannel] is an addressed request/response pipe carrying raw
//! service payloads (OBD2 or UDS bytes) to an ECU and returning the raw
//! response payload. Two implementations exist in this crate:
//! * [crate::obd2::elm327::Elm327Channel] - ELM327 ASCII dialect
//! * [crate::autel::AutelVci] - Autel framed J2534 PassThru calls
//!
//! Higher layers (orchestrator, module scanner) only ever see this trait,
//! so a simulated vehicle is indistinguishable from a real one.

use crate::DiagServerResult;

/// OBD2 broadcast (functional) request address
pub const BROADCAST_ADDR: u32 = 0x7DF;

/// First physical ECU request address of the standard OBD range
pub const PHYSICAL_ADDR_BASE: u32 = 0x7E0;

/// Offset from an ECU's request address to its response address
pub const RESPONSE_ADDR_OFFSET: u32 = 0x08;

/// An addressed request/response channel for diagnostic service payloads
pub trait DiagChannel: Send + std::fmt::Debug {
    /// Brings the channel into a state where [DiagChannel::request] can be
    /// used: for an ELM327 this runs the AT initialization sequence, for an
    /// Autel VCI it performs the identify/open/connect/filter conversation.
    fn initialize(&mut self) -> DiagServerResult<()>;

    /// Sends `payload` to the ECU addressed by `addr` and waits for the
    /// response payload.
    ///
    /// An empty `Ok` vector is a first-class "no data" result (the bus is
    /// fine, no ECU had anything to say), distinct from an error.
    ///
    /// ## Parameters
    /// * addr - 11-bit CAN request address ([BROADCAST_ADDR] for functional
    ///   addressing)
    /// * payload - Raw service bytes (`01 0C`, `3E 00`, ...)
    /// * timeout_ms - Response deadline
    fn request(&mut self, addr: u32, payload: &[u8], timeout_ms: u32)
    -> DiagServerResult<Vec<u8>>;

    /// Reads the vehicle battery voltage as measured by the adapter, if the
    /// adapter can
    fn read_battery_voltage(&mut self) -> DiagServerResult<Option<f32>>;

    /// Human readable channel description, e.g. `"ELM327"`
    fn protocol_name(&self) -> &'static str;

    /// Tears the channel down. The underlying transport is closed
    fn shutdown(&mut self) -> DiagServerResult<()>;
}
