//! Byte transport abstraction between the diagnostic stack and a VCI dongle.
//!
//! The stack is transport agnostic. A [ByteTransport] is anything that can
//! push bytes towards the dongle, hand back whatever the dongle sent, and
//! report connection lifecycle changes. Physical implementations (BLE
//! characteristic write/notify, RFCOMM, serial ports) live outside this
//! crate; the in-process [crate::simulator::SimulatedVehicle] is the
//! implementation shipped here.

use std::sync::mpsc;

/// Transport operation result
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors produced by a byte transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Underlying IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Timeout writing to the device
    #[error("timeout writing to transport")]
    WriteTimeout,
    /// Timeout waiting for inbound bytes
    #[error("timeout reading from transport")]
    ReadTimeout,
    /// Nothing buffered. Only returned for zero-timeout reads
    #[error("transport receive buffer is empty")]
    BufferEmpty,
    /// The transport has not been opened, or the peer disconnected
    #[error("transport is not open")]
    NotOpen,
    /// Transport-specific failure
    #[error("transport failure: {0}")]
    Other(String),
}

/// Connection lifecycle of a transport
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link to the device
    Disconnected,
    /// Searching for the device
    Scanning,
    /// Link establishment in progress
    Connecting,
    /// Link established, bytes can flow
    Connected,
    /// The link failed and must be re-established
    Error,
}

/// A bidirectional byte stream with connection lifecycle events.
///
/// The diagnostic session owns its transport exclusively. Inbound data is
/// chunk oriented: one `recv` returns one delivery from the device (a BLE
/// notification, an RFCOMM read, one simulator response segment), which may
/// hold a partial frame or several frames. Framing is the next layer's job.
pub trait ByteTransport: Send + std::fmt::Debug {
    /// Opens the link. Implementations transition their state stream
    /// through `Connecting` to `Connected`
    fn open(&mut self) -> TransportResult<()>;

    /// Closes the link, transitioning to `Disconnected`
    fn close(&mut self) -> TransportResult<()>;

    /// Writes `data` to the device
    ///
    /// ## Parameters
    /// * data - Bytes to write
    /// * timeout_ms - Write timeout. 0 means fire-and-forget
    fn send(&mut self, data: &[u8], timeout_ms: u32) -> TransportResult<()>;

    /// Reads the next inbound chunk.
    ///
    /// ## Parameters
    /// * timeout_ms - How long to wait for data. With a value of 0 the
    ///   call returns immediately, yielding [TransportError::BufferEmpty]
    ///   when nothing is buffered
    fn recv(&mut self, timeout_ms: u32) -> TransportResult<Vec<u8>>;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Registers a listener for connection state changes. Every transition
    /// is delivered to all listeners registered at the time it happens.
    fn subscribe_state(&mut self) -> mpsc::Receiver<ConnectionState>;

    /// Discards any buffered inbound bytes
    fn clear_rx_buffer(&mut self) -> TransportResult<()>;
}

/// Identifiers host applications use to recognize supported adapters
/// during device discovery. Discovery itself happens outside this crate;
/// these are published so every frontend filters the same way.
pub mod identifiers {
    /// Device-name prefixes of Autel VCI dongles
    pub const AUTEL_NAME_PREFIXES: [&str; 2] = ["Autel", "Maxi-"];
    /// Autel's IEEE OUI (MAC address prefix)
    pub const AUTEL_OUI: &str = "00:0C:BF";
    /// BLE service the Autel VCI exposes
    pub const AUTEL_BLE_SERVICE_UUID: &str = "0000fff0-0000-1000-8000-00805f9b34fb";
    /// BLE characteristic written to reach the VCI
    pub const AUTEL_BLE_WRITE_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";
    /// BLE characteristic the VCI notifies responses on
    pub const AUTEL_BLE_NOTIFY_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";
    /// Bluetooth Classic serial port profile UUID
    pub const SPP_UUID: &str = "00001101-0000-1000-8000-00805f9b34fb";
    /// RFCOMM channel of the Autel SPP service
    pub const AUTEL_RFCOMM_CHANNEL: u8 = 12;
    /// Name fragments of ELM327-compatible adapters
    pub const ELM_NAME_FRAGMENTS: [&str; 4] = ["OBD", "ELM", "VLINK", "VEEPEAK"];

    /// True when a discovered device name looks like an Autel VCI
    pub fn is_autel_name(name: &str) -> bool {
        AUTEL_NAME_PREFIXES.iter().any(|p| name.starts_with(p))
    }

    /// True when a discovered device name looks like an ELM327 adapter
    pub fn is_elm_name(name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        ELM_NAME_FRAGMENTS.iter().any(|f| upper.contains(f))
    }
}

/// Helper collecting state-change listeners. Transports embed one and call
/// [StateNotifier::transition] on lifecycle changes.
#[derive(Debug, Default)]
pub struct StateNotifier {
    current: Option<ConnectionState>,
    listeners: Vec<mpsc::Sender<ConnectionState>>,
}

impl StateNotifier {
    /// Creates a notifier starting in `Disconnected`
    pub fn new() -> Self {
        Self {
            current: Some(ConnectionState::Disconnected),
            listeners: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.current.unwrap_or(ConnectionState::Disconnected)
    }

    /// Registers a new listener
    pub fn subscribe(&mut self) -> mpsc::Receiver<ConnectionState> {
        let (tx, rx) = mpsc::channel();
        self.listeners.push(tx);
        rx
    }

    /// Moves to `state`, notifying listeners. Dead listeners are dropped.
    pub fn transition(&mut self, state: ConnectionState) {
        if self.current == Some(state) {
            return;
        }
        log::debug!("transport state {:?} -> {:?}", self.current, state);
        self.current = Some(state);
        self.listeners.retain(|l| l.send(state).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_classification() {
        assert!(identifiers::is_autel_name("Autel AP200"));
        assert!(identifiers::is_autel_name("Maxi-VCI Mini"));
        assert!(!identifiers::is_autel_name("random gadget"));

        assert!(identifiers::is_elm_name("OBDII"));
        assert!(identifiers::is_elm_name("elm327 v1.5"));
        assert!(identifiers::is_elm_name("Veepeak BLE+"));
        assert!(!identifiers::is_elm_name("JBL Speaker"));
    }

    #[test]
    fn notifier_delivers_transitions_once() {
        let mut n = StateNotifier::new();
        assert_eq!(n.state(), ConnectionState::Disconnected);
        let rx = n.subscribe();
        n.transition(ConnectionState::Connecting);
        n.transition(ConnectionState::Connecting); // No duplicate event
        n.transition(ConnectionState::Connected);
        assert_eq!(rx.try_recv(), Ok(ConnectionState::Connecting));
        assert_eq!(rx.try_recv(), Ok(ConnectionState::Connected));
        assert!(rx.try_recv().is_err());
        assert_eq!(n.state(), ConnectionState::Connected);
    }
}
