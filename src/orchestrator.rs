//! The diagnostic orchestrator: one worker thread owning the channel,
//! serializing every command, and composing the higher level operations
//! (DTC read/clear, readiness, VIN, live-data streaming) out of atomic
//! request/response round trips.
//!
//! Callers talk to the worker over an mpsc queue; each command carries its
//! own reply channel, so responses complete strictly in issue order and a
//! caller can cancel by dropping the pending receiver.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, warn};

use crate::channel::{BROADCAST_ADDR, DiagChannel};
use crate::dtc::Dtc;
use crate::obd2::{DataPid, MonitorStatus, Obd2Service, decode_monitor_status, decode_vin};
use crate::vehicle::{DiagnosticSession, LiveDataSample, VehicleInfo};
use crate::{DiagError, DiagServerResult};

/// Orchestrator configuration
#[derive(Debug, Copy, Clone)]
pub struct OrchestratorOptions {
    /// Deadline for ordinary round trips
    pub default_timeout_ms: u32,
    /// Deadline for VIN and other multi-frame reads
    pub long_timeout_ms: u32,
    /// Total live-data sample rate across all subscribed PIDs
    pub live_data_cadence_hz: u32,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5000,
            long_timeout_ms: 15000,
            live_data_cadence_hz: 10,
        }
    }
}

/// Lifecycle of the orchestrator
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    /// Created, not yet initialized
    Idle = 0,
    /// Channel initialized, ready for commands
    Ready = 1,
    /// Live-data streaming active
    Streaming = 2,
    /// Initialization or the channel failed
    Error = 3,
    /// Shut down
    Closed = 4,
}

impl From<u8> for SessionStatus {
    fn from(b: u8) -> Self {
        match b {
            1 => SessionStatus::Ready,
            2 => SessionStatus::Streaming,
            3 => SessionStatus::Error,
            4 => SessionStatus::Closed,
            _ => SessionStatus::Idle,
        }
    }
}

enum Command {
    Initialize(mpsc::Sender<DiagServerResult<()>>),
    Request {
        addr: u32,
        payload: Vec<u8>,
        timeout_ms: u32,
        reply: mpsc::Sender<DiagServerResult<Vec<u8>>>,
    },
    ReadVoltage(mpsc::Sender<DiagServerResult<Option<f32>>>),
    ProtocolName(mpsc::Sender<DiagServerResult<String>>),
    StartLiveData {
        pids: Vec<DataPid>,
        sink: mpsc::Sender<LiveDataSample>,
        reply: mpsc::Sender<DiagServerResult<()>>,
    },
    StopLiveData,
    Shutdown(mpsc::Sender<DiagServerResult<()>>),
}

/// Serialized diagnostic session over one [DiagChannel].
///
/// All public operations block until the worker has completed them;
/// commands issued from multiple threads complete in issue order.
#[derive(Debug)]
pub struct DiagnosticOrchestrator {
    tx: mpsc::Sender<Command>,
    status: Arc<AtomicU8>,
    opts: OrchestratorOptions,
}

impl DiagnosticOrchestrator {
    /// Creates the orchestrator and its worker thread. The channel is
    /// moved into the worker and owned by it until [DiagnosticOrchestrator::shutdown].
    pub fn new(channel: Box<dyn DiagChannel>, opts: OrchestratorOptions) -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let status = Arc::new(AtomicU8::new(SessionStatus::Idle as u8));
        let worker_status = status.clone();
        std::thread::spawn(move || worker_loop(channel, rx, worker_status, opts));
        Self { tx, status, opts }
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        self.status.load(Ordering::Relaxed).into()
    }

    fn send_command<T>(
        &self,
        cmd: Command,
        reply_rx: mpsc::Receiver<DiagServerResult<T>>,
    ) -> DiagServerResult<T> {
        self.tx.send(cmd).map_err(|_| DiagError::SessionClosed)?;
        reply_rx.recv().unwrap_or(Err(DiagError::SessionClosed))
    }

    /// Runs the channel's initialization sequence. Any failure leaves the
    /// session in [SessionStatus::Error].
    pub fn initialize(&self) -> DiagServerResult<()> {
        let (reply, rx) = mpsc::channel();
        self.send_command(Command::Initialize(reply), rx)
    }

    /// One raw addressed round trip. The building block every higher
    /// operation (and the module scanner) is composed from.
    pub fn request(&self, addr: u32, payload: &[u8], timeout_ms: u32) -> DiagServerResult<Vec<u8>> {
        let (reply, rx) = mpsc::channel();
        self.send_command(
            Command::Request {
                addr,
                payload: payload.to_vec(),
                timeout_ms,
                reply,
            },
            rx,
        )
    }

    /// Broadcast OBD2 round trip with the default deadline
    fn obd_request(&self, payload: &[u8]) -> DiagServerResult<Vec<u8>> {
        self.request(BROADCAST_ADDR, payload, self.opts.default_timeout_ms)
    }

    /// Reads the stored (confirmed) trouble codes (mode 03)
    pub fn read_stored_dtcs(&self) -> DiagServerResult<Vec<Dtc>> {
        let resp = self.obd_request(&[Obd2Service::StoredDtcs as u8])?;
        crate::obd2::decode_dtc_response(Obd2Service::StoredDtcs, &resp)
    }

    /// Reads the pending trouble codes (mode 07)
    pub fn read_pending_dtcs(&self) -> DiagServerResult<Vec<Dtc>> {
        let resp = self.obd_request(&[Obd2Service::PendingDtcs as u8])?;
        crate::obd2::decode_dtc_response(Obd2Service::PendingDtcs, &resp)
    }

    /// Clears trouble codes and resets the readiness monitors (mode 04)
    pub fn clear_dtcs(&self) -> DiagServerResult<()> {
        self.obd_request(&[Obd2Service::ClearDtcs as u8]).map(|_| ())
    }

    /// Reads the monitor status since DTCs cleared (mode 01 PID 01)
    pub fn read_readiness_monitors(&self) -> DiagServerResult<MonitorStatus> {
        let resp = self.obd_request(&[Obd2Service::CurrentData as u8, 0x01])?;
        if resp.len() < 2 {
            return Err(DiagError::InvalidResponseLength);
        }
        decode_monitor_status(&resp[2..])
    }

    /// Reads one live-data PID once
    pub fn read_pid(&self, pid: DataPid) -> DiagServerResult<Option<LiveDataSample>> {
        read_pid_over(
            |payload| self.obd_request(payload),
            pid,
        )
    }

    /// Reads the supported mode 01 PIDs via the `00/20/40/60` bitmaps
    pub fn read_supported_pids(&self) -> DiagServerResult<Vec<u8>> {
        let mut supported = Vec::new();
        for base in [0x00u8, 0x20, 0x40, 0x60] {
            let resp = self.obd_request(&[Obd2Service::CurrentData as u8, base])?;
            if resp.len() < 6 {
                break;
            }
            let batch = crate::obd2::decode_supported_pids(base, &resp[2..6]);
            let continues = batch.contains(&(base + 0x20));
            supported.extend(batch);
            if !continues {
                break;
            }
        }
        Ok(supported)
    }

    /// Reads the VIN (mode 09 PID 02, usually multi-frame)
    pub fn read_vin(&self) -> DiagServerResult<String> {
        let resp = self.request(
            BROADCAST_ADDR,
            &[Obd2Service::VehicleInfo as u8, crate::obd2::info_pid::VIN],
            self.opts.long_timeout_ms,
        )?;
        decode_vin(&resp)
    }

    /// Reads the calibration identifications (mode 09 PID 04). ECUs may
    /// report more than one, in 16 byte slots.
    pub fn read_calibration_ids(&self) -> DiagServerResult<Vec<String>> {
        let resp = self.request(
            BROADCAST_ADDR,
            &[
                Obd2Service::VehicleInfo as u8,
                crate::obd2::info_pid::CALIBRATION_ID,
            ],
            self.opts.long_timeout_ms,
        )?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(resp[3..]
            .chunks(16)
            .map(crate::obd2::sanitize_ascii)
            .filter(|s| !s.is_empty())
            .collect())
    }

    /// Reads the calibration verification numbers (mode 09 PID 06)
    pub fn read_cvns(&self) -> DiagServerResult<Vec<String>> {
        let resp = self.request(
            BROADCAST_ADDR,
            &[Obd2Service::VehicleInfo as u8, crate::obd2::info_pid::CVN],
            self.opts.long_timeout_ms,
        )?;
        if resp.len() < 3 {
            return Err(DiagError::InvalidResponseLength);
        }
        Ok(resp[3..]
            .chunks(4)
            .filter(|c| c.len() == 4)
            .map(|c| format!("{:02X}{:02X}{:02X}{:02X}", c[0], c[1], c[2], c[3]))
            .collect())
    }

    /// Battery voltage as measured by the adapter
    pub fn read_battery_voltage(&self) -> DiagServerResult<Option<f32>> {
        let (reply, rx) = mpsc::channel();
        self.send_command(Command::ReadVoltage(reply), rx)
    }

    /// Name of the protocol the underlying channel speaks
    pub fn protocol_name(&self) -> DiagServerResult<String> {
        let (reply, rx) = mpsc::channel();
        self.send_command(Command::ProtocolName(reply), rx)
    }

    /// Captures a point-in-time session record: vehicle identity, battery
    /// voltage, stored trouble codes and readiness monitors. The returned
    /// record is already ended (immutable).
    pub fn capture_session(&self, id: u32) -> DiagServerResult<DiagnosticSession> {
        let vehicle = VehicleInfo {
            vin: self.read_vin().ok(),
            protocol: self.protocol_name()?,
            battery_voltage: self.read_battery_voltage().unwrap_or(None),
        };
        let mut session = DiagnosticSession::new(id, vehicle);
        session.record_dtcs(self.read_stored_dtcs()?);
        if let Ok(readiness) = self.read_readiness_monitors() {
            session.record_readiness(readiness);
        }
        session.end();
        Ok(session)
    }

    /// Starts streaming the given PIDs round-robin at the configured total
    /// cadence. Samples arrive on the returned receiver; a PID timing out
    /// simply skips its slot. Dropping the receiver ends the stream.
    pub fn read_live_data(
        &self,
        pids: &[DataPid],
    ) -> DiagServerResult<mpsc::Receiver<LiveDataSample>> {
        let (sink, samples) = mpsc::channel();
        let (reply, rx) = mpsc::channel();
        self.send_command(
            Command::StartLiveData {
                pids: pids.to_vec(),
                sink,
                reply,
            },
            rx,
        )?;
        Ok(samples)
    }

    /// Stops an active live-data stream
    pub fn stop_live_data(&self) {
        let _ = self.tx.send(Command::StopLiveData);
    }

    /// Shuts the worker down and closes the channel
    pub fn shutdown(&self) -> DiagServerResult<()> {
        let (reply, rx) = mpsc::channel();
        self.send_command(Command::Shutdown(reply), rx)
    }
}

/// One PID round trip, shared between the one-shot and streaming paths.
/// `Ok(None)` means the ECU had no data for this PID.
fn read_pid_over(
    mut roundtrip: impl FnMut(&[u8]) -> DiagServerResult<Vec<u8>>,
    pid: DataPid,
) -> DiagServerResult<Option<LiveDataSample>> {
    let resp = roundtrip(&[Obd2Service::CurrentData as u8, pid.byte()])?;
    if resp.is_empty() {
        return Ok(None); // NO DATA
    }
    if resp.len() < 2
        || resp[0] != Obd2Service::CurrentData.positive_sid()
        || resp[1] != pid.byte()
    {
        return Err(DiagError::WrongMessage);
    }
    Ok(pid.decode(&resp[2..]).map(|value| LiveDataSample {
        pid,
        value,
        timestamp: SystemTime::now(),
    }))
}

struct StreamState {
    pids: Vec<DataPid>,
    sink: mpsc::Sender<LiveDataSample>,
    next_idx: usize,
    next_poll: Instant,
    interval: Duration,
}

fn worker_loop(
    mut channel: Box<dyn DiagChannel>,
    rx: mpsc::Receiver<Command>,
    status: Arc<AtomicU8>,
    opts: OrchestratorOptions,
) {
    let mut stream: Option<StreamState> = None;

    loop {
        // Block when idle, poll when a stream needs servicing
        let cmd = if stream.is_some() {
            match rx.try_recv() {
                Ok(c) => Some(c),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => break,
            }
        } else {
            match rx.recv() {
                Ok(c) => Some(c),
                Err(_) => break,
            }
        };

        match cmd {
            Some(Command::Initialize(reply)) => {
                let res = channel.initialize();
                status.store(
                    if res.is_ok() {
                        SessionStatus::Ready
                    } else {
                        SessionStatus::Error
                    } as u8,
                    Ordering::Relaxed,
                );
                if let Err(e) = &res {
                    error!("channel initialization failed: {e}");
                }
                let _ = reply.send(res);
            }
            Some(Command::Request {
                addr,
                payload,
                timeout_ms,
                reply,
            }) => {
                let res = channel.request(addr, &payload, timeout_ms);
                if matches!(res, Err(DiagError::NotConnected)) {
                    status.store(SessionStatus::Error as u8, Ordering::Relaxed);
                }
                // A dropped receiver is a cancelled command; nothing to do
                let _ = reply.send(res);
            }
            Some(Command::ReadVoltage(reply)) => {
                let _ = reply.send(channel.read_battery_voltage());
            }
            Some(Command::ProtocolName(reply)) => {
                let _ = reply.send(Ok(channel.protocol_name().to_string()));
            }
            Some(Command::StartLiveData { pids, sink, reply }) => {
                if pids.is_empty() {
                    let _ = reply.send(Err(DiagError::Unsupported));
                } else {
                    let interval =
                        Duration::from_millis(1000 / opts.live_data_cadence_hz.max(1) as u64);
                    stream = Some(StreamState {
                        pids,
                        sink,
                        next_idx: 0,
                        next_poll: Instant::now(),
                        interval,
                    });
                    status.store(SessionStatus::Streaming as u8, Ordering::Relaxed);
                    let _ = reply.send(Ok(()));
                }
            }
            Some(Command::StopLiveData) => {
                stream = None;
                status.store(SessionStatus::Ready as u8, Ordering::Relaxed);
            }
            Some(Command::Shutdown(reply)) => {
                stream = None;
                let res = channel.shutdown();
                status.store(SessionStatus::Closed as u8, Ordering::Relaxed);
                let _ = reply.send(res);
                break;
            }
            None => {}
        }

        // Service the live stream between commands
        let mut stream_done: Option<SessionStatus> = None;
        if let Some(st) = &mut stream {
            let now = Instant::now();
            if now < st.next_poll {
                std::thread::sleep(st.next_poll.saturating_duration_since(now).min(st.interval));
                continue;
            }
            st.next_poll = now + st.interval;
            let pid = st.pids[st.next_idx];
            st.next_idx = (st.next_idx + 1) % st.pids.len();

            let timeout = (st.interval.as_millis() as u32).max(100);
            match read_pid_over(
                |payload| channel.request(BROADCAST_ADDR, payload, timeout),
                pid,
            ) {
                Ok(Some(sample)) => {
                    if st.sink.send(sample).is_err() {
                        debug!("live-data receiver dropped, stopping stream");
                        stream_done = Some(SessionStatus::Ready);
                    }
                }
                // Omitted sample: no data or a slow PID must not halt the
                // round robin
                Ok(None) | Err(DiagError::Timeout) => {
                    warn!("live-data sample for {pid:?} omitted");
                }
                Err(DiagError::NotConnected) => {
                    error!("channel disconnected during live stream");
                    stream_done = Some(SessionStatus::Error);
                }
                Err(e) => {
                    warn!("live-data read for {pid:?} failed: {e}");
                }
            }
        }
        if let Some(next_status) = stream_done {
            stream = None;
            status.store(next_status as u8, Ordering::Relaxed);
        }
    }
    status.store(SessionStatus::Closed as u8, Ordering::Relaxed);
}
