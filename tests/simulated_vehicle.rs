//! End-to-end tests driving the orchestrator and scanner over the ELM327
//! channel against the simulated vehicle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::time::{Duration, Instant};

use vci_diagnostics::DiagError;
use vci_diagnostics::channel::DiagChannel;
use vci_diagnostics::obd2::DataPid;
use vci_diagnostics::obd2::elm327::{Elm327Channel, ElmOptions};
use vci_diagnostics::orchestrator::{DiagnosticOrchestrator, OrchestratorOptions, SessionStatus};
use vci_diagnostics::scanner::{ScanMode, ScanOptions, scan_modules};
use vci_diagnostics::simulator::{Scenario, SimulatedVehicle, VehicleProfile};
use vci_diagnostics::transport::{
    ByteTransport, ConnectionState, StateNotifier, TransportError, TransportResult,
};
use vci_diagnostics::vehicle::ModuleCategory;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_elm_options() -> ElmOptions {
    ElmOptions {
        reset_settle_ms: 10,
        default_timeout_ms: 1000,
        long_timeout_ms: 2000,
        protocol: 0,
    }
}

fn connected_orchestrator(
    profile: VehicleProfile,
    scenario: Scenario,
) -> (DiagnosticOrchestrator, SimulatedVehicle) {
    let sim = SimulatedVehicle::new(profile, scenario);
    let channel = Elm327Channel::new(Box::new(sim.clone()), fast_elm_options());
    let orch = DiagnosticOrchestrator::new(Box::new(channel), OrchestratorOptions::default());
    orch.initialize().expect("initialization must succeed");
    (orch, sim)
}

#[test]
fn initialize_reaches_ready() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    assert_eq!(orch.status(), SessionStatus::Ready);
    orch.shutdown().unwrap();
    assert_eq!(orch.status(), SessionStatus::Closed);
}

#[test]
fn live_pids_decode_to_plausible_values() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);

    let rpm = orch
        .read_pid(DataPid::EngineRpm)
        .unwrap()
        .expect("rpm sample");
    let rpm = rpm.value.as_float().unwrap();
    assert!((0.0..6500.0).contains(&rpm), "rpm {rpm}");

    let coolant = orch
        .read_pid(DataPid::CoolantTemp)
        .unwrap()
        .expect("coolant sample");
    let c = coolant.value.as_float().unwrap();
    assert!((-40.0..150.0).contains(&c), "coolant {c}");

    let volts = orch
        .read_pid(DataPid::ModuleVoltage)
        .unwrap()
        .expect("voltage sample");
    let v = volts.value.as_float().unwrap();
    assert!((10.0..16.0).contains(&v), "battery {v}");
    orch.shutdown().unwrap();
}

#[test]
fn supported_pids_contain_the_closed_set() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let supported = orch.read_supported_pids().unwrap();
    for pid in DataPid::ALL {
        assert!(
            supported.contains(&pid.byte()),
            "PID 0x{:02X} missing from {supported:02X?}",
            pid.byte()
        );
    }
    orch.shutdown().unwrap();
}

#[test]
fn vin_reads_via_multi_frame() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    assert_eq!(orch.read_vin().unwrap(), "1OPENDIAG0TEST123");
    orch.shutdown().unwrap();

    let (orch, _sim) = connected_orchestrator(VehicleProfile::DieselTruck, Scenario::Idle);
    assert_eq!(orch.read_vin().unwrap(), "3DIESELHDT7700042");
    orch.shutdown().unwrap();
}

#[test]
fn dtc_read_and_clear_cycle() {
    init_logging();
    let (orch, _sim) =
        connected_orchestrator(VehicleProfile::StandardCar, Scenario::EngineProblem);

    let stored = orch.read_stored_dtcs().unwrap();
    let codes: Vec<String> = stored.iter().map(|d| d.code()).collect();
    assert_eq!(codes, vec!["P0300", "P0171"]);

    let pending = orch.read_pending_dtcs().unwrap();
    assert_eq!(pending[0].code(), "P0301");

    let readiness = orch.read_readiness_monitors().unwrap();
    assert!(readiness.mil_on);
    assert_eq!(readiness.dtc_count, 2);

    orch.clear_dtcs().unwrap();
    assert!(orch.read_stored_dtcs().unwrap().is_empty());
    assert!(orch.read_pending_dtcs().unwrap().is_empty());
    let readiness = orch.read_readiness_monitors().unwrap();
    assert!(!readiness.mil_on);
    orch.shutdown().unwrap();
}

#[test]
fn readiness_monitor_set_follows_ignition_type() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::DieselTruck, Scenario::Idle);
    let readiness = orch.read_readiness_monitors().unwrap();
    assert!(readiness.compression_ignition);
    assert!(readiness.monitors.iter().any(|m| m.name == "NOx/SCR monitor"));
    orch.shutdown().unwrap();
}

#[test]
fn battery_voltage_via_atrv() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let v = orch.read_battery_voltage().unwrap().expect("voltage");
    assert!((10.0..16.0).contains(&v), "voltage {v}");
    orch.shutdown().unwrap();
}

#[test]
fn live_stream_round_robins_without_halting() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::SportsCar, Scenario::Highway);
    let pids = [DataPid::EngineRpm, DataPid::VehicleSpeed, DataPid::CoolantTemp];
    let stream = orch.read_live_data(&pids).unwrap();
    assert_eq!(orch.status(), SessionStatus::Streaming);

    let mut seen = std::collections::HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.len() < pids.len() && Instant::now() < deadline {
        if let Ok(sample) = stream.recv_timeout(Duration::from_millis(500)) {
            seen.insert(sample.pid);
        }
    }
    assert_eq!(seen.len(), pids.len(), "all PIDs must produce samples");

    orch.stop_live_data();
    orch.shutdown().unwrap();
}

#[test]
fn commands_complete_in_issue_order() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let orch = Arc::new(orch);

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for i in 0..4u32 {
        let orch = orch.clone();
        let tx = tx.clone();
        handles.push(std::thread::spawn(move || {
            let res = orch.read_pid(DataPid::EngineRpm);
            tx.send((i, res.is_ok())).unwrap();
        }));
    }
    drop(tx);
    let results: Vec<(u32, bool)> = rx.iter().collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|(_, ok)| *ok));
    orch.shutdown().unwrap();
}

#[test]
fn quick_scan_finds_powertrain_modules() {
    init_logging();
    let (orch, _sim) =
        connected_orchestrator(VehicleProfile::StandardCar, Scenario::EngineProblem);

    let mut events = 0;
    let mut saw_complete = false;
    let modules = scan_modules(&orch, ScanOptions::default(), |p| {
        events += 1;
        saw_complete |= p.complete;
    })
    .unwrap();

    assert!(saw_complete);
    assert_eq!(events, 17); // 16 probes + completion
    let addrs: Vec<u32> = modules.iter().map(|m| m.address).collect();
    assert!(addrs.contains(&0x7E0));
    assert!(addrs.contains(&0x7E1));

    let engine = modules.iter().find(|m| m.address == 0x7E0).unwrap();
    assert_eq!(engine.category, ModuleCategory::Powertrain);
    assert_eq!(engine.response_address, 0x7E8);
    assert_eq!(engine.identification.software_version.as_deref(), Some("ECM-A42.1.88"));
    assert_eq!(engine.identification.serial_number.as_deref(), Some("SN-ECM-0001942"));
    assert_eq!(engine.identification.part_number.as_deref(), Some("8200 334 417"));
    assert_eq!(engine.dtcs.len(), 2);
    assert_eq!(engine.dtcs[0].code(), "P0300");
    orch.shutdown().unwrap();
}

#[test]
fn full_scan_orders_by_category_then_address() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let opts = ScanOptions {
        mode: ScanMode::Full,
        ..Default::default()
    };
    let modules = scan_modules(&orch, opts, |_| {}).unwrap();

    let addrs: Vec<u32> = modules.iter().map(|m| m.address).collect();
    assert!(addrs.contains(&0x730), "chassis module found");
    assert!(addrs.contains(&0x740), "body module found");
    assert!(addrs.contains(&0x710), "gateway found");

    let indices: Vec<usize> = modules.iter().map(|m| m.category.index()).collect();
    let mut sorted = indices.clone();
    sorted.sort();
    assert_eq!(indices, sorted, "categories must be ordered");

    for w in modules.windows(2) {
        if w[0].category == w[1].category {
            assert!(w[0].address < w[1].address, "addresses ordered inside category");
        }
    }
    orch.shutdown().unwrap();
}

#[test]
fn session_capture_snapshot() {
    init_logging();
    let (orch, _sim) =
        connected_orchestrator(VehicleProfile::StandardCar, Scenario::EngineProblem);
    let session = orch.capture_session(1).unwrap();
    assert!(!session.is_open());
    assert_eq!(session.vehicle.vin.as_deref(), Some("1OPENDIAG0TEST123"));
    assert_eq!(session.vehicle.protocol, "ELM327");
    assert!(session.vehicle.battery_voltage.is_some());
    assert_eq!(session.dtcs.len(), 2);
    assert!(session.readiness.as_ref().is_some_and(|r| r.mil_on));
    orch.shutdown().unwrap();
}

#[cfg(feature = "serde")]
#[test]
fn session_record_serializes() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let session = orch.capture_session(7).unwrap();
    let json = serde_json::to_string(&session).unwrap();
    assert!(json.contains("1OPENDIAG0TEST123"));
    assert!(json.contains("ELM327"));
    orch.shutdown().unwrap();
}

#[test]
fn vehicle_information_pids() {
    init_logging();
    let (orch, _sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    let cals = orch.read_calibration_ids().unwrap();
    assert_eq!(cals, vec!["CAL-OPENDIAG-001"]);
    let cvns = orch.read_cvns().unwrap();
    assert_eq!(cvns, vec!["1BADC0DE"]);
    orch.shutdown().unwrap();
}

#[test]
fn uds_services_over_elm() {
    use vci_diagnostics::uds::diagnostic_session_control::{UdsSessionType, set_session_mode};
    use vci_diagnostics::uds::ecu_reset::{ResetType, ecu_reset};
    use vci_diagnostics::uds::read_dtc_information::get_dtcs_by_status_mask;
    use vci_diagnostics::uds::routine_control;
    use vci_diagnostics::uds::{UdsClient, clear_diagnostic_information};

    init_logging();
    let sim = SimulatedVehicle::new(VehicleProfile::StandardCar, Scenario::EngineProblem);
    let mut channel = Elm327Channel::new(Box::new(sim.clone()), fast_elm_options());
    channel.initialize().unwrap();

    let mut client = UdsClient::new(&mut channel, 0x7E0).with_timeout(1000);
    client.tester_present().unwrap();

    let timings = set_session_mode(&mut client, UdsSessionType::Extended).unwrap();
    let timings = timings.expect("session timings");
    assert_eq!(timings.p2_max_ms, 0x32);
    assert_eq!(timings.p2_star_max_10ms, 0x01F4);

    client.control_dtc_setting(false).unwrap();

    let dtcs = get_dtcs_by_status_mask(&mut client, 0xFF).unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!(dtcs[0].code(), "P0300");
    assert!(dtcs[0].is_confirmed());

    let status = routine_control::start_routine(&mut client, 0x0203, &[]).unwrap();
    assert_eq!(status, vec![0x00]);

    clear_diagnostic_information::clear_diagnostic_information(
        &mut client,
        clear_diagnostic_information::ALL_DTCS,
    )
    .unwrap();
    assert!(get_dtcs_by_status_mask(&mut client, 0xFF).unwrap().is_empty());

    let down_time = ecu_reset(&mut client, ResetType::SoftReset).unwrap();
    assert!(down_time.is_none());
}

/// A transport that never answers, for deadline behavior
#[derive(Debug, Clone)]
struct SilentTransport {
    open: Arc<AtomicBool>,
}

impl SilentTransport {
    fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl ByteTransport for SilentTransport {
    fn open(&mut self) -> TransportResult<()> {
        self.open.store(true, Ordering::Relaxed);
        Ok(())
    }
    fn close(&mut self) -> TransportResult<()> {
        self.open.store(false, Ordering::Relaxed);
        Ok(())
    }
    fn send(&mut self, _data: &[u8], _timeout_ms: u32) -> TransportResult<()> {
        if self.open.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
    fn recv(&mut self, timeout_ms: u32) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if !self.open.load(Ordering::Relaxed) {
                return Err(TransportError::NotOpen);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::ReadTimeout);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
    fn state(&self) -> ConnectionState {
        if self.open.load(Ordering::Relaxed) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
    fn subscribe_state(&mut self) -> mpsc::Receiver<ConnectionState> {
        StateNotifier::new().subscribe()
    }
    fn clear_rx_buffer(&mut self) -> TransportResult<()> {
        Ok(())
    }
}

#[test]
fn silent_transport_times_out_within_tolerance() {
    init_logging();
    let mut transport = SilentTransport::new();
    ByteTransport::open(&mut transport).unwrap();
    let mut channel = Elm327Channel::new(Box::new(transport), fast_elm_options());

    let start = Instant::now();
    let res = channel.request(0x7DF, &[0x01, 0x0C], 300);
    let elapsed = start.elapsed();
    assert!(matches!(res, Err(DiagError::Timeout)), "got {res:?}");
    assert!(
        elapsed >= Duration::from_millis(280) && elapsed <= Duration::from_millis(400),
        "timeout took {elapsed:?}"
    );
}

#[test]
fn dropping_the_link_fails_inflight_request() {
    init_logging();
    let transport = SilentTransport::new();
    let open_flag = transport.open.clone();
    let mut t = transport.clone();
    ByteTransport::open(&mut t).unwrap();
    let mut channel = Elm327Channel::new(Box::new(t), fast_elm_options());

    let killer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        open_flag.store(false, Ordering::Relaxed);
    });

    let res = channel.request(0x7DF, &[0x01, 0x0C], 5000);
    assert!(matches!(res, Err(DiagError::NotConnected)), "got {res:?}");
    killer.join().unwrap();
}

#[test]
fn scenario_switch_changes_reported_state() {
    init_logging();
    let (orch, sim) = connected_orchestrator(VehicleProfile::StandardCar, Scenario::Idle);
    assert!(orch.read_stored_dtcs().unwrap().is_empty());

    sim.set_scenario(Scenario::EngineProblem);
    let dtcs = orch.read_stored_dtcs().unwrap();
    assert_eq!(dtcs.len(), 2);
    orch.shutdown().unwrap();
}
