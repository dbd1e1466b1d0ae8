//! End-to-end tests for the Autel VCI path: framed J2534 PassThru calls
//! carrying ISO-TP segmented diagnostic payloads, against the simulated
//! vehicle.

use std::time::Duration;

use vci_diagnostics::autel::{AutelVci, VciOptions};
use vci_diagnostics::channel::DiagChannel;
use vci_diagnostics::obd2::DataPid;
use vci_diagnostics::orchestrator::{DiagnosticOrchestrator, OrchestratorOptions};
use vci_diagnostics::scanner::{ScanOptions, scan_modules};
use vci_diagnostics::simulator::{Scenario, SimulatedVehicle, VehicleProfile};
use vci_diagnostics::uds::security_access::{self, XorSeedKey};
use vci_diagnostics::uds::{UdsClient, data_by_identifier};
use vci_diagnostics::{DiagError, obd2};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_vci_options() -> VciOptions {
    VciOptions {
        connect_timeout_ms: 2000,
        request_timeout_ms: 1000,
        read_poll_ms: 10,
        ..VciOptions::default()
    }
}

fn connected_vci(profile: VehicleProfile, scenario: Scenario) -> (AutelVci, SimulatedVehicle) {
    let sim = SimulatedVehicle::new(profile, scenario);
    let mut vci = AutelVci::with_options(Box::new(sim.clone()), fast_vci_options());
    vci.initialize().expect("vci connect sequence must succeed");
    (vci, sim)
}

#[test]
fn connect_sequence_identifies_and_opens_channel() {
    init_logging();
    let (vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    assert!(vci.version().is_some());
    assert_eq!(vci.protocol_name(), "Autel J2534");
}

#[test]
fn tester_present_roundtrip() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let resp = vci.request(0x7E0, &[0x3E, 0x00], 1000).unwrap();
    assert_eq!(resp, vec![0x7E, 0x00]);
    vci.shutdown().unwrap();
}

#[test]
fn obd_pid_over_passthru() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let resp = vci.request(0x7DF, &[0x01, 0x0C], 1000).unwrap();
    assert_eq!(resp[0], 0x41);
    assert_eq!(resp[1], 0x0C);
    let rpm = DataPid::EngineRpm.decode(&resp[2..]).unwrap();
    assert!(rpm.as_float().unwrap() < 6500.0);
    vci.shutdown().unwrap();
}

#[test]
fn vin_multi_frame_over_passthru() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let resp = vci.request(0x7DF, &[0x09, 0x02], 5000).unwrap();
    let vin = obd2::decode_vin(&resp).unwrap();
    assert_eq!(vin, "1OPENDIAG0TEST123");
    vci.shutdown().unwrap();
}

#[test]
fn read_identification_dids() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let mut client = UdsClient::new(&mut vci, 0x7E0).with_timeout(1000);
    let sw = data_by_identifier::read_ident_string(
        &mut client,
        data_by_identifier::did::APPLICATION_SOFTWARE_ID,
    )
    .unwrap();
    assert_eq!(sw, "ECM-A42.1.88");

    let missing = data_by_identifier::read_data_by_identifier(&mut client, 0x1234);
    assert!(matches!(
        missing,
        Err(DiagError::UdsNegative(
            vci_diagnostics::uds::UdsError::RequestOutOfRange
        ))
    ));
}

#[test]
fn security_unlock_and_write_did() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let mut client = UdsClient::new(&mut vci, 0x7E0).with_timeout(1000);

    // Writes are locked before the handshake
    let denied = data_by_identifier::write_data_by_identifier(&mut client, 0xF198, &[0x01]);
    assert!(matches!(denied, Err(DiagError::SecurityDenied)));

    security_access::unlock(&mut client, &XorSeedKey::default(), 3).unwrap();
    data_by_identifier::write_data_by_identifier(&mut client, 0xF198, &[0x01]).unwrap();
}

#[test]
fn wrong_seed_key_algorithm_is_rejected() {
    init_logging();
    let (mut vci, _sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);
    let mut client = UdsClient::new(&mut vci, 0x7E0).with_timeout(1000);
    let res = security_access::unlock(&mut client, &XorSeedKey(0xDEAD_BEEF), 1);
    assert!(matches!(res, Err(DiagError::InvalidKey)), "got {res:?}");
}

#[test]
fn orchestrator_is_transport_agnostic() {
    init_logging();
    // The same orchestrator code that runs over ELM327 runs over the VCI
    let sim = SimulatedVehicle::new(VehicleProfile::SportsCar, Scenario::EngineProblem);
    let vci = AutelVci::with_options(Box::new(sim.clone()), fast_vci_options());
    let orch = DiagnosticOrchestrator::new(Box::new(vci), OrchestratorOptions::default());
    orch.initialize().unwrap();

    assert_eq!(orch.read_vin().unwrap(), "2SPORT99RS0X55511");
    let dtcs = orch.read_stored_dtcs().unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!(dtcs[0].code(), "P0300");

    let v = orch.read_battery_voltage().unwrap().expect("vbatt ioctl");
    assert!((10.0..16.0).contains(&v));
    orch.shutdown().unwrap();
}

#[test]
fn module_scan_over_passthru() {
    init_logging();
    let sim = SimulatedVehicle::new(VehicleProfile::StandardCar, Scenario::Idle);
    let vci = AutelVci::with_options(Box::new(sim.clone()), fast_vci_options());
    let orch = DiagnosticOrchestrator::new(Box::new(vci), OrchestratorOptions::default());
    orch.initialize().unwrap();

    let modules = scan_modules(&orch, ScanOptions::default(), |_| {}).unwrap();
    let addrs: Vec<u32> = modules.iter().map(|m| m.address).collect();
    assert!(addrs.contains(&0x7E0));
    assert!(addrs.contains(&0x7E1));
    orch.shutdown().unwrap();
}

#[test]
fn dropped_link_fails_pending_and_subsequent_requests() {
    init_logging();
    let (mut vci, sim) = connected_vci(VehicleProfile::StandardCar, Scenario::Idle);

    sim.drop_link();
    // Give the reader thread a moment to observe the closed transport
    std::thread::sleep(Duration::from_millis(100));

    let res = vci.request(0x7E0, &[0x3E, 0x00], 500);
    assert!(
        matches!(res, Err(DiagError::NotConnected) | Err(DiagError::TransportIO(_))),
        "got {res:?}"
    );
}
