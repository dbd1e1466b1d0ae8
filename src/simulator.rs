//! An in-process simulated vehicle.
//!
//! [SimulatedVehicle] is a [ByteTransport] that answers the same wire
//! surfaces a real VCI does: ELM327 ASCII (AT commands + OBD/UDS hex) and
//! Autel framed J2534 PassThru calls. Inbound bytes are classified exactly
//! the way the real stack classifies them (printable ASCII vs. frame
//! magic), so the layers above cannot tell the difference.
//!
//! The vehicle model interpolates smoothly towards per-scenario targets
//! with bounded random jitter, and a handful of ECUs with identification
//! strings, DTCs and seed/key security hang off the simulated bus.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use rand::Rng;
use strum_macros::{Display, EnumIter, EnumString};

use crate::autel::packet::{self, ParseStatus};
use crate::autel::{self, AutelPacket, sub_command};
use crate::channel::{BROADCAST_ADDR, RESPONSE_ADDR_OFFSET};
use crate::dtc::Dtc;
use crate::isotp::{self, Assembly, IsoTpAssembler};
use crate::obd2::DataPid;
use crate::obd2::elm327::{self, ElmCommand};
use crate::transport::{
    ByteTransport, ConnectionState, StateNotifier, TransportError, TransportResult,
};
use crate::uds::security_access::{SeedKeyAlgorithm, XorSeedKey};

/// Driving scenario selecting the vehicle model's targets
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Scenario {
    /// Ignition on, engine off
    Off,
    /// Warm engine at idle
    Idle,
    /// Stop-and-go city driving
    City,
    /// Steady highway cruise
    Highway,
    /// Hard acceleration and high load
    Aggressive,
    /// Cold engine shortly after start
    ColdStart,
    /// Misfiring engine, MIL on
    EngineProblem,
    /// Cooling system failure
    Overheating,
}

/// Vehicle hardware profile
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum VehicleProfile {
    /// Ordinary petrol passenger car
    StandardCar,
    /// High revving sports car
    SportsCar,
    /// Compression ignition truck
    DieselTruck,
}

impl VehicleProfile {
    /// Warm idle speed
    pub fn idle_rpm(&self) -> f32 {
        match self {
            VehicleProfile::StandardCar => 750.0,
            VehicleProfile::SportsCar => 900.0,
            VehicleProfile::DieselTruck => 600.0,
        }
    }

    /// Rev limiter
    pub fn redline(&self) -> f32 {
        match self {
            VehicleProfile::StandardCar => 6500.0,
            VehicleProfile::SportsCar => 8500.0,
            VehicleProfile::DieselTruck => 3500.0,
        }
    }

    /// Top speed in km/h
    pub fn max_speed(&self) -> f32 {
        match self {
            VehicleProfile::StandardCar => 190.0,
            VehicleProfile::SportsCar => 280.0,
            VehicleProfile::DieselTruck => 120.0,
        }
    }

    /// Normal operating coolant temperature
    pub fn normal_coolant_temp(&self) -> f32 {
        match self {
            VehicleProfile::StandardCar => 90.0,
            VehicleProfile::SportsCar => 95.0,
            VehicleProfile::DieselTruck => 82.0,
        }
    }

    /// Compression ignition flag for the readiness monitor set
    pub fn compression_ignition(&self) -> bool {
        matches!(self, VehicleProfile::DieselTruck)
    }

    /// The VIN the simulated vehicle reports
    pub fn vin(&self) -> &'static str {
        match self {
            VehicleProfile::StandardCar => "1OPENDIAG0TEST123",
            VehicleProfile::SportsCar => "2SPORT99RS0X55511",
            VehicleProfile::DieselTruck => "3DIESELHDT7700042",
        }
    }
}

/// Target operating point of one scenario, before profile scaling
#[derive(Debug, Copy, Clone)]
struct Targets {
    rpm_frac: f32,   // Fraction of the band between idle and redline
    speed_frac: f32, // Fraction of max speed
    coolant: f32,
    throttle: f32,
    engine_on: bool,
}

impl Scenario {
    fn targets(&self, profile: VehicleProfile) -> Targets {
        let normal = profile.normal_coolant_temp();
        match self {
            Scenario::Off => Targets {
                rpm_frac: 0.0,
                speed_frac: 0.0,
                coolant: 20.0,
                throttle: 0.0,
                engine_on: false,
            },
            Scenario::Idle => Targets {
                rpm_frac: 0.0,
                speed_frac: 0.0,
                coolant: normal,
                throttle: 12.0,
                engine_on: true,
            },
            Scenario::City => Targets {
                rpm_frac: 0.25,
                speed_frac: 0.25,
                coolant: normal,
                throttle: 30.0,
                engine_on: true,
            },
            Scenario::Highway => Targets {
                rpm_frac: 0.40,
                speed_frac: 0.60,
                coolant: normal + 3.0,
                throttle: 45.0,
                engine_on: true,
            },
            Scenario::Aggressive => Targets {
                rpm_frac: 0.85,
                speed_frac: 0.85,
                coolant: normal + 8.0,
                throttle: 95.0,
                engine_on: true,
            },
            Scenario::ColdStart => Targets {
                rpm_frac: 0.08,
                speed_frac: 0.0,
                coolant: 15.0,
                throttle: 15.0,
                engine_on: true,
            },
            Scenario::EngineProblem => Targets {
                rpm_frac: 0.05,
                speed_frac: 0.0,
                coolant: normal,
                throttle: 18.0,
                engine_on: true,
            },
            Scenario::Overheating => Targets {
                rpm_frac: 0.30,
                speed_frac: 0.30,
                coolant: 121.0,
                throttle: 35.0,
                engine_on: true,
            },
        }
    }

    fn stored_dtcs(&self) -> Vec<u16> {
        match self {
            Scenario::EngineProblem => vec![0x0300, 0x0171],
            Scenario::Overheating => vec![0x0217, 0x0118],
            _ => vec![],
        }
    }

    fn pending_dtcs(&self) -> Vec<u16> {
        match self {
            Scenario::EngineProblem => vec![0x0301],
            _ => vec![],
        }
    }
}

/// Continuously interpolated engine/vehicle state
#[derive(Debug)]
struct EngineModel {
    profile: VehicleProfile,
    scenario: Scenario,
    rpm: f32,
    speed: f32,
    coolant: f32,
    oil: f32,
    intake_temp: f32,
    ambient: f32,
    maf: f32,
    throttle: f32,
    fuel_level: f32,
    battery: f32,
    short_trim: f32,
    long_trim: f32,
    runtime_s: f32,
    last_step: Instant,
}

impl EngineModel {
    fn new(profile: VehicleProfile, scenario: Scenario) -> Self {
        let ambient = 18.0;
        Self {
            profile,
            scenario,
            rpm: 0.0,
            speed: 0.0,
            coolant: ambient,
            oil: ambient,
            intake_temp: ambient,
            ambient,
            maf: 0.0,
            throttle: 0.0,
            fuel_level: 62.0,
            battery: 12.4,
            short_trim: 0.0,
            long_trim: 1.5,
            runtime_s: 0.0,
            last_step: Instant::now(),
        }
    }

    /// Moves every channel a fraction of the way to its target plus a
    /// little noise. `alpha` per second keeps convergence time-based.
    fn step(&mut self) {
        let dt = self.last_step.elapsed().as_secs_f32().min(2.0);
        self.last_step = Instant::now();
        let t = self.scenario.targets(self.profile);
        let alpha = (dt * 1.5).min(1.0);
        let mut rng = rand::thread_rng();

        let rpm_target = if t.engine_on {
            self.profile.idle_rpm() + t.rpm_frac * (self.profile.redline() - self.profile.idle_rpm())
        } else {
            0.0
        };
        let mut approach = |current: &mut f32, target: f32, jitter: f32| {
            *current += (target - *current) * alpha;
            if jitter > 0.0 && target > 0.0 {
                *current += rng.gen_range(-jitter..=jitter);
            }
        };

        approach(&mut self.rpm, rpm_target, if t.engine_on { 30.0 } else { 0.0 });
        approach(&mut self.speed, t.speed_frac * self.profile.max_speed(), 1.0);
        approach(&mut self.coolant, t.coolant, 0.2);
        approach(&mut self.oil, t.coolant + 8.0, 0.2);
        approach(&mut self.intake_temp, self.ambient + self.throttle * 0.1, 0.3);
        approach(&mut self.throttle, t.throttle, 0.5);
        approach(&mut self.maf, self.rpm * 0.004 * (1.0 + self.throttle / 100.0), 0.2);
        approach(&mut self.battery, if t.engine_on { 14.1 } else { 12.4 }, 0.02);
        // Misfires drive the trims rich
        let trim_target = if self.scenario == Scenario::EngineProblem {
            12.0
        } else {
            0.0
        };
        approach(&mut self.short_trim, trim_target, 0.4);

        if t.engine_on {
            self.runtime_s += dt;
            self.fuel_level = (self.fuel_level - dt * 0.002).max(0.0);
        } else {
            self.runtime_s = 0.0;
            self.rpm = 0.0;
            self.speed = 0.0;
        }
        self.rpm = self.rpm.clamp(0.0, self.profile.redline());
        self.speed = self.speed.clamp(0.0, self.profile.max_speed());
    }

    fn pid_value(&self, pid: DataPid) -> f32 {
        match pid {
            DataPid::EngineLoad => self.throttle * 0.8,
            DataPid::CoolantTemp => self.coolant,
            DataPid::ShortFuelTrim1 => self.short_trim,
            DataPid::LongFuelTrim1 => self.long_trim,
            DataPid::IntakeMap => 30.0 + self.throttle * 0.7,
            DataPid::EngineRpm => self.rpm,
            DataPid::VehicleSpeed => self.speed,
            DataPid::TimingAdvance => 8.0 + self.rpm * 0.002,
            DataPid::IntakeAirTemp => self.intake_temp,
            DataPid::MafRate => self.maf,
            DataPid::ThrottlePosition => self.throttle,
            DataPid::RunTime => self.runtime_s,
            DataPid::FuelLevel => self.fuel_level,
            DataPid::ModuleVoltage => self.battery,
            DataPid::AmbientTemp => self.ambient,
            DataPid::OilTemp => self.oil,
            DataPid::FuelRate => 0.8 + self.maf * 0.25,
        }
    }
}

/// One simulated ECU on the bus
#[derive(Debug)]
struct SimModule {
    software_version: &'static str,
    serial_number: &'static str,
    part_number: &'static str,
    dtcs: Vec<Dtc>,
    pending_seed: Option<Vec<u8>>,
    unlocked: bool,
    failed_attempts: u32,
    session: u8,
}

impl SimModule {
    fn new(sw: &'static str, serial: &'static str, part: &'static str, dtcs: Vec<u16>) -> Self {
        Self {
            software_version: sw,
            serial_number: serial,
            part_number: part,
            dtcs: dtcs
                .into_iter()
                .map(|w| Dtc::from_word(w).with_status(0x08))
                .collect(),
            pending_seed: None,
            unlocked: false,
            failed_attempts: 0,
            session: 0x01,
        }
    }
}

#[derive(Debug)]
struct SimInner {
    notifier: StateNotifier,
    open: bool,
    rx_queue: VecDeque<Vec<u8>>,
    // ELM interpreter state
    echo: bool,
    linefeeds: bool,
    spaces: bool,
    headers: bool,
    elm_header: Option<u32>,
    pending_line: Vec<u8>,
    // Autel PassThru state
    pt_channel: Option<u32>,
    pt_filter: Option<u32>,
    can_rx: VecDeque<(u32, Vec<u8>)>,
    bus_assembler: HashMap<u32, IsoTpAssembler>,
    // Vehicle
    engine: EngineModel,
    modules: HashMap<u32, SimModule>,
    stored: Vec<u16>,
    pending: Vec<u16>,
    mil: bool,
    security: XorSeedKey,
}

impl SimInner {
    fn new(profile: VehicleProfile, scenario: Scenario) -> Self {
        let mut modules = HashMap::new();
        modules.insert(
            0x7E0,
            SimModule::new(
                "ECM-A42.1.88",
                "SN-ECM-0001942",
                "8200 334 417",
                scenario.stored_dtcs(),
            ),
        );
        modules.insert(
            0x7E1,
            SimModule::new("TCM-7.0.3", "SN-TCM-0077120", "8200 112 003", vec![]),
        );
        modules.insert(
            0x730,
            SimModule::new("ABS-2.4.0", "SN-ABS-0009315", "4760 220 818", vec![0x4123]),
        );
        modules.insert(
            0x740,
            SimModule::new("BCM-11.5.2", "SN-BCM-0102277", "9810 554 101", vec![0x8100]),
        );
        modules.insert(
            0x710,
            SimModule::new("GW-3.3.1", "SN-GW-0000071", "5WK5 010 330", vec![]),
        );

        Self {
            notifier: StateNotifier::new(),
            open: false,
            rx_queue: VecDeque::new(),
            echo: true,
            linefeeds: true,
            spaces: true,
            headers: false,
            elm_header: None,
            pending_line: Vec::new(),
            pt_channel: None,
            pt_filter: None,
            can_rx: VecDeque::new(),
            bus_assembler: HashMap::new(),
            engine: EngineModel::new(profile, scenario),
            stored: scenario.stored_dtcs(),
            pending: scenario.pending_dtcs(),
            mil: !scenario.stored_dtcs().is_empty(),
            modules,
            security: XorSeedKey::default(),
        }
    }

    fn set_scenario(&mut self, scenario: Scenario) {
        self.engine.scenario = scenario;
        self.stored = scenario.stored_dtcs();
        self.pending = scenario.pending_dtcs();
        self.mil = !self.stored.is_empty();
        if let Some(engine) = self.modules.get_mut(&0x7E0) {
            engine.dtcs = scenario
                .stored_dtcs()
                .into_iter()
                .map(|w| Dtc::from_word(w).with_status(0x08))
                .collect();
        }
    }

    // ---- shared diagnostic service model -------------------------------

    /// Answers one service request the way the addressed ECU would.
    /// `None` means silence on the bus (NO DATA).
    fn service_request(&mut self, addr: u32, req: &[u8]) -> Option<Vec<u8>> {
        self.engine.step();
        let sid = *req.first()?;
        match sid {
            0x01 | 0x03 | 0x04 | 0x07 | 0x09 => {
                // OBD2 is answered by the engine controller only
                if addr == BROADCAST_ADDR || addr == 0x7E0 {
                    self.obd_request(req)
                } else {
                    None
                }
            }
            _ => {
                let target = if addr == BROADCAST_ADDR { 0x7E0 } else { addr };
                if self.modules.contains_key(&target) {
                    Some(self.uds_request(target, req))
                } else {
                    None
                }
            }
        }
    }

    fn obd_request(&mut self, req: &[u8]) -> Option<Vec<u8>> {
        let mode = req[0];
        match (mode, req.get(1).copied()) {
            (0x01, Some(0x00)) | (0x01, Some(0x20)) | (0x01, Some(0x40)) | (0x01, Some(0x60)) => {
                let base = req[1];
                let mut bitmap = [0u8; 4];
                for pid in DataPid::ALL {
                    let p = pid.byte();
                    if p > base && p <= base + 0x20 {
                        let bit = (p - base - 1) as usize;
                        bitmap[bit / 8] |= 0x80 >> (bit % 8);
                    }
                }
                if base == 0x00 {
                    bitmap[0] |= 0x80; // PID 01, monitor status
                }
                // Continuation flag: the next supported-PID PID
                if DataPid::ALL.iter().any(|p| p.byte() > base + 0x20) {
                    bitmap[3] |= 0x01;
                }
                let mut resp = vec![0x41, base];
                resp.extend_from_slice(&bitmap);
                Some(resp)
            }
            (0x01, Some(0x01)) => {
                let problem = matches!(
                    self.engine.scenario,
                    Scenario::EngineProblem | Scenario::Overheating
                );
                let a = (self.stored.len() as u8 & 0x7F) | if self.mil { 0x80 } else { 0x00 };
                let b = 0x07
                    | if self.engine.profile.compression_ignition() {
                        0x08
                    } else {
                        0x00
                    }
                    | if problem { 0x10 } else { 0x00 };
                let c = 0xE1; // Equipped non-continuous monitors
                let d = if problem { 0x21 } else { 0x00 };
                Some(vec![0x41, 0x01, a, b, c, d])
            }
            (0x01, Some(p)) => {
                let pid = DataPid::from_byte(p)?;
                let mut resp = vec![0x41, p];
                resp.extend(pid.encode(self.engine.pid_value(pid)));
                Some(resp)
            }
            (0x03, None) => Some(Self::dtc_mode_response(0x43, &self.stored)),
            (0x07, None) => Some(Self::dtc_mode_response(0x47, &self.pending)),
            (0x04, None) => {
                self.stored.clear();
                self.pending.clear();
                self.mil = false;
                if let Some(engine) = self.modules.get_mut(&0x7E0) {
                    engine.dtcs.clear();
                }
                Some(vec![0x44])
            }
            (0x09, Some(0x00)) => Some(vec![0x49, 0x00, 0x54, 0x00, 0x00, 0x00]),
            (0x09, Some(0x02)) => {
                let mut resp = vec![0x49, 0x02, 0x01];
                resp.extend_from_slice(self.engine.profile.vin().as_bytes());
                Some(resp)
            }
            (0x09, Some(0x04)) => {
                let mut resp = vec![0x49, 0x04, 0x01];
                resp.extend_from_slice(b"CAL-OPENDIAG-001");
                Some(resp)
            }
            (0x09, Some(0x06)) => Some(vec![0x49, 0x06, 0x01, 0x1B, 0xAD, 0xC0, 0xDE]),
            _ => None,
        }
    }

    fn dtc_mode_response(positive_sid: u8, words: &[u16]) -> Vec<u8> {
        let mut resp = vec![positive_sid, words.len() as u8];
        for w in words {
            resp.extend_from_slice(&w.to_be_bytes());
        }
        resp
    }

    fn uds_request(&mut self, addr: u32, req: &[u8]) -> Vec<u8> {
        let negative = |sid: u8, nrc: u8| vec![0x7F, sid, nrc];
        let sid = req[0];
        let security = self.security;
        let Some(module) = self.modules.get_mut(&addr) else {
            return negative(sid, 0x11);
        };
        match sid {
            0x3E => vec![0x7E, 0x00],
            0x10 => match req.get(1) {
                Some(mode @ 0x01..=0x04) => {
                    module.session = *mode;
                    // P2 = 50ms, P2* = 5s
                    vec![0x50, *mode, 0x00, 0x32, 0x01, 0xF4]
                }
                Some(_) => negative(sid, 0x12),
                None => negative(sid, 0x13),
            },
            0x11 => match req.get(1) {
                Some(mode @ 0x01..=0x03) => {
                    module.session = 0x01;
                    module.unlocked = false;
                    vec![0x51, *mode]
                }
                _ => negative(sid, 0x12),
            },
            0x22 => {
                let Some(did) = req.get(1..3) else {
                    return negative(sid, 0x13);
                };
                let did = u16::from_be_bytes([did[0], did[1]]);
                let value: Option<Vec<u8>> = match did {
                    0xF194 => Some(module.software_version.as_bytes().to_vec()),
                    0xF18C => Some(module.serial_number.as_bytes().to_vec()),
                    0xF187 => Some(module.part_number.as_bytes().to_vec()),
                    0xF186 => Some(vec![module.session]),
                    0xF190 if addr == 0x7E0 => {
                        Some(self.engine.profile.vin().as_bytes().to_vec())
                    }
                    _ => None,
                };
                match value {
                    Some(v) => {
                        let mut resp = vec![0x62];
                        resp.extend_from_slice(&did.to_be_bytes());
                        resp.extend_from_slice(&v);
                        resp
                    }
                    None => negative(sid, 0x31),
                }
            }
            0x27 => match req.get(1) {
                Some(0x01) => {
                    if module.unlocked {
                        return vec![0x67, 0x01, 0x00, 0x00, 0x00, 0x00];
                    }
                    if module.failed_attempts >= 3 {
                        return negative(sid, 0x36);
                    }
                    let seed: [u8; 4] = rand::thread_rng().r#gen();
                    module.pending_seed = Some(seed.to_vec());
                    let mut resp = vec![0x67, 0x01];
                    resp.extend_from_slice(&seed);
                    resp
                }
                Some(0x02) => match module.pending_seed.take() {
                    Some(seed) => {
                        if req.get(2..) == Some(security.compute_key(&seed).as_slice()) {
                            module.unlocked = true;
                            module.failed_attempts = 0;
                            vec![0x67, 0x02]
                        } else {
                            module.failed_attempts += 1;
                            negative(sid, 0x35)
                        }
                    }
                    None => negative(sid, 0x24),
                },
                _ => negative(sid, 0x12),
            },
            0x19 => match req.get(1) {
                Some(0x01) => {
                    let count = module.dtcs.len() as u16;
                    let mut resp = vec![0x59, 0x01, 0xFF, 0x01];
                    resp.extend_from_slice(&count.to_be_bytes());
                    resp
                }
                Some(0x02) => {
                    let mut resp = vec![0x59, 0x02, 0xFF];
                    for dtc in &module.dtcs {
                        resp.extend_from_slice(&dtc.to_word().to_be_bytes());
                        resp.push(0x00);
                        resp.push(dtc.status.bits());
                    }
                    resp
                }
                _ => negative(sid, 0x12),
            },
            0x14 => {
                module.dtcs.clear();
                vec![0x54]
            }
            0x2E => {
                if !module.unlocked {
                    negative(sid, 0x33)
                } else if req.len() < 4 {
                    negative(sid, 0x13)
                } else {
                    vec![0x6E, req[1], req[2]]
                }
            }
            0x31 => match req.get(1..4) {
                Some(args) => vec![0x71, args[0], args[1], args[2], 0x00],
                None => negative(sid, 0x13),
            },
            0x85 => match req.get(1) {
                Some(sub @ (0x01 | 0x02)) => vec![0xC5, *sub],
                _ => negative(sid, 0x12),
            },
            _ => negative(sid, 0x11),
        }
    }

    // ---- ELM327 surface ------------------------------------------------

    fn elm_handle_line(&mut self, line: &str) {
        let mut out = String::new();
        if self.echo {
            out.push_str(line);
            out.push('\r');
        }
        let body = match ElmCommand::parse(line) {
            Some(cmd) => self.elm_execute(cmd),
            None => "?".to_string(),
        };
        out.push_str(&body);
        out.push_str(if self.linefeeds { "\r\n>" } else { "\r>" });
        self.rx_queue.push_back(out.into_bytes());
    }

    fn elm_execute(&mut self, cmd: ElmCommand) -> String {
        match cmd {
            ElmCommand::Reset => {
                self.echo = true;
                self.linefeeds = true;
                self.spaces = true;
                self.headers = false;
                self.elm_header = None;
                "ELM327 v1.5".to_string()
            }
            ElmCommand::Echo(on) => {
                self.echo = on;
                "OK".to_string()
            }
            ElmCommand::Linefeeds(on) => {
                self.linefeeds = on;
                "OK".to_string()
            }
            ElmCommand::Spaces(on) => {
                self.spaces = on;
                "OK".to_string()
            }
            ElmCommand::Headers(on) => {
                self.headers = on;
                "OK".to_string()
            }
            ElmCommand::SetProtocol(_) | ElmCommand::SetTimeout(_) | ElmCommand::AdaptiveTiming(_) => {
                "OK".to_string()
            }
            ElmCommand::SetHeader(h) => {
                self.elm_header = Some(h);
                "OK".to_string()
            }
            ElmCommand::Info => "ELM327 v1.5".to_string(),
            ElmCommand::ReadVoltage => {
                self.engine.step();
                format!("{:.1}V", self.engine.battery)
            }
            ElmCommand::DescribeProtocol => "AUTO, ISO 15765-4 (CAN 11/500)".to_string(),
            ElmCommand::DescribeProtocolNumber => "A6".to_string(),
            ElmCommand::Payload(req) => {
                let addr = self.elm_header.unwrap_or(BROADCAST_ADDR);
                let responder =
                    if addr == BROADCAST_ADDR { 0x7E0 } else { addr } + RESPONSE_ADDR_OFFSET;
                match self.service_request(addr, &req) {
                    Some(resp) => self.elm_format_response(responder, &resp),
                    None => "NO DATA".to_string(),
                }
            }
        }
    }

    /// Single-frame payloads print bare; longer ones print as raw ISO-TP
    /// frames, one per line, the way clone interpreters hand them up.
    /// With `ATH1` each line is prefixed with the responder's CAN id.
    fn elm_format_response(&self, responder: u32, payload: &[u8]) -> String {
        let prefix = if self.headers {
            format!("{responder:03X}{}", if self.spaces { " " } else { "" })
        } else {
            String::new()
        };
        if payload.len() <= isotp::SINGLE_FRAME_CAPACITY {
            return format!("{prefix}{}", elm327::bytes_to_hex(payload, self.spaces));
        }
        isotp::segment(payload)
            .iter()
            .map(|f| format!("{prefix}{}", elm327::bytes_to_hex(f, self.spaces)))
            .collect::<Vec<_>>()
            .join("\r")
    }

    // ---- Autel framed surface ------------------------------------------

    fn autel_handle_packet(&mut self, pkt: &AutelPacket) {
        let (status, payload) = self.autel_execute(pkt);
        // Response path: leading 00, status in the command word
        let mut frame = vec![0x00];
        frame.extend(packet::encode_frame(
            pkt.session_id,
            pkt.message_counter,
            status,
            pkt.sub_command,
            &payload,
        ));
        self.rx_queue.push_back(frame);
    }

    /// J2534 ERR_INVALID_CHANNEL_ID, returned for data calls before open
    const ERR_INVALID_CHANNEL: u32 = 0x02;

    fn autel_execute(&mut self, pkt: &AutelPacket) -> (u32, Vec<u8>) {
        let ok = autel::STATUS_SUCCESS;
        match pkt.sub_command {
            sub_command::IDENTIFY => {
                (ok, packet::pad_device_string(autel::IDENTIFY_VENDOR_STRING))
            }
            sub_command::GET_VERSION => (ok, packet::pad_device_string("V2.41.19;FW1.10.03")),
            sub_command::DISCONNECT => {
                self.pt_channel = None;
                (ok, vec![0u8; 4])
            }
            sub_command::PT_OPEN => {
                self.pt_channel = Some(1);
                (ok, 1u32.to_le_bytes().to_vec())
            }
            sub_command::PT_CLOSE => {
                self.pt_channel = None;
                (ok, Vec::new())
            }
            sub_command::PT_CONNECT => (ok, Vec::new()),
            sub_command::PT_START_MSG_FILTER => {
                self.pt_filter = Some(1);
                (ok, 1u32.to_le_bytes().to_vec())
            }
            sub_command::PT_STOP_MSG_FILTER => {
                self.pt_filter = None;
                (ok, Vec::new())
            }
            sub_command::PT_IOCTL => {
                // READ_VBATT is the only ioctl the model answers
                self.engine.step();
                let mv = (self.engine.battery * 1000.0) as u32;
                (ok, mv.to_le_bytes().to_vec())
            }
            sub_command::PT_WRITE_MSGS => {
                if self.pt_channel.is_none() {
                    return (Self::ERR_INVALID_CHANNEL, Vec::new());
                }
                if let Some(data) = pkt
                    .payload_u32(12)
                    .and_then(|len| pkt.payload.get(16..16 + len as usize))
                {
                    let frame = data.to_vec();
                    self.bus_write(&frame);
                }
                (ok, Vec::new())
            }
            sub_command::PT_READ_MSGS => {
                if self.pt_channel.is_none() {
                    return (Self::ERR_INVALID_CHANNEL, Vec::new());
                }
                let max = pkt.payload_u32(4).unwrap_or(1) as usize;
                let mut out = Vec::new();
                let mut count = 0u32;
                let mut body = Vec::new();
                while count < max as u32 {
                    let Some((id, frame)) = self.can_rx.pop_front() else {
                        break;
                    };
                    let mut msg = id.to_be_bytes().to_vec();
                    msg.extend_from_slice(&frame);
                    body.extend_from_slice(&(msg.len() as u32).to_le_bytes());
                    body.extend_from_slice(&msg);
                    count += 1;
                }
                out.extend_from_slice(&count.to_le_bytes());
                out.extend_from_slice(&body);
                (ok, out)
            }
            other => {
                log::warn!("simulator: unknown autel sub_command 0x{other:X}");
                (ok, Vec::new())
            }
        }
    }

    /// One CAN frame written by the tester: run it through the per-address
    /// ISO-TP assembler and answer completed requests
    fn bus_write(&mut self, data: &[u8]) {
        if data.len() < 5 {
            return;
        }
        let addr = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let frame = &data[4..];

        let assembler = self.bus_assembler.entry(addr).or_default();
        match assembler.push_frame(frame) {
            Assembly::Complete(request) => {
                let responder = if addr == BROADCAST_ADDR { 0x7E0 } else { addr };
                if let Some(resp) = self.service_request(addr, &request) {
                    let resp_addr = responder + RESPONSE_ADDR_OFFSET;
                    for f in isotp::segment(&resp) {
                        let mut padded = f;
                        padded.resize(8, 0x00);
                        self.can_rx.push_back((resp_addr, padded));
                    }
                }
            }
            Assembly::SendFlowControl => {
                // ECU releases the tester's consecutive frames immediately
                let responder = if addr == BROADCAST_ADDR { 0x7E0 } else { addr };
                let mut fc = isotp::CLEAR_TO_SEND.to_vec();
                fc.resize(8, 0x00);
                self.can_rx
                    .push_back((responder + RESPONSE_ADDR_OFFSET, fc));
            }
            Assembly::Pending => {}
        }
    }

    // ---- byte entry point ----------------------------------------------

    fn handle_bytes(&mut self, data: &[u8]) {
        if elm327::is_ascii_text(data) {
            self.pending_line.extend_from_slice(data);
            while let Some(pos) = self.pending_line.iter().position(|b| *b == b'\r') {
                let line: Vec<u8> = self.pending_line.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
                if !text.trim().is_empty() {
                    self.elm_handle_line(text.trim());
                }
            }
            return;
        }

        let mut buf = data.to_vec();
        loop {
            match packet::parse_frame(&buf) {
                ParseStatus::Frame { packet, consumed } => {
                    buf.drain(..consumed);
                    self.autel_handle_packet(&packet);
                }
                ParseStatus::NeedMoreBytes { .. } => break,
                ParseStatus::Bad { consumed, .. } => {
                    buf.drain(..consumed.max(1));
                }
            }
            if buf.is_empty() {
                break;
            }
        }
    }
}

/// The simulated vehicle transport. Cloning shares the underlying vehicle,
/// so a test can keep a handle for scenario control while the diagnostic
/// stack owns the boxed transport.
#[derive(Debug, Clone)]
pub struct SimulatedVehicle {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedVehicle {
    /// Creates a vehicle with the given profile and starting scenario
    pub fn new(profile: VehicleProfile, scenario: Scenario) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner::new(profile, scenario))),
        }
    }

    /// Switches the driving scenario (DTCs and targets follow)
    pub fn set_scenario(&self, scenario: Scenario) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.set_scenario(scenario);
        }
    }

    /// Simulates the peer dropping the link: pending and subsequent
    /// operations fail until [ByteTransport::open] is called again
    pub fn drop_link(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.open = false;
            inner.rx_queue.clear();
            inner.notifier.transition(ConnectionState::Disconnected);
        }
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, SimInner>, TransportError> {
        self.inner
            .lock()
            .map_err(|_| TransportError::Other("simulator poisoned".into()))
    }
}

impl ByteTransport for SimulatedVehicle {
    fn open(&mut self) -> TransportResult<()> {
        let mut inner = self.locked()?;
        inner.notifier.transition(ConnectionState::Connecting);
        inner.open = true;
        inner.notifier.transition(ConnectionState::Connected);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        let mut inner = self.locked()?;
        inner.open = false;
        inner.rx_queue.clear();
        inner.notifier.transition(ConnectionState::Disconnected);
        Ok(())
    }

    fn send(&mut self, data: &[u8], _timeout_ms: u32) -> TransportResult<()> {
        let mut inner = self.locked()?;
        if !inner.open {
            return Err(TransportError::NotOpen);
        }
        inner.handle_bytes(data);
        Ok(())
    }

    fn recv(&mut self, timeout_ms: u32) -> TransportResult<Vec<u8>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            {
                let mut inner = self.locked()?;
                if !inner.open {
                    return Err(TransportError::NotOpen);
                }
                if let Some(chunk) = inner.rx_queue.pop_front() {
                    return Ok(chunk);
                }
            }
            if timeout_ms == 0 {
                return Err(TransportError::BufferEmpty);
            }
            if Instant::now() >= deadline {
                return Err(TransportError::ReadTimeout);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn state(&self) -> ConnectionState {
        self.inner
            .lock()
            .map(|i| i.notifier.state())
            .unwrap_or(ConnectionState::Error)
    }

    fn subscribe_state(&mut self) -> mpsc::Receiver<ConnectionState> {
        match self.inner.lock() {
            Ok(mut i) => i.notifier.subscribe(),
            Err(_) => mpsc::channel().1,
        }
    }

    fn clear_rx_buffer(&mut self) -> TransportResult<()> {
        self.locked()?.rx_queue.clear();
        Ok(())
    }
}
