//! Mode 01 data PIDs (SAE J1979) and their decode formulas.
//!
//! The PID set is closed: these are the parameters a live-data view knows
//! how to plot. Each PID knows its name, display unit, expected data length
//! and the formula mapping raw bytes to an engineering value.

use crate::obd2::ObdValue;

/// One live-data parameter of service mode 01
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum DataPid {
    /// Calculated engine load
    EngineLoad = 0x04,
    /// Engine coolant temperature
    CoolantTemp = 0x05,
    /// Short term fuel trim, bank 1
    ShortFuelTrim1 = 0x06,
    /// Long term fuel trim, bank 1
    LongFuelTrim1 = 0x07,
    /// Intake manifold absolute pressure
    IntakeMap = 0x0B,
    /// Engine speed
    EngineRpm = 0x0C,
    /// Vehicle speed
    VehicleSpeed = 0x0D,
    /// Timing advance before TDC
    TimingAdvance = 0x0E,
    /// Intake air temperature
    IntakeAirTemp = 0x0F,
    /// Mass air flow rate
    MafRate = 0x10,
    /// Throttle position
    ThrottlePosition = 0x11,
    /// Run time since engine start
    RunTime = 0x1F,
    /// Fuel tank level input
    FuelLevel = 0x2F,
    /// Control module voltage
    ModuleVoltage = 0x42,
    /// Ambient air temperature
    AmbientTemp = 0x46,
    /// Engine oil temperature
    OilTemp = 0x5C,
    /// Engine fuel rate
    FuelRate = 0x5E,
}

impl DataPid {
    /// Every PID in the closed set, in PID order
    pub const ALL: [DataPid; 17] = [
        DataPid::EngineLoad,
        DataPid::CoolantTemp,
        DataPid::ShortFuelTrim1,
        DataPid::LongFuelTrim1,
        DataPid::IntakeMap,
        DataPid::EngineRpm,
        DataPid::VehicleSpeed,
        DataPid::TimingAdvance,
        DataPid::IntakeAirTemp,
        DataPid::MafRate,
        DataPid::ThrottlePosition,
        DataPid::RunTime,
        DataPid::FuelLevel,
        DataPid::ModuleVoltage,
        DataPid::AmbientTemp,
        DataPid::OilTemp,
        DataPid::FuelRate,
    ];

    /// Looks a PID up by its wire byte
    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.iter().find(|p| **p as u8 == b).copied()
    }

    /// The PID byte as sent on the wire
    pub fn byte(&self) -> u8 {
        *self as u8
    }

    /// Human readable parameter name
    pub fn name(&self) -> &'static str {
        match self {
            DataPid::EngineLoad => "Calculated engine load",
            DataPid::CoolantTemp => "Engine coolant temperature",
            DataPid::ShortFuelTrim1 => "Short term fuel trim - Bank 1",
            DataPid::LongFuelTrim1 => "Long term fuel trim - Bank 1",
            DataPid::IntakeMap => "Intake manifold absolute pressure",
            DataPid::EngineRpm => "Engine speed",
            DataPid::VehicleSpeed => "Vehicle speed",
            DataPid::TimingAdvance => "Timing advance",
            DataPid::IntakeAirTemp => "Intake air temperature",
            DataPid::MafRate => "Mass air flow rate",
            DataPid::ThrottlePosition => "Throttle position",
            DataPid::RunTime => "Run time since engine start",
            DataPid::FuelLevel => "Fuel tank level",
            DataPid::ModuleVoltage => "Control module voltage",
            DataPid::AmbientTemp => "Ambient air temperature",
            DataPid::OilTemp => "Engine oil temperature",
            DataPid::FuelRate => "Engine fuel rate",
        }
    }

    /// Display unit of the decoded value
    pub fn unit(&self) -> &'static str {
        match self {
            DataPid::EngineLoad
            | DataPid::ShortFuelTrim1
            | DataPid::LongFuelTrim1
            | DataPid::ThrottlePosition
            | DataPid::FuelLevel => "%",
            DataPid::CoolantTemp
            | DataPid::IntakeAirTemp
            | DataPid::AmbientTemp
            | DataPid::OilTemp => "°C",
            DataPid::IntakeMap => "kPa",
            DataPid::EngineRpm => "rpm",
            DataPid::VehicleSpeed => "km/h",
            DataPid::TimingAdvance => "°",
            DataPid::MafRate => "g/s",
            DataPid::RunTime => "s",
            DataPid::ModuleVoltage => "V",
            DataPid::FuelRate => "L/h",
        }
    }

    /// Number of data bytes the formula consumes
    pub fn data_len(&self) -> usize {
        match self {
            DataPid::EngineRpm
            | DataPid::MafRate
            | DataPid::RunTime
            | DataPid::ModuleVoltage
            | DataPid::FuelRate => 2,
            _ => 1,
        }
    }

    /// Applies the decode formula to the data bytes following `mode|0x40`
    /// and the echoed PID. Returns `None` when `data` is too short.
    pub fn decode(&self, data: &[u8]) -> Option<ObdValue> {
        if data.len() < self.data_len() {
            return None;
        }
        let a = data[0] as f32;
        let ab = || ((data[0] as u32) << 8 | data[1] as u32) as f32;
        Some(match self {
            DataPid::EngineLoad | DataPid::ThrottlePosition | DataPid::FuelLevel => {
                ObdValue::Float(a * 100.0 / 255.0)
            }
            DataPid::CoolantTemp
            | DataPid::IntakeAirTemp
            | DataPid::AmbientTemp
            | DataPid::OilTemp => ObdValue::Float(a - 40.0),
            DataPid::ShortFuelTrim1 | DataPid::LongFuelTrim1 => {
                ObdValue::Float((a - 128.0) * 100.0 / 128.0)
            }
            DataPid::IntakeMap => ObdValue::Float(a),
            DataPid::EngineRpm => ObdValue::Float(ab() / 4.0),
            DataPid::VehicleSpeed => ObdValue::Float(a),
            DataPid::TimingAdvance => ObdValue::Float(a / 2.0 - 64.0),
            DataPid::MafRate => ObdValue::Float(ab() / 100.0),
            DataPid::RunTime => ObdValue::Int(ab() as i64),
            DataPid::ModuleVoltage => ObdValue::Float(ab() / 1000.0),
            DataPid::FuelRate => ObdValue::Float(ab() / 20.0),
        })
    }

    /// Inverse of [DataPid::decode]: produces the data bytes an ECU would
    /// send for an engineering value. Values are clamped into the range the
    /// encoding can carry. Used by the simulator and round-trip tests.
    pub fn encode(&self, value: f32) -> Vec<u8> {
        let one = |v: f32| vec![v.clamp(0.0, 255.0).round() as u8];
        let two = |v: f32| {
            let w = v.clamp(0.0, 65535.0).round() as u16;
            vec![(w >> 8) as u8, w as u8]
        };
        match self {
            DataPid::EngineLoad | DataPid::ThrottlePosition | DataPid::FuelLevel => {
                one(value * 255.0 / 100.0)
            }
            DataPid::CoolantTemp
            | DataPid::IntakeAirTemp
            | DataPid::AmbientTemp
            | DataPid::OilTemp => one(value + 40.0),
            DataPid::ShortFuelTrim1 | DataPid::LongFuelTrim1 => {
                one(value * 128.0 / 100.0 + 128.0)
            }
            DataPid::IntakeMap => one(value),
            DataPid::EngineRpm => two(value * 4.0),
            DataPid::VehicleSpeed => one(value),
            DataPid::TimingAdvance => one((value + 64.0) * 2.0),
            DataPid::MafRate => two(value * 100.0),
            DataPid::RunTime => two(value),
            DataPid::ModuleVoltage => two(value * 1000.0),
            DataPid::FuelRate => two(value * 20.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpm_decode() {
        // 0x1A 0xF8 -> (26*256 + 248) / 4 = 1726.0
        let v = DataPid::EngineRpm.decode(&[0x1A, 0xF8]).unwrap();
        assert_eq!(v.as_float(), Some(1726.0));
    }

    #[test]
    fn coolant_decode() {
        let v = DataPid::CoolantTemp.decode(&[0x7B]).unwrap();
        assert_eq!(v.as_float(), Some(83.0));
    }

    #[test]
    fn fuel_trim_symmetry() {
        assert_eq!(
            DataPid::ShortFuelTrim1.decode(&[128]).unwrap().as_float(),
            Some(0.0)
        );
        assert_eq!(
            DataPid::ShortFuelTrim1.decode(&[0]).unwrap().as_float(),
            Some(-100.0)
        );
    }

    #[test]
    fn rpm_encode_decode_round_trip() {
        // Quantization is 1/4 rpm, so whole rpm values survive exactly
        for rpm in 0..16384 {
            let bytes = DataPid::EngineRpm.encode(rpm as f32);
            let back = DataPid::EngineRpm.decode(&bytes).unwrap();
            assert_eq!(back.as_float(), Some(rpm as f32));
        }
    }

    #[test]
    fn decode_rejects_short_data() {
        assert!(DataPid::EngineRpm.decode(&[0x1A]).is_none());
        assert!(DataPid::CoolantTemp.decode(&[]).is_none());
    }

    #[test]
    fn byte_lookup() {
        assert_eq!(DataPid::from_byte(0x0C), Some(DataPid::EngineRpm));
        assert_eq!(DataPid::from_byte(0x5E), Some(DataPid::FuelRate));
        assert_eq!(DataPid::from_byte(0x02), None);
    }
}
