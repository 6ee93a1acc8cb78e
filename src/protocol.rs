use crate::{
    capability::{CapabilitySet, SettingKind, TargetSettings},
    codec::{FieldFormat, FieldReader, FieldWriter},
    error::{ControlError, FtmsError, Result},
    types::{
        IndoorBikeSimulation, SpinDownControlCode, SpinDownSpeeds, SpinDownStatusCode,
        StopPauseCode,
    },
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// First byte of every control point indication
pub const RESPONSE_CODE: u8 = 0x80;

/// Machine status op code for "control permission lost"
pub const CONTROL_PERMISSION_LOST: u8 = 0xFF;

const SPEED: FieldFormat = FieldFormat::unsigned(2, 100);
const INCLINATION: FieldFormat = FieldFormat::signed(2, 10);
const WIND_SPEED: FieldFormat = FieldFormat::signed(2, 1000);
const GRADE: FieldFormat = FieldFormat::signed(2, 100);
const ROLLING_RESISTANCE: FieldFormat = FieldFormat::unsigned(1, 10_000);
const WIND_RESISTANCE: FieldFormat = FieldFormat::unsigned(1, 100);
const WHEEL_CIRCUMFERENCE: FieldFormat = FieldFormat::unsigned(2, 10);
const CADENCE: FieldFormat = FieldFormat::unsigned(2, 2);

/// Fitness Machine Control Point op codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlOpCode {
    /// Request control of the machine
    RequestControl = 0x00,
    /// Reset the machine
    Reset = 0x01,
    /// Set target speed
    SetTargetSpeed = 0x02,
    /// Set target inclination
    SetTargetInclination = 0x03,
    /// Set target resistance level
    SetTargetResistance = 0x04,
    /// Set target power
    SetTargetPower = 0x05,
    /// Set target heart rate
    SetTargetHeartRate = 0x06,
    /// Start or resume the workout
    StartOrResume = 0x07,
    /// Stop or pause the workout
    StopOrPause = 0x08,
    /// Set targeted expended energy
    SetTargetedEnergy = 0x09,
    /// Set targeted number of steps
    SetTargetedSteps = 0x0A,
    /// Set targeted number of strides
    SetTargetedStrides = 0x0B,
    /// Set targeted distance
    SetTargetedDistance = 0x0C,
    /// Set targeted training time
    SetTargetedTime = 0x0D,
    /// Set targeted time in two heart rate zones
    SetTargetedTimeTwoZones = 0x0E,
    /// Set targeted time in three heart rate zones
    SetTargetedTimeThreeZones = 0x0F,
    /// Set targeted time in five heart rate zones
    SetTargetedTimeFiveZones = 0x10,
    /// Set indoor bike simulation parameters
    SetIndoorBikeSimulation = 0x11,
    /// Set wheel circumference
    SetWheelCircumference = 0x12,
    /// Spin down control
    SpinDownControl = 0x13,
    /// Set targeted cadence
    SetTargetedCadence = 0x14,
}

impl ControlOpCode {
    /// Convert from a wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x03 => Some(Self::SetTargetInclination),
            0x04 => Some(Self::SetTargetResistance),
            0x05 => Some(Self::SetTargetPower),
            0x06 => Some(Self::SetTargetHeartRate),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x09 => Some(Self::SetTargetedEnergy),
            0x0A => Some(Self::SetTargetedSteps),
            0x0B => Some(Self::SetTargetedStrides),
            0x0C => Some(Self::SetTargetedDistance),
            0x0D => Some(Self::SetTargetedTime),
            0x0E => Some(Self::SetTargetedTimeTwoZones),
            0x0F => Some(Self::SetTargetedTimeThreeZones),
            0x10 => Some(Self::SetTargetedTimeFiveZones),
            0x11 => Some(Self::SetIndoorBikeSimulation),
            0x12 => Some(Self::SetWheelCircumference),
            0x13 => Some(Self::SpinDownControl),
            0x14 => Some(Self::SetTargetedCadence),
            _ => None,
        }
    }
}

impl fmt::Display for ControlOpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", *self as u8)
    }
}

/// A typed control point command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// Request control; required before any other command
    RequestControl,
    /// Reset the machine
    Reset,
    /// Target speed in km/h
    SetTargetSpeed(f64),
    /// Target inclination in percent
    SetTargetInclination(f64),
    /// Target resistance level
    SetTargetResistance(f64),
    /// Target power in watts
    SetTargetPower(i16),
    /// Target heart rate in bpm
    SetTargetHeartRate(u8),
    /// Start or resume
    StartOrResume,
    /// Stop or pause
    StopOrPause(StopPauseCode),
    /// Targeted expended energy in kcal
    SetTargetedEnergy(u16),
    /// Targeted number of steps
    SetTargetedSteps(u16),
    /// Targeted number of strides
    SetTargetedStrides(u16),
    /// Targeted distance in meters (24 bit)
    SetTargetedDistance(u32),
    /// Targeted training time in seconds
    SetTargetedTime(u16),
    /// Targeted seconds in the fat burn and fitness zones
    SetTargetedTimeTwoZones([u16; 2]),
    /// Targeted seconds in the light, moderate and hard zones
    SetTargetedTimeThreeZones([u16; 3]),
    /// Targeted seconds in the five heart rate zones
    SetTargetedTimeFiveZones([u16; 5]),
    /// Indoor bike simulation parameters
    SetIndoorBikeSimulation(IndoorBikeSimulation),
    /// Wheel circumference in millimeters
    SetWheelCircumference(f64),
    /// Start or ignore a spin down
    SpinDownControl(SpinDownControlCode),
    /// Targeted cadence in rpm
    SetTargetedCadence(f64),
}

impl ControlRequest {
    /// Op code written as the first byte
    #[must_use]
    pub const fn op_code(&self) -> ControlOpCode {
        use ControlOpCode as Op;
        match self {
            Self::RequestControl => Op::RequestControl,
            Self::Reset => Op::Reset,
            Self::SetTargetSpeed(_) => Op::SetTargetSpeed,
            Self::SetTargetInclination(_) => Op::SetTargetInclination,
            Self::SetTargetResistance(_) => Op::SetTargetResistance,
            Self::SetTargetPower(_) => Op::SetTargetPower,
            Self::SetTargetHeartRate(_) => Op::SetTargetHeartRate,
            Self::StartOrResume => Op::StartOrResume,
            Self::StopOrPause(_) => Op::StopOrPause,
            Self::SetTargetedEnergy(_) => Op::SetTargetedEnergy,
            Self::SetTargetedSteps(_) => Op::SetTargetedSteps,
            Self::SetTargetedStrides(_) => Op::SetTargetedStrides,
            Self::SetTargetedDistance(_) => Op::SetTargetedDistance,
            Self::SetTargetedTime(_) => Op::SetTargetedTime,
            Self::SetTargetedTimeTwoZones(_) => Op::SetTargetedTimeTwoZones,
            Self::SetTargetedTimeThreeZones(_) => Op::SetTargetedTimeThreeZones,
            Self::SetTargetedTimeFiveZones(_) => Op::SetTargetedTimeFiveZones,
            Self::SetIndoorBikeSimulation(_) => Op::SetIndoorBikeSimulation,
            Self::SetWheelCircumference(_) => Op::SetWheelCircumference,
            Self::SpinDownControl(_) => Op::SpinDownControl,
            Self::SetTargetedCadence(_) => Op::SetTargetedCadence,
        }
    }

    /// Target setting bit the machine must advertise for this command
    #[must_use]
    pub const fn required_setting(&self) -> Option<TargetSettings> {
        use TargetSettings as T;
        match self {
            Self::RequestControl | Self::Reset | Self::StartOrResume | Self::StopOrPause(_) => {
                None
            }
            Self::SetTargetSpeed(_) => Some(T::SPEED),
            Self::SetTargetInclination(_) => Some(T::INCLINATION),
            Self::SetTargetResistance(_) => Some(T::RESISTANCE),
            Self::SetTargetPower(_) => Some(T::POWER),
            Self::SetTargetHeartRate(_) => Some(T::HEART_RATE),
            Self::SetTargetedEnergy(_) => Some(T::TARGETED_EXPENDED_ENERGY),
            Self::SetTargetedSteps(_) => Some(T::TARGETED_STEP_NUMBER),
            Self::SetTargetedStrides(_) => Some(T::TARGETED_STRIDE_NUMBER),
            Self::SetTargetedDistance(_) => Some(T::TARGETED_DISTANCE),
            Self::SetTargetedTime(_) => Some(T::TARGETED_TRAINING_TIME),
            Self::SetTargetedTimeTwoZones(_) => Some(T::TARGETED_TIME_TWO_ZONES),
            Self::SetTargetedTimeThreeZones(_) => Some(T::TARGETED_TIME_THREE_ZONES),
            Self::SetTargetedTimeFiveZones(_) => Some(T::TARGETED_TIME_FIVE_ZONES),
            Self::SetIndoorBikeSimulation(_) => Some(T::INDOOR_BIKE_SIMULATION),
            Self::SetWheelCircumference(_) => Some(T::WHEEL_CIRCUMFERENCE),
            Self::SpinDownControl(_) => Some(T::SPIN_DOWN_CONTROL),
            Self::SetTargetedCadence(_) => Some(T::TARGETED_CADENCE),
        }
    }

    /// Setting and value to check against an advertised range
    #[must_use]
    pub fn ranged_value(&self) -> Option<(SettingKind, f64)> {
        match *self {
            Self::SetTargetSpeed(speed) => Some((SettingKind::Speed, speed)),
            Self::SetTargetInclination(inclination) => {
                Some((SettingKind::Inclination, inclination))
            }
            Self::SetTargetResistance(resistance) => Some((SettingKind::Resistance, resistance)),
            Self::SetTargetPower(power) => Some((SettingKind::Power, f64::from(power))),
            Self::SetTargetHeartRate(bpm) => Some((SettingKind::HeartRate, f64::from(bpm))),
            _ => None,
        }
    }

    /// Check the request against what the machine advertises
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotSupported`] if the machine does not advertise the
    /// setting, or [`FtmsError::OutOfRange`] for a value outside its range.
    pub fn validate(&self, capabilities: &CapabilitySet) -> Result<()> {
        if let Some(setting) = self.required_setting() {
            if !capabilities.supports_setting(setting) {
                return Err(FtmsError::NotSupported(format!("{}", self.op_code())));
            }
        }
        if let Some((kind, value)) = self.ranged_value() {
            capabilities.check_value(kind, value)?;
        }
        Ok(())
    }

    /// Encode into a control point write
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] if a parameter does not fit its
    /// wire field.
    pub fn encode(&self) -> Result<Bytes> {
        let mut writer = FieldWriter::new();
        writer.put_u8(self.op_code() as u8);

        match self {
            Self::RequestControl | Self::Reset | Self::StartOrResume => {}
            Self::SetTargetSpeed(speed) => writer.encode_scaled(*speed, SPEED)?,
            Self::SetTargetInclination(value) | Self::SetTargetResistance(value) => {
                writer.encode_scaled(*value, INCLINATION)?;
            }
            Self::SetTargetPower(power) => writer.encode_sint(i32::from(*power), 2)?,
            Self::SetTargetHeartRate(bpm) => writer.put_u8(*bpm),
            Self::StopOrPause(code) => writer.put_u8(*code as u8),
            Self::SetTargetedEnergy(value)
            | Self::SetTargetedSteps(value)
            | Self::SetTargetedStrides(value)
            | Self::SetTargetedTime(value) => writer.encode_uint(u32::from(*value), 2)?,
            Self::SetTargetedDistance(meters) => writer.encode_uint(*meters, 3)?,
            Self::SetTargetedTimeTwoZones(zones) => encode_zones(&mut writer, zones)?,
            Self::SetTargetedTimeThreeZones(zones) => encode_zones(&mut writer, zones)?,
            Self::SetTargetedTimeFiveZones(zones) => encode_zones(&mut writer, zones)?,
            Self::SetIndoorBikeSimulation(simulation) => {
                writer.encode_scaled(simulation.wind_speed, WIND_SPEED)?;
                writer.encode_scaled(simulation.grade, GRADE)?;
                writer.encode_scaled(simulation.rolling_resistance, ROLLING_RESISTANCE)?;
                writer.encode_scaled(simulation.wind_resistance, WIND_RESISTANCE)?;
            }
            Self::SetWheelCircumference(millimeters) => {
                writer.encode_scaled(*millimeters, WHEEL_CIRCUMFERENCE)?;
            }
            Self::SpinDownControl(code) => writer.put_u8(*code as u8),
            Self::SetTargetedCadence(rpm) => writer.encode_scaled(*rpm, CADENCE)?,
        }

        Ok(writer.freeze())
    }
}

fn encode_zones(writer: &mut FieldWriter, zones: &[u16]) -> Result<()> {
    for seconds in zones {
        writer.encode_uint(u32::from(*seconds), 2)?;
    }
    Ok(())
}

/// Result code carried by a control point indication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    /// Success
    Success,
    /// Op code not supported
    NotSupported,
    /// Invalid parameter
    InvalidParameter,
    /// Operation failed
    OperationFailed,
    /// Control not permitted
    ControlNotPermitted,
    /// Reserved result code
    Unknown(u8),
}

impl ResultCode {
    /// Convert from a wire byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Self::Success,
            0x02 => Self::NotSupported,
            0x03 => Self::InvalidParameter,
            0x04 => Self::OperationFailed,
            0x05 => Self::ControlNotPermitted,
            other => Self::Unknown(other),
        }
    }

    /// Map to `Ok` for success, otherwise the matching [`ControlError`]
    ///
    /// # Errors
    ///
    /// Returns the [`ControlError`] for every code other than success.
    pub const fn into_result(self) -> std::result::Result<(), ControlError> {
        match self {
            Self::Success => Ok(()),
            Self::NotSupported => Err(ControlError::NotSupported),
            Self::InvalidParameter => Err(ControlError::InvalidParameter),
            Self::OperationFailed => Err(ControlError::OperationFailed),
            Self::ControlNotPermitted => Err(ControlError::ControlNotPermitted),
            Self::Unknown(code) => Err(ControlError::Unknown(code)),
        }
    }
}

/// Decoded control point indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    /// Echoed request op code
    pub request_op: u8,
    /// Result code
    pub result: ResultCode,
    /// Op-specific response parameters
    pub parameters: Bytes,
}

impl ControlResponse {
    /// Decode a control point indication
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] for indications shorter than three
    /// bytes and [`FtmsError::Protocol`] if the first byte is not the response
    /// code.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data);
        let response_code = reader.decode_u8()?;
        if response_code != RESPONSE_CODE {
            return Err(FtmsError::Protocol(format!(
                "control point indication starts with {response_code:#04x}, expected {RESPONSE_CODE:#04x}"
            )));
        }

        let request_op = reader.decode_u8()?;
        let result = ResultCode::from_u8(reader.decode_u8()?);
        Ok(Self {
            request_op,
            result,
            parameters: Bytes::copy_from_slice(reader.rest()),
        })
    }

    /// Target speeds carried by a successful spin down start
    #[must_use]
    pub fn spin_down_speeds(&self) -> Option<SpinDownSpeeds> {
        if self.request_op != ControlOpCode::SpinDownControl as u8
            || self.result != ResultCode::Success
        {
            return None;
        }
        let mut reader = FieldReader::new(&self.parameters);
        let low = reader.decode_scaled(SPEED).ok()?;
        let high = reader.decode_scaled(SPEED).ok()?;
        Some(SpinDownSpeeds { low, high })
    }
}

/// Unsolicited Fitness Machine Status indication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MachineStatus {
    /// The machine was reset
    Reset,
    /// Stopped or paused by the user
    StoppedOrPausedByUser(StopPauseCode),
    /// Stopped by the safety key
    StoppedBySafetyKey,
    /// Started or resumed by the user
    StartedOrResumedByUser,
    /// Target speed changed, km/h
    TargetSpeedChanged(f64),
    /// Target inclination changed, percent
    TargetInclinationChanged(f64),
    /// Target resistance level changed
    TargetResistanceChanged(f64),
    /// Target power changed, watts
    TargetPowerChanged(i16),
    /// Target heart rate changed, bpm
    TargetHeartRateChanged(u8),
    /// Targeted expended energy changed, kcal
    TargetedEnergyChanged(u16),
    /// Targeted number of steps changed
    TargetedStepsChanged(u16),
    /// Targeted number of strides changed
    TargetedStridesChanged(u16),
    /// Targeted distance changed, meters
    TargetedDistanceChanged(u32),
    /// Targeted training time changed; one entry per heart rate zone
    TargetedTimeChanged(Vec<u16>),
    /// Indoor bike simulation parameters changed
    IndoorBikeSimulationChanged(IndoorBikeSimulation),
    /// Wheel circumference changed, millimeters
    WheelCircumferenceChanged(f64),
    /// Spin down progress
    SpinDownStatus(SpinDownStatusCode),
    /// Targeted cadence changed, rpm
    TargetedCadenceChanged(f64),
    /// Another client took control, or the machine revoked it
    ControlPermissionLost,
    /// Reserved op code, or parameters that could not be interpreted
    Unknown {
        /// Raw op code
        code: u8,
        /// Raw parameters
        parameters: Vec<u8>,
    },
}

impl MachineStatus {
    /// Decode a Fitness Machine Status indication
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::TruncatedBuffer`] if the buffer ends before the op
    /// code or mid-parameter.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(data);
        let code = reader.decode_u8()?;

        let status = match code {
            0x01 => Self::Reset,
            0x02 => match StopPauseCode::from_u8(reader.decode_u8()?) {
                Some(stop_pause) => Self::StoppedOrPausedByUser(stop_pause),
                None => Self::Unknown {
                    code,
                    parameters: data[1..].to_vec(),
                },
            },
            0x03 => Self::StoppedBySafetyKey,
            0x04 => Self::StartedOrResumedByUser,
            0x05 => Self::TargetSpeedChanged(reader.decode_scaled(SPEED)?),
            0x06 => Self::TargetInclinationChanged(reader.decode_scaled(INCLINATION)?),
            0x07 => Self::TargetResistanceChanged(
                reader.decode_scaled(FieldFormat::unsigned(1, 10))?,
            ),
            0x08 => Self::TargetPowerChanged(reader.decode_i16()?),
            0x09 => Self::TargetHeartRateChanged(reader.decode_u8()?),
            0x0A => Self::TargetedEnergyChanged(reader.decode_u16()?),
            0x0B => Self::TargetedStepsChanged(reader.decode_u16()?),
            0x0C => Self::TargetedStridesChanged(reader.decode_u16()?),
            0x0D => Self::TargetedDistanceChanged(reader.decode_uint(3)?),
            0x0E => Self::TargetedTimeChanged(decode_zones(&mut reader, 1)?),
            0x0F => Self::TargetedTimeChanged(decode_zones(&mut reader, 2)?),
            0x10 => Self::TargetedTimeChanged(decode_zones(&mut reader, 3)?),
            0x11 => Self::TargetedTimeChanged(decode_zones(&mut reader, 5)?),
            0x12 => Self::IndoorBikeSimulationChanged(IndoorBikeSimulation {
                wind_speed: reader.decode_scaled(WIND_SPEED)?,
                grade: reader.decode_scaled(GRADE)?,
                rolling_resistance: reader.decode_scaled(ROLLING_RESISTANCE)?,
                wind_resistance: reader.decode_scaled(WIND_RESISTANCE)?,
            }),
            0x13 => Self::WheelCircumferenceChanged(reader.decode_scaled(WHEEL_CIRCUMFERENCE)?),
            0x14 => Self::SpinDownStatus(SpinDownStatusCode::from(reader.decode_u8()?)),
            0x15 => Self::TargetedCadenceChanged(reader.decode_scaled(CADENCE)?),
            CONTROL_PERMISSION_LOST => Self::ControlPermissionLost,
            _ => Self::Unknown {
                code,
                parameters: reader.rest().to_vec(),
            },
        };

        Ok(status)
    }

    /// Whether this status means the client no longer holds control
    #[must_use]
    pub const fn revokes_control(&self) -> bool {
        matches!(self, Self::Reset | Self::ControlPermissionLost)
    }
}

fn decode_zones(reader: &mut FieldReader<'_>, count: usize) -> Result<Vec<u16>> {
    (0..count).map(|_| reader.decode_u16()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn capabilities(settings: TargetSettings, ranges: &[(SettingKind, Vec<u8>)]) -> CapabilitySet {
        let mut feature = 0u32.to_le_bytes().to_vec();
        feature.extend_from_slice(&settings.bits().to_le_bytes());
        let ranges: HashMap<_, _> = ranges.iter().cloned().collect();
        CapabilitySet::build(&feature, &ranges).unwrap()
    }

    #[test]
    fn test_set_target_speed_encoding() {
        let bytes = ControlRequest::SetTargetSpeed(20.0).encode().unwrap();
        assert_eq!(&bytes[..], &[0x02, 0xD0, 0x07]);
    }

    #[test]
    fn test_request_encodings() {
        assert_eq!(&ControlRequest::RequestControl.encode().unwrap()[..], &[0x00]);
        assert_eq!(
            &ControlRequest::StopOrPause(StopPauseCode::Pause)
                .encode()
                .unwrap()[..],
            &[0x08, 0x02]
        );
        assert_eq!(
            &ControlRequest::SetTargetInclination(-1.5).encode().unwrap()[..],
            &[0x03, 0xF1, 0xFF]
        );
        assert_eq!(
            &ControlRequest::SetTargetPower(250).encode().unwrap()[..],
            &[0x05, 0xFA, 0x00]
        );
        assert_eq!(
            &ControlRequest::SetTargetedDistance(100_000)
                .encode()
                .unwrap()[..],
            &[0x0C, 0xA0, 0x86, 0x01]
        );
        assert_eq!(
            &ControlRequest::SetTargetedTimeThreeZones([60, 120, 180])
                .encode()
                .unwrap()[..],
            &[0x0F, 0x3C, 0x00, 0x78, 0x00, 0xB4, 0x00]
        );
        assert_eq!(
            &ControlRequest::SetTargetedCadence(90.5).encode().unwrap()[..],
            &[0x14, 0xB5, 0x00]
        );
    }

    #[test]
    fn test_indoor_bike_simulation_encoding() {
        let request = ControlRequest::SetIndoorBikeSimulation(IndoorBikeSimulation {
            wind_speed: -1.5,
            grade: 4.25,
            rolling_resistance: 0.004,
            wind_resistance: 0.51,
        });
        assert_eq!(
            &request.encode().unwrap()[..],
            &[0x11, 0x24, 0xFA, 0xA9, 0x01, 0x28, 0x33]
        );
    }

    #[test]
    fn test_unencodable_parameter() {
        assert!(matches!(
            ControlRequest::SetTargetedDistance(0x0100_0000).encode(),
            Err(FtmsError::ValueOutOfRange { .. })
        ));
        assert!(ControlRequest::SetTargetSpeed(-1.0).encode().is_err());
    }

    #[test]
    fn test_validate_against_capabilities() {
        // 0.00 .. 20.00 km/h
        let caps = capabilities(
            TargetSettings::SPEED | TargetSettings::SPIN_DOWN_CONTROL,
            &[(SettingKind::Speed, vec![0x00, 0x00, 0xD0, 0x07, 0x01, 0x00])],
        );

        assert!(ControlRequest::SetTargetSpeed(12.5).validate(&caps).is_ok());
        assert!(ControlRequest::RequestControl.validate(&caps).is_ok());
        assert!(ControlRequest::SpinDownControl(SpinDownControlCode::Start)
            .validate(&caps)
            .is_ok());
        assert!(matches!(
            ControlRequest::SetTargetSpeed(25.0).validate(&caps),
            Err(FtmsError::OutOfRange { .. })
        ));
        assert!(matches!(
            ControlRequest::SetTargetPower(100).validate(&caps),
            Err(FtmsError::NotSupported(_))
        ));
        assert!(matches!(
            ControlRequest::SetTargetedSteps(1000).validate(&caps),
            Err(FtmsError::NotSupported(_))
        ));
    }

    #[test]
    fn test_response_decoding() {
        let response = ControlResponse::decode(&[0x80, 0x02, 0x01]).unwrap();
        assert_eq!(response.request_op, 0x02);
        assert_eq!(response.result, ResultCode::Success);
        assert!(response.parameters.is_empty());

        let response = ControlResponse::decode(&[0x80, 0x05, 0x03]).unwrap();
        assert_eq!(
            response.result.into_result(),
            Err(ControlError::InvalidParameter)
        );

        let response = ControlResponse::decode(&[0x80, 0x05, 0x09]).unwrap();
        assert_eq!(response.result, ResultCode::Unknown(0x09));
    }

    #[test]
    fn test_malformed_response() {
        assert!(matches!(
            ControlResponse::decode(&[0x7F, 0x02, 0x01]),
            Err(FtmsError::Protocol(_))
        ));
        assert!(matches!(
            ControlResponse::decode(&[0x80, 0x02]),
            Err(FtmsError::TruncatedBuffer { .. })
        ));
    }

    #[test]
    fn test_spin_down_speeds() {
        let response =
            ControlResponse::decode(&[0x80, 0x13, 0x01, 0xD0, 0x07, 0xA0, 0x0F]).unwrap();
        assert_eq!(
            response.spin_down_speeds(),
            Some(SpinDownSpeeds {
                low: 20.0,
                high: 40.0
            })
        );

        let response = ControlResponse::decode(&[0x80, 0x02, 0x01, 0xD0, 0x07]).unwrap();
        assert_eq!(response.spin_down_speeds(), None);
    }

    #[test]
    fn test_machine_status_decoding() {
        assert_eq!(MachineStatus::decode(&[0x01]).unwrap(), MachineStatus::Reset);
        assert_eq!(
            MachineStatus::decode(&[0x02, 0x02]).unwrap(),
            MachineStatus::StoppedOrPausedByUser(StopPauseCode::Pause)
        );
        assert_eq!(
            MachineStatus::decode(&[0x05, 0xE8, 0x03]).unwrap(),
            MachineStatus::TargetSpeedChanged(10.0)
        );
        assert_eq!(
            MachineStatus::decode(&[0x07, 0x2D]).unwrap(),
            MachineStatus::TargetResistanceChanged(4.5)
        );
        assert_eq!(
            MachineStatus::decode(&[0x0F, 0x3C, 0x00, 0x78, 0x00]).unwrap(),
            MachineStatus::TargetedTimeChanged(vec![60, 120])
        );
        assert_eq!(
            MachineStatus::decode(&[0xFF]).unwrap(),
            MachineStatus::ControlPermissionLost
        );
        assert_eq!(
            MachineStatus::decode(&[0x30, 0xAA]).unwrap(),
            MachineStatus::Unknown {
                code: 0x30,
                parameters: vec![0xAA]
            }
        );
    }

    #[test]
    fn test_machine_status_truncated() {
        assert!(MachineStatus::decode(&[]).is_err());
        assert!(MachineStatus::decode(&[0x05, 0xE8]).is_err());
    }

    #[test]
    fn test_revokes_control() {
        assert!(MachineStatus::ControlPermissionLost.revokes_control());
        assert!(MachineStatus::Reset.revokes_control());
        assert!(!MachineStatus::StartedOrResumedByUser.revokes_control());
    }

    #[test]
    fn test_op_code_from_u8() {
        assert_eq!(
            ControlOpCode::from_u8(0x13),
            Some(ControlOpCode::SpinDownControl)
        );
        assert_eq!(ControlOpCode::from_u8(0x15), None);
    }
}
