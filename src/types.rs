use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

use crate::{
    CROSS_TRAINER_DATA_UUID, INDOOR_BIKE_DATA_UUID, ROWER_DATA_UUID, TREADMILL_DATA_UUID,
};

/// Fitness machine class, one per FTMS data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineType {
    /// Treadmill Data (0x2ACD)
    Treadmill,
    /// Cross Trainer Data (0x2ACE)
    CrossTrainer,
    /// Rower Data (0x2AD1)
    Rower,
    /// Indoor Bike Data (0x2AD2)
    IndoorBike,
}

impl MachineType {
    /// Standard data characteristic for this class
    #[must_use]
    pub const fn data_characteristic(self) -> Uuid {
        match self {
            Self::Treadmill => TREADMILL_DATA_UUID,
            Self::CrossTrainer => CROSS_TRAINER_DATA_UUID,
            Self::Rower => ROWER_DATA_UUID,
            Self::IndoorBike => INDOOR_BIKE_DATA_UUID,
        }
    }

    /// Look up the class served by a standard data characteristic
    #[must_use]
    pub fn from_data_characteristic(uuid: Uuid) -> Option<Self> {
        [
            Self::Treadmill,
            Self::CrossTrainer,
            Self::Rower,
            Self::IndoorBike,
        ]
        .into_iter()
        .find(|machine| machine.data_characteristic() == uuid)
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Treadmill => write!(f, "Treadmill"),
            Self::CrossTrainer => write!(f, "Cross Trainer"),
            Self::Rower => write!(f, "Rower"),
            Self::IndoorBike => write!(f, "Indoor Bike"),
        }
    }
}

/// Cross trainer movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementDirection {
    /// Moving forward
    Forward,
    /// Moving backward
    Backward,
}

impl fmt::Display for MovementDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
        }
    }
}

/// Training status reported by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingStatusCode {
    /// Other
    Other,
    /// Idle
    Idle,
    /// Warming up
    WarmingUp,
    /// Low intensity interval
    LowIntensityInterval,
    /// High intensity interval
    HighIntensityInterval,
    /// Recovery interval
    RecoveryInterval,
    /// Isometric
    Isometric,
    /// Heart rate control
    HeartRateControl,
    /// Fitness test
    FitnessTest,
    /// Speed below the control region
    SpeedOutsideControlRegionLow,
    /// Speed above the control region
    SpeedOutsideControlRegionHigh,
    /// Cool down
    CoolDown,
    /// Watt control
    WattControl,
    /// Manual mode (quick start)
    ManualMode,
    /// Pre-workout
    PreWorkout,
    /// Post-workout
    PostWorkout,
    /// Reserved code
    Unknown(u8),
}

impl From<u8> for TrainingStatusCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Other,
            0x01 => Self::Idle,
            0x02 => Self::WarmingUp,
            0x03 => Self::LowIntensityInterval,
            0x04 => Self::HighIntensityInterval,
            0x05 => Self::RecoveryInterval,
            0x06 => Self::Isometric,
            0x07 => Self::HeartRateControl,
            0x08 => Self::FitnessTest,
            0x09 => Self::SpeedOutsideControlRegionLow,
            0x0A => Self::SpeedOutsideControlRegionHigh,
            0x0B => Self::CoolDown,
            0x0C => Self::WattControl,
            0x0D => Self::ManualMode,
            0x0E => Self::PreWorkout,
            0x0F => Self::PostWorkout,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for TrainingStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other => write!(f, "Other"),
            Self::Idle => write!(f, "Idle"),
            Self::WarmingUp => write!(f, "Warming Up"),
            Self::LowIntensityInterval => write!(f, "Low Intensity Interval"),
            Self::HighIntensityInterval => write!(f, "High Intensity Interval"),
            Self::RecoveryInterval => write!(f, "Recovery Interval"),
            Self::Isometric => write!(f, "Isometric"),
            Self::HeartRateControl => write!(f, "Heart Rate Control"),
            Self::FitnessTest => write!(f, "Fitness Test"),
            Self::SpeedOutsideControlRegionLow => write!(f, "Speed Too Low"),
            Self::SpeedOutsideControlRegionHigh => write!(f, "Speed Too High"),
            Self::CoolDown => write!(f, "Cool Down"),
            Self::WattControl => write!(f, "Watt Control"),
            Self::ManualMode => write!(f, "Manual Mode"),
            Self::PreWorkout => write!(f, "Pre-Workout"),
            Self::PostWorkout => write!(f, "Post-Workout"),
            Self::Unknown(code) => write!(f, "Unknown ({code:#04x})"),
        }
    }
}

/// Parameter of the Stop or Pause command and status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopPauseCode {
    /// Stop the workout
    Stop = 0x01,
    /// Pause the workout
    Pause = 0x02,
}

impl StopPauseCode {
    /// Parse a wire value
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Stop),
            0x02 => Some(Self::Pause),
            _ => None,
        }
    }
}

/// Parameter of the Spin Down Control command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpinDownControlCode {
    /// Start the spin down procedure
    Start = 0x01,
    /// Ignore a spin down request from the machine
    Ignore = 0x02,
}

/// Spin down progress reported through machine status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpinDownStatusCode {
    /// The machine asks for a spin down
    Requested,
    /// Spin down completed
    Success,
    /// Spin down failed
    Error,
    /// The user should stop pedaling
    StopPedaling,
    /// Reserved code
    Unknown(u8),
}

impl From<u8> for SpinDownStatusCode {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Self::Requested,
            0x02 => Self::Success,
            0x03 => Self::Error,
            0x04 => Self::StopPedaling,
            other => Self::Unknown(other),
        }
    }
}

/// Indoor bike simulation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndoorBikeSimulation {
    /// Wind speed in m/s, resolution 0.001
    pub wind_speed: f64,
    /// Grade in percent, resolution 0.01
    pub grade: f64,
    /// Coefficient of rolling resistance, resolution 0.0001
    pub rolling_resistance: f64,
    /// Wind resistance coefficient in kg/m, resolution 0.01
    pub wind_resistance: f64,
}

/// Target speeds returned by a successful spin down start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpinDownSpeeds {
    /// Lower target speed in km/h
    pub low: f64,
    /// Upper target speed in km/h
    pub high: f64,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a control request waits for its indication, in milliseconds
    pub control_timeout_ms: u64,
    /// Send Request Control before the first command and after control is lost
    pub auto_request_control: bool,
    /// Read the training status characteristic once at startup
    pub read_initial_training_status: bool,
}

impl EngineConfig {
    /// Control point timeout as a [`Duration`]
    #[must_use]
    pub const fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            control_timeout_ms: 2_000,
            auto_request_control: true,
            read_initial_training_status: true,
        }
    }
}
