//! Capability negotiation: the Fitness Machine Feature bitmask and the
//! supported range characteristics, read once per session.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};
use tracing::{debug, warn};

use crate::codec::{FieldFormat, FieldReader};
use crate::error::{FtmsError, Result};

/// Length of the Fitness Machine Feature characteristic
pub const FEATURE_LEN: usize = 8;

bitflags! {
    /// Fitness Machine Features (first 32 bits of the Feature characteristic)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MachineFeatures: u32 {
        /// Average speed
        const AVERAGE_SPEED = 1 << 0;
        /// Cadence
        const CADENCE = 1 << 1;
        /// Total distance
        const TOTAL_DISTANCE = 1 << 2;
        /// Inclination
        const INCLINATION = 1 << 3;
        /// Elevation gain
        const ELEVATION_GAIN = 1 << 4;
        /// Pace
        const PACE = 1 << 5;
        /// Step count
        const STEP_COUNT = 1 << 6;
        /// Resistance level
        const RESISTANCE_LEVEL = 1 << 7;
        /// Stride count
        const STRIDE_COUNT = 1 << 8;
        /// Expended energy
        const EXPENDED_ENERGY = 1 << 9;
        /// Heart rate measurement
        const HEART_RATE_MEASUREMENT = 1 << 10;
        /// Metabolic equivalent
        const METABOLIC_EQUIVALENT = 1 << 11;
        /// Elapsed time
        const ELAPSED_TIME = 1 << 12;
        /// Remaining time
        const REMAINING_TIME = 1 << 13;
        /// Power measurement
        const POWER_MEASUREMENT = 1 << 14;
        /// Force on belt and power output
        const FORCE_ON_BELT_AND_POWER_OUTPUT = 1 << 15;
        /// User data retention
        const USER_DATA_RETENTION = 1 << 16;
    }
}

bitflags! {
    /// Target Setting Features (last 32 bits of the Feature characteristic)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct TargetSettings: u32 {
        /// Speed target
        const SPEED = 1 << 0;
        /// Inclination target
        const INCLINATION = 1 << 1;
        /// Resistance target
        const RESISTANCE = 1 << 2;
        /// Power target
        const POWER = 1 << 3;
        /// Heart rate target
        const HEART_RATE = 1 << 4;
        /// Targeted expended energy
        const TARGETED_EXPENDED_ENERGY = 1 << 5;
        /// Targeted step number
        const TARGETED_STEP_NUMBER = 1 << 6;
        /// Targeted stride number
        const TARGETED_STRIDE_NUMBER = 1 << 7;
        /// Targeted distance
        const TARGETED_DISTANCE = 1 << 8;
        /// Targeted training time
        const TARGETED_TRAINING_TIME = 1 << 9;
        /// Training time in two heart rate zones
        const TARGETED_TIME_TWO_ZONES = 1 << 10;
        /// Training time in three heart rate zones
        const TARGETED_TIME_THREE_ZONES = 1 << 11;
        /// Training time in five heart rate zones
        const TARGETED_TIME_FIVE_ZONES = 1 << 12;
        /// Indoor bike simulation parameters
        const INDOOR_BIKE_SIMULATION = 1 << 13;
        /// Wheel circumference
        const WHEEL_CIRCUMFERENCE = 1 << 14;
        /// Spin down control
        const SPIN_DOWN_CONTROL = 1 << 15;
        /// Targeted cadence
        const TARGETED_CADENCE = 1 << 16;
    }
}

/// Settings that come with a supported range characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SettingKind {
    /// Speed in km/h
    Speed,
    /// Inclination in percent
    Inclination,
    /// Resistance level
    Resistance,
    /// Power in watts
    Power,
    /// Heart rate in bpm
    HeartRate,
}

impl SettingKind {
    /// All ranged settings
    pub const ALL: [Self; 5] = [
        Self::Speed,
        Self::Inclination,
        Self::Resistance,
        Self::Power,
        Self::HeartRate,
    ];

    /// Format of each of the three values in the range characteristic
    #[must_use]
    pub const fn range_format(self) -> FieldFormat {
        match self {
            Self::Speed => FieldFormat::unsigned(2, 100),
            Self::Inclination | Self::Resistance => FieldFormat::signed(2, 10),
            Self::Power => FieldFormat::S16,
            Self::HeartRate => FieldFormat::U8,
        }
    }

    /// Expected length of the range characteristic
    #[must_use]
    pub const fn range_len(self) -> usize {
        3 * self.range_format().width()
    }

    /// Target setting bit that advertises this setting
    #[must_use]
    pub const fn target_setting(self) -> TargetSettings {
        match self {
            Self::Speed => TargetSettings::SPEED,
            Self::Inclination => TargetSettings::INCLINATION,
            Self::Resistance => TargetSettings::RESISTANCE,
            Self::Power => TargetSettings::POWER,
            Self::HeartRate => TargetSettings::HEART_RATE,
        }
    }
}

impl fmt::Display for SettingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Speed => write!(f, "speed"),
            Self::Inclination => write!(f, "inclination"),
            Self::Resistance => write!(f, "resistance"),
            Self::Power => write!(f, "power"),
            Self::HeartRate => write!(f, "heart rate"),
        }
    }
}

/// Advertised range of a setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettingRange {
    /// Minimum accepted value
    pub min: f64,
    /// Maximum accepted value
    pub max: f64,
    /// Minimum increment
    pub increment: f64,
}

impl SettingRange {
    /// Decode a range characteristic payload
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::MalformedCapability`] if the payload length does
    /// not match the setting's range format.
    pub fn decode(kind: SettingKind, data: &[u8]) -> Result<Self> {
        if data.len() != kind.range_len() {
            return Err(FtmsError::MalformedCapability(format!(
                "{kind} range is {} bytes, expected {}",
                data.len(),
                kind.range_len()
            )));
        }

        let format = kind.range_format();
        let mut reader = FieldReader::new(data);
        Ok(Self {
            min: reader.decode_scaled(format)?,
            max: reader.decode_scaled(format)?,
            increment: reader.decode_scaled(format)?,
        })
    }

    /// Whether `value` lies within `min..=max`
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// What a connected machine supports, built once at startup
///
/// The set is never mutated after [`CapabilitySet::build`], so it is shared
/// behind an `Arc` without locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySet {
    features: MachineFeatures,
    settings: TargetSettings,
    ranges: HashMap<SettingKind, SettingRange>,
}

impl CapabilitySet {
    /// Build the capability set from the Feature characteristic and the range
    /// characteristics that were read
    ///
    /// Ranges are decoded only for settings whose target setting bit is set.
    /// Range payloads for unadvertised settings are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::MalformedCapability`] if the feature payload is not
    /// 8 bytes, or an advertised ranged setting has a missing or wrong-length
    /// range payload.
    pub fn build(feature_bytes: &[u8], ranges: &HashMap<SettingKind, Vec<u8>>) -> Result<Self> {
        if feature_bytes.len() != FEATURE_LEN {
            return Err(FtmsError::MalformedCapability(format!(
                "feature characteristic is {} bytes, expected {FEATURE_LEN}",
                feature_bytes.len()
            )));
        }

        let mut reader = FieldReader::new(feature_bytes);
        let features = MachineFeatures::from_bits_truncate(reader.decode_uint(4)?);
        let settings = TargetSettings::from_bits_truncate(reader.decode_uint(4)?);

        let mut decoded = HashMap::new();
        for kind in SettingKind::ALL {
            if !settings.contains(kind.target_setting()) {
                if ranges.contains_key(&kind) {
                    debug!("Ignoring {} range, setting not advertised", kind);
                }
                continue;
            }

            let data = ranges.get(&kind).ok_or_else(|| {
                FtmsError::MalformedCapability(format!("{kind} is advertised without a range"))
            })?;
            let range = SettingRange::decode(kind, data)?;
            if range.min > range.max {
                warn!(
                    "{} range has min {} above max {}",
                    kind, range.min, range.max
                );
            }
            decoded.insert(kind, range);
        }

        debug!(
            "Capabilities: features={:?} settings={:?} ranges={}",
            features,
            settings,
            decoded.len()
        );

        Ok(Self {
            features,
            settings,
            ranges: decoded,
        })
    }

    /// Machine features
    #[must_use]
    pub const fn features(&self) -> MachineFeatures {
        self.features
    }

    /// Target settings
    #[must_use]
    pub const fn settings(&self) -> TargetSettings {
        self.settings
    }

    /// Check a machine feature bit
    #[must_use]
    pub const fn supports_feature(&self, feature: MachineFeatures) -> bool {
        self.features.contains(feature)
    }

    /// Check a target setting bit
    #[must_use]
    pub const fn supports_setting(&self, setting: TargetSettings) -> bool {
        self.settings.contains(setting)
    }

    /// Advertised range, `None` if the setting is unsupported
    #[must_use]
    pub fn range(&self, kind: SettingKind) -> Option<&SettingRange> {
        self.ranges.get(&kind)
    }

    /// Validate a value for a ranged setting
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotSupported`] if the setting is not advertised and
    /// [`FtmsError::OutOfRange`] if the value is outside the advertised range.
    pub fn check_value(&self, kind: SettingKind, value: f64) -> Result<()> {
        let range = self
            .range(kind)
            .ok_or_else(|| FtmsError::NotSupported(format!("{kind} target")))?;

        if !range.contains(value) {
            return Err(FtmsError::OutOfRange {
                setting: kind.to_string(),
                value,
                min: range.min,
                max: range.max,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature_bytes(features: MachineFeatures, settings: TargetSettings) -> Vec<u8> {
        let mut bytes = features.bits().to_le_bytes().to_vec();
        bytes.extend_from_slice(&settings.bits().to_le_bytes());
        bytes
    }

    #[test]
    fn test_build_with_ranges() {
        let features = MachineFeatures::AVERAGE_SPEED | MachineFeatures::POWER_MEASUREMENT;
        let settings = TargetSettings::SPEED | TargetSettings::POWER;

        let mut ranges = HashMap::new();
        // 1.00 .. 20.00 km/h, step 0.10
        ranges.insert(SettingKind::Speed, vec![0x64, 0x00, 0xD0, 0x07, 0x0A, 0x00]);
        // 0 .. 800 W, step 1
        ranges.insert(SettingKind::Power, vec![0x00, 0x00, 0x20, 0x03, 0x01, 0x00]);

        let caps = CapabilitySet::build(&feature_bytes(features, settings), &ranges).unwrap();

        assert!(caps.supports_feature(MachineFeatures::AVERAGE_SPEED));
        assert!(!caps.supports_feature(MachineFeatures::CADENCE));
        assert!(caps.supports_setting(TargetSettings::POWER));

        let speed = caps.range(SettingKind::Speed).unwrap();
        assert_eq!(speed.min, 1.0);
        assert_eq!(speed.max, 20.0);
        assert_eq!(speed.increment, 0.1);
        assert_eq!(caps.range(SettingKind::Power).unwrap().max, 800.0);
        assert!(caps.range(SettingKind::Inclination).is_none());
    }

    #[test]
    fn test_unadvertised_range_is_ignored() {
        let mut ranges = HashMap::new();
        ranges.insert(SettingKind::HeartRate, vec![0x01]);

        let caps = CapabilitySet::build(
            &feature_bytes(MachineFeatures::empty(), TargetSettings::empty()),
            &ranges,
        )
        .unwrap();
        assert!(caps.range(SettingKind::HeartRate).is_none());
    }

    #[test]
    fn test_malformed_feature_length() {
        let err = CapabilitySet::build(&[0u8; 7], &HashMap::new()).unwrap_err();
        assert!(matches!(err, FtmsError::MalformedCapability(_)));
        assert!(err.is_session_fatal());
    }

    #[test]
    fn test_malformed_range_length() {
        let mut ranges = HashMap::new();
        ranges.insert(SettingKind::Inclination, vec![0x00, 0x00, 0x64, 0x00]);

        let err = CapabilitySet::build(
            &feature_bytes(MachineFeatures::INCLINATION, TargetSettings::INCLINATION),
            &ranges,
        )
        .unwrap_err();
        assert!(matches!(err, FtmsError::MalformedCapability(_)));
    }

    #[test]
    fn test_missing_range_is_malformed() {
        let err = CapabilitySet::build(
            &feature_bytes(MachineFeatures::empty(), TargetSettings::RESISTANCE),
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, FtmsError::MalformedCapability(_)));
    }

    #[test]
    fn test_check_value() {
        let mut ranges = HashMap::new();
        // -5.0 .. 15.0 %, step 0.5
        ranges.insert(
            SettingKind::Inclination,
            vec![0xCE, 0xFF, 0x96, 0x00, 0x05, 0x00],
        );
        let caps = CapabilitySet::build(
            &feature_bytes(MachineFeatures::INCLINATION, TargetSettings::INCLINATION),
            &ranges,
        )
        .unwrap();

        assert!(caps.check_value(SettingKind::Inclination, -5.0).is_ok());
        assert!(caps.check_value(SettingKind::Inclination, 15.0).is_ok());
        assert!(matches!(
            caps.check_value(SettingKind::Inclination, 15.5),
            Err(FtmsError::OutOfRange { .. })
        ));
        assert!(matches!(
            caps.check_value(SettingKind::Speed, 5.0),
            Err(FtmsError::NotSupported(_))
        ));
    }

    #[test]
    fn test_reserved_bits_are_dropped() {
        let caps = CapabilitySet::build(
            &[0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00],
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(caps.features(), MachineFeatures::all());
        assert_eq!(caps.settings(), TargetSettings::empty());
    }
}
