//! Data record decoding for the four supported machine classes and the
//! Training Status characteristic.
//!
//! Every data characteristic starts with a 16-bit presence flags field. Each
//! class has a static table of field groups in wire order; a group is decoded
//! only when its bit declares it present. Bit 0 is "More Data" and is
//! inverted: the first group is present when the bit is clear.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::capability::{CapabilitySet, MachineFeatures};
use crate::codec::{flag_set, FieldFormat, FieldReader};
use crate::error::Result;
use crate::types::{MachineType, MovementDirection, TrainingStatusCode};

/// Bit that marks a record as continued in a following notification
pub const MORE_DATA_BIT: u8 = 0;

const CROSS_TRAINER_BACKWARD_BIT: u8 = 15;

/// A decoded telemetry value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Property {
    /// Instantaneous speed, km/h
    InstantaneousSpeed,
    /// Average speed, km/h
    AverageSpeed,
    /// Instantaneous cadence, rpm
    InstantaneousCadence,
    /// Average cadence, rpm
    AverageCadence,
    /// Total distance, m
    TotalDistance,
    /// Inclination, %
    Inclination,
    /// Ramp angle, degrees
    RampAngle,
    /// Positive elevation gain, m
    PositiveElevationGain,
    /// Negative elevation gain, m
    NegativeElevationGain,
    /// Instantaneous pace, km/min
    InstantaneousPace,
    /// Average pace, km/min
    AveragePace,
    /// Step rate, steps/min
    StepRate,
    /// Average step rate, steps/min
    AverageStepRate,
    /// Step count
    StepCount,
    /// Stride count
    StrideCount,
    /// Stroke rate, strokes/min
    StrokeRate,
    /// Stroke count
    StrokeCount,
    /// Average stroke rate, strokes/min
    AverageStrokeRate,
    /// Instantaneous split time, s/500 m
    SplitTime,
    /// Average split time, s/500 m
    AverageSplitTime,
    /// Resistance level
    ResistanceLevel,
    /// Instantaneous power, W
    InstantaneousPower,
    /// Average power, W
    AveragePower,
    /// Total energy, kcal
    TotalEnergy,
    /// Energy per hour, kcal
    EnergyPerHour,
    /// Energy per minute, kcal
    EnergyPerMinute,
    /// Heart rate, bpm
    HeartRate,
    /// Metabolic equivalent
    MetabolicEquivalent,
    /// Elapsed time, s
    ElapsedTime,
    /// Remaining time, s
    RemainingTime,
    /// Force on belt, N
    ForceOnBelt,
    /// Power output, W
    PowerOutput,
}

impl Property {
    /// Machine feature that must be advertised before the property is tracked
    ///
    /// `None` means the property is always tracked.
    #[must_use]
    pub const fn feature(self) -> Option<MachineFeatures> {
        use MachineFeatures as F;
        match self {
            Self::InstantaneousSpeed | Self::StrokeRate | Self::StrokeCount => None,
            Self::AverageSpeed => Some(F::AVERAGE_SPEED),
            Self::InstantaneousCadence | Self::AverageCadence | Self::AverageStrokeRate => {
                Some(F::CADENCE)
            }
            Self::TotalDistance => Some(F::TOTAL_DISTANCE),
            Self::Inclination | Self::RampAngle => Some(F::INCLINATION),
            Self::PositiveElevationGain | Self::NegativeElevationGain => Some(F::ELEVATION_GAIN),
            Self::InstantaneousPace
            | Self::AveragePace
            | Self::SplitTime
            | Self::AverageSplitTime => Some(F::PACE),
            Self::StepRate | Self::AverageStepRate | Self::StepCount => Some(F::STEP_COUNT),
            Self::StrideCount => Some(F::STRIDE_COUNT),
            Self::ResistanceLevel => Some(F::RESISTANCE_LEVEL),
            Self::InstantaneousPower | Self::AveragePower => Some(F::POWER_MEASUREMENT),
            Self::TotalEnergy | Self::EnergyPerHour | Self::EnergyPerMinute => {
                Some(F::EXPENDED_ENERGY)
            }
            Self::HeartRate => Some(F::HEART_RATE_MEASUREMENT),
            Self::MetabolicEquivalent => Some(F::METABOLIC_EQUIVALENT),
            Self::ElapsedTime => Some(F::ELAPSED_TIME),
            Self::RemainingTime => Some(F::REMAINING_TIME),
            Self::ForceOnBelt | Self::PowerOutput => Some(F::FORCE_ON_BELT_AND_POWER_OUTPUT),
        }
    }

    /// Whether the capability set allows tracking this property
    #[must_use]
    pub fn is_supported_by(self, capabilities: &CapabilitySet) -> bool {
        self.feature()
            .is_none_or(|feature| capabilities.supports_feature(feature))
    }

    /// Stable snake case name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::InstantaneousSpeed => "speed_instant",
            Self::AverageSpeed => "speed_average",
            Self::InstantaneousCadence => "cadence_instant",
            Self::AverageCadence => "cadence_average",
            Self::TotalDistance => "distance_total",
            Self::Inclination => "inclination",
            Self::RampAngle => "ramp_angle",
            Self::PositiveElevationGain => "elevation_gain_positive",
            Self::NegativeElevationGain => "elevation_gain_negative",
            Self::InstantaneousPace => "pace_instant",
            Self::AveragePace => "pace_average",
            Self::StepRate => "step_rate_instant",
            Self::AverageStepRate => "step_rate_average",
            Self::StepCount => "step_count",
            Self::StrideCount => "stride_count",
            Self::StrokeRate => "stroke_rate_instant",
            Self::StrokeCount => "stroke_count",
            Self::AverageStrokeRate => "stroke_rate_average",
            Self::SplitTime => "split_time_instant",
            Self::AverageSplitTime => "split_time_average",
            Self::ResistanceLevel => "resistance_level",
            Self::InstantaneousPower => "power_instant",
            Self::AveragePower => "power_average",
            Self::TotalEnergy => "energy_total",
            Self::EnergyPerHour => "energy_per_hour",
            Self::EnergyPerMinute => "energy_per_minute",
            Self::HeartRate => "heart_rate",
            Self::MetabolicEquivalent => "metabolic_equivalent",
            Self::ElapsedTime => "time_elapsed",
            Self::RemainingTime => "time_remaining",
            Self::ForceOnBelt => "force_on_belt",
            Self::PowerOutput => "power_output",
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fields gated by one presence bit, in wire order
#[derive(Debug)]
struct FieldGroup {
    bit: u8,
    fields: &'static [(Property, FieldFormat)],
}

impl FieldGroup {
    const fn new(bit: u8, fields: &'static [(Property, FieldFormat)]) -> Self {
        Self { bit, fields }
    }

    fn is_present(&self, flags: u16) -> bool {
        let set = flag_set(u32::from(flags), self.bit);
        if self.bit == MORE_DATA_BIT {
            !set
        } else {
            set
        }
    }
}

const SPEED: FieldFormat = FieldFormat::unsigned(2, 100);
const TENTHS_S16: FieldFormat = FieldFormat::signed(2, 10);
const TENTHS_U16: FieldFormat = FieldFormat::unsigned(2, 10);
const TENTHS_U8: FieldFormat = FieldFormat::unsigned(1, 10);
const HALVES_U8: FieldFormat = FieldFormat::unsigned(1, 2);
const HALVES_U16: FieldFormat = FieldFormat::unsigned(2, 2);

const ENERGY: &[(Property, FieldFormat)] = &[
    (Property::TotalEnergy, FieldFormat::U16),
    (Property::EnergyPerHour, FieldFormat::U16),
    (Property::EnergyPerMinute, FieldFormat::U8),
];

const TREADMILL_FIELDS: &[FieldGroup] = &[
    FieldGroup::new(0, &[(Property::InstantaneousSpeed, SPEED)]),
    FieldGroup::new(1, &[(Property::AverageSpeed, SPEED)]),
    FieldGroup::new(2, &[(Property::TotalDistance, FieldFormat::U24)]),
    FieldGroup::new(
        3,
        &[
            (Property::Inclination, TENTHS_S16),
            (Property::RampAngle, TENTHS_S16),
        ],
    ),
    FieldGroup::new(
        4,
        &[
            (Property::PositiveElevationGain, TENTHS_U16),
            (Property::NegativeElevationGain, TENTHS_U16),
        ],
    ),
    FieldGroup::new(5, &[(Property::InstantaneousPace, TENTHS_U8)]),
    FieldGroup::new(6, &[(Property::AveragePace, TENTHS_U8)]),
    FieldGroup::new(7, ENERGY),
    FieldGroup::new(8, &[(Property::HeartRate, FieldFormat::U8)]),
    FieldGroup::new(9, &[(Property::MetabolicEquivalent, TENTHS_U8)]),
    FieldGroup::new(10, &[(Property::ElapsedTime, FieldFormat::U16)]),
    FieldGroup::new(11, &[(Property::RemainingTime, FieldFormat::U16)]),
    FieldGroup::new(
        12,
        &[
            (Property::ForceOnBelt, FieldFormat::S16),
            (Property::PowerOutput, FieldFormat::S16),
        ],
    ),
    FieldGroup::new(13, &[(Property::StepCount, FieldFormat::U24)]),
];

const CROSS_TRAINER_FIELDS: &[FieldGroup] = &[
    FieldGroup::new(0, &[(Property::InstantaneousSpeed, SPEED)]),
    FieldGroup::new(1, &[(Property::AverageSpeed, SPEED)]),
    FieldGroup::new(2, &[(Property::TotalDistance, FieldFormat::U24)]),
    FieldGroup::new(
        3,
        &[
            (Property::StepRate, FieldFormat::U16),
            (Property::AverageStepRate, FieldFormat::U16),
        ],
    ),
    FieldGroup::new(4, &[(Property::StrideCount, FieldFormat::U16)]),
    FieldGroup::new(
        5,
        &[
            (Property::PositiveElevationGain, FieldFormat::U16),
            (Property::NegativeElevationGain, FieldFormat::U16),
        ],
    ),
    FieldGroup::new(
        6,
        &[
            (Property::Inclination, TENTHS_S16),
            (Property::RampAngle, TENTHS_S16),
        ],
    ),
    FieldGroup::new(7, &[(Property::ResistanceLevel, TENTHS_S16)]),
    FieldGroup::new(8, &[(Property::InstantaneousPower, FieldFormat::S16)]),
    FieldGroup::new(9, &[(Property::AveragePower, FieldFormat::S16)]),
    FieldGroup::new(10, ENERGY),
    FieldGroup::new(11, &[(Property::HeartRate, FieldFormat::U8)]),
    FieldGroup::new(12, &[(Property::MetabolicEquivalent, TENTHS_U8)]),
    FieldGroup::new(13, &[(Property::ElapsedTime, FieldFormat::U16)]),
    FieldGroup::new(14, &[(Property::RemainingTime, FieldFormat::U16)]),
];

const ROWER_FIELDS: &[FieldGroup] = &[
    FieldGroup::new(
        0,
        &[
            (Property::StrokeRate, HALVES_U8),
            (Property::StrokeCount, FieldFormat::U16),
        ],
    ),
    FieldGroup::new(1, &[(Property::AverageStrokeRate, HALVES_U8)]),
    FieldGroup::new(2, &[(Property::TotalDistance, FieldFormat::U24)]),
    FieldGroup::new(3, &[(Property::SplitTime, FieldFormat::U16)]),
    FieldGroup::new(4, &[(Property::AverageSplitTime, FieldFormat::U16)]),
    FieldGroup::new(5, &[(Property::InstantaneousPower, FieldFormat::S16)]),
    FieldGroup::new(6, &[(Property::AveragePower, FieldFormat::S16)]),
    FieldGroup::new(7, &[(Property::ResistanceLevel, FieldFormat::S16)]),
    FieldGroup::new(8, ENERGY),
    FieldGroup::new(9, &[(Property::HeartRate, FieldFormat::U8)]),
    FieldGroup::new(10, &[(Property::MetabolicEquivalent, TENTHS_U8)]),
    FieldGroup::new(11, &[(Property::ElapsedTime, FieldFormat::U16)]),
    FieldGroup::new(12, &[(Property::RemainingTime, FieldFormat::U16)]),
];

const INDOOR_BIKE_FIELDS: &[FieldGroup] = &[
    FieldGroup::new(0, &[(Property::InstantaneousSpeed, SPEED)]),
    FieldGroup::new(1, &[(Property::AverageSpeed, SPEED)]),
    FieldGroup::new(2, &[(Property::InstantaneousCadence, HALVES_U16)]),
    FieldGroup::new(3, &[(Property::AverageCadence, HALVES_U16)]),
    FieldGroup::new(4, &[(Property::TotalDistance, FieldFormat::U24)]),
    FieldGroup::new(5, &[(Property::ResistanceLevel, FieldFormat::S16)]),
    FieldGroup::new(6, &[(Property::InstantaneousPower, FieldFormat::S16)]),
    FieldGroup::new(7, &[(Property::AveragePower, FieldFormat::S16)]),
    FieldGroup::new(8, ENERGY),
    FieldGroup::new(9, &[(Property::HeartRate, FieldFormat::U8)]),
    FieldGroup::new(10, &[(Property::MetabolicEquivalent, TENTHS_U8)]),
    FieldGroup::new(11, &[(Property::ElapsedTime, FieldFormat::U16)]),
    FieldGroup::new(12, &[(Property::RemainingTime, FieldFormat::U16)]),
];

const fn field_table(machine_type: MachineType) -> &'static [FieldGroup] {
    match machine_type {
        MachineType::Treadmill => TREADMILL_FIELDS,
        MachineType::CrossTrainer => CROSS_TRAINER_FIELDS,
        MachineType::Rower => ROWER_FIELDS,
        MachineType::IndoorBike => INDOOR_BIKE_FIELDS,
    }
}

/// Every property a machine class can report, in wire order
pub fn class_properties(machine_type: MachineType) -> impl Iterator<Item = Property> {
    field_table(machine_type)
        .iter()
        .flat_map(|group| group.fields.iter().map(|&(property, _)| property))
}

/// One decoded field of a data record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    /// Which property the field carries
    pub property: Property,
    /// Value after scaling
    pub value: f64,
}

/// Decoded content of one data characteristic notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeData {
    /// Raw presence flags
    pub flags: u16,
    /// More Data bit: the device continues the record in another notification
    pub more_data: bool,
    /// Fields present in this notification, in wire order
    pub fields: Vec<FieldValue>,
    /// Movement direction, cross trainers only
    pub movement_direction: Option<MovementDirection>,
}

impl RealtimeData {
    /// Value of a property if this record carries it
    #[must_use]
    pub fn get(&self, property: Property) -> Option<f64> {
        self.fields
            .iter()
            .find(|field| field.property == property)
            .map(|field| field.value)
    }

    /// Whether this record carries a property
    #[must_use]
    pub fn contains(&self, property: Property) -> bool {
        self.get(property).is_some()
    }

    /// Append the next notification of a multi-packet record
    ///
    /// Presence bits accumulate while the More Data bit follows `next`.
    pub fn extend(&mut self, next: &Self) {
        let more_data_mask = 1u16 << MORE_DATA_BIT;
        self.flags = ((self.flags | next.flags) & !more_data_mask) | (next.flags & more_data_mask);
        self.more_data = next.more_data;
        self.fields.extend_from_slice(&next.fields);
        if next.movement_direction.is_some() {
            self.movement_direction = next.movement_direction;
        }
    }
}

/// Decoded Training Status characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingStatus {
    /// Status code
    pub code: TrainingStatusCode,
    /// Optional descriptive text
    pub text: Option<String>,
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataRecord {
    /// Treadmill Data
    Treadmill(RealtimeData),
    /// Cross Trainer Data
    CrossTrainer(RealtimeData),
    /// Rower Data
    Rower(RealtimeData),
    /// Indoor Bike Data
    IndoorBike(RealtimeData),
    /// Training Status
    TrainingStatus(TrainingStatus),
}

impl DataRecord {
    /// Realtime fields, `None` for training status records
    #[must_use]
    pub const fn realtime(&self) -> Option<&RealtimeData> {
        match self {
            Self::Treadmill(data)
            | Self::CrossTrainer(data)
            | Self::Rower(data)
            | Self::IndoorBike(data) => Some(data),
            Self::TrainingStatus(_) => None,
        }
    }

    /// Mutable realtime fields, `None` for training status records
    pub const fn realtime_mut(&mut self) -> Option<&mut RealtimeData> {
        match self {
            Self::Treadmill(data)
            | Self::CrossTrainer(data)
            | Self::Rower(data)
            | Self::IndoorBike(data) => Some(data),
            Self::TrainingStatus(_) => None,
        }
    }

    /// Machine class the record was decoded for
    #[must_use]
    pub const fn machine_type(&self) -> Option<MachineType> {
        match self {
            Self::Treadmill(_) => Some(MachineType::Treadmill),
            Self::CrossTrainer(_) => Some(MachineType::CrossTrainer),
            Self::Rower(_) => Some(MachineType::Rower),
            Self::IndoorBike(_) => Some(MachineType::IndoorBike),
            Self::TrainingStatus(_) => None,
        }
    }
}

/// Decode a data characteristic notification for a machine class
///
/// Reserved flag bits are ignored. Bytes after the last declared field are
/// ignored.
///
/// # Errors
///
/// Returns [`crate::FtmsError::TruncatedBuffer`] if the buffer ends before the
/// flags or mid-field.
pub fn decode(machine_type: MachineType, data: &[u8]) -> Result<DataRecord> {
    let mut reader = FieldReader::new(data);
    let flags = reader.decode_u16()?;

    let mut fields = Vec::new();
    for group in field_table(machine_type) {
        if !group.is_present(flags) {
            continue;
        }
        for &(property, format) in group.fields {
            let value = reader.decode_scaled(format)?;
            fields.push(FieldValue { property, value });
        }
    }

    if !reader.is_empty() {
        debug!(
            "{} data: ignoring {} trailing byte(s) after flags {:#06x}",
            machine_type,
            reader.remaining(),
            flags
        );
    }

    let movement_direction = (machine_type == MachineType::CrossTrainer).then(|| {
        if flag_set(u32::from(flags), CROSS_TRAINER_BACKWARD_BIT) {
            MovementDirection::Backward
        } else {
            MovementDirection::Forward
        }
    });

    let data = RealtimeData {
        flags,
        more_data: flag_set(u32::from(flags), MORE_DATA_BIT),
        fields,
        movement_direction,
    };

    Ok(match machine_type {
        MachineType::Treadmill => DataRecord::Treadmill(data),
        MachineType::CrossTrainer => DataRecord::CrossTrainer(data),
        MachineType::Rower => DataRecord::Rower(data),
        MachineType::IndoorBike => DataRecord::IndoorBike(data),
    })
}

/// Decode the Training Status characteristic
///
/// The string is decoded lossily so a device sending invalid UTF-8 still
/// yields a status code.
///
/// # Errors
///
/// Returns [`crate::FtmsError::TruncatedBuffer`] if flags or code are missing.
pub fn decode_training_status(data: &[u8]) -> Result<DataRecord> {
    let mut reader = FieldReader::new(data);
    let flags = reader.decode_u8()?;
    let code = TrainingStatusCode::from(reader.decode_u8()?);

    let rest = reader.rest();
    let text = if flag_set(u32::from(flags), 0) {
        Some(String::from_utf8_lossy(rest).into_owned())
    } else {
        if !rest.is_empty() {
            debug!("Training status: ignoring {} byte(s) without string flag", rest.len());
        }
        None
    };

    Ok(DataRecord::TrainingStatus(TrainingStatus { code, text }))
}
