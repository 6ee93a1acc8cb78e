#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ftms-engine
//!
//! A client engine for the Bluetooth Fitness Machine Service (FTMS), the GATT
//! profile spoken by treadmills, cross trainers, rowers and indoor bikes.
//!
//! The engine turns raw characteristic payloads into typed, machine-specific
//! telemetry and turns typed commands into correctly sequenced and
//! acknowledged control point writes. Scanning, pairing and connecting stay
//! with the caller; the engine is handed a [`Transport`] for an already
//! connected machine.
//!
//! ## Components
//!
//! - **Field codec** ([`codec`]): little-endian integers and scaled fields
//! - **Capability set** ([`capability`]): feature bits and setting ranges, read
//!   once per session
//! - **Data record decoder** ([`records`]): flag-driven records per machine class
//! - **Control point** ([`control`]): one outstanding request, matched to its
//!   indication by op code
//! - **Event dispatcher** ([`dispatcher`]): property snapshot and one ordered
//!   event stream
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use ftms_engine::{
//!     BtleplugTransport, Characteristics, EngineConfig, FitnessMachine, FtmsEvent, MachineType,
//! };
//!
//! # async fn run(peripheral: btleplug::platform::Peripheral) -> Result<(), Box<dyn std::error::Error>> {
//! // `peripheral` is connected and its services are discovered
//! let transport = Arc::new(BtleplugTransport::new(peripheral).await?);
//! let characteristics =
//!     Characteristics::standard(MachineType::Treadmill).retain_available(&transport.available());
//!
//! let (treadmill, mut events) = FitnessMachine::connect(
//!     transport,
//!     MachineType::Treadmill,
//!     characteristics,
//!     EngineConfig::default(),
//! )
//! .await?;
//!
//! treadmill.start_or_resume().await?;
//! treadmill.set_target_speed(6.5).await?;
//!
//! while let Some(dispatched) = events.recv().await {
//!     if let FtmsEvent::PropertiesUpdated { snapshot, .. } = dispatched.event {
//!         println!("{snapshot}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

/// Transport contract and btleplug adapter
pub mod ble;
pub mod capability;
pub mod codec;
pub mod control;
/// Fitness machine session
pub mod device;
pub mod dispatcher;
/// Error types and handling
pub mod error;
/// Control point and machine status wire formats
pub mod protocol;
pub mod records;
/// Shared enums and configuration
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BtleplugTransport, Characteristics, Transport, TransportEvent};
pub use capability::{CapabilitySet, MachineFeatures, SettingKind, SettingRange, TargetSettings};
pub use control::{ControlAccess, ControlPoint};
pub use device::FitnessMachine;
pub use dispatcher::{DispatchedEvent, EventSource, FtmsEvent, PropertySnapshot};
pub use error::{ControlError, FtmsError, Result};
pub use protocol::{ControlOpCode, ControlRequest, ControlResponse, MachineStatus, ResultCode};
pub use records::{DataRecord, Property, RealtimeData, TrainingStatus};
pub use types::{
    EngineConfig, IndoorBikeSimulation, MachineType, MovementDirection, SpinDownControlCode,
    SpinDownSpeeds, SpinDownStatusCode, StopPauseCode, TrainingStatusCode,
};

use uuid::Uuid;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Expand a 16-bit Bluetooth SIG assigned number into a full UUID
#[must_use]
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5F9B_34FB | ((short as u128) << 96))
}

/// Fitness Machine Service
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);

/// Fitness Machine Feature (read)
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);

/// Treadmill Data (notify)
pub const TREADMILL_DATA_UUID: Uuid = ble_uuid(0x2ACD);

/// Cross Trainer Data (notify)
pub const CROSS_TRAINER_DATA_UUID: Uuid = ble_uuid(0x2ACE);

/// Rower Data (notify)
pub const ROWER_DATA_UUID: Uuid = ble_uuid(0x2AD1);

/// Indoor Bike Data (notify)
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);

/// Training Status (read, notify)
pub const TRAINING_STATUS_UUID: Uuid = ble_uuid(0x2AD3);

/// Supported Speed Range (read)
pub const SPEED_RANGE_UUID: Uuid = ble_uuid(0x2AD4);

/// Supported Inclination Range (read)
pub const INCLINATION_RANGE_UUID: Uuid = ble_uuid(0x2AD5);

/// Supported Resistance Level Range (read)
pub const RESISTANCE_RANGE_UUID: Uuid = ble_uuid(0x2AD6);

/// Supported Heart Rate Range (read)
pub const HEART_RATE_RANGE_UUID: Uuid = ble_uuid(0x2AD7);

/// Supported Power Range (read)
pub const POWER_RANGE_UUID: Uuid = ble_uuid(0x2AD8);

/// Fitness Machine Control Point (write, indicate)
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);

/// Fitness Machine Status (notify)
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);
