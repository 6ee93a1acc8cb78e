//! Routes raw notifications to decoders, keeps the property snapshot and
//! publishes one ordered event stream per machine.

use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    ble::{Characteristics, TransportEvent},
    capability::CapabilitySet,
    control::ControlPoint,
    error::FtmsError,
    protocol::{ControlResponse, MachineStatus},
    records::{self, DataRecord, Property},
    types::{MachineType, MovementDirection, TrainingStatusCode},
};

/// Latest known value of every tracked property
///
/// A property keeps its value until a record carrying it arrives. Properties
/// the machine does not advertise are never populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    values: BTreeMap<Property, f64>,
    /// Cross trainer movement direction
    pub movement_direction: Option<MovementDirection>,
    /// Last training status code
    pub training_status: Option<TrainingStatusCode>,
    /// Last training status text
    pub training_status_text: Option<String>,
}

impl PropertySnapshot {
    /// Latest value of a property
    #[must_use]
    pub fn get(&self, property: Property) -> Option<f64> {
        self.values.get(&property).copied()
    }

    /// All populated properties
    pub fn iter(&self) -> impl Iterator<Item = (Property, f64)> + '_ {
        self.values.iter().map(|(property, value)| (*property, *value))
    }

    /// Number of populated properties
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no property has been populated yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge a record field by field, returning the properties whose value
    /// changed
    pub fn apply(&mut self, record: &DataRecord, capabilities: &CapabilitySet) -> Vec<Property> {
        match record {
            DataRecord::TrainingStatus(status) => {
                self.training_status = Some(status.code);
                self.training_status_text.clone_from(&status.text);
                Vec::new()
            }
            DataRecord::Treadmill(data)
            | DataRecord::CrossTrainer(data)
            | DataRecord::Rower(data)
            | DataRecord::IndoorBike(data) => {
                if data.movement_direction.is_some() {
                    self.movement_direction = data.movement_direction;
                }

                let mut changed = Vec::new();
                for field in &data.fields {
                    if field.property.is_supported_by(capabilities)
                        && self.values.insert(field.property, field.value) != Some(field.value)
                        && !changed.contains(&field.property)
                    {
                        changed.push(field.property);
                    }
                }
                changed
            }
        }
    }
}

impl fmt::Display for PropertySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (property, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{property}={value}")?;
            first = false;
        }
        if let Some(status) = self.training_status {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "training_status={status}")?;
        }
        Ok(())
    }
}

/// Characteristic category an event originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// Machine class data characteristic
    Data,
    /// Training Status
    TrainingStatus,
    /// Fitness Machine Status
    MachineStatus,
    /// Fitness Machine Control Point
    ControlPoint,
    /// The transport itself
    Transport,
}

/// Event delivered to the consumer
#[derive(Debug)]
pub enum FtmsEvent {
    /// A complete record was merged into the snapshot
    PropertiesUpdated {
        /// Snapshot after the merge
        snapshot: PropertySnapshot,
        /// Tracked properties whose value differs from the previous snapshot
        changed: Vec<Property>,
    },
    /// The machine reported a status change
    StatusChanged(MachineStatus),
    /// The machine answered the outstanding control request
    ///
    /// The submitting caller receives the same outcome. `result` tells
    /// acceptance from rejection.
    ControlCompleted(ControlResponse),
    /// A notification could not be decoded; the snapshot is unchanged
    DecodeFailed {
        /// Characteristic the notification came from
        characteristic: Uuid,
        /// Decode error
        error: FtmsError,
    },
    /// The transport reported a disconnect
    Disconnected,
}

/// Event with its position in the stream
#[derive(Debug)]
pub struct DispatchedEvent {
    /// Increases by one for every emitted event
    pub sequence: u64,
    /// Source category
    pub source: EventSource,
    /// The event
    pub event: FtmsEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Data,
    TrainingStatus,
    MachineStatus,
    ControlPoint,
}

/// Single consumer of transport events for one machine
pub struct EventDispatcher {
    machine_type: MachineType,
    routes: HashMap<Uuid, Route>,
    capabilities: Arc<CapabilitySet>,
    snapshot: Arc<RwLock<PropertySnapshot>>,
    control: Option<Arc<ControlPoint>>,
    events: mpsc::UnboundedSender<DispatchedEvent>,
    sequence: u64,
    partial: Option<DataRecord>,
    fragments: usize,
}

/// Notifications one record may span before it is applied regardless
const MAX_RECORD_FRAGMENTS: usize = 16;

impl EventDispatcher {
    /// Create a dispatcher routing the given characteristics
    #[must_use]
    pub fn new(
        machine_type: MachineType,
        characteristics: &Characteristics,
        capabilities: Arc<CapabilitySet>,
        control: Option<Arc<ControlPoint>>,
        events: mpsc::UnboundedSender<DispatchedEvent>,
    ) -> Self {
        let mut routes = HashMap::new();
        routes.insert(characteristics.data, Route::Data);
        if let Some(uuid) = characteristics.training_status {
            routes.insert(uuid, Route::TrainingStatus);
        }
        if let Some(uuid) = characteristics.machine_status {
            routes.insert(uuid, Route::MachineStatus);
        }
        if let Some(uuid) = characteristics.control_point {
            routes.insert(uuid, Route::ControlPoint);
        }

        Self {
            machine_type,
            routes,
            capabilities,
            snapshot: Arc::new(RwLock::new(PropertySnapshot::default())),
            control,
            events,
            sequence: 0,
            partial: None,
            fragments: 0,
        }
    }

    /// Shared handle for snapshot readers
    #[must_use]
    pub fn snapshot_handle(&self) -> Arc<RwLock<PropertySnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Route one notification
    pub async fn on_raw_notification(&mut self, characteristic: Uuid, data: &[u8]) {
        let Some(route) = self.routes.get(&characteristic).copied() else {
            debug!("Ignoring notification from unrouted {}", characteristic);
            return;
        };

        match route {
            Route::Data => match records::decode(self.machine_type, data) {
                Ok(record) => self.on_data_record(record).await,
                Err(error) => {
                    self.drop_partial();
                    self.decode_failed(EventSource::Data, characteristic, data, error);
                }
            },
            Route::TrainingStatus => match records::decode_training_status(data) {
                Ok(record) => self.merge(EventSource::TrainingStatus, &record).await,
                Err(error) => {
                    self.decode_failed(EventSource::TrainingStatus, characteristic, data, error);
                }
            },
            Route::MachineStatus => match MachineStatus::decode(data) {
                Ok(status) => {
                    if status.revokes_control() {
                        if let Some(control) = &self.control {
                            control.on_control_lost();
                        }
                    }
                    debug!("Machine status: {:?}", status);
                    self.emit(EventSource::MachineStatus, FtmsEvent::StatusChanged(status));
                }
                Err(error) => {
                    self.decode_failed(EventSource::MachineStatus, characteristic, data, error);
                }
            },
            Route::ControlPoint => {
                let Some(control) = &self.control else {
                    warn!("Control point indication without a control point");
                    return;
                };
                if let Some(response) = control.on_indication(data) {
                    self.emit(EventSource::ControlPoint, FtmsEvent::ControlCompleted(response));
                }
            }
        }
    }

    /// Fail the pending control request and tell the consumer
    pub fn on_disconnect(&mut self) {
        info!("{} disconnected", self.machine_type);
        self.drop_partial();
        if let Some(control) = &self.control {
            control.on_disconnect();
        }
        self.emit(EventSource::Transport, FtmsEvent::Disconnected);
    }

    /// Consume transport events until a disconnect or the channel closes
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Notification {
                    characteristic,
                    value,
                } => self.on_raw_notification(characteristic, &value).await,
                TransportEvent::Disconnected => {
                    self.on_disconnect();
                    return;
                }
            }
        }
        debug!("Transport event channel closed");
    }

    /// Hold fragments back until the machine clears More Data
    async fn on_data_record(&mut self, record: DataRecord) {
        let record = match self.partial.take() {
            Some(mut partial) => {
                if let (Some(head), Some(next)) = (partial.realtime_mut(), record.realtime()) {
                    head.extend(next);
                }
                partial
            }
            None => record,
        };
        self.fragments += 1;

        if record.realtime().is_some_and(|data| data.more_data) {
            if self.fragments < MAX_RECORD_FRAGMENTS {
                trace!("Buffering {} data fragment {}", self.machine_type, self.fragments);
                self.partial = Some(record);
                return;
            }
            warn!(
                "{} record still incomplete after {} notifications, applying it",
                self.machine_type, self.fragments
            );
        }

        self.fragments = 0;
        self.merge(EventSource::Data, &record).await;
    }

    fn drop_partial(&mut self) {
        if self.partial.take().is_some() {
            debug!("Discarding {} buffered data fragment(s)", self.fragments);
        }
        self.fragments = 0;
    }

    async fn merge(&mut self, source: EventSource, record: &DataRecord) {
        let (snapshot, changed) = {
            let mut snapshot = self.snapshot.write().await;
            let changed = snapshot.apply(record, &self.capabilities);
            (snapshot.clone(), changed)
        };

        self.emit(source, FtmsEvent::PropertiesUpdated { snapshot, changed });
    }

    fn decode_failed(
        &mut self,
        source: EventSource,
        characteristic: Uuid,
        data: &[u8],
        error: FtmsError,
    ) {
        warn!(
            "Failed to decode {:?} notification {:02X?}: {}",
            source, data, error
        );
        self.emit(
            source,
            FtmsEvent::DecodeFailed {
                characteristic,
                error,
            },
        );
    }

    fn emit(&mut self, source: EventSource, event: FtmsEvent) {
        self.sequence += 1;
        let dispatched = DispatchedEvent {
            sequence: self.sequence,
            source,
            event,
        };
        if self.events.send(dispatched).is_err() {
            debug!("Event receiver dropped");
        }
    }
}
