use crate::{
    ble::{Characteristics, Transport, TransportEvent},
    capability::CapabilitySet,
    control::{ControlAccess, ControlPoint},
    dispatcher::{DispatchedEvent, EventDispatcher, PropertySnapshot},
    error::{FtmsError, Result},
    protocol::{ControlOpCode, ControlRequest, ControlResponse},
    records::{self, Property},
    types::{
        EngineConfig, IndoorBikeSimulation, MachineType, SpinDownControlCode, SpinDownSpeeds,
        StopPauseCode,
    },
};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Session with one connected fitness machine
///
/// `FitnessMachine` negotiates capabilities once at startup, subscribes to the
/// machine's characteristics and runs an event dispatcher in the background.
/// Commands go through the control point one at a time; every setter is
/// checked against the advertised capabilities before anything is written.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use ftms_engine::{
///     BtleplugTransport, Characteristics, EngineConfig, FitnessMachine, MachineType, Property,
/// };
///
/// # async fn run(peripheral: btleplug::platform::Peripheral) -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(BtleplugTransport::new(peripheral).await?);
/// let characteristics =
///     Characteristics::standard(MachineType::IndoorBike).retain_available(&transport.available());
///
/// let (bike, mut events) = FitnessMachine::connect(
///     transport,
///     MachineType::IndoorBike,
///     characteristics,
///     EngineConfig::default(),
/// )
/// .await?;
///
/// bike.set_target_power(200).await?;
///
/// while let Some(event) = events.recv().await {
///     println!("#{} {:?}", event.sequence, event.event);
/// }
///
/// let power = bike.snapshot().await.get(Property::InstantaneousPower);
/// println!("Last power: {power:?}");
/// # Ok(())
/// # }
/// ```
pub struct FitnessMachine {
    machine_type: MachineType,
    characteristics: Characteristics,
    capabilities: Arc<CapabilitySet>,
    control: Option<Arc<ControlPoint>>,
    snapshot: Arc<RwLock<PropertySnapshot>>,
    config: EngineConfig,
    dispatcher: JoinHandle<()>,
}

impl FitnessMachine {
    /// Negotiate capabilities, subscribe and start dispatching events
    ///
    /// Reads the Feature characteristic and every range characteristic in
    /// `characteristics`, builds the capability set, registers for disconnects,
    /// subscribes to the data, status and control point characteristics and,
    /// if configured, reads Training Status once. Returns the session and the
    /// receiver for its ordered event stream.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::MalformedCapability`] if the feature or range data
    /// cannot be interpreted, or any transport error raised while reading the
    /// feature characteristic or subscribing.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        machine_type: MachineType,
        characteristics: Characteristics,
        config: EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatchedEvent>)> {
        info!("Negotiating capabilities with {}", machine_type);

        let feature = transport.read(characteristics.feature).await?;
        let mut ranges = HashMap::new();
        let mut range_failures = Vec::new();
        for (kind, uuid) in &characteristics.ranges {
            match transport.read(*uuid).await {
                Ok(value) => {
                    ranges.insert(*kind, value);
                }
                Err(e) => {
                    warn!("Could not read {} range: {}", kind, e);
                    range_failures.push(format!("{kind} range read failed: {e}"));
                }
            }
        }
        let capabilities = CapabilitySet::build(&feature, &ranges).map_err(|e| match e {
            FtmsError::MalformedCapability(reason) if !range_failures.is_empty() => {
                FtmsError::MalformedCapability(format!("{reason} ({})", range_failures.join("; ")))
            }
            other => other,
        })?;
        let capabilities = Arc::new(capabilities);

        let control = characteristics.control_point.map(|uuid| {
            Arc::new(ControlPoint::new(
                Arc::clone(&transport),
                uuid,
                Arc::clone(&capabilities),
                config.control_timeout(),
            ))
        });
        if control.is_none() {
            warn!("{} has no control point, commands are unavailable", machine_type);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = EventDispatcher::new(
            machine_type,
            &characteristics,
            Arc::clone(&capabilities),
            control.clone(),
            events_tx,
        );
        let snapshot = dispatcher.snapshot_handle();

        transport.on_disconnect(inbound_tx.clone()).await?;
        for uuid in characteristics.subscriptions() {
            transport.subscribe(uuid, inbound_tx.clone()).await?;
        }

        if config.read_initial_training_status {
            if let Some(uuid) = characteristics.training_status {
                match transport.read(uuid).await {
                    Ok(value) => {
                        let _ = inbound_tx.send(TransportEvent::Notification {
                            characteristic: uuid,
                            value,
                        });
                    }
                    Err(e) => warn!("Initial training status read failed: {}", e),
                }
            }
        }

        let dispatcher = tokio::spawn(dispatcher.run(inbound_rx));
        info!(
            "{} ready: features={:?} settings={:?}",
            machine_type,
            capabilities.features(),
            capabilities.settings()
        );

        Ok((
            Self {
                machine_type,
                characteristics,
                capabilities,
                control,
                snapshot,
                config,
                dispatcher,
            },
            events_rx,
        ))
    }

    /// Machine class of this session
    #[must_use]
    pub const fn machine_type(&self) -> MachineType {
        self.machine_type
    }

    /// Characteristics the session was started with
    #[must_use]
    pub const fn characteristics(&self) -> &Characteristics {
        &self.characteristics
    }

    /// Capabilities negotiated at startup
    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Engine configuration
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Copy of the latest property snapshot
    pub async fn snapshot(&self) -> PropertySnapshot {
        self.snapshot.read().await.clone()
    }

    /// Properties this machine class reports that the machine advertises
    #[must_use]
    pub fn supported_properties(&self) -> Vec<Property> {
        records::class_properties(self.machine_type)
            .filter(|property| property.is_supported_by(&self.capabilities))
            .collect()
    }

    /// Control access, `None` without a control point
    #[must_use]
    pub fn control_access(&self) -> Option<ControlAccess> {
        self.control.as_ref().map(|control| control.access())
    }

    /// Whether the event dispatcher is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.dispatcher.is_finished()
    }

    fn control_point(&self) -> Result<&ControlPoint> {
        self.control
            .as_deref()
            .ok_or_else(|| FtmsError::NotSupported("fitness machine control point".to_string()))
    }

    /// Submit any control request
    ///
    /// With `auto_request_control` enabled, Request Control is sent first
    /// whenever control is not known to be granted.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotSupported`] without a control point, plus every
    /// error of [`ControlPoint::submit`] for either request.
    pub async fn execute(&self, request: ControlRequest) -> Result<ControlResponse> {
        let control = self.control_point()?;

        if self.config.auto_request_control
            && request.op_code() != ControlOpCode::RequestControl
            && control.access() != ControlAccess::Granted
        {
            request.validate(&self.capabilities)?;
            info!("Requesting control before {}", request.op_code());
            control.submit(ControlRequest::RequestControl).await?;
        }

        control.submit(request).await
    }

    /// Request control of the machine
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn request_control(&self) -> Result<()> {
        self.execute(ControlRequest::RequestControl).await?;
        Ok(())
    }

    /// Reset the machine; control must be requested again afterwards
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting {}", self.machine_type);
        self.execute(ControlRequest::Reset).await?;
        Ok(())
    }

    /// Start or resume the workout
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn start_or_resume(&self) -> Result<()> {
        info!("Starting workout");
        self.execute(ControlRequest::StartOrResume).await?;
        Ok(())
    }

    /// Stop the workout
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping workout");
        self.execute(ControlRequest::StopOrPause(StopPauseCode::Stop))
            .await?;
        Ok(())
    }

    /// Pause the workout
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn pause(&self) -> Result<()> {
        info!("Pausing workout");
        self.execute(ControlRequest::StopOrPause(StopPauseCode::Pause))
            .await?;
        Ok(())
    }

    /// Set the target speed in km/h
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if the speed is outside the advertised
    /// range, plus the errors of [`FitnessMachine::execute`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use ftms_engine::FitnessMachine;
    /// # async fn run(treadmill: &FitnessMachine) -> ftms_engine::Result<()> {
    /// treadmill.set_target_speed(8.5).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn set_target_speed(&self, speed: f64) -> Result<()> {
        info!("Setting target speed to {:.2} km/h", speed);
        self.execute(ControlRequest::SetTargetSpeed(speed)).await?;
        Ok(())
    }

    /// Set the target inclination in percent
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if the value is outside the advertised
    /// range, plus the errors of [`FitnessMachine::execute`].
    pub async fn set_target_inclination(&self, inclination: f64) -> Result<()> {
        info!("Setting target inclination to {:.1}%", inclination);
        self.execute(ControlRequest::SetTargetInclination(inclination))
            .await?;
        Ok(())
    }

    /// Set the target resistance level
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if the value is outside the advertised
    /// range, plus the errors of [`FitnessMachine::execute`].
    pub async fn set_target_resistance(&self, level: f64) -> Result<()> {
        info!("Setting target resistance to {:.1}", level);
        self.execute(ControlRequest::SetTargetResistance(level))
            .await?;
        Ok(())
    }

    /// Set the target power in watts
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if the value is outside the advertised
    /// range, plus the errors of [`FitnessMachine::execute`].
    pub async fn set_target_power(&self, watts: i16) -> Result<()> {
        info!("Setting target power to {} W", watts);
        self.execute(ControlRequest::SetTargetPower(watts)).await?;
        Ok(())
    }

    /// Set the target heart rate in bpm
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::OutOfRange`] if the value is outside the advertised
    /// range, plus the errors of [`FitnessMachine::execute`].
    pub async fn set_target_heart_rate(&self, bpm: u8) -> Result<()> {
        info!("Setting target heart rate to {} bpm", bpm);
        self.execute(ControlRequest::SetTargetHeartRate(bpm))
            .await?;
        Ok(())
    }

    /// Set the targeted expended energy in kcal
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn set_targeted_energy(&self, kcal: u16) -> Result<()> {
        self.execute(ControlRequest::SetTargetedEnergy(kcal)).await?;
        Ok(())
    }

    /// Set the targeted number of steps
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn set_targeted_steps(&self, steps: u16) -> Result<()> {
        self.execute(ControlRequest::SetTargetedSteps(steps)).await?;
        Ok(())
    }

    /// Set the targeted number of strides
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn set_targeted_strides(&self, strides: u16) -> Result<()> {
        self.execute(ControlRequest::SetTargetedStrides(strides))
            .await?;
        Ok(())
    }

    /// Set the targeted distance in meters
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] above 16 777 215 m, plus the
    /// errors of [`FitnessMachine::execute`].
    pub async fn set_targeted_distance(&self, meters: u32) -> Result<()> {
        self.execute(ControlRequest::SetTargetedDistance(meters))
            .await?;
        Ok(())
    }

    /// Set the targeted training time in seconds
    ///
    /// One value sets the total time. Two, three or five values set the time
    /// per heart rate zone.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidParameters`] for any other number of values,
    /// plus the errors of [`FitnessMachine::execute`].
    pub async fn set_targeted_time(&self, seconds: &[u16]) -> Result<()> {
        let request = match *seconds {
            [total] => ControlRequest::SetTargetedTime(total),
            [a, b] => ControlRequest::SetTargetedTimeTwoZones([a, b]),
            [a, b, c] => ControlRequest::SetTargetedTimeThreeZones([a, b, c]),
            [a, b, c, d, e] => ControlRequest::SetTargetedTimeFiveZones([a, b, c, d, e]),
            _ => {
                return Err(FtmsError::InvalidParameters(format!(
                    "Targeted time takes 1, 2, 3 or 5 values, got {}",
                    seconds.len()
                )))
            }
        };
        self.execute(request).await?;
        Ok(())
    }

    /// Set indoor bike simulation parameters
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::ValueOutOfRange`] if a parameter does not fit its
    /// field, plus the errors of [`FitnessMachine::execute`].
    pub async fn set_indoor_bike_simulation(&self, simulation: IndoorBikeSimulation) -> Result<()> {
        debug!("Setting simulation parameters {:?}", simulation);
        self.execute(ControlRequest::SetIndoorBikeSimulation(simulation))
            .await?;
        Ok(())
    }

    /// Set the wheel circumference in millimeters
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn set_wheel_circumference(&self, millimeters: f64) -> Result<()> {
        self.execute(ControlRequest::SetWheelCircumference(millimeters))
            .await?;
        Ok(())
    }

    /// Start or ignore a spin down
    ///
    /// A successful start returns the target speed window the user should
    /// reach before coasting.
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn spin_down(&self, code: SpinDownControlCode) -> Result<Option<SpinDownSpeeds>> {
        info!("Spin down control: {:?}", code);
        let response = self.execute(ControlRequest::SpinDownControl(code)).await?;
        Ok(response.spin_down_speeds())
    }

    /// Set the targeted cadence in rpm
    ///
    /// # Errors
    ///
    /// See [`FitnessMachine::execute`].
    pub async fn set_targeted_cadence(&self, rpm: f64) -> Result<()> {
        self.execute(ControlRequest::SetTargetedCadence(rpm))
            .await?;
        Ok(())
    }
}

impl Drop for FitnessMachine {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ble::testing::MockTransport,
        capability::{MachineFeatures, TargetSettings},
        dispatcher::FtmsEvent,
        types::TrainingStatusCode,
        CONTROL_POINT_UUID, FEATURE_UUID, INDOOR_BIKE_DATA_UUID, POWER_RANGE_UUID,
        TRAINING_STATUS_UUID,
    };

    fn bike_transport() -> Arc<MockTransport> {
        let features = MachineFeatures::AVERAGE_SPEED | MachineFeatures::POWER_MEASUREMENT;
        let settings = TargetSettings::POWER | TargetSettings::TARGETED_TRAINING_TIME;
        let mut feature = features.bits().to_le_bytes().to_vec();
        feature.extend_from_slice(&settings.bits().to_le_bytes());

        Arc::new(
            MockTransport::default()
                .with_value(FEATURE_UUID, feature)
                // 0 .. 1000 W, step 5
                .with_value(POWER_RANGE_UUID, vec![0x00, 0x00, 0xE8, 0x03, 0x05, 0x00])
                .with_value(TRAINING_STATUS_UUID, vec![0x00, 0x01]),
        )
    }

    async fn connect(
        transport: &Arc<MockTransport>,
    ) -> (FitnessMachine, mpsc::UnboundedReceiver<DispatchedEvent>) {
        FitnessMachine::connect(
            Arc::clone(transport) as Arc<dyn Transport>,
            MachineType::IndoorBike,
            Characteristics::standard(MachineType::IndoorBike),
            EngineConfig {
                control_timeout_ms: 500,
                ..EngineConfig::default()
            },
        )
        .await
        .unwrap()
    }

    fn auto_responder(transport: &Arc<MockTransport>, result: u8) -> JoinHandle<()> {
        let mut writes = transport.write_listener();
        let transport = Arc::clone(transport);
        tokio::spawn(async move {
            while let Some((_, data)) = writes.recv().await {
                transport.notify(CONTROL_POINT_UUID, &[0x80, data[0], result]);
            }
        })
    }

    #[tokio::test]
    async fn test_connect_negotiates_and_subscribes() {
        let transport = bike_transport();
        let (bike, mut events) = connect(&transport).await;

        assert!(transport.is_subscribed(INDOOR_BIKE_DATA_UUID));
        assert!(transport.is_subscribed(CONTROL_POINT_UUID));
        assert_eq!(bike.machine_type(), MachineType::IndoorBike);
        assert_eq!(bike.capabilities().range(crate::SettingKind::Power).unwrap().max, 1000.0);
        assert_eq!(
            bike.supported_properties(),
            vec![
                Property::InstantaneousSpeed,
                Property::AverageSpeed,
                Property::InstantaneousPower,
                Property::AveragePower
            ]
        );
        assert_eq!(bike.control_access(), Some(ControlAccess::Unknown));
        assert!(bike.is_running());

        let event = events.recv().await.unwrap();
        assert!(matches!(event.event, FtmsEvent::PropertiesUpdated { .. }));
        assert_eq!(
            bike.snapshot().await.training_status,
            Some(TrainingStatusCode::Idle)
        );
    }

    #[tokio::test]
    async fn test_malformed_feature_fails_connect() {
        let transport = Arc::new(MockTransport::default().with_value(FEATURE_UUID, vec![0x00; 4]));
        let result = FitnessMachine::connect(
            transport,
            MachineType::Rower,
            Characteristics::standard(MachineType::Rower),
            EngineConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(FtmsError::MalformedCapability(_))));
    }

    #[tokio::test]
    async fn test_unreadable_range_is_named_in_error() {
        let settings = TargetSettings::POWER;
        let mut feature = 0u32.to_le_bytes().to_vec();
        feature.extend_from_slice(&settings.bits().to_le_bytes());
        let transport = Arc::new(MockTransport::default().with_value(FEATURE_UUID, feature));

        let result = FitnessMachine::connect(
            transport,
            MachineType::IndoorBike,
            Characteristics::standard(MachineType::IndoorBike),
            EngineConfig::default(),
        )
        .await;

        let Err(FtmsError::MalformedCapability(reason)) = result else {
            panic!("expected malformed capability");
        };
        assert!(reason.contains("without a range"), "{reason}");
        assert!(reason.contains("range read failed"), "{reason}");
        assert!(reason.contains(&POWER_RANGE_UUID.to_string()), "{reason}");
    }

    #[tokio::test]
    async fn test_setter_requests_control_first() {
        let transport = bike_transport();
        let (bike, _events) = connect(&transport).await;
        let responder = auto_responder(&transport, 0x01);

        bike.set_target_power(250).await.unwrap();
        assert_eq!(bike.control_access(), Some(ControlAccess::Granted));

        bike.set_target_power(300).await.unwrap();

        let writes: Vec<Vec<u8>> = transport.writes().into_iter().map(|(_, data)| data).collect();
        assert_eq!(
            writes,
            vec![vec![0x00], vec![0x05, 0xFA, 0x00], vec![0x05, 0x2C, 0x01]]
        );
        responder.abort();
    }

    #[tokio::test]
    async fn test_unsupported_setter_writes_nothing() {
        let transport = bike_transport();
        let (bike, _events) = connect(&transport).await;

        assert!(matches!(
            bike.set_target_speed(10.0).await,
            Err(FtmsError::NotSupported(_))
        ));
        assert!(matches!(
            bike.set_target_power(1200).await,
            Err(FtmsError::OutOfRange { .. })
        ));
        assert!(matches!(
            bike.set_targeted_time(&[60, 60, 60, 60]).await,
            Err(FtmsError::InvalidParameters(_))
        ));
        assert!(transport.writes().is_empty());
    }

    #[tokio::test]
    async fn test_targeted_time_zones() {
        let transport = bike_transport();
        let (bike, _events) = connect(&transport).await;
        let responder = auto_responder(&transport, 0x01);

        bike.set_targeted_time(&[1800]).await.unwrap();
        assert_eq!(transport.writes().last().unwrap().1, vec![0x0D, 0x08, 0x07]);

        // two zones are not advertised
        assert!(matches!(
            bike.set_targeted_time(&[600, 600]).await,
            Err(FtmsError::NotSupported(_))
        ));
        responder.abort();
    }

    #[tokio::test]
    async fn test_no_control_point() {
        let transport = bike_transport();
        let mut characteristics = Characteristics::standard(MachineType::IndoorBike);
        characteristics.control_point = None;

        let (bike, _events) = FitnessMachine::connect(
            Arc::clone(&transport) as Arc<dyn Transport>,
            MachineType::IndoorBike,
            characteristics,
            EngineConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(bike.control_access(), None);
        assert!(matches!(
            bike.start_or_resume().await,
            Err(FtmsError::NotSupported(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_is_reported() {
        let transport = bike_transport();
        let (bike, mut events) = connect(&transport).await;

        // initial training status
        events.recv().await.unwrap();
        transport.disconnect();

        let event = events.recv().await.unwrap();
        assert!(matches!(event.event, FtmsEvent::Disconnected));
        assert_eq!(bike.control_access(), Some(ControlAccess::Revoked));
    }
}
