use async_trait::async_trait;
use btleplug::{
    api::{Characteristic, Peripheral as _, WriteType},
    platform::Peripheral,
};
use futures::stream::StreamExt;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    capability::SettingKind,
    error::{FtmsError, Result},
    types::MachineType,
    CONTROL_POINT_UUID, FEATURE_UUID, HEART_RATE_RANGE_UUID, INCLINATION_RANGE_UUID,
    MACHINE_STATUS_UUID, POWER_RANGE_UUID, RESISTANCE_RANGE_UUID, SPEED_RANGE_UUID,
    TRAINING_STATUS_UUID,
};

/// Something the transport pushes into the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A characteristic value changed (notification or indication)
    Notification {
        /// Characteristic that changed
        characteristic: Uuid,
        /// New value
        value: Vec<u8>,
    },
    /// The link to the machine is gone
    Disconnected,
}

/// GATT operations the engine needs from a connected machine
///
/// Connection management and discovery happen before the engine is handed a
/// transport. Every notification for subscribed characteristics must be sent
/// into the sink in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Enable notifications or indications and deliver them to `sink`
    async fn subscribe(
        &self,
        characteristic: Uuid,
        sink: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()>;

    /// Write a characteristic value
    async fn write(&self, characteristic: Uuid, data: &[u8], expect_response: bool) -> Result<()>;

    /// Deliver [`TransportEvent::Disconnected`] to `sink` when the link drops
    async fn on_disconnect(&self, sink: mpsc::UnboundedSender<TransportEvent>) -> Result<()>;
}

/// Resolved characteristic identities for one machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Characteristics {
    /// Fitness Machine Feature
    pub feature: Uuid,
    /// Supported range characteristics that exist on the machine
    pub ranges: HashMap<SettingKind, Uuid>,
    /// Data characteristic for the machine class
    pub data: Uuid,
    /// Training Status, if present
    pub training_status: Option<Uuid>,
    /// Fitness Machine Status, if present
    pub machine_status: Option<Uuid>,
    /// Fitness Machine Control Point, if present
    pub control_point: Option<Uuid>,
}

impl Characteristics {
    /// Bluetooth SIG assigned characteristics for a machine class
    #[must_use]
    pub fn standard(machine_type: MachineType) -> Self {
        let ranges = SettingKind::ALL
            .into_iter()
            .map(|kind| (kind, range_characteristic(kind)))
            .collect();

        Self {
            feature: FEATURE_UUID,
            ranges,
            data: machine_type.data_characteristic(),
            training_status: Some(TRAINING_STATUS_UUID),
            machine_status: Some(MACHINE_STATUS_UUID),
            control_point: Some(CONTROL_POINT_UUID),
        }
    }

    /// Keep only characteristics the peripheral actually exposes
    #[must_use]
    pub fn retain_available(mut self, available: &[Uuid]) -> Self {
        self.ranges.retain(|_, uuid| available.contains(uuid));
        for optional in [
            &mut self.training_status,
            &mut self.machine_status,
            &mut self.control_point,
        ] {
            if optional.is_some_and(|uuid| !available.contains(&uuid)) {
                *optional = None;
            }
        }
        self
    }

    /// Characteristics the engine subscribes to, data first
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Uuid> {
        std::iter::once(self.data)
            .chain(self.training_status)
            .chain(self.machine_status)
            .chain(self.control_point)
            .collect()
    }
}

/// Standard range characteristic for a setting
#[must_use]
pub const fn range_characteristic(kind: SettingKind) -> Uuid {
    match kind {
        SettingKind::Speed => SPEED_RANGE_UUID,
        SettingKind::Inclination => INCLINATION_RANGE_UUID,
        SettingKind::Resistance => RESISTANCE_RANGE_UUID,
        SettingKind::Power => POWER_RANGE_UUID,
        SettingKind::HeartRate => HEART_RATE_RANGE_UUID,
    }
}

type SinkMap = Arc<StdMutex<HashMap<Uuid, mpsc::UnboundedSender<TransportEvent>>>>;
type DisconnectSinks = Arc<StdMutex<Vec<mpsc::UnboundedSender<TransportEvent>>>>;

/// [`Transport`] over a connected btleplug peripheral
///
/// All notifications are read from the peripheral's single notification
/// stream by one task, so arrival order is kept across characteristics. The
/// end of that stream is reported as a disconnect.
pub struct BtleplugTransport {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    sinks: SinkMap,
    disconnect_sinks: DisconnectSinks,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Wrap a peripheral that is connected and has had its services discovered
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::Ble`] if the notification stream cannot be opened.
    pub async fn new(peripheral: Peripheral) -> Result<Self> {
        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .map(|characteristic| (characteristic.uuid, characteristic))
            .collect();
        debug!(
            "Peripheral {} exposes {} characteristic(s)",
            peripheral.address(),
            characteristics.len()
        );

        let sinks: SinkMap = Arc::default();
        let disconnect_sinks: DisconnectSinks = Arc::default();

        let mut notifications = peripheral.notifications().await?;
        let pump_sinks = Arc::clone(&sinks);
        let pump_disconnect = Arc::clone(&disconnect_sinks);
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification {}: {:02X?}",
                    notification.uuid,
                    notification.value
                );
                let sink = pump_sinks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&notification.uuid)
                    .cloned();
                match sink {
                    Some(sink) => {
                        let _ = sink.send(TransportEvent::Notification {
                            characteristic: notification.uuid,
                            value: notification.value,
                        });
                    }
                    None => debug!("Unrouted notification from {}", notification.uuid),
                }
            }

            info!("Notification stream ended");
            for sink in pump_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain(..)
            {
                let _ = sink.send(TransportEvent::Disconnected);
            }
        });

        Ok(Self {
            peripheral,
            characteristics,
            sinks,
            disconnect_sinks,
            pump: Mutex::new(Some(pump)),
        })
    }

    /// UUIDs of every characteristic the peripheral exposes
    #[must_use]
    pub fn available(&self) -> Vec<Uuid> {
        self.characteristics.keys().copied().collect()
    }

    /// Underlying peripheral
    #[must_use]
    pub const fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Stop the notification pump and disconnect
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::Ble`] if disconnection fails.
    pub async fn disconnect(&self) -> Result<()> {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or(FtmsError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let characteristic = self.characteristic(characteristic)?;
        let value = self.peripheral.read(characteristic).await?;
        debug!("Read {}: {:02X?}", characteristic.uuid, value);
        Ok(value)
    }

    async fn subscribe(
        &self,
        characteristic: Uuid,
        sink: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(characteristic.uuid, sink);
        self.peripheral.subscribe(characteristic).await?;
        debug!("Subscribed to {}", characteristic.uuid);
        Ok(())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], expect_response: bool) -> Result<()> {
        let characteristic = self.characteristic(characteristic)?;
        let write_type = if expect_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(|e| FtmsError::Transport(format!("Write to {} failed: {e}", characteristic.uuid)))
    }

    async fn on_disconnect(&self, sink: mpsc::UnboundedSender<TransportEvent>) -> Result<()> {
        let finished = self
            .pump
            .lock()
            .await
            .as_ref()
            .is_none_or(JoinHandle::is_finished);
        if finished {
            warn!("Notification stream already closed");
            let _ = sink.send(TransportEvent::Disconnected);
            return Ok(());
        }
        self.disconnect_sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_characteristics() {
        let characteristics = Characteristics::standard(MachineType::Treadmill);

        assert_eq!(characteristics.feature, FEATURE_UUID);
        assert_eq!(characteristics.data, crate::TREADMILL_DATA_UUID);
        assert_eq!(characteristics.ranges.len(), 5);
        assert_eq!(
            characteristics.ranges.get(&SettingKind::Speed),
            Some(&SPEED_RANGE_UUID)
        );
        assert_eq!(
            characteristics.subscriptions(),
            vec![
                crate::TREADMILL_DATA_UUID,
                TRAINING_STATUS_UUID,
                MACHINE_STATUS_UUID,
                CONTROL_POINT_UUID
            ]
        );
    }

    #[test]
    fn test_retain_available() {
        let characteristics = Characteristics::standard(MachineType::IndoorBike).retain_available(&[
            FEATURE_UUID,
            crate::INDOOR_BIKE_DATA_UUID,
            POWER_RANGE_UUID,
            CONTROL_POINT_UUID,
        ]);

        assert_eq!(characteristics.ranges.len(), 1);
        assert!(characteristics.ranges.contains_key(&SettingKind::Power));
        assert!(characteristics.training_status.is_none());
        assert!(characteristics.machine_status.is_none());
        assert_eq!(characteristics.control_point, Some(CONTROL_POINT_UUID));
    }

    #[test]
    fn test_uuid_assignments() {
        assert_eq!(
            FEATURE_UUID.to_string(),
            "00002acc-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            range_characteristic(SettingKind::HeartRate).to_string(),
            "00002ad7-0000-1000-8000-00805f9b34fb"
        );
    }

    #[tokio::test]
    async fn test_mock_transport_routes_notifications() {
        let transport = testing::MockTransport::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        transport.subscribe(FEATURE_UUID, tx.clone()).await.unwrap();
        transport.on_disconnect(tx).await.unwrap();
        transport.notify(FEATURE_UUID, &[0x01]);
        transport.disconnect();

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Notification {
                characteristic: FEATURE_UUID,
                value: vec![0x01]
            })
        );
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
    }
}
