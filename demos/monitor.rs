use btleplug::{
    api::{Central, Manager as _, Peripheral as _, ScanFilter},
    platform::Manager,
};
use ftms_engine::{
    BtleplugTransport, Characteristics, EngineConfig, FitnessMachine, FtmsError, FtmsEvent,
    MachineType, Result, Transport, FTMS_SERVICE_UUID,
};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🚴 FTMS Monitor Example");
    info!("Scanning for fitness machines...");

    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    let central = adapters
        .into_iter()
        .next()
        .ok_or_else(|| FtmsError::Transport("No Bluetooth adapter found".to_string()))?;

    central
        .start_scan(ScanFilter {
            services: vec![FTMS_SERVICE_UUID],
        })
        .await?;
    sleep(Duration::from_secs(5)).await;
    central.stop_scan().await?;

    let peripheral = central
        .peripherals()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| FtmsError::Transport("No fitness machine found".to_string()))?;

    peripheral.connect().await?;
    peripheral.discover_services().await?;
    info!("✅ Connected to {}", peripheral.address());

    let transport = Arc::new(BtleplugTransport::new(peripheral).await?);
    let available = transport.available();

    let Some(machine_type) = available
        .iter()
        .find_map(|uuid| MachineType::from_data_characteristic(*uuid))
    else {
        error!("❌ Device exposes no supported data characteristic");
        transport.disconnect().await?;
        return Ok(());
    };
    info!("📋 Machine type: {}", machine_type);

    let characteristics = Characteristics::standard(machine_type).retain_available(&available);
    let (machine, mut events) = FitnessMachine::connect(
        Arc::clone(&transport) as Arc<dyn Transport>,
        machine_type,
        characteristics,
        EngineConfig::default(),
    )
    .await?;

    info!("📊 Tracked properties:");
    for property in machine.supported_properties() {
        info!("  {}", property);
    }

    while let Some(dispatched) = events.recv().await {
        match dispatched.event {
            FtmsEvent::PropertiesUpdated { snapshot, .. } => {
                info!("#{} {}", dispatched.sequence, snapshot);
            }
            FtmsEvent::StatusChanged(status) => {
                info!("#{} status: {:?}", dispatched.sequence, status);
            }
            FtmsEvent::ControlCompleted(response) => {
                info!(
                    "#{} control op {:#04x}: {:?}",
                    dispatched.sequence, response.request_op, response.result
                );
            }
            FtmsEvent::DecodeFailed {
                characteristic,
                error,
            } => {
                warn!(
                    "#{} bad notification from {}: {}",
                    dispatched.sequence, characteristic, error
                );
            }
            FtmsEvent::Disconnected => {
                warn!("⚠️ Disconnected");
                break;
            }
        }
    }

    Ok(())
}
