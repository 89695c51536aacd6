use crate::connection::LoopEvent;
use crate::transport::{DeviceId, TransportEvent};
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;

/// Stable key for a peripheral within one adapter session
pub fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId(format!("{:?}", id))
}

/// Streams advertisements into the event loop until the task is aborted.
///
/// No service filter is applied; the device session matches on the local name.
pub async fn run_scan(adapter: Adapter, loop_tx: UnboundedSender<LoopEvent>) {
    if let Err(e) = scan_with_btleplug(&adapter, &loop_tx).await {
        log::warn!("Scan failed: {}", e);
        let _ = loop_tx.send(LoopEvent::Transport(TransportEvent::ScanFailed(
            e.to_string(),
        )));
    }
}

async fn scan_with_btleplug(
    adapter: &Adapter,
    loop_tx: &UnboundedSender<LoopEvent>,
) -> Result<(), btleplug::Error> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    // Peripherals cached from an earlier scan won't be rediscovered
    for peripheral in adapter.peripherals().await? {
        report(&peripheral, loop_tx).await;
    }

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if let Ok(peripheral) = adapter.peripheral(&id).await {
                    report(&peripheral, loop_tx).await;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

async fn report(peripheral: &Peripheral, loop_tx: &UnboundedSender<LoopEvent>) {
    let local_name = match peripheral.properties().await {
        Ok(Some(props)) => props.local_name,
        _ => None,
    };
    log::debug!(
        "Found Device: Name: {:?}, Address: {}",
        local_name,
        peripheral.address()
    );
    let _ = loop_tx.send(LoopEvent::Transport(TransportEvent::Advertisement {
        device: device_id(&peripheral.id()),
        local_name,
    }));
}
