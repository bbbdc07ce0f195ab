//! btleplug Radio
//!
//! Central-role transport on the host Bluetooth adapter. Discovery reports
//! both newly discovered devices and manufacturer-data changes of devices
//! already seen, so the directory stays push-driven. btleplug cannot act as a
//! peripheral, so advertising and hosting the write characteristic are
//! reported as unsupported.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use chrono::Utc;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::transport::{
    AdvertiseHandle, DeviceObservation, FrameSink, ObservationSink, RadioHandle, ScanHandle,
    ServerHandle, Transport, TransportError, UNKNOWN,
};

/// GATT service hosting the mesh write characteristic
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4d455348_0001_1000_8000_00805f9b34fb);

/// Write characteristic carrying point-to-point frames
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x4d455348_0002_1000_8000_00805f9b34fb);

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

fn radio_error(e: btleplug::Error) -> TransportError {
    TransportError::Radio(e.to_string())
}

/// Transport on the first Bluetooth adapter of the host
pub struct BtleTransport {
    adapter: Adapter,
    vendor_code: u16,
}

impl BtleTransport {
    pub async fn new(vendor_code: u16) -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(radio_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(radio_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapter)?;

        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => warn!("Could not read adapter info: {}", e),
        }

        Ok(Self {
            adapter,
            vendor_code,
        })
    }

    async fn find_peripheral(&self, address: &str) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await
            .map_err(radio_error)?
            .into_iter()
            .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            .ok_or_else(|| TransportError::PeerNotFound(address.to_string()))
    }

    async fn write_frames(
        &self,
        peripheral: &Peripheral,
        address: &str,
        frames: &[Vec<u8>],
    ) -> Result<(), TransportError> {
        let write_error = |reason: String| TransportError::Write {
            address: address.to_string(),
            reason,
        };

        peripheral
            .discover_services()
            .await
            .map_err(|e| write_error(e.to_string()))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == WRITE_CHARACTERISTIC_UUID)
            .ok_or_else(|| write_error("mesh write characteristic not found".to_string()))?;

        for frame in frames {
            peripheral
                .write(&characteristic, frame, WriteType::WithResponse)
                .await
                .map_err(|e| write_error(e.to_string()))?;
        }

        debug!("Wrote {} frames to {}", frames.len(), address);
        Ok(())
    }
}

/// Build an observation for a peripheral if it carries the mesh vendor slot
async fn observe(
    peripheral: &Peripheral,
    manufacturer_data: Option<HashMap<u16, Vec<u8>>>,
    vendor_code: u16,
) -> Option<DeviceObservation> {
    let properties: Option<PeripheralProperties> = match peripheral.properties().await {
        Ok(properties) => properties,
        Err(e) => {
            debug!("Could not read properties of {}: {}", peripheral.address(), e);
            None
        }
    };

    let manufacturer_data = manufacturer_data
        .or_else(|| properties.as_ref().map(|p| p.manufacturer_data.clone()))?;
    if !manufacturer_data.contains_key(&vendor_code) {
        return None;
    }

    let (name, rssi) = match &properties {
        Some(p) => (
            p.local_name.clone().unwrap_or_else(|| UNKNOWN.to_string()),
            p.rssi.map(i32::from).unwrap_or(0),
        ),
        None => (UNKNOWN.to_string(), 0),
    };

    Some(DeviceObservation {
        address: peripheral.address().to_string(),
        name,
        rssi,
        manufacturer_data,
        observed_at: Utc::now(),
    })
}

async fn observation_for_event(
    adapter: &Adapter,
    event: CentralEvent,
    vendor_code: u16,
) -> Option<DeviceObservation> {
    let (id, manufacturer_data) = match event {
        CentralEvent::DeviceDiscovered(id) => (id, None),
        CentralEvent::ManufacturerDataAdvertisement {
            id,
            manufacturer_data,
        } => (id, Some(manufacturer_data)),
        _ => return None,
    };

    let peripheral = adapter.peripheral(&id).await.ok()?;
    observe(&peripheral, manufacturer_data, vendor_code).await
}

#[async_trait]
impl Transport for BtleTransport {
    async fn scan(&self, sink: ObservationSink) -> Result<ScanHandle, TransportError> {
        let mut events = self.adapter.events().await.map_err(radio_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(radio_error)?;
        info!("Started BLE discovery (vendor code {:#06x})", self.vendor_code);

        // Devices the adapter already knows about
        for peripheral in self.adapter.peripherals().await.map_err(radio_error)? {
            if let Some(obs) = observe(&peripheral, None, self.vendor_code).await {
                sink.push(obs);
            }
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let adapter = self.adapter.clone();
        let vendor_code = self.vendor_code;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = events.next() => {
                        let Some(event) = event else { break };
                        if let Some(obs) = observation_for_event(&adapter, event, vendor_code).await {
                            sink.push(obs);
                        }
                    }
                }
            }

            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop BLE scan: {}", e);
            }
            info!("BLE discovery stopped");
        });

        Ok(RadioHandle::new("ble scan", move || {
            let _ = stop_tx.send(());
        }))
    }

    async fn advertise(&self, _payload: Vec<u8>) -> Result<AdvertiseHandle, TransportError> {
        Err(TransportError::Unsupported("advertising (central-only radio)"))
    }

    async fn register_receiver(&self, _sink: FrameSink) -> Result<ServerHandle, TransportError> {
        Err(TransportError::Unsupported("GATT server (central-only radio)"))
    }

    async fn send(&self, peer_address: &str, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let peripheral = self.find_peripheral(peer_address).await?;

        match tokio::time::timeout(CONNECTION_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => debug!("Connected to {}", peer_address),
            Ok(Err(e)) => {
                return Err(TransportError::Connect {
                    address: peer_address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(TransportError::Connect {
                    address: peer_address.to_string(),
                    reason: "connection timeout".to_string(),
                })
            }
        }

        let written = self.write_frames(&peripheral, peer_address, frames).await;

        let disconnected = peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::Disconnect {
                address: peer_address.to_string(),
                reason: e.to_string(),
            });

        // A write failure outranks a disconnect failure
        written?;
        disconnected
    }
}
