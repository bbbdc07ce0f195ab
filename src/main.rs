//! meshlink daemon
//!
//! Runs one mesh node on the host Bluetooth adapter: logs the devices it
//! hears, prints chat frames and saves received files until Ctrl+C.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use meshlink::message::parse_chat_frame;
use meshlink::{
    BluetoothMeshService, BtleTransport, DeviceRecord, DownloadSink, FileStore, IdentityStore,
    MeshConfig, MeshEventHandler,
};

const DEFAULT_CONFIG_PATH: &str = "meshlink.json";

struct DaemonHandler {
    downloads: DownloadSink,
}

#[async_trait]
impl MeshEventHandler for DaemonHandler {
    async fn on_device(&self, record: DeviceRecord) -> Result<()> {
        match record.payload_text().filter(|text| !text.is_empty()) {
            Some(text) => info!(
                "{} [{}] {} ttl={} rssi={}: {}",
                record.origin_hex(),
                record.address,
                record.name,
                record.ttl,
                record.rssi,
                text
            ),
            None => info!(
                "{} [{}] {} ttl={} rssi={}",
                record.origin_hex(),
                record.address,
                record.name,
                record.ttl,
                record.rssi
            ),
        }
        Ok(())
    }

    async fn on_frame(&self, frame: Vec<u8>) -> Result<()> {
        if self.downloads.accepts(&frame) {
            self.downloads.on_receive_frame(&frame).await?;
            return Ok(());
        }

        match parse_chat_frame(&frame) {
            Ok(message) => info!("<{}> {}", message.sender, message.text),
            Err(e) => warn!("Dropping {} byte frame: {}", frame.len(), e),
        }
        Ok(())
    }
}

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MESHLINK_CONFIG").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    info!("=== meshlink: Bluetooth LE mesh messaging ===");

    let path = config_path();
    let config = MeshConfig::load(Some(&path))
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    info!("Node {} with configuration: {}", config.device_name, config.to_json());

    let identity = Arc::new(IdentityStore::new(Arc::new(FileStore::new(&config.state_dir))));
    let transport = BtleTransport::new(config.vendor_code)
        .await
        .context("Failed to open Bluetooth adapter")?;
    let handler = Arc::new(DaemonHandler {
        downloads: DownloadSink::new(&config.download_dir),
    });

    let service = BluetoothMeshService::new(config, Arc::new(transport), identity, handler);
    service.start().await?;
    info!("Status: {}", service.get_status().await);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    service.stop().await;
    info!("Known devices at shutdown: {}", service.get_known_devices().len());
    Ok(())
}
