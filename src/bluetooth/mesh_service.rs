//! Bluetooth LE Mesh Service
//!
//! Wires a radio transport to the neighbor directory, the node identity and
//! the application handler. Radio callbacks only enqueue; one worker per
//! queue drains it, so a flood of events cannot spawn unbounded work.
//! Observations are dropped when their queue is full, frames wait for room.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::directory::{DeviceRecord, NeighborDirectory, OriginKey};
use super::protocol::{self, flags, OriginId};
use super::transport::{
    AdvertiseHandle, EventSink, ScanHandle, ServerHandle, Transport, TransportError,
};
use crate::config::MeshConfig;
use crate::identity::{IdentityStore, StoreError};
use crate::message::chat::encode_chat_frame;
use crate::transfer::prepare_transfer;

/// Application callbacks. Errors and panics are logged and contained.
#[async_trait]
pub trait MeshEventHandler: Send + Sync {
    /// A device record changed in the directory
    async fn on_device(&self, record: DeviceRecord) -> Result<()>;

    /// A point-to-point frame arrived
    async fn on_frame(&self, frame: Vec<u8>) -> Result<()> {
        debug!("Ignoring {} byte frame", frame.len());
        Ok(())
    }
}

/// Outcome of sending to one neighbor
pub type PeerResult = (String, Result<(), TransportError>);

struct Running {
    scan: ScanHandle,
    advertisement: Option<AdvertiseHandle>,
    server: Option<ServerHandle>,
    workers: Vec<JoinHandle<()>>,
}

/// Mesh node on top of a radio transport
pub struct BluetoothMeshService {
    config: MeshConfig,
    transport: Arc<dyn Transport>,
    directory: Arc<NeighborDirectory>,
    identity: Arc<IdentityStore>,
    handler: Arc<dyn MeshEventHandler>,
    running: Mutex<Option<Running>>,
}

async fn dispatch<F>(what: &'static str, handler_call: F)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(handler_call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("{} handler failed: {:#}", what, e),
        Err(_) => error!("{} handler panicked; continuing", what),
    }
}

impl BluetoothMeshService {
    pub fn new(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<IdentityStore>,
        handler: Arc<dyn MeshEventHandler>,
    ) -> Self {
        let directory = Arc::new(NeighborDirectory::new(config.vendor_code, config.direct_ttl));
        Self {
            config,
            transport,
            directory,
            identity,
            handler,
            running: Mutex::new(None),
        }
    }

    /// Start scanning, advertise presence and accept frames. No-op if running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let origin_id = self
            .identity
            .get_or_create_origin_id()
            .context("Failed to load origin id")?;
        info!("Starting mesh service as {}", hex::encode(origin_id));

        // Nothing is acquired yet, so a store failure leaves no radio state behind
        let presence = protocol::encode(
            flags::CHAT,
            self.identity
                .next_seqnum()
                .context("Failed to allocate presence sequence number")?,
            self.config.advertise_ttl,
            &origin_id,
            &[],
        );

        let (observation_sink, observation_rx) =
            EventSink::channel("observation", self.config.observation_queue);
        let (frame_sink, frame_rx) = EventSink::channel("frame", self.config.frame_queue);

        let workers = vec![
            self.spawn_observation_worker(observation_rx),
            self.spawn_frame_worker(frame_rx),
        ];

        let scan = match self.transport.scan(observation_sink).await {
            Ok(scan) => scan,
            Err(e) => {
                workers.iter().for_each(JoinHandle::abort);
                return Err(e).context("Failed to start scan");
            }
        };

        let advertisement = match self.transport.advertise(presence).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Presence advertisement unavailable: {}", e);
                None
            }
        };

        let server = match self.transport.register_receiver(frame_sink).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Point-to-point receiver unavailable: {}", e);
                None
            }
        };

        *running = Some(Running {
            scan,
            advertisement,
            server,
            workers,
        });

        info!("Mesh service started");
        Ok(())
    }

    /// Stop everything `start` acquired. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };

        info!("Stopping mesh service");
        running.scan.stop();
        if let Some(advertisement) = &running.advertisement {
            advertisement.stop();
        }
        if let Some(server) = &running.server {
            server.stop();
        }
        for worker in &running.workers {
            worker.abort();
        }

        info!("Mesh service stopped");
        true
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn spawn_observation_worker(
        &self,
        mut rx: mpsc::Receiver<super::transport::DeviceObservation>,
    ) -> JoinHandle<()> {
        let directory = self.directory.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            while let Some(obs) = rx.recv().await {
                if let Some(record) = directory.on_observation(&obs) {
                    dispatch("device", handler.on_device(record)).await;
                }
            }
            debug!("Observation worker finished");
        })
    }

    fn spawn_frame_worker(&self, mut rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let handler = self.handler.clone();

        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                dispatch("frame", handler.on_frame(frame)).await;
            }
            debug!("Frame worker finished");
        })
    }

    pub fn directory(&self) -> &Arc<NeighborDirectory> {
        &self.directory
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn get_or_create_origin_id(&self) -> Result<OriginId, StoreError> {
        self.identity.get_or_create_origin_id()
    }

    pub fn next_seqnum(&self) -> Result<u16, StoreError> {
        self.identity.next_seqnum()
    }

    pub fn get_neighbors(&self) -> HashMap<OriginKey, DeviceRecord> {
        self.directory.get_neighbors()
    }

    pub fn get_known_devices(&self) -> HashMap<OriginKey, DeviceRecord> {
        self.directory.get_known_devices()
    }

    /// Replace the presence advertisement with a chat packet carrying `text`
    pub async fn announce(&self, text: &str) -> Result<()> {
        let packet = protocol::make_chat_packet(
            self.identity.next_seqnum()?,
            &self.identity.get_or_create_origin_id()?,
            text,
            self.config.advertise_ttl,
        );

        let handle = self
            .transport
            .advertise(packet)
            .await
            .context("Failed to advertise")?;

        let mut running = self.running.lock().await;
        match running.as_mut() {
            Some(running) => {
                if let Some(previous) = running.advertisement.replace(handle) {
                    previous.stop();
                }
            }
            None => {
                handle.stop();
                anyhow::bail!("Mesh service is not running");
            }
        }

        debug!("Announced {} bytes", text.len());
        Ok(())
    }

    /// Write raw frames to one peer
    pub async fn send_frames(&self, peer_address: &str, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        self.transport.send(peer_address, frames).await
    }

    /// Send a file and wait for the last frame to be written. Returns the chunk count.
    pub async fn send_file(
        &self,
        peer_address: &str,
        blob: &[u8],
        extension: &str,
    ) -> Result<u32, TransportError> {
        let transfer = prepare_transfer(blob, extension, self.config.chunk_size);
        let chunks = transfer.total_chunks;
        info!("Sending .{} file to {} in {} chunks", extension, peer_address, chunks);

        self.transport.send(peer_address, transfer.frames()).await?;
        Ok(chunks)
    }

    /// Send a file in the background
    pub fn start_send_file(
        &self,
        peer_address: String,
        blob: Vec<u8>,
        extension: String,
    ) -> JoinHandle<Result<u32, TransportError>> {
        let transport = self.transport.clone();
        let transfer = prepare_transfer(&blob, &extension, self.config.chunk_size);

        tokio::spawn(async move {
            let chunks = transfer.total_chunks;
            match transport.send(&peer_address, transfer.frames()).await {
                Ok(()) => {
                    info!("Sent .{} file to {} ({} chunks)", extension, peer_address, chunks);
                    Ok(chunks)
                }
                Err(e) => {
                    warn!("File transfer to {} failed: {}", peer_address, e);
                    Err(e)
                }
            }
        })
    }

    /// Send a chat frame to every current neighbor
    pub async fn broadcast_chat(&self, text: &str) -> Result<Vec<PeerResult>, StoreError> {
        let frame = encode_chat_frame(&self.identity.get_or_create_origin_id()?, text);
        let frames = [frame];

        let mut results = Vec::new();
        for address in self.directory.neighbor_addresses() {
            let result = self.transport.send(&address, &frames).await;
            if let Err(e) = &result {
                warn!("Chat to {} failed: {}", address, e);
            }
            results.push((address, result));
        }
        Ok(results)
    }

    pub async fn get_status(&self) -> Value {
        let running = self.running.lock().await;
        let origin_id = self
            .identity
            .get_or_create_origin_id()
            .map(hex::encode)
            .unwrap_or_default();

        serde_json::json!({
            "is_running": running.is_some(),
            "is_scanning": running.as_ref().map_or(false, |r| !r.scan.is_stopped()),
            "is_advertising": running.as_ref().map_or(false, |r| r.advertisement.is_some()),
            "accepting_frames": running.as_ref().map_or(false, |r| r.server.is_some()),
            "origin_id": origin_id,
            "directory": self.directory.get_statistics(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory::MemoryEther;
    use crate::bluetooth::protocol::encode;
    use crate::bluetooth::transport::{DeviceObservation, MESH_VENDOR_CODE};
    use crate::identity::{KeyValueStore, MemoryStore, SEQNUM_KEY};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    struct Recorder {
        devices: UnboundedSender<DeviceRecord>,
        frames: UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl MeshEventHandler for Recorder {
        async fn on_device(&self, record: DeviceRecord) -> Result<()> {
            let _ = self.devices.send(record);
            Ok(())
        }

        async fn on_frame(&self, frame: Vec<u8>) -> Result<()> {
            let _ = self.frames.send(frame);
            Ok(())
        }
    }

    /// Panics on the first device, fails on the second, records the rest
    struct Faulty {
        calls: std::sync::atomic::AtomicUsize,
        devices: UnboundedSender<DeviceRecord>,
    }

    #[async_trait]
    impl MeshEventHandler for Faulty {
        async fn on_device(&self, record: DeviceRecord) -> Result<()> {
            match self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) {
                0 => panic!("handler bug"),
                1 => anyhow::bail!("handler error"),
                _ => {
                    let _ = self.devices.send(record);
                    Ok(())
                }
            }
        }
    }

    fn service(
        ether: &MemoryEther,
        address: &str,
        handler: Arc<dyn MeshEventHandler>,
    ) -> BluetoothMeshService {
        BluetoothMeshService::new(
            MeshConfig::default(),
            Arc::new(ether.node(address, address)),
            Arc::new(IdentityStore::in_memory()),
            handler,
        )
    }

    fn recorder() -> (
        Arc<Recorder>,
        mpsc::UnboundedReceiver<DeviceRecord>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (devices, device_rx) = mpsc::unbounded_channel();
        let (frames, frame_rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder { devices, frames }), device_rx, frame_rx)
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn nodes_discover_each_other_as_neighbors() {
        let ether = MemoryEther::new();
        let (handler_a, mut devices_a, _) = recorder();
        let (handler_b, mut devices_b, _) = recorder();
        let a = service(&ether, "AA", handler_a);
        let b = service(&ether, "BB", handler_b);

        a.start().await.unwrap();
        b.start().await.unwrap();

        let seen_by_a = next(&mut devices_a).await;
        let seen_by_b = next(&mut devices_b).await;
        assert_eq!(seen_by_a.origin_id, b.get_or_create_origin_id().unwrap());
        assert_eq!(seen_by_b.origin_id, a.get_or_create_origin_id().unwrap());
        assert_eq!(seen_by_a.address, "BB");
        assert_eq!(a.get_neighbors().len(), 1);
        assert_eq!(b.get_known_devices().len(), 1);
    }

    #[tokio::test]
    async fn handler_faults_do_not_stop_dispatch() {
        let ether = MemoryEther::new();
        let (devices, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Faulty {
            calls: Default::default(),
            devices,
        });
        let node = service(&ether, "AA", handler);
        node.start().await.unwrap();

        for seqnum in 1..=3u16 {
            ether.inject(DeviceObservation::new(
                "CC",
                "peer",
                -50,
                MESH_VENDOR_CODE,
                encode(0x01, seqnum, 5, &[9; 8], b""),
            ));
        }

        let record = next(&mut rx).await;
        assert_eq!(record.seqnum, 3);
        // Directory state was updated for every observation
        assert_eq!(node.get_neighbors()[&vec![9u8; 8]].seqnum, 3);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_the_radio() {
        let ether = MemoryEther::new();
        let (handler, _, _) = recorder();
        let node = service(&ether, "AA", handler);

        node.start().await.unwrap();
        node.start().await.unwrap();
        assert_eq!(ether.scanner_count(), 1);
        assert_eq!(ether.advertisement_count(), 1);
        assert!(ether.has_receiver("AA"));

        assert!(node.stop().await);
        assert!(!node.stop().await);
        assert_eq!(ether.scanner_count(), 0);
        assert_eq!(ether.advertisement_count(), 0);
        assert!(!ether.has_receiver("AA"));
        assert!(!node.is_running().await);
    }

    /// Keeps the origin id but refuses to persist sequence numbers
    struct SeqnumWriteFails {
        inner: MemoryStore,
    }

    impl KeyValueStore for SeqnumWriteFails {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
            if key == SEQNUM_KEY {
                return Err(StoreError::Io {
                    path: "seqnum.bin".into(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
                });
            }
            self.inner.put(key, value)
        }
    }

    #[tokio::test]
    async fn failed_start_leaves_the_radio_untouched() {
        let ether = MemoryEther::new();
        let (handler, _, _) = recorder();
        let store = Arc::new(SeqnumWriteFails {
            inner: MemoryStore::new(),
        });
        let node = BluetoothMeshService::new(
            MeshConfig::default(),
            Arc::new(ether.node("AA", "AA")),
            Arc::new(IdentityStore::new(store)),
            handler,
        );

        assert!(node.start().await.is_err());
        assert!(!node.is_running().await);
        assert_eq!(ether.scanner_count(), 0);
        assert_eq!(ether.advertisement_count(), 0);
        assert!(!ether.has_receiver("AA"));
        assert!(!node.stop().await);
    }

    #[tokio::test]
    async fn presence_advertisement_uses_first_seqnum() {
        let ether = MemoryEther::new();
        let (handler_a, _, _) = recorder();
        let (handler_b, mut devices_b, _) = recorder();
        let a = service(&ether, "AA", handler_a);
        let b = service(&ether, "BB", handler_b);

        b.start().await.unwrap();
        a.start().await.unwrap();

        let record = next(&mut devices_b).await;
        assert_eq!(record.seqnum, 1);
        assert_eq!(record.ttl, 5);
        assert_eq!(record.flags, flags::CHAT);
        assert!(record.payload.is_empty());
    }

    #[tokio::test]
    async fn announce_updates_the_advertised_payload() {
        let ether = MemoryEther::new();
        let (handler_a, _, _) = recorder();
        let (handler_b, mut devices_b, _) = recorder();
        let a = service(&ether, "AA", handler_a);
        let b = service(&ether, "BB", handler_b);
        b.start().await.unwrap();
        a.start().await.unwrap();
        next(&mut devices_b).await;

        a.announce("hello everyone").await.unwrap();
        let record = next(&mut devices_b).await;
        assert_eq!(record.payload_text(), Some("hello everyone"));
        assert_eq!(record.seqnum, 2);
        assert_eq!(ether.advertisement_count(), 2);
    }

    #[tokio::test]
    async fn announce_requires_a_running_service() {
        let ether = MemoryEther::new();
        let (handler, _, _) = recorder();
        let node = service(&ether, "AA", handler);
        assert!(node.announce("nope").await.is_err());
        assert_eq!(ether.advertisement_count(), 0);
    }

    #[tokio::test]
    async fn chat_reaches_every_neighbor() {
        let ether = MemoryEther::new();
        let (handler_a, mut devices_a, _) = recorder();
        let (handler_b, _, mut frames_b) = recorder();
        let a = service(&ether, "AA", handler_a);
        let b = service(&ether, "BB", handler_b);
        a.start().await.unwrap();
        b.start().await.unwrap();
        next(&mut devices_a).await;

        let results = a.broadcast_chat("hi b").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "BB");
        assert!(results[0].1.is_ok());

        let frame = next(&mut frames_b).await;
        let message = crate::message::parse_chat_frame(&frame).unwrap();
        assert_eq!(message.text, "hi b");
        assert_eq!(message.sender_id(), Some(a.get_or_create_origin_id().unwrap()));
    }

    #[tokio::test]
    async fn background_file_send_reports_transport_errors() {
        let ether = MemoryEther::new();
        let (handler, _, _) = recorder();
        let node = service(&ether, "AA", handler);

        let result = node
            .start_send_file("ZZ".to_string(), vec![1, 2, 3], "bin".to_string())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn status_reflects_lifecycle() {
        let ether = MemoryEther::new();
        let (handler, _, _) = recorder();
        let node = service(&ether, "AA", handler);

        assert_eq!(node.get_status().await["is_running"], false);
        node.start().await.unwrap();
        let status = node.get_status().await;
        assert_eq!(status["is_running"], true);
        assert_eq!(status["is_scanning"], true);
        assert_eq!(status["origin_id"].as_str().unwrap().len(), 16);
    }
}
