//! Radio Transport Abstraction
//!
//! The narrow interface between the mesh core and a radio. Implementations
//! push observations and received frames into bounded sinks and never block
//! on the consumer.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Vendor code the mesh packet is advertised under
pub const MESH_VENDOR_CODE: u16 = 0xFFFF;

/// Placeholder for an address or name the radio did not report
pub const UNKNOWN: &str = "<unknown>";

/// One advertisement or property-changed report from the radio
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceObservation {
    pub address: String,
    pub name: String,
    pub rssi: i32,
    /// Manufacturer data by vendor code
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub observed_at: DateTime<Utc>,
}

impl DeviceObservation {
    /// Observation carrying a single vendor payload, stamped now
    pub fn new(
        address: impl Into<String>,
        name: impl Into<String>,
        rssi: i32,
        vendor_code: u16,
        payload: Vec<u8>,
    ) -> Self {
        let mut manufacturer_data = HashMap::new();
        manufacturer_data.insert(vendor_code, payload);

        Self {
            address: address.into(),
            name: name.into(),
            rssi,
            manufacturer_data,
            observed_at: Utc::now(),
        }
    }

    pub fn vendor_payload(&self, vendor_code: u16) -> Option<&[u8]> {
        self.manufacturer_data.get(&vendor_code).map(Vec::as_slice)
    }

    /// Vendor payload as text, if it is valid UTF-8
    pub fn vendor_text(&self, vendor_code: u16) -> Option<&str> {
        self.vendor_payload(vendor_code)
            .and_then(|bytes| std::str::from_utf8(bytes).ok())
    }
}

/// Failure talking to the radio or a peer
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("peer not found: {0}")]
    PeerNotFound(String),
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },
    #[error("write to {address} failed: {reason}")]
    Write { address: String, reason: String },
    #[error("disconnect from {address} failed: {reason}")]
    Disconnect { address: String, reason: String },
    #[error("operation not supported by this radio: {0}")]
    Unsupported(&'static str),
    #[error("radio error: {0}")]
    Radio(String),
}

/// Bounded, non-blocking producer side of a dispatch queue
#[derive(Debug)]
pub struct EventSink<T> {
    label: &'static str,
    tx: mpsc::Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for EventSink<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label,
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<T> EventSink<T> {
    /// Sink plus the receiver the dispatch worker drains
    pub fn channel(label: &'static str, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            label,
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, rx)
    }

    /// Queue an event without waiting. Returns false if it was dropped.
    pub fn push(&self, event: T) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("{} queue full, dropped event ({} total)", self.label, dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an event, waiting for room. Returns false if the worker is gone.
    pub async fn send(&self, event: T) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub type ObservationSink = EventSink<DeviceObservation>;
pub type FrameSink = EventSink<Vec<u8>>;

type StopFn = Box<dyn FnOnce() + Send>;

/// Handle to a running radio activity. `stop` releases it exactly once.
pub struct RadioHandle {
    kind: &'static str,
    on_stop: Mutex<Option<StopFn>>,
}

impl RadioHandle {
    pub fn new(kind: &'static str, on_stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            kind,
            on_stop: Mutex::new(Some(Box::new(on_stop))),
        }
    }

    /// Stop the activity. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        let on_stop = self.on_stop.lock().take();
        match on_stop {
            Some(release) => {
                release();
                log::debug!("Stopped {}", self.kind);
                true
            }
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.on_stop.lock().is_none()
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl std::fmt::Debug for RadioHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadioHandle")
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

pub type ScanHandle = RadioHandle;
pub type AdvertiseHandle = RadioHandle;
pub type ServerHandle = RadioHandle;

/// A radio the mesh core can run on
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin discovery; every qualifying observation is pushed into `sink`.
    async fn scan(&self, sink: ObservationSink) -> Result<ScanHandle, TransportError>;

    /// Broadcast `payload` as manufacturer data under the mesh vendor code.
    async fn advertise(&self, payload: Vec<u8>) -> Result<AdvertiseHandle, TransportError>;

    /// Accept point-to-point writes; each write is pushed into `sink`.
    async fn register_receiver(&self, sink: FrameSink) -> Result<ServerHandle, TransportError>;

    /// Connect to `peer_address`, write each frame in order, disconnect.
    async fn send(&self, peer_address: &str, frames: &[Vec<u8>]) -> Result<(), TransportError>;
}
