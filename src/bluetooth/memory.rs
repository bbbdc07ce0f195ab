//! In-Memory Radio
//!
//! A shared ether that any number of `MemoryTransport` nodes attach to.
//! Advertisements reach every other scanning node and point-to-point writes
//! reach the receiver registered under the peer address.

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::transport::{
    AdvertiseHandle, DeviceObservation, FrameSink, ObservationSink, RadioHandle, ScanHandle,
    ServerHandle, Transport, TransportError, MESH_VENDOR_CODE,
};

/// Signal strength reported for every in-memory observation
pub const MEMORY_RSSI: i32 = -40;

struct Advertisement {
    address: String,
    name: String,
    payload: Vec<u8>,
}

#[derive(Default)]
struct EtherState {
    next_id: u64,
    scanners: HashMap<u64, (String, ObservationSink)>,
    advertisements: HashMap<u64, Advertisement>,
    receivers: HashMap<String, (u64, FrameSink)>,
}

impl EtherState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shared medium for in-memory nodes
#[derive(Clone, Default)]
pub struct MemoryEther {
    state: Arc<Mutex<EtherState>>,
}

impl MemoryEther {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node with the given radio address
    pub fn node(&self, address: impl Into<String>, name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            ether: self.clone(),
            address: address.into(),
            name: name.into(),
        }
    }

    /// Deliver a raw observation to every scanner
    pub fn inject(&self, obs: DeviceObservation) {
        let state = self.state.lock();
        for (_, sink) in state.scanners.values() {
            sink.push(obs.clone());
        }
    }

    pub fn scanner_count(&self) -> usize {
        self.state.lock().scanners.len()
    }

    pub fn advertisement_count(&self) -> usize {
        self.state.lock().advertisements.len()
    }

    pub fn has_receiver(&self, address: &str) -> bool {
        self.state.lock().receivers.contains_key(address)
    }
}

fn observation_of(advert: &Advertisement) -> DeviceObservation {
    DeviceObservation::new(
        advert.address.clone(),
        advert.name.clone(),
        MEMORY_RSSI,
        MESH_VENDOR_CODE,
        advert.payload.clone(),
    )
}

/// One node attached to a `MemoryEther`
#[derive(Clone)]
pub struct MemoryTransport {
    ether: MemoryEther,
    address: String,
    name: String,
}

impl MemoryTransport {
    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn scan(&self, sink: ObservationSink) -> Result<ScanHandle, TransportError> {
        let mut state = self.ether.state.lock();
        let id = state.allocate_id();

        for advert in state.advertisements.values() {
            if advert.address != self.address {
                sink.push(observation_of(advert));
            }
        }
        state.scanners.insert(id, (self.address.clone(), sink));
        debug!("{} scanning on memory ether", self.address);

        let ether = self.ether.clone();
        Ok(RadioHandle::new("memory scan", move || {
            ether.state.lock().scanners.remove(&id);
        }))
    }

    async fn advertise(&self, payload: Vec<u8>) -> Result<AdvertiseHandle, TransportError> {
        let advert = Advertisement {
            address: self.address.clone(),
            name: self.name.clone(),
            payload,
        };

        let mut state = self.ether.state.lock();
        let id = state.allocate_id();
        let obs = observation_of(&advert);
        for (owner, sink) in state.scanners.values() {
            if *owner != self.address {
                sink.push(obs.clone());
            }
        }
        state.advertisements.insert(id, advert);

        let ether = self.ether.clone();
        Ok(RadioHandle::new("memory advertisement", move || {
            ether.state.lock().advertisements.remove(&id);
        }))
    }

    async fn register_receiver(&self, sink: FrameSink) -> Result<ServerHandle, TransportError> {
        let mut state = self.ether.state.lock();
        let id = state.allocate_id();
        state.receivers.insert(self.address.clone(), (id, sink));

        let ether = self.ether.clone();
        let address = self.address.clone();
        Ok(RadioHandle::new("memory receiver", move || {
            let mut state = ether.state.lock();
            if state.receivers.get(&address).map(|(owner, _)| *owner) == Some(id) {
                state.receivers.remove(&address);
            }
        }))
    }

    async fn send(&self, peer_address: &str, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let sink = self
            .ether
            .state
            .lock()
            .receivers
            .get(peer_address)
            .map(|(_, sink)| sink.clone())
            .ok_or_else(|| TransportError::PeerNotFound(peer_address.to_string()))?;

        // Point-to-point writes are lossless: wait for the receiver to drain
        for frame in frames {
            if !sink.send(frame.clone()).await {
                return Err(TransportError::Write {
                    address: peer_address.to_string(),
                    reason: "receiver closed".to_string(),
                });
            }
        }

        debug!("{} wrote {} frames to {}", self.address, frames.len(), peer_address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::transport::EventSink;

    #[tokio::test]
    async fn advertisement_reaches_other_scanners_only() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let b = ether.node("BB", "b");

        let (sink_a, mut rx_a) = EventSink::channel("a", 8);
        let (sink_b, mut rx_b) = EventSink::channel("b", 8);
        let _scan_a = a.scan(sink_a).await.unwrap();
        let _scan_b = b.scan(sink_b).await.unwrap();

        let _adv = a.advertise(b"ping".to_vec()).await.unwrap();

        let obs = rx_b.try_recv().unwrap();
        assert_eq!(obs.address, "AA");
        assert_eq!(obs.vendor_payload(MESH_VENDOR_CODE), Some(&b"ping"[..]));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_scanner_sees_current_advertisements() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let b = ether.node("BB", "b");
        let adv = a.advertise(b"hello".to_vec()).await.unwrap();

        let (sink, mut rx) = EventSink::channel("b", 8);
        let _scan = b.scan(sink).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().address, "AA");

        adv.stop();
        assert_eq!(ether.advertisement_count(), 0);
    }

    #[tokio::test]
    async fn stopped_scan_is_detached() {
        let ether = MemoryEther::new();
        let node = ether.node("AA", "a");
        let (sink, _rx) = EventSink::channel("a", 8);
        let scan = node.scan(sink).await.unwrap();
        assert_eq!(ether.scanner_count(), 1);
        assert!(scan.stop());
        assert!(!scan.stop());
        assert_eq!(ether.scanner_count(), 0);
    }

    #[tokio::test]
    async fn send_delivers_frames_in_order() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let b = ether.node("BB", "b");
        let (sink, mut rx) = EventSink::channel("frames", 8);
        let _server = b.register_receiver(sink).await.unwrap();

        a.send("BB", &[b"one".to_vec(), b"two".to_vec()]).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"one");
        assert_eq!(rx.try_recv().unwrap(), b"two");
    }

    #[tokio::test]
    async fn send_waits_for_a_full_receiver_queue() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let b = ether.node("BB", "b");
        let (sink, mut rx) = EventSink::channel("frames", 2);
        let _server = b.register_receiver(sink).await.unwrap();

        let frames: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i]).collect();
        let expected = frames.clone();
        let sender = tokio::spawn(async move { a.send("BB", &frames).await });

        let mut received = Vec::new();
        while received.len() < expected.len() {
            received.push(rx.recv().await.unwrap());
        }
        sender.await.unwrap().unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn send_to_closed_receiver_fails() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let b = ether.node("BB", "b");
        let (sink, rx) = EventSink::channel("frames", 2);
        let _server = b.register_receiver(sink).await.unwrap();
        drop(rx);

        let err = a.send("BB", &[b"x".to_vec()]).await.unwrap_err();
        assert!(matches!(err, TransportError::Write { .. }));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_fails() {
        let ether = MemoryEther::new();
        let a = ether.node("AA", "a");
        let err = a.send("ZZ", &[b"x".to_vec()]).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerNotFound(addr) if addr == "ZZ"));
    }
}
