//! Neighbor Directory
//!
//! Classifies decoded advertisements into one-hop neighbors and the wider set
//! of known devices. Entries are keyed by origin id because radio addresses
//! rotate.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::protocol::{self, MeshPacket, DEFAULT_TTL};
use super::transport::{DeviceObservation, MESH_VENDOR_CODE};

/// Directory key: the origin id as carried in the packet
pub type OriginKey = Vec<u8>;

/// Latest state of a peer, built from its packet and the observation that carried it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub version: u8,
    pub flags: u8,
    pub seqnum: u16,
    pub ttl: u8,
    pub origin_id: Vec<u8>,
    pub payload: Vec<u8>,
    pub address: String,
    pub name: String,
    pub rssi: i32,
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    pub fn from_packet(packet: MeshPacket, obs: &DeviceObservation) -> Self {
        Self {
            version: packet.version,
            flags: packet.flags,
            seqnum: packet.seqnum,
            ttl: packet.ttl,
            origin_id: packet.origin_id,
            payload: packet.payload,
            address: obs.address.clone(),
            name: obs.name.clone(),
            rssi: obs.rssi,
            last_seen: obs.observed_at,
        }
    }

    pub fn origin_hex(&self) -> String {
        hex::encode(&self.origin_id)
    }

    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// Addresses tracked for duplicate suppression before stale ones are evicted
pub const MAX_TRACKED_ADDRESSES: usize = 4096;

/// Addresses silent for longer than this are the first to be forgotten
pub const PAYLOAD_CACHE_MAX_AGE: Duration = Duration::from_secs(600);

struct SeenPayload {
    bytes: Vec<u8>,
    seen_at: Instant,
}

#[derive(Debug, Default)]
struct Tables {
    neighbors: HashMap<OriginKey, DeviceRecord>,
    known_devices: HashMap<OriginKey, DeviceRecord>,
}

/// Neighbor and known-device maps for one node
pub struct NeighborDirectory {
    vendor_code: u16,
    direct_ttl: u8,
    // Both maps change together under one lock
    tables: RwLock<Tables>,
    last_payload_by_address: DashMap<String, SeenPayload>,
    payload_cache_limit: usize,
}

impl NeighborDirectory {
    pub fn new(vendor_code: u16, direct_ttl: u8) -> Self {
        Self {
            vendor_code,
            direct_ttl,
            tables: RwLock::new(Tables::default()),
            last_payload_by_address: DashMap::new(),
            payload_cache_limit: MAX_TRACKED_ADDRESSES,
        }
    }

    /// Cap the number of addresses remembered for duplicate suppression
    pub fn with_payload_cache_limit(mut self, limit: usize) -> Self {
        self.payload_cache_limit = limit.max(1);
        self
    }

    pub fn direct_ttl(&self) -> u8 {
        self.direct_ttl
    }

    pub fn vendor_code(&self) -> u16 {
        self.vendor_code
    }

    /// Classify one observation. Returns the record when the directory changed.
    pub fn on_observation(&self, obs: &DeviceObservation) -> Option<DeviceRecord> {
        let payload = obs.vendor_payload(self.vendor_code)?;

        if !self.remember_payload(&obs.address, payload) {
            return None;
        }

        let packet = match protocol::decode(payload) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping advertisement from {}: {}", obs.address, e);
                return None;
            }
        };

        let record = DeviceRecord::from_packet(packet, obs);
        let key = record.origin_id.clone();

        let mut tables = self.tables.write();
        let is_new = !tables.known_devices.contains_key(&key);
        tables.known_devices.insert(key.clone(), record.clone());

        if record.ttl == self.direct_ttl {
            if tables.neighbors.insert(key, record.clone()).is_none() {
                info!("New neighbor {} at {}", record.origin_hex(), record.address);
            }
        } else if tables.neighbors.remove(&key).is_some() {
            info!(
                "Demoted {} from neighbors (ttl {} != {})",
                record.origin_hex(),
                record.ttl,
                self.direct_ttl
            );
        }
        drop(tables);

        if is_new {
            debug!("Discovered device {} ({}, {} dBm)", record.origin_hex(), record.name, record.rssi);
        }

        Some(record)
    }

    /// Returns false if `payload` repeats the last one seen from `address`.
    fn remember_payload(&self, address: &str, payload: &[u8]) -> bool {
        let now = Instant::now();

        if let Some(mut previous) = self.last_payload_by_address.get_mut(address) {
            previous.seen_at = now;
            if previous.bytes == payload {
                return false;
            }
            previous.bytes = payload.to_vec();
            return true;
        }

        self.last_payload_by_address.insert(
            address.to_string(),
            SeenPayload {
                bytes: payload.to_vec(),
                seen_at: now,
            },
        );
        if self.last_payload_by_address.len() > self.payload_cache_limit {
            self.evict_payloads(now);
        }
        true
    }

    /// Drop silent addresses, then the least recently heard until under the cap
    fn evict_payloads(&self, now: Instant) {
        let before = self.last_payload_by_address.len();
        self.last_payload_by_address
            .retain(|_, seen| now.saturating_duration_since(seen.seen_at) < PAYLOAD_CACHE_MAX_AGE);

        while self.last_payload_by_address.len() > self.payload_cache_limit {
            let oldest = self
                .last_payload_by_address
                .iter()
                .min_by_key(|entry| entry.seen_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(address) => {
                    self.last_payload_by_address.remove(&address);
                }
                None => break,
            }
        }

        debug!(
            "Evicted {} addresses from the payload cache",
            before - self.last_payload_by_address.len()
        );
    }

    /// Snapshot of one-hop neighbors
    pub fn get_neighbors(&self) -> HashMap<OriginKey, DeviceRecord> {
        self.tables.read().neighbors.clone()
    }

    /// Snapshot of every device ever observed
    pub fn get_known_devices(&self) -> HashMap<OriginKey, DeviceRecord> {
        self.tables.read().known_devices.clone()
    }

    pub fn neighbor(&self, origin_id: &[u8]) -> Option<DeviceRecord> {
        self.tables.read().neighbors.get(origin_id).cloned()
    }

    pub fn known_device(&self, origin_id: &[u8]) -> Option<DeviceRecord> {
        self.tables.read().known_devices.get(origin_id).cloned()
    }

    pub fn is_neighbor(&self, origin_id: &[u8]) -> bool {
        self.tables.read().neighbors.contains_key(origin_id)
    }

    /// Radio addresses of the current neighbors
    pub fn neighbor_addresses(&self) -> Vec<String> {
        self.tables
            .read()
            .neighbors
            .values()
            .map(|record| record.address.clone())
            .collect()
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let tables = self.tables.read();
        serde_json::json!({
            "neighbors": tables.neighbors.len(),
            "known_devices": tables.known_devices.len(),
            "tracked_addresses": self.last_payload_by_address.len(),
            "direct_ttl": self.direct_ttl,
        })
    }
}

impl Default for NeighborDirectory {
    fn default() -> Self {
        Self::new(MESH_VENDOR_CODE, DEFAULT_TTL)
    }
}
