//! Node Identity Module
//!
//! Owns the persistent origin id and the wrapping 16-bit sequence counter.

pub mod store;

pub use store::{FileStore, KeyValueStore, MemoryStore, StoreError};

use log::info;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::bluetooth::protocol::{OriginId, ORIGIN_ID_SIZE};

/// Storage key of the origin id (8 raw bytes)
pub const ORIGIN_ID_KEY: &str = "origin_id";

/// Storage key of the sequence counter (2 raw bytes, big-endian)
pub const SEQNUM_KEY: &str = "seqnum";

/// Origin id and sequence number source backed by a durable store
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
    origin_id: Mutex<Option<OriginId>>,
    // Guards the read-increment-write of the sequence counter
    seqnum_lock: Mutex<()>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            origin_id: Mutex::new(None),
            seqnum_lock: Mutex::new(()),
        }
    }

    /// Identity that lives only as long as the process
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Return the stored origin id, creating and persisting a random one on first use
    pub fn get_or_create_origin_id(&self) -> Result<OriginId, StoreError> {
        let mut cached = self.origin_id.lock();
        if let Some(id) = *cached {
            return Ok(id);
        }

        let id = match self.store.get(ORIGIN_ID_KEY)? {
            Some(bytes) => {
                if bytes.len() < ORIGIN_ID_SIZE {
                    return Err(StoreError::InvalidOriginId(bytes.len()));
                }
                let mut id = [0u8; ORIGIN_ID_SIZE];
                id.copy_from_slice(&bytes[..ORIGIN_ID_SIZE]);
                id
            }
            None => {
                let id = rand::random::<OriginId>();
                self.store.put(ORIGIN_ID_KEY, &id)?;
                info!("Created new origin id {}", hex::encode(id));
                id
            }
        };

        *cached = Some(id);
        Ok(id)
    }

    /// Increment, persist and return the sequence number (wraps 65535 -> 0)
    pub fn next_seqnum(&self) -> Result<u16, StoreError> {
        let _guard = self.seqnum_lock.lock();

        let last = match self.store.get(SEQNUM_KEY)? {
            Some(bytes) if bytes.len() >= 2 => u16::from_be_bytes([bytes[0], bytes[1]]),
            _ => 0,
        };

        let next = last.wrapping_add(1);
        self.store.put(SEQNUM_KEY, &next.to_be_bytes())?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn origin_id_is_stable() {
        let identity = IdentityStore::in_memory();
        let first = identity.get_or_create_origin_id().unwrap();
        let second = identity.get_or_create_origin_id().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn origin_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let first = IdentityStore::new(Arc::new(FileStore::new(dir.path())))
            .get_or_create_origin_id()
            .unwrap();
        let second = IdentityStore::new(Arc::new(FileStore::new(dir.path())))
            .get_or_create_origin_id()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(dir.path().join("origin_id.bin")).unwrap(), first);
    }

    #[test]
    fn stored_origin_id_uses_first_eight_bytes() {
        let store = Arc::new(MemoryStore::new());
        store.put(ORIGIN_ID_KEY, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap();
        let identity = IdentityStore::new(store);
        assert_eq!(identity.get_or_create_origin_id().unwrap(), [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn short_stored_origin_id_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.put(ORIGIN_ID_KEY, &[1, 2, 3]).unwrap();
        let identity = IdentityStore::new(store);
        assert!(matches!(
            identity.get_or_create_origin_id(),
            Err(StoreError::InvalidOriginId(3))
        ));
    }

    #[test]
    fn seqnum_starts_at_one_and_wraps() {
        let identity = IdentityStore::in_memory();
        for expected in 1..=u16::MAX {
            assert_eq!(identity.next_seqnum().unwrap(), expected);
        }
        assert_eq!(identity.next_seqnum().unwrap(), 0);
        assert_eq!(identity.next_seqnum().unwrap(), 1);
    }

    #[test]
    fn seqnum_persists_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        store.put(SEQNUM_KEY, &[0x01, 0xff]).unwrap();

        let identity = IdentityStore::new(store);
        assert_eq!(identity.next_seqnum().unwrap(), 0x0200);
        assert_eq!(std::fs::read(dir.path().join("seqnum.bin")).unwrap(), vec![0x02, 0x00]);
    }

    #[test]
    fn truncated_seqnum_record_restarts_from_zero() {
        let store = Arc::new(MemoryStore::new());
        store.put(SEQNUM_KEY, &[0x07]).unwrap();
        assert_eq!(IdentityStore::new(store).next_seqnum().unwrap(), 1);
    }

    #[test]
    fn concurrent_callers_never_share_a_seqnum() {
        let identity = Arc::new(IdentityStore::in_memory());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let identity = identity.clone();
                std::thread::spawn(move || {
                    (0..200)
                        .map(|_| identity.next_seqnum().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for seqnum in handle.join().unwrap() {
                assert!(seen.insert(seqnum), "duplicate seqnum {seqnum}");
            }
        }
        assert_eq!(seen.len(), 1600);
    }
}
