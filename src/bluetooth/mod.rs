//! Bluetooth LE Mesh Networking Module
//!
//! Packet codec, radio transports, the neighbor directory and the service
//! that ties them together.

pub mod btle;
pub mod directory;
pub mod memory;
pub mod mesh_service;
pub mod protocol;
pub mod transport;

pub use btle::BtleTransport;
pub use directory::{DeviceRecord, NeighborDirectory};
pub use memory::{MemoryEther, MemoryTransport};
pub use mesh_service::{BluetoothMeshService, MeshEventHandler, PeerResult};
pub use protocol::{DecodeError, MeshPacket, OriginId};
pub use transport::{DeviceObservation, RadioHandle, Transport, TransportError};
