//! meshlink - Opportunistic Bluetooth LE Mesh Messaging
//!
//! Nodes advertise small mesh packets as BLE manufacturer data, keep a
//! directory of the nodes they hear, and move files and chat messages over
//! a point-to-point write channel.

pub mod bluetooth;
pub mod config;
pub mod identity;
pub mod message;
pub mod transfer;

pub use bluetooth::protocol::{decode as decode_packet, encode as encode_packet, make_chat_packet};
pub use bluetooth::{
    BluetoothMeshService, BtleTransport, DecodeError, DeviceObservation, DeviceRecord,
    MemoryEther, MeshEventHandler, MeshPacket, NeighborDirectory, OriginId, Transport,
    TransportError,
};
pub use config::{ConfigError, MeshConfig};
pub use identity::{FileStore, IdentityStore, KeyValueStore, MemoryStore, StoreError};
pub use message::{ChatError, ChatMessage};
pub use transfer::{DownloadSink, FileReceiver, ProtocolError, ReceiveEvent};
