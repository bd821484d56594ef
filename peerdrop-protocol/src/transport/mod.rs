//! PeerDrop Transport Layer
//!
//! The protocol only needs an ordered, reliable message channel. This module
//! defines that channel as a pair of traits and ships two implementations:
//! an in-process one and newline-delimited JSON over TCP.

mod r#trait;
pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransportFactory, RawPeer};
pub use r#trait::{
    Channel, MessageSink, MessageStream, TransportCapabilities, TransportFactory, TransportType,
};
pub use tcp::{TcpListenerTransport, TcpTransportFactory};
