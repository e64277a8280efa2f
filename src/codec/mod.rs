//! Wire formats for the rendezvous handshake and the duplicated data paths
//!
//! Three tiny formats live here, all big-endian:
//! - the 8-byte sentinel rendezvous packet (four port fields),
//! - the 4-byte length prefix framing application messages on reliable
//!   streams,
//! - the 4-byte sequence prefix numbering unreliable datagrams.

pub mod framing;
pub mod rendezvous;
