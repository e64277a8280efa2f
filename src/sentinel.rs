//! Sentinel handle over the shared UDP socket
//!
//! The sentinel is the session's raw UDP voice: it emits rendezvous packets
//! and the 2-byte firewall challenge, and it reports the port the whole
//! session is reachable on. Receiving is handled by the demultiplexer,
//! which feeds diverted rendezvous packets into the consumer channel the
//! session drains.

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;

use crate::transport::demux::DemuxSocket;

/// The 2-byte nonsense payload poked at a peer's reserved client port.
/// Its only job is to make the local NAT admit return traffic from the
/// listener port; the peer ignores it entirely.
pub(crate) const FIREWALL_CHALLENGE: [u8; 2] = [0, 0];

#[derive(Clone)]
pub(crate) struct Sentinel {
    socket: Arc<DemuxSocket>,
}

impl Sentinel {
    pub(crate) fn new(socket: Arc<DemuxSocket>) -> Self {
        Self { socket }
    }

    /// The UDP port shared by the sentinel and the listener.
    pub(crate) fn port(&self) -> u16 {
        self.socket.port()
    }

    pub(crate) fn send_to(&self, remote: SocketAddrV6, data: &[u8]) -> bool {
        self.socket.send_raw(SocketAddr::V6(remote), data)
    }
}
