//! The 8-byte sentinel rendezvous packet
//!
//! Each handshake packet carries four big-endian `u16` port fields. The
//! sender writes its own ports first, so the order on the wire is
//! `(senderServer, senderClient, receiverServer, receiverClient)`. The
//! receiver reads the same bytes as `(remoteServer, remoteClient,
//! localServer, localClient)`; the swap in meaning is what lets one encoder
//! serve all three packets of the exchange. A field of zero means "unknown".

/// Exact size of a rendezvous packet. Anything else is dropped.
pub const PACKET_LEN: usize = 8;

/// The four ports identifying one peer pairing.
///
/// `local_server` is the shared listener port of this host. `local_client`
/// is the per-peer port reserved fresh from the OS so the remote listener
/// can punch our firewall by sending into it. The `remote_*` fields mirror
/// the peer's view of the same two ports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortQuad {
    pub local_server: u16,
    pub local_client: u16,
    pub remote_server: u16,
    pub remote_client: u16,
}

impl PortQuad {
    /// A slot with an all-zero quad holds no peer.
    pub fn is_zero(&self) -> bool {
        *self == PortQuad::default()
    }

    /// True once we have heard any port from the peer. Drives the short
    /// handshake timeout: a peer that answered once and then went silent
    /// fails faster than one that never answered.
    pub fn peer_known(&self) -> bool {
        self.remote_server != 0 || self.remote_client != 0
    }
}

/// A decoded rendezvous packet, fields in the receiver's frame of reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousPacket {
    pub remote_server: u16,
    pub remote_client: u16,
    pub local_server: u16,
    pub local_client: u16,
}

/// Position of a packet in the 3-way exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Remote ports filled, local ports zero: the peer is initiating.
    Initial,
    /// Both pairs filled: the peer is answering our initial packet.
    Response,
    /// Remote ports zero, local ports filled: final acknowledgement.
    Ack,
}

impl RendezvousPacket {
    /// Classifies the packet by which port pairs are present.
    ///
    /// Returns `None` for an all-zero packet, which matches no step of the
    /// exchange and is ignored.
    pub fn kind(&self) -> Option<PacketKind> {
        let remote_known = self.remote_server != 0 || self.remote_client != 0;
        let local_known = self.local_server != 0 || self.local_client != 0;
        match (remote_known, local_known) {
            (true, false) => Some(PacketKind::Initial),
            (true, true) => Some(PacketKind::Response),
            (false, true) => Some(PacketKind::Ack),
            (false, false) => None,
        }
    }
}

/// Encodes a packet from the sender's point of view.
///
/// The sender's own ports go first on the wire so the receiver decodes them
/// as its `remote_*` pair.
pub fn encode(
    local_server: u16,
    local_client: u16,
    remote_server: u16,
    remote_client: u16,
) -> [u8; PACKET_LEN] {
    let mut buf = [0u8; PACKET_LEN];
    buf[0..2].copy_from_slice(&local_server.to_be_bytes());
    buf[2..4].copy_from_slice(&local_client.to_be_bytes());
    buf[4..6].copy_from_slice(&remote_server.to_be_bytes());
    buf[6..8].copy_from_slice(&remote_client.to_be_bytes());
    buf
}

/// Decodes a packet from the receiver's point of view.
///
/// Returns `None` unless the datagram is exactly [`PACKET_LEN`] bytes.
pub fn decode(data: &[u8]) -> Option<RendezvousPacket> {
    if data.len() != PACKET_LEN {
        return None;
    }
    Some(RendezvousPacket {
        remote_server: u16::from_be_bytes([data[0], data[1]]),
        remote_client: u16::from_be_bytes([data[2], data[3]]),
        local_server: u16::from_be_bytes([data[4], data[5]]),
        local_client: u16::from_be_bytes([data[6], data[7]]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_swaps_sender_and_receiver_meaning() {
        // sender: local ports 5000/60001, knows remote 5001/60002
        let wire = encode(5000, 60001, 5001, 60002);
        let seen = decode(&wire).unwrap();
        assert_eq!(seen.remote_server, 5000);
        assert_eq!(seen.remote_client, 60001);
        assert_eq!(seen.local_server, 5001);
        assert_eq!(seen.local_client, 60002);
    }

    #[test]
    fn classification_follows_presence_of_pairs() {
        let initial = decode(&encode(5000, 60001, 0, 0)).unwrap();
        assert_eq!(initial.kind(), Some(PacketKind::Initial));

        let response = decode(&encode(5000, 60001, 5001, 60002)).unwrap();
        assert_eq!(response.kind(), Some(PacketKind::Response));

        let ack = decode(&encode(0, 0, 5001, 60002)).unwrap();
        assert_eq!(ack.kind(), Some(PacketKind::Ack));

        let nothing = decode(&encode(0, 0, 0, 0)).unwrap();
        assert_eq!(nothing.kind(), None);
    }

    #[test]
    fn one_known_port_is_enough_to_classify() {
        // a zero field means "unknown", not "absent pair"
        let pkt = decode(&encode(5000, 0, 0, 0)).unwrap();
        assert_eq!(pkt.kind(), Some(PacketKind::Initial));
    }

    #[test]
    fn wrong_length_is_dropped() {
        assert!(decode(&[0u8; 7]).is_none());
        assert!(decode(&[0u8; 9]).is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn quad_predicates() {
        let mut quad = PortQuad::default();
        assert!(quad.is_zero());
        assert!(!quad.peer_known());

        quad.local_server = 5000;
        assert!(!quad.is_zero());
        assert!(!quad.peer_known());

        quad.remote_client = 60002;
        assert!(quad.peer_known());
    }
}
