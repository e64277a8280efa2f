//! Channel façade handed to the application
//!
//! A [`Channel`] is a cheap clonable handle onto one peer slot. Sends are
//! duplicated across the twinned connections: every reliable frame goes out
//! on both the self-initiated and the peer-initiated stream of its lane, and
//! every datagram goes out on both connections. The receiving side
//! deduplicates, so the application sees each message exactly once while the
//! wire hides single-path loss and jitter.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::codec::framing;
use crate::session::slot::Slot;

/// Index of one of the four reliable lanes.
///
/// The transport encodes direction and parity in the two least significant
/// bits of its stream identifiers; shifting them away yields this index, so
/// lane `k` always rides stream id `4k` of each connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaneIndex(u8);

impl LaneIndex {
    /// Number of reliable lanes per channel.
    pub const COUNT: usize = 4;

    /// Returns `None` when `index` is not a valid lane.
    pub fn new(index: usize) -> Option<Self> {
        (index < Self::COUNT).then_some(Self(index as u8))
    }

    /// Maps a transport stream index (`stream_id >> 2`) onto a lane.
    pub(crate) fn from_stream_index(index: u64) -> Option<Self> {
        usize::try_from(index).ok().and_then(Self::new)
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// All lanes in order.
    pub fn all() -> impl Iterator<Item = LaneIndex> {
        (0..Self::COUNT as u8).map(LaneIndex)
    }
}

impl fmt::Display for LaneIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle onto one connected (or connecting) peer.
#[derive(Clone)]
pub struct Channel {
    pub(crate) slot: Arc<Slot>,
}

impl Channel {
    pub(crate) fn new(slot: Arc<Slot>) -> Self {
        Self { slot }
    }

    /// Tears the peer down: closes both connections and frees the slot.
    /// The application still receives a final `on_disconnect` once the
    /// transport finishes closing.
    pub async fn disconnect(&self) {
        self.slot.reset_channels().await;
    }

    /// Sends one message on a reliable lane, duplicated across both stream
    /// handles of the lane.
    ///
    /// Returns `false` when the payload exceeds
    /// [`framing::MAX_RELIABLE_PAYLOAD`] or when no submission was accepted.
    /// `true` means at least one path took the message; the peer delivers
    /// it exactly once either way.
    pub async fn reliable_send(&self, lane: LaneIndex, data: &[u8]) -> bool {
        let Some(frame) = framing::encode_reliable(data) else {
            return false;
        };

        let mut streams = self.slot.lanes[lane.as_usize()].send.lock().await;
        let mut sent = false;

        // Each submission owns its own clone of the frame, taken before the
        // write, so a path that completes early cannot free the buffer while
        // the other path still references it.
        if let Some(stream) = streams.server_stream.as_mut() {
            match stream.write_chunk(frame.clone()).await {
                Ok(()) => sent = true,
                Err(e) => tracing::debug!("lane {lane}: peer-side send failed: {e}"),
            }
        }
        if let Some(stream) = streams.client_stream.as_mut() {
            match stream.write_chunk(frame.clone()).await {
                Ok(()) => sent = true,
                Err(e) => tracing::debug!("lane {lane}: self-side send failed: {e}"),
            }
        }

        sent
    }

    /// Sends one datagram on the unreliable lane, duplicated across both
    /// connections.
    ///
    /// The acceptable payload size depends on the path MTU negotiated by
    /// the transport; oversized payloads are rejected with `false` rather
    /// than fragmented. Delivery is at-most-once and in ascending order;
    /// whatever arrives late or out of order is dropped by the receiver.
    pub async fn unreliable_send(&self, data: &[u8]) -> bool {
        let (client_conn, server_conn) = {
            let state = self.slot.state.lock().await;
            (state.client_conn.clone(), state.server_conn.clone())
        };

        let limit = [&server_conn, &client_conn]
            .into_iter()
            .flatten()
            .filter_map(|conn| conn.max_datagram_size())
            .max();
        let Some(limit) = limit else {
            return false;
        };
        if framing::PREFIX_LEN + data.len() > limit {
            return false;
        }

        let sequence = self.slot.next_send_packet.fetch_add(1, Ordering::SeqCst);
        let frame = framing::encode_datagram(sequence, data);

        let mut sent = false;
        for connection in [server_conn, client_conn].into_iter().flatten() {
            match connection.send_datagram(frame.clone()) {
                Ok(()) => sent = true,
                Err(e) => tracing::debug!("datagram send failed: {e}"),
            }
        }
        sent
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Eq for Channel {}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.slot.index)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.slot.index)
    }
}
