//! Per-connection receive pumps and teardown watchers
//!
//! Once a connection of the twinned pair is established, three kinds of
//! tasks keep it flowing:
//! - a stream pump per reliable receive stream, feeding the shared lane
//!   reassembly state and popping framed messages,
//! - a datagram pump per connection, enforcing the ascending sequence rule,
//! - a closed watcher per connection, which drops that side's handles when
//!   the transport finishes and delivers `on_disconnect` once both sides
//!   are gone.
//!
//! Duplicate suppression lives entirely on the receive side: both streams
//! of a lane carry the identical byte sequence, so whichever pump advances
//! `next_recv_byte` first wins and the other finds its chunk already
//! consumed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use quinn::Connection;

use crate::channel::{Channel, LaneIndex};
use crate::codec::framing;
use crate::hooks::deliver_guarded;
use crate::session::SessionShared;
use crate::session::slot::{Side, Slot};

/// Upper bound per ordered read. Small enough to keep lane locks short.
const RECV_CHUNK: usize = 16 * 1024;

/// Wires up a connection accepted by the listener: the peer dialed us.
pub(crate) async fn adopt_server_connection(
    shared: Arc<SessionShared>,
    slot: Arc<Slot>,
    connection: Connection,
) {
    tracing::debug!(
        "slot {}: inbound connection established from {}",
        slot.index,
        connection.remote_address()
    );
    {
        let mut state = slot.state.lock().await;
        state.server_conn = Some(connection.clone());
        state.handshake_begin = None;
    }
    slot.refcount.fetch_add(1, Ordering::SeqCst);

    spawn_stream_acceptor(shared.clone(), slot.clone(), connection.clone());
    spawn_datagram_pump(shared.clone(), slot.clone(), connection.clone());
    spawn_closed_watcher(shared, slot, connection, Side::Server);
}

/// Wires up the connection we dialed, opening one stream per lane.
pub(crate) async fn adopt_client_connection(
    shared: Arc<SessionShared>,
    slot: Arc<Slot>,
    connection: Connection,
) {
    tracing::debug!(
        "slot {}: outbound connection established to {}",
        slot.index,
        connection.remote_address()
    );
    {
        let mut state = slot.state.lock().await;
        state.client_conn = Some(connection.clone());
        state.handshake_begin = None;
    }
    slot.refcount.fetch_add(1, Ordering::SeqCst);

    // The transport assigns stream ids in open order, so lane k rides
    // stream id 4k and the peer recovers the lane from the id alone.
    for lane in LaneIndex::all() {
        match connection.open_bi().await {
            Ok((send, recv)) => {
                slot.lanes[lane.as_usize()].send.lock().await.client_stream = Some(send);
                spawn_stream_pump(shared.clone(), slot.clone(), recv, lane);
            }
            Err(e) => {
                tracing::warn!("slot {}: opening lane {lane} failed: {e}", slot.index);
            }
        }
    }

    spawn_datagram_pump(shared.clone(), slot.clone(), connection.clone());
    spawn_closed_watcher(shared, slot, connection, Side::Client);
}

/// Accepts the peer's four lane streams as they materialize and binds each
/// to its lane by stream id.
fn spawn_stream_acceptor(shared: Arc<SessionShared>, slot: Arc<Slot>, connection: Connection) {
    tokio::spawn(async move {
        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let Some(lane) = LaneIndex::from_stream_index(recv.id().index()) else {
                tracing::debug!(
                    "slot {}: ignoring unexpected stream {}",
                    slot.index,
                    recv.id()
                );
                continue;
            };
            slot.lanes[lane.as_usize()].send.lock().await.server_stream = Some(send);
            spawn_stream_pump(shared.clone(), slot.clone(), recv, lane);
        }
    });
}

fn spawn_stream_pump(
    shared: Arc<SessionShared>,
    slot: Arc<Slot>,
    mut recv: quinn::RecvStream,
    lane: LaneIndex,
) {
    tokio::spawn(async move {
        loop {
            let chunk = match recv.read_chunk(RECV_CHUNK, true).await {
                Ok(Some(chunk)) => chunk,
                // stream finished, reset, or connection gone
                Ok(None) | Err(_) => return,
            };

            let context = slot.state.lock().await.upgrade_context();
            let Some(context) = context else {
                // the application dropped its channel state; tear down
                tracing::debug!("slot {}: channel context gone, resetting", slot.index);
                slot.reset_channels().await;
                return;
            };

            let begin = chunk.offset;
            let end = begin + chunk.bytes.len() as u64;

            let mut lane_recv = slot.lanes[lane.as_usize()].recv.lock().await;

            // the twin stream already delivered everything in this chunk
            if end <= lane_recv.next_recv_byte {
                continue;
            }
            if lane_recv.next_recv_byte < begin {
                // bytes below this chunk were never seen on either stream;
                // the lane state is corrupt
                drop(lane_recv);
                tracing::warn!("slot {}: lane {lane} offset gap, resetting", slot.index);
                slot.reset_channels().await;
                return;
            }

            let skip = (lane_recv.next_recv_byte - begin) as usize;
            lane_recv.buffer.extend_from_slice(&chunk.bytes[skip..]);
            lane_recv.next_recv_byte = end;

            // one chunk can complete several framed messages
            while let Some(message) = framing::take_frame(&mut lane_recv.buffer) {
                let hooks = shared.hooks.clone();
                let channel = Channel::new(slot.clone());
                let context = context.clone();
                deliver_guarded("reliable receive", async move {
                    hooks.on_reliable(channel, lane, message, context).await;
                })
                .await;
            }
        }
    });
}

fn spawn_datagram_pump(shared: Arc<SessionShared>, slot: Arc<Slot>, connection: Connection) {
    tokio::spawn(async move {
        loop {
            let datagram = match connection.read_datagram().await {
                Ok(datagram) => datagram,
                Err(_) => return,
            };
            // runt datagrams carry no sequence number
            let Some(sequence) = framing::decode_prefix(&datagram) else {
                continue;
            };

            let context = slot.state.lock().await.upgrade_context();
            let Some(context) = context else {
                tracing::debug!("slot {}: channel context gone, resetting", slot.index);
                slot.reset_channels().await;
                return;
            };

            let mut recv = slot.datagram_recv.lock().await;
            if recv.next_recv_packet != sequence {
                // late twin duplicate or reordered packet; drop it
                continue;
            }
            recv.next_recv_packet = recv.next_recv_packet.wrapping_add(1);

            let payload = datagram.slice(framing::PREFIX_LEN..);
            let hooks = shared.hooks.clone();
            let channel = Channel::new(slot.clone());
            deliver_guarded("unreliable receive", async move {
                hooks.on_unreliable(channel, payload, context).await;
            })
            .await;
        }
    });
}

/// Waits for a connection to finish closing, then releases that side of the
/// slot. The last side out delivers the disconnect and frees the slot.
fn spawn_closed_watcher(
    shared: Arc<SessionShared>,
    slot: Arc<Slot>,
    connection: Connection,
    side: Side,
) {
    tokio::spawn(async move {
        let reason = connection.closed().await;
        tracing::debug!(
            "slot {}: {side:?} connection closed: {reason}",
            slot.index
        );

        let remaining = slot.shutdown_side(side).await;
        if remaining != 0 {
            return;
        }

        let context = slot.state.lock().await.upgrade_context();
        let hooks = shared.hooks.clone();
        let channel = Channel::new(slot.clone());
        deliver_guarded("disconnect", async move {
            hooks.on_disconnect(channel, context).await;
        })
        .await;

        slot.reset_channels().await;
    });
}
