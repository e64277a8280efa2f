//! Per-peer connection slot
//!
//! A session holds a fixed table of [`MAX_PEERS`] slots. Each slot tracks
//! one peer through its whole life: the rendezvous port quadruple, the
//! transient socket that pins the punched client port, both directions of
//! the twinned transport, the four reliable lanes, and the datagram
//! counters.
//!
//! A slot is free exactly when its port quadruple is all zero and its
//! refcount is zero. The refcount counts established connection sides;
//! transport tasks still unwinding after a reset keep it non-zero, which
//! keeps the slot out of circulation until they finish.

use std::any::Any;
use std::net::SocketAddrV6;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use quinn::{Connection, Endpoint, SendStream, VarInt};
use tokio::sync::Mutex;

use crate::channel::LaneIndex;
use crate::codec::rendezvous::PortQuad;

/// Size of the per-session slot table.
pub(crate) const MAX_PEERS: usize = 16;

const RESET_CODE: u32 = 0;

/// Which host initiated a connection of the twinned pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// We dialed: our client endpoint to the peer's listener.
    Client,
    /// The peer dialed: accepted by our listener.
    Server,
}

pub(crate) struct Slot {
    pub(crate) index: usize,
    pub(crate) state: Mutex<SlotState>,
    /// Established connection sides plus in-flight teardown work.
    pub(crate) refcount: AtomicU32,
    pub(crate) next_send_packet: AtomicU32,
    pub(crate) datagram_recv: Mutex<DatagramRecv>,
    pub(crate) lanes: [Lane; LaneIndex::COUNT],
}

/// Mutable slot fields guarded by the modification lock.
#[derive(Default)]
pub(crate) struct SlotState {
    pub(crate) ports: PortQuad,
    pub(crate) remote_sentinel: Option<SocketAddrV6>,
    /// `None` means idle or fully connected; `Some` means a handshake is in
    /// flight and the retry daemon owns its fate.
    pub(crate) handshake_begin: Option<Instant>,
    /// Holds the reserved local client port between rendezvous and connect.
    pub(crate) transient: Option<std::net::UdpSocket>,
    /// The per-peer client endpoint, bound to the reserved port.
    pub(crate) client_endpoint: Option<Endpoint>,
    /// Latch so packet 2 and packet 3 cannot both start the client.
    pub(crate) client_started: bool,
    pub(crate) app_context: Option<Weak<dyn Any + Send + Sync>>,
    pub(crate) client_conn: Option<Connection>,
    pub(crate) server_conn: Option<Connection>,
}

impl SlotState {
    pub(crate) fn upgrade_context(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.app_context.as_ref().and_then(Weak::upgrade)
    }
}

#[derive(Default)]
pub(crate) struct DatagramRecv {
    pub(crate) next_recv_packet: u32,
}

/// One reliable lane: both directional send handles plus the shared
/// reassembly state both receive pumps feed.
#[derive(Default)]
pub(crate) struct Lane {
    pub(crate) send: Mutex<LaneSend>,
    pub(crate) recv: Mutex<LaneRecv>,
}

#[derive(Default)]
pub(crate) struct LaneSend {
    pub(crate) client_stream: Option<SendStream>,
    pub(crate) server_stream: Option<SendStream>,
}

pub(crate) struct LaneRecv {
    pub(crate) buffer: Vec<u8>,
    pub(crate) next_recv_byte: u64,
}

impl Default for LaneRecv {
    fn default() -> Self {
        Self {
            buffer: Vec::with_capacity(1500),
            next_recv_byte: 0,
        }
    }
}

impl Slot {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: Mutex::new(SlotState::default()),
            refcount: AtomicU32::new(0),
            next_send_packet: AtomicU32::new(0),
            datagram_recv: Mutex::new(DatagramRecv::default()),
            lanes: std::array::from_fn(|_| Lane::default()),
        }
    }

    /// Clears the locked state fields and initiates close on every transport
    /// handle held there. Does not touch the refcount: the closed watchers
    /// drain it as the transport finishes.
    pub(crate) fn reset_state(state: &mut SlotState) {
        if let Some(conn) = state.client_conn.take() {
            conn.close(VarInt::from_u32(RESET_CODE), b"reset");
        }
        if let Some(conn) = state.server_conn.take() {
            conn.close(VarInt::from_u32(RESET_CODE), b"reset");
        }
        if let Some(endpoint) = state.client_endpoint.take() {
            endpoint.close(VarInt::from_u32(RESET_CODE), b"reset");
        }
        *state = SlotState::default();
    }

    /// Clears every lane and the datagram counters.
    pub(crate) async fn reset_lanes(&self) {
        for lane in &self.lanes {
            {
                let mut send = lane.send.lock().await;
                send.client_stream = None;
                send.server_stream = None;
            }
            {
                let mut recv = lane.recv.lock().await;
                recv.buffer.clear();
                recv.next_recv_byte = 0;
            }
        }
        self.datagram_recv.lock().await.next_recv_packet = 0;
        self.next_send_packet.store(0, Ordering::SeqCst);
    }

    /// Full teardown of the slot: both directions, all lanes, all
    /// rendezvous bookkeeping. Callers must not hold any slot lock.
    pub(crate) async fn reset_channels(&self) {
        {
            let mut state = self.state.lock().await;
            Self::reset_state(&mut state);
        }
        self.reset_lanes().await;
    }

    /// Drops the handles owned by one connection side and releases its
    /// refcount contribution. Returns the remaining count; zero means both
    /// sides are gone and the peer is disconnected.
    pub(crate) async fn shutdown_side(&self, side: Side) -> u32 {
        {
            let mut state = self.state.lock().await;
            match side {
                Side::Client => {
                    state.client_conn = None;
                    if let Some(endpoint) = state.client_endpoint.take() {
                        endpoint.close(VarInt::from_u32(RESET_CODE), b"closed");
                    }
                }
                Side::Server => state.server_conn = None,
            }
        }
        for lane in &self.lanes {
            let mut send = lane.send.lock().await;
            match side {
                Side::Client => send.client_stream = None,
                Side::Server => send.server_stream = None,
            }
        }
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }
}
