//! Rendezvous handshake and retry daemon
//!
//! The 3-packet exchange negotiates the four ports of a peer pairing and
//! punches both firewalls before any secure transport starts:
//!
//! 1. The initiator reserves a client port and announces both of its ports.
//! 2. The responder reserves its own client port, pokes the initiator's
//!    client port from its listener socket (the firewall challenge), and
//!    answers with all four ports.
//! 3. The initiator pokes back, acknowledges, and both sides dial.
//!
//! Retries ride a single daemon task with a 4 s cadence. Two give-up
//! horizons encode how much we know: 60 s when the peer never answered
//! (probably offline, fail silently) and 12 s once any peer port is known
//! (it answered once and dropped out, tell the application).

use std::net::{SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::addr;
use crate::channel::Channel;
use crate::codec::rendezvous::{PacketKind, RendezvousPacket};
use crate::hooks::{accept_guarded, deliver_guarded};
use crate::sentinel::FIREWALL_CHALLENGE;
use crate::session::slot::Slot;
use crate::session::{SessionShared, bind_transient, pump};
use crate::transport;

const RETRY_INTERVAL: Duration = Duration::from_secs(4);
const LONG_STOP: Duration = Duration::from_secs(60);
const SHORT_STOP: Duration = Duration::from_secs(12);
/// Keeps a check scheduled just under a cadence boundary from waiting a
/// whole extra tick.
const TIMER_GRACE: Duration = Duration::from_millis(2);

impl SessionShared {
    /// Entry point for every datagram the demultiplexer diverted.
    pub(crate) async fn consume_rendezvous(self: &Arc<Self>, data: Vec<u8>, remote: SocketAddr) {
        let Some(packet) = crate::codec::rendezvous::decode(&data) else {
            return;
        };
        let Some(kind) = packet.kind() else {
            return;
        };
        let remote = addr::canonical_v6(remote);

        let _creation = self.creation_lock.lock().await;
        let (matching, index) = self.find_matching(remote).await;
        let Some(index) = index else {
            tracing::debug!("rendezvous from {remote} dropped: peer table full");
            return;
        };
        let slot = self.slots[index].clone();
        let connected = slot.state.lock().await.handshake_begin.is_none();

        match kind {
            PacketKind::Initial => {
                // A repeat of packet 1 after we are connected is the peer's
                // retry crossing our completion; nothing to do.
                if matching && connected {
                    return;
                }
                tracing::debug!("slot {index}: rendezvous packet 1 from {remote}");
                self.receive_initial(&slot, packet, remote).await;
            }
            PacketKind::Response => {
                // only meaningful for an attempt we actually started
                if !matching || connected {
                    return;
                }
                tracing::debug!("slot {index}: rendezvous packet 2 from {remote}");
                self.receive_response(&slot, packet, remote).await;
            }
            PacketKind::Ack => {
                if !matching || connected {
                    return;
                }
                tracing::debug!("slot {index}: rendezvous packet 3 from {remote}");
                self.start_client(&slot, remote).await;
            }
        }
    }

    async fn receive_initial(
        &self,
        slot: &Arc<Slot>,
        packet: RendezvousPacket,
        remote: SocketAddrV6,
    ) {
        let quad = {
            let mut state = slot.state.lock().await;
            state.ports.remote_server = packet.remote_server;
            state.ports.remote_client = packet.remote_client;

            if state.handshake_begin.is_none() {
                // Passive open: reserve our client port now. When a
                // handshake is already running we dialed each other
                // simultaneously; keep the ports we chose first and let the
                // two attempts collapse into this slot.
                let reserved = bind_transient()
                    .and_then(|socket| Ok((socket.local_addr()?.port(), socket)));
                let (local_client, transient) = match reserved {
                    Ok(reserved) => reserved,
                    Err(e) => {
                        tracing::warn!("slot {}: reserving a client port failed: {e}", slot.index);
                        // leave the slot free instead of half-claimed
                        state.ports = Default::default();
                        return;
                    }
                };
                state.ports.local_server = self.sentinel.port();
                state.ports.local_client = local_client;
                state.handshake_begin = Some(Instant::now());
                state.transient = Some(transient);
                state.remote_sentinel = Some(remote);
            }
            state.ports
        };

        self.challenge_firewall(remote, packet.remote_client);
        self.send_ports(remote, quad);
    }

    async fn receive_response(
        self: &Arc<Self>,
        slot: &Arc<Slot>,
        packet: RendezvousPacket,
        remote: SocketAddrV6,
    ) {
        {
            let mut state = slot.state.lock().await;
            state.ports.remote_server = packet.remote_server;
            state.ports.remote_client = packet.remote_client;
        }

        self.challenge_firewall(remote, packet.remote_client);

        // final acknowledgement: our ports zeroed, theirs echoed
        let wire =
            crate::codec::rendezvous::encode(0, 0, packet.remote_server, packet.remote_client);
        self.sentinel.send_to(remote, &wire);

        self.start_client(slot, remote).await;
    }

    /// Pokes a 2-byte nonsense packet at the peer's reserved client port.
    ///
    /// It leaves from the shared socket, which is also the listener's port;
    /// that is the mapping the peer's NAT must hold for our later transport
    /// traffic to get through.
    fn challenge_firewall(&self, remote: SocketAddrV6, remote_client: u16) {
        if remote_client == 0 {
            return;
        }
        let target = SocketAddrV6::new(*remote.ip(), remote_client, 0, 0);
        self.sentinel.send_to(target, &FIREWALL_CHALLENGE);
    }

    /// Converts the reserved transient socket into the per-peer client
    /// endpoint and hands off to an async task that asks the application
    /// and dials the peer's listener.
    ///
    /// Both packet 2 and packet 3 funnel here; the `client_started` latch
    /// makes the second arrival a no-op.
    async fn start_client(self: &Arc<Self>, slot: &Arc<Slot>, remote: SocketAddrV6) {
        let (endpoint, remote_server) = {
            let mut state = slot.state.lock().await;
            if state.client_started {
                return;
            }
            let Some(transient) = state.transient.take() else {
                return;
            };
            // The socket that reserved the port becomes the endpoint, so
            // the punched mapping is reused without ever releasing the port.
            let endpoint = match quinn::Endpoint::new(
                transport::endpoint_config(),
                None,
                transient,
                Arc::new(quinn::TokioRuntime),
            ) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    tracing::warn!("slot {}: client endpoint failed: {e}", slot.index);
                    return;
                }
            };
            state.client_started = true;
            state.client_endpoint = Some(endpoint.clone());
            (endpoint, state.ports.remote_server)
        };

        let target = SocketAddr::V6(SocketAddrV6::new(*remote.ip(), remote_server, 0, 0));
        let shared = self.clone();
        let slot = slot.clone();
        tokio::spawn(async move {
            shared.finish_client(slot, endpoint, target).await;
        });
    }

    async fn finish_client(
        self: Arc<Self>,
        slot: Arc<Slot>,
        endpoint: quinn::Endpoint,
        target: SocketAddr,
    ) {
        // The application decides before anything is dialed.
        let channel = Channel::new(slot.clone());
        let Some(context) = accept_guarded(self.hooks.clone(), channel).await else {
            tracing::debug!("slot {}: application rejected the channel", slot.index);
            slot.reset_channels().await;
            return;
        };
        {
            let mut state = slot.state.lock().await;
            state.app_context = Some(Arc::downgrade(&context));
        }

        let connecting =
            match endpoint.connect_with(self.client_config.clone(), target, transport::SERVER_NAME)
            {
                Ok(connecting) => connecting,
                Err(e) => {
                    tracing::warn!("slot {}: connect to {target} refused to start: {e}", slot.index);
                    return;
                }
            };

        match connecting.await {
            Ok(connection) => pump::adopt_client_connection(self, slot, connection).await,
            // leave the slot to the retry daemon's timeout
            Err(e) => tracing::debug!("slot {}: connection to {target} failed: {e}", slot.index),
        }
    }

    async fn check_handshake(&self, slot: &Arc<Slot>) {
        let mut state = slot.state.lock().await;
        let Some(begin) = state.handshake_begin else {
            return;
        };
        let elapsed = begin.elapsed();

        // scheduled again before the next cadence boundary
        if elapsed < RETRY_INTERVAL - TIMER_GRACE {
            return;
        }

        if elapsed > LONG_STOP - TIMER_GRACE {
            // never heard a thing; the peer is probably offline
            tracing::info!(
                "slot {}: abandoning handshake after {elapsed:?}",
                slot.index
            );
            Slot::reset_state(&mut state);
            drop(state);
            slot.reset_lanes().await;
            return;
        }

        if state.ports.peer_known() && elapsed > SHORT_STOP - TIMER_GRACE {
            // the peer answered once and went silent; surface it
            tracing::info!(
                "slot {}: peer stopped responding during handshake",
                slot.index
            );
            let context = state.upgrade_context();
            Slot::reset_state(&mut state);
            drop(state);
            slot.reset_lanes().await;

            let hooks = self.hooks.clone();
            let channel = Channel::new(slot.clone());
            deliver_guarded("disconnect", async move {
                hooks.on_disconnect(channel, context).await;
            })
            .await;
            return;
        }

        let Some(remote) = state.remote_sentinel else {
            return;
        };
        let quad = state.ports;
        drop(state);

        tracing::debug!("slot {}: retrying rendezvous with {remote}", slot.index);
        self.send_ports(remote, quad);
    }
}

/// Walks the slot table on a fixed cadence and drives every pending
/// handshake: resend, or give up on one of the two horizons.
pub(crate) async fn retry_daemon(shared: Arc<SessionShared>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
        }
        for slot in &shared.slots {
            shared.check_handshake(slot).await;
        }
    }
}
