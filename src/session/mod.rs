//! Session orchestrator
//!
//! One [`KoiSession`] owns everything a host needs to talk to its peers: the
//! shared UDP socket (sentinel plus QUIC listener on one port), the slot
//! table, the rendezvous retry daemon, and the accept loop that admits only
//! peers who completed the UDP handshake.
//!
//! # Threading
//!
//! The session is task-based. `start` spawns:
//! - the rendezvous consumer, draining packets the demultiplexer diverted,
//! - the listener accept loop,
//! - the retry daemon.
//!
//! Per connected peer, further pumps are spawned in [`pump`]. All tasks
//! watch the session's cancellation token and unwind on shutdown.
//!
//! # Locking
//!
//! The creation lock serializes slot allocation and nests outside the
//! per-slot modification locks; those nest outside the per-lane locks.
//! Lookups use `try_lock` on slots and skip contended entries, so the
//! consumer can never deadlock against a transport pump holding a slot.

pub(crate) mod handshake;
pub(crate) mod pump;
pub(crate) mod slot;

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use quinn::Runtime;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::addr;
use crate::codec::rendezvous::{self, PortQuad};
use crate::hooks::SessionHooks;
use crate::sentinel::Sentinel;
use crate::session::slot::{MAX_PEERS, Slot};
use crate::transport::{self, demux::DemuxSocket};

/// A started peer-to-peer session.
///
/// Dropping the handle cancels the daemon tasks and closes the endpoint;
/// call [`KoiSession::shutdown`] first for an orderly teardown that waits
/// for in-flight transport work.
pub struct KoiSession {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    pub(crate) hooks: Arc<dyn SessionHooks>,
    pub(crate) endpoint: quinn::Endpoint,
    pub(crate) sentinel: Sentinel,
    pub(crate) client_config: quinn::ClientConfig,
    pub(crate) slots: [Arc<Slot>; MAX_PEERS],
    /// Serializes slot allocation across connect_to and inbound rendezvous.
    pub(crate) creation_lock: Mutex<()>,
    pub(crate) shutdown: CancellationToken,
}

impl KoiSession {
    /// Binds the shared UDP port and starts the session daemons.
    ///
    /// Pass `port = 0` to let the OS pick. On success the session is
    /// reachable on [`KoiSession::sentinel_port`] and will accept peers that
    /// complete the rendezvous; on failure nothing is left behind.
    pub async fn start(hooks: Arc<dyn SessionHooks>, port: u16) -> crate::Result<Self> {
        let server_config = transport::server_config()?;
        let client_config = transport::client_config()?;

        let socket = bind_dual_stack(port)?;
        let runtime = Arc::new(quinn::TokioRuntime);
        let wrapped = runtime.wrap_udp_socket(socket)?;

        let (rendezvous_tx, rendezvous_rx) = mpsc::unbounded_channel();
        let demux = Arc::new(DemuxSocket::new(wrapped, rendezvous_tx));

        let endpoint = quinn::Endpoint::new_with_abstract_socket(
            transport::endpoint_config(),
            Some(server_config),
            demux.clone(),
            runtime,
        )?;

        let shared = Arc::new(SessionShared {
            hooks,
            endpoint,
            sentinel: Sentinel::new(demux),
            client_config,
            slots: std::array::from_fn(|i| Arc::new(Slot::new(i))),
            creation_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(consume_loop(shared.clone(), rendezvous_rx));
        tokio::spawn(accept_loop(shared.clone()));
        tokio::spawn(handshake::retry_daemon(shared.clone()));

        tracing::info!("session listening on UDP port {}", shared.sentinel.port());
        Ok(Self { shared })
    }

    /// The UDP port shared by the sentinel and the listener.
    pub fn sentinel_port(&self) -> u16 {
        self.shared.sentinel.port()
    }

    /// Starts connecting to a peer's sentinel endpoint.
    ///
    /// Fire and forget: a malformed address, a saturated slot table, or an
    /// attempt already in flight for the same endpoint are all silently
    /// dropped. Success surfaces later as an `on_accept` invocation.
    pub async fn connect_to(&self, addr_and_port: &str, port: u16) {
        let Some(remote) = addr::parse_endpoint(addr_and_port, port) else {
            tracing::debug!("connect_to: unparseable endpoint {addr_and_port:?}");
            return;
        };
        self.shared.connect_to(remote).await;
    }

    /// Orderly teardown: resets every slot, waits for in-flight transport
    /// callbacks to release their refcounts, then closes the endpoint.
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        for slot in &self.shared.slots {
            slot.reset_channels().await;
            while slot.refcount.load(Ordering::SeqCst) != 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        self.shared.endpoint.close(0u32.into(), b"session closed");
        self.shared.endpoint.wait_idle().await;
        tracing::info!("session shut down");
    }
}

impl Drop for KoiSession {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.endpoint.close(0u32.into(), b"session dropped");
    }
}

impl SessionShared {
    pub(crate) async fn connect_to(&self, remote: SocketAddrV6) {
        let _creation = self.creation_lock.lock().await;

        let (matching, index) = self.find_matching(remote).await;
        // an attempt to this endpoint is already in flight or connected
        if matching {
            return;
        }
        let Some(index) = index else {
            tracing::debug!("connect_to {remote}: peer table full");
            return;
        };

        // Reserve the local client port the peer's listener will punch.
        let transient = match bind_transient() {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("connect_to {remote}: reserving a client port failed: {e}");
                return;
            }
        };
        let local_client = match transient.local_addr() {
            Ok(a) => a.port(),
            Err(e) => {
                tracing::warn!("connect_to {remote}: {e}");
                return;
            }
        };

        let slot = &self.slots[index];
        let quad = {
            let mut state = slot.state.lock().await;
            state.ports = PortQuad {
                local_server: self.sentinel.port(),
                local_client,
                remote_server: 0,
                remote_client: 0,
            };
            state.handshake_begin = Some(Instant::now());
            state.transient = Some(transient);
            state.remote_sentinel = Some(remote);
            state.ports
        };

        tracing::debug!("slot {index}: sending rendezvous packet 1 to {remote}");
        self.send_ports(remote, quad);
    }

    /// Finds the slot holding `remote`, or the first free slot.
    ///
    /// Slots whose lock is contended are skipped rather than awaited; the
    /// result is only meaningful while the caller holds the creation lock.
    pub(crate) async fn find_matching(&self, remote: SocketAddrV6) -> (bool, Option<usize>) {
        let mut first_free = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let Ok(state) = slot.state.try_lock() else {
                continue;
            };
            if state.remote_sentinel == Some(remote) {
                return (true, Some(i));
            }
            if first_free.is_none()
                && slot.refcount.load(Ordering::SeqCst) == 0
                && state.ports.is_zero()
            {
                first_free = Some(i);
            }
        }
        (false, first_free)
    }

    /// Matches an inbound transport connection against the slot table.
    ///
    /// The peer must be dialing from the client port it announced during
    /// the rendezvous, from the same address as its sentinel. Anything else
    /// never completed the UDP handshake and is refused.
    pub(crate) async fn match_incoming(&self, remote: SocketAddrV6) -> Option<Arc<Slot>> {
        for slot in &self.slots {
            let state = slot.state.lock().await;
            // port first; it is cheaper than the address comparison
            if state.ports.remote_client == 0 || state.ports.remote_client != remote.port() {
                continue;
            }
            if let Some(sentinel) = state.remote_sentinel
                && sentinel.ip() == remote.ip()
            {
                return Some(slot.clone());
            }
        }
        None
    }

    /// Emits one rendezvous packet carrying the given quad.
    pub(crate) fn send_ports(&self, remote: SocketAddrV6, quad: PortQuad) {
        let wire = rendezvous::encode(
            quad.local_server,
            quad.local_client,
            quad.remote_server,
            quad.remote_client,
        );
        self.sentinel.send_to(remote, &wire);
    }
}

async fn consume_loop(
    shared: Arc<SessionShared>,
    mut rendezvous_rx: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            packet = rendezvous_rx.recv() => match packet {
                Some((data, remote)) => shared.consume_rendezvous(data, remote).await,
                None => return,
            }
        }
    }
}

async fn accept_loop(shared: Arc<SessionShared>) {
    loop {
        let incoming = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            incoming = shared.endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return,
            }
        };

        let remote = addr::canonical_v6(incoming.remote_address());
        let Some(slot) = shared.match_incoming(remote).await else {
            tracing::debug!("refusing connection from {remote}: no matching rendezvous");
            incoming.refuse();
            continue;
        };

        let connecting = match incoming.accept() {
            Ok(connecting) => connecting,
            Err(e) => {
                tracing::debug!("accepting connection from {remote} failed: {e}");
                continue;
            }
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            match connecting.await {
                Ok(connection) => pump::adopt_server_connection(shared, slot, connection).await,
                Err(e) => tracing::debug!("inbound connection from {remote} failed: {e}"),
            }
        });
    }
}

/// Binds a dual-stack UDP socket so one port serves both address families.
fn bind_dual_stack(port: u16) -> crate::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_only_v6(false)?;
    let local = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port);
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Reserves a fresh OS-chosen port for one peer's client connection.
pub(crate) fn bind_transient() -> crate::Result<std::net::UdpSocket> {
    bind_dual_stack(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dual_stack_bind_reports_a_port() {
        let socket = bind_dual_stack(0).expect("bind");
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn transient_ports_are_distinct() {
        let a = bind_transient().unwrap();
        let b = bind_transient().unwrap();
        assert_ne!(
            a.local_addr().unwrap().port(),
            b.local_addr().unwrap().port()
        );
    }
}
