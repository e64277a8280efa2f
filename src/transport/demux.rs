//! Shared UDP socket demultiplexer
//!
//! The rendezvous handshake and the QUIC listener must live on the same UDP
//! port: the peer learns one server port from the sentinel exchange, and the
//! firewall challenge has to leave from that very port or the peer's NAT
//! will not admit the later QUIC traffic.
//!
//! Rather than binding two sockets to one port and hoping the OS routes
//! packets the right way, a single socket is wrapped in this demultiplexer
//! and handed to quinn as its [`AsyncUdpSocket`]. Inbound datagrams of
//! exactly eight bytes are rendezvous packets and are diverted to the
//! session's consumer channel; a QUIC packet can never be that short, so the
//! filter is unambiguous. Everything else flows to quinn untouched.
//! Outbound raw sends reuse quinn's own send path on the same socket.

use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tokio::sync::mpsc;

use crate::codec::rendezvous;

/// One UDP socket serving both the QUIC endpoint and the sentinel.
#[derive(Debug)]
pub(crate) struct DemuxSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    rendezvous_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
}

impl DemuxSocket {
    pub(crate) fn new(
        inner: Arc<dyn AsyncUdpSocket>,
        rendezvous_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    ) -> Self {
        Self {
            inner,
            rendezvous_tx,
        }
    }

    /// Sends a raw datagram from the shared socket, outside any QUIC
    /// connection. Used for rendezvous packets and the firewall challenge.
    ///
    /// Failures are reported but not retried here; the retry daemon resends
    /// handshake packets on its own cadence.
    pub(crate) fn send_raw(&self, destination: SocketAddr, data: &[u8]) -> bool {
        let transmit = Transmit {
            destination,
            ecn: None,
            contents: data,
            segment_size: None,
            src_ip: None,
        };
        match self.inner.try_send(&transmit) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("raw send to {destination} failed: {e}");
                false
            }
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.inner.local_addr().map(|a| a.port()).unwrap_or(0)
    }
}

impl AsyncUdpSocket for DemuxSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        loop {
            let count = ready!(self.inner.poll_recv(cx, bufs, meta))?;

            // Divert rendezvous packets and compact the rest of the batch in
            // place so quinn sees a contiguous prefix.
            let mut kept = 0;
            for i in 0..count {
                let len = meta[i].len;
                let stride = meta[i].stride;
                if len == rendezvous::PACKET_LEN && stride == len {
                    let packet = bufs[i][..len].to_vec();
                    let _ = self.rendezvous_tx.send((packet, meta[i].addr));
                    continue;
                }
                // zero-length datagrams carry nothing for either consumer
                if len == 0 {
                    continue;
                }
                if kept != i {
                    meta.swap(kept, i);
                    let (head, tail) = bufs.split_at_mut(i);
                    head[kept][..len].copy_from_slice(&tail[0][..len]);
                }
                kept += 1;
            }

            if kept > 0 {
                return Poll::Ready(Ok(kept));
            }
            // The whole batch was rendezvous traffic. Poll the socket again
            // instead of reporting an empty receive to quinn.
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }
}
