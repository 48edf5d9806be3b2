//! UDP flow-demultiplexing listener
//!
//! UDP has no connections, but every session needs one: the listener turns a
//! single bound socket into per-source virtual connections.
//!
//! ```text
//! recv_from loop
//!     |
//!     +-- known source --> per-flow queue --> FlowConn::recv()
//!     |
//!     +-- new source ----> accept filter --> backlog --> accept()
//! ```
//!
//! The demux loop never blocks on a slow consumer: per-flow queues and the
//! accept backlog drop datagrams/flows when full. A flow unregisters itself
//! on close, so a later datagram from the same source starts a fresh flow.
//!
//! [`FlowConn`] implements the packet-connection abstraction the DTLS layer
//! and the packet pump consume, so the same listener fronts both the plain
//! UDP side of the client and the DTLS side of the server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use webrtc_util::conn::Conn;
use webrtc_util::Error as ConnError;

/// Default number of not-yet-accepted flows kept before new ones are dropped.
pub const DEFAULT_BACKLOG: usize = 1024;

/// Depth of each flow's inbound datagram queue.
const FLOW_QUEUE_DEPTH: usize = 64;

/// Largest datagram the demux loop will read.
const MAX_DATAGRAM: usize = 65536;

/// Inspects the first datagram of a prospective flow; `false` discards it
/// without creating a flow.
pub type AcceptFilter = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// Listener construction and accept errors.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Binding the UDP socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The listener has been closed.
    #[error("listener closed")]
    Closed,
}

impl ListenerError {
    /// Listener failures end the orchestrator: a failed bind needs operator
    /// intervention and a closed listener means shutdown is underway.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Demux counters, exposed for logging and tests.
#[derive(Debug, Default)]
pub struct ListenerStats {
    flows_opened: AtomicU64,
    flows_dropped_backlog: AtomicU64,
    datagrams_filtered: AtomicU64,
    datagrams_dropped_queue: AtomicU64,
}

impl ListenerStats {
    #[must_use]
    pub fn flows_opened(&self) -> u64 {
        self.flows_opened.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn flows_dropped_backlog(&self) -> u64 {
        self.flows_dropped_backlog.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn datagrams_filtered(&self) -> u64 {
        self.datagrams_filtered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn datagrams_dropped_queue(&self) -> u64 {
        self.datagrams_dropped_queue.load(Ordering::Relaxed)
    }
}

type FlowMap = DashMap<SocketAddr, mpsc::Sender<Bytes>>;

/// A UDP listener yielding one virtual connection per source address.
pub struct UdpListener {
    local_addr: SocketAddr,
    flows: Arc<FlowMap>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<FlowConn>>>,
    shutdown: CancellationToken,
    stats: Arc<ListenerStats>,
}

impl UdpListener {
    /// Bind and start demultiplexing.
    ///
    /// `accept_filter` vets the first datagram of every prospective flow;
    /// `None` admits all sources.
    pub async fn bind(
        addr: SocketAddr,
        backlog: usize,
        accept_filter: Option<AcceptFilter>,
    ) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;
        let socket = Arc::new(socket);
        let flows: Arc<FlowMap> = Arc::new(DashMap::new());
        let stats = Arc::new(ListenerStats::default());
        let (accept_tx, accept_rx) = mpsc::channel(backlog);
        let shutdown = CancellationToken::new();

        tokio::spawn(demux_loop(
            Arc::clone(&socket),
            local_addr,
            Arc::clone(&flows),
            accept_tx,
            accept_filter,
            shutdown.clone(),
            Arc::clone(&stats),
        ));

        debug!(listen = %local_addr, backlog, "UDP listener started");

        Ok(Self {
            local_addr,
            flows,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            shutdown,
            stats,
        })
    }

    /// Wait for the next new flow.
    pub async fn accept(&self) -> Result<Arc<FlowConn>, ListenerError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Err(ListenerError::Closed),
            conn = rx.recv() => conn.ok_or(ListenerError::Closed),
        }
    }

    /// Local socket address (useful when bound to port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Demux counters.
    #[must_use]
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Number of currently registered flows.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.flows.len()
    }

    /// Stop the demux loop and wake pending `accept` calls. Existing flows
    /// keep their queues; sessions shut them down through their own scopes.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[allow(clippy::too_many_arguments)]
async fn demux_loop(
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    flows: Arc<FlowMap>,
    accept_tx: mpsc::Sender<Arc<FlowConn>>,
    accept_filter: Option<AcceptFilter>,
    shutdown: CancellationToken,
    stats: Arc<ListenerStats>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(listen = %local_addr, error = %e, "UDP read failed");
                    continue;
                }
            },
        };
        let datagram = Bytes::copy_from_slice(&buf[..len]);

        if let Some(queue) = flows.get(&peer) {
            match queue.try_send(datagram) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    stats.datagrams_dropped_queue.fetch_add(1, Ordering::Relaxed);
                    trace!(%peer, "flow queue full, datagram dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Flow died without deregistering; forget it so the next
                    // datagram from this source starts fresh.
                    drop(queue);
                    flows.remove(&peer);
                }
            }
            continue;
        }

        if let Some(filter) = &accept_filter {
            if !filter(&datagram) {
                stats.datagrams_filtered.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "first datagram rejected by accept filter");
                continue;
            }
        }

        let (tx, rx) = mpsc::channel(FLOW_QUEUE_DEPTH);
        // The queue was just created, this send cannot fail.
        let _ = tx.try_send(datagram);
        let conn = Arc::new(FlowConn {
            socket: Arc::clone(&socket),
            local_addr,
            peer,
            rx: tokio::sync::Mutex::new(rx),
            closed: CancellationToken::new(),
            deregistered: std::sync::atomic::AtomicBool::new(false),
            flows: Arc::clone(&flows),
        });
        flows.insert(peer, tx);

        match accept_tx.try_send(Arc::clone(&conn)) {
            Ok(()) => {
                stats.flows_opened.fetch_add(1, Ordering::Relaxed);
                trace!(%peer, "new flow queued for accept");
            }
            Err(_) => {
                stats.flows_dropped_backlog.fetch_add(1, Ordering::Relaxed);
                flows.remove(&peer);
                debug!(%peer, "accept backlog full, flow dropped");
            }
        }
    }
    debug!(listen = %local_addr, "UDP listener demux loop stopped");
}

/// One virtual connection: datagrams from a single source address.
pub struct FlowConn {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peer: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    closed: CancellationToken,
    deregistered: std::sync::atomic::AtomicBool,
    flows: Arc<FlowMap>,
}

impl FlowConn {
    /// The source address this flow belongs to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Conn for FlowConn {
    async fn connect(&self, _addr: SocketAddr) -> webrtc_util::Result<()> {
        Err(ConnError::Other("flow connections have a fixed peer".into()))
    }

    async fn recv(&self, buf: &mut [u8]) -> webrtc_util::Result<usize> {
        let mut rx = self.rx.lock().await;
        let datagram = tokio::select! {
            () = self.closed.cancelled() => None,
            pkt = rx.recv() => pkt,
        };
        let Some(datagram) = datagram else {
            return Err(ConnError::Other("flow closed".into()));
        };
        if buf.len() < datagram.len() {
            return Err(ConnError::Other("short read buffer".into()));
        }
        buf[..datagram.len()].copy_from_slice(&datagram);
        Ok(datagram.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> webrtc_util::Result<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.peer))
    }

    async fn send(&self, buf: &[u8]) -> webrtc_util::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(ConnError::Other("flow closed".into()));
        }
        self.socket
            .send_to(buf, self.peer)
            .await
            .map_err(Into::into)
    }

    async fn send_to(&self, _buf: &[u8], _target: SocketAddr) -> webrtc_util::Result<usize> {
        Err(ConnError::Other("flow connections have a fixed peer".into()))
    }

    fn local_addr(&self) -> webrtc_util::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    async fn close(&self) -> webrtc_util::Result<()> {
        // Deregister exactly once: a successor flow may reuse this peer key.
        if !self.deregistered.swap(true, Ordering::SeqCst) {
            self.closed.cancel();
            self.flows.remove(&self.peer);
        }
        Ok(())
    }

    fn as_any(&self) -> &(dyn std::any::Any + Send + Sync) {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bound_listener(filter: Option<AcceptFilter>) -> (UdpListener, UdpSocket) {
        let listener = UdpListener::bind("127.0.0.1:0".parse().unwrap(), 8, filter)
            .await
            .unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        (listener, client)
    }

    #[tokio::test]
    async fn demux_creates_one_flow_per_source() {
        let (listener, client_a) = bound_listener(None).await;
        let client_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr();

        client_a.send_to(b"from-a", target).await.unwrap();
        client_b.send_to(b"from-b", target).await.unwrap();

        let first = listener.accept().await.unwrap();
        let second = listener.accept().await.unwrap();
        assert_ne!(first.peer(), second.peer());
        assert_eq!(listener.active_flows(), 2);

        let mut buf = [0u8; 64];
        let n = first.recv(&mut buf).await.unwrap();
        assert!(matches!(&buf[..n], b"from-a" | b"from-b"));
    }

    #[tokio::test]
    async fn subsequent_datagrams_reach_the_same_flow() {
        let (listener, client) = bound_listener(None).await;
        let target = listener.local_addr();

        client.send_to(b"one", target).await.unwrap();
        let flow = listener.accept().await.unwrap();
        client.send_to(b"two", target).await.unwrap();

        let mut buf = [0u8; 16];
        let n = flow.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        let n = flow.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
        assert_eq!(listener.active_flows(), 1);
    }

    #[tokio::test]
    async fn flow_sends_reach_the_peer() {
        let (listener, client) = bound_listener(None).await;
        client.send_to(b"hi", listener.local_addr()).await.unwrap();
        let flow = listener.accept().await.unwrap();

        flow.send(b"reply").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert_eq!(from, listener.local_addr());
    }

    #[tokio::test]
    async fn accept_filter_discards_probes() {
        let filter: AcceptFilter = Arc::new(|pkt: &[u8]| pkt.first() == Some(&22));
        let (listener, client) = bound_listener(Some(filter)).await;
        let target = listener.local_addr();

        client.send_to(b"probe", target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(listener.active_flows(), 0);
        assert_eq!(listener.stats().datagrams_filtered(), 1);

        client.send_to(&[22, 0xfe, 0xfd], target).await.unwrap();
        let flow = listener.accept().await.unwrap();
        assert_eq!(flow.peer(), client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn closed_flow_unregisters_and_unblocks_reads() {
        let (listener, client) = bound_listener(None).await;
        client.send_to(b"x", listener.local_addr()).await.unwrap();
        let flow = listener.accept().await.unwrap();
        let mut buf = [0u8; 8];
        flow.recv(&mut buf).await.unwrap();

        let reader = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                flow.recv(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        flow.close().await.unwrap();
        assert!(reader.await.unwrap().is_err());
        assert_eq!(listener.active_flows(), 0);

        // Same source now starts a new flow.
        client.send_to(b"y", listener.local_addr()).await.unwrap();
        let again = listener.accept().await.unwrap();
        assert_eq!(again.peer(), flow.peer());
    }

    #[tokio::test]
    async fn close_unblocks_pending_accept() {
        let (listener, _client) = bound_listener(None).await;
        let listener = Arc::new(listener);
        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.close();
        assert!(matches!(waiter.await.unwrap(), Err(ListenerError::Closed)));
    }
}
