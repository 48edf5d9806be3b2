//! Server session orchestrator
//!
//! Accepts DTLS flows on the bind address and forwards the decrypted
//! datagrams to a fixed plain-UDP upstream:
//!
//! ```text
//! remote client --> UdpListener --> [record filter + admission]
//!                                        |  DTLS handshake
//!                                        v
//!                                     session --> upstream dial --> pump
//! ```
//!
//! The listener's accept filter admits only flows whose first datagram
//! carries a DTLS Handshake record, discarding DPI probes before any state
//! is allocated. Source-IP rate limiting runs next, before the handshake
//! spends any CPU on the peer.

mod config;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use webrtc_dtls::config::{Config as DtlsConfig, ExtendedMasterSecretType};
use webrtc_dtls::conn::DTLSConn;
use webrtc_util::conn::Conn;

pub use config::ServerConfig;

use crate::addrgen::SingleEndpoint;
use crate::admission::{AllowFn, TimeLimit};
use crate::client::arm_time_limit;
use crate::dialer::DynDialer;
use crate::error::{DtlsPipeError, SessionError};
use crate::listener::{AcceptFilter, FlowConn, UdpListener, DEFAULT_BACKLOG};
use crate::pump::pair_conn;
use crate::tracker::StaleMode;

/// DTLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// Fixed part of a DTLS record header, in bytes.
const RECORD_HEADER_LEN: usize = 13;

type PacketConn = Arc<dyn Conn + Send + Sync>;

/// Shared per-session context, immutable after startup.
struct SessionCtx {
    upstream: DynDialer,
    dtls_config: DtlsConfig,
    timeout: Duration,
    idle_timeout: Duration,
    stale_mode: StaleMode,
    time_limit: TimeLimit,
    allow: AllowFn,
}

/// The server end of the tunnel.
pub struct Server {
    listener: Arc<UdpListener>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Server {
    /// Bind the DTLS listener and start serving flows.
    pub async fn new(mut cfg: ServerConfig) -> Result<Self, DtlsPipeError> {
        cfg.populate_defaults();

        let filter: AcceptFilter = Arc::new(|pkt: &[u8]| {
            pkt.len() >= RECORD_HEADER_LEN && pkt[0] == CONTENT_TYPE_HANDSHAKE
        });
        let listener = Arc::new(
            UdpListener::bind(cfg.bind_address, DEFAULT_BACKLOG, Some(filter)).await?,
        );

        let keystore = Arc::clone(&cfg.keystore);
        let mut dtls_config = DtlsConfig {
            cipher_suites: cfg.cipher_suites.clone(),
            elliptic_curves: cfg.elliptic_curves.clone(),
            extended_master_secret: ExtendedMasterSecretType::Require,
            psk: Some(Arc::new(move |hint: &[u8]| {
                keystore
                    .psk_for_hint(hint)
                    .map_err(|e| webrtc_dtls::Error::Other(e.to_string()))
            })),
            mtu: cfg.mtu,
            ..Default::default()
        };
        if cfg.enable_cid {
            dtls_config.connection_id_generator = Some(Arc::new(Vec::new));
        }
        debug!(
            skip_hello_verify = cfg.skip_hello_verify,
            "cookie exchange is owned by the DTLS layer"
        );

        let ctx = Arc::new(SessionCtx {
            upstream: DynDialer::new(Arc::new(SingleEndpoint(cfg.remote_address.clone()))),
            dtls_config,
            timeout: cfg.timeout,
            idle_timeout: cfg.idle_timeout,
            stale_mode: cfg.stale_mode,
            time_limit: cfg.time_limit,
            allow: Arc::clone(&cfg.allow),
        });

        let workers = TaskTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            Arc::clone(&listener),
            ctx,
            workers.clone(),
            cfg.shutdown.clone(),
        ));

        info!(
            listen = %listener.local_addr(),
            upstream = %cfg.remote_address,
            "dtlspipe server listening"
        );

        Ok(Self {
            listener,
            shutdown: cfg.shutdown,
            workers,
            accept_task: tokio::sync::Mutex::new(Some(accept_task)),
        })
    }

    /// Local listener address (useful when bound to port 0).
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.listener.local_addr()
    }

    /// Number of sessions currently running.
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.workers.len()
    }

    /// Cancel the base scope, stop the listener and wait for all sessions.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.listener.close();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
        self.workers.close();
        self.workers.wait().await;
    }
}

async fn accept_loop(
    listener: Arc<UdpListener>,
    ctx: Arc<SessionCtx>,
    workers: TaskTracker,
    shutdown: CancellationToken,
) {
    loop {
        let flow = tokio::select! {
            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(flow) => flow,
                Err(_) => break,
            },
        };
        // Admission runs before the handshake: a rejected peer costs no
        // crypto and never reaches the upstream.
        if !(ctx.allow)(flow.peer()) {
            debug!(client = %flow.peer(), "flow rejected by admission policy");
            let _ = flow.close().await;
            continue;
        }
        workers.spawn(serve(Arc::clone(&ctx), flow, shutdown.child_token()));
    }
    debug!("server accept loop stopped");
}

async fn serve(ctx: Arc<SessionCtx>, flow: Arc<FlowConn>, session: CancellationToken) {
    let peer = flow.peer();
    let transport: PacketConn = flow.clone();

    let dtls: PacketConn = tokio::select! {
        () = session.cancelled() => {
            let _ = flow.close().await;
            return;
        }
        res = timeout(
            ctx.timeout,
            DTLSConn::new(transport, ctx.dtls_config.clone(), false, None),
        ) => match res {
            Ok(Ok(conn)) => Arc::new(conn),
            Ok(Err(e)) => {
                warn!(client = %peer, error = %e, "DTLS handshake failed");
                let _ = flow.close().await;
                return;
            }
            Err(_) => {
                warn!(client = %peer, timeout = ?ctx.timeout, "DTLS handshake timed out");
                let _ = flow.close().await;
                return;
            }
        },
    };

    info!(client = %peer, "[+] session");
    arm_time_limit(&ctx.time_limit, &session);

    let upstream = tokio::select! {
        () = session.cancelled() => {
            let _ = dtls.close().await;
            return;
        }
        res = timeout(ctx.timeout, dial_upstream(&ctx)) => match res {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(client = %peer, error = %e, "upstream dial failed");
                let _ = dtls.close().await;
                session.cancel();
                info!(client = %peer, "[-] session");
                return;
            }
            Err(_) => {
                warn!(client = %peer, timeout = ?ctx.timeout, "upstream dial timed out");
                let _ = dtls.close().await;
                session.cancel();
                info!(client = %peer, "[-] session");
                return;
            }
        },
    };

    pair_conn(
        session.clone(),
        dtls,
        upstream,
        ctx.idle_timeout,
        ctx.stale_mode,
    )
    .await;

    session.cancel();
    info!(client = %peer, "[-] session");
}

async fn dial_upstream(ctx: &SessionCtx) -> Result<PacketConn, SessionError> {
    let (udp, _addr) = ctx.upstream.dial().await?;
    Ok(udp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::StaticKeystore;

    fn test_config() -> ServerConfig {
        ServerConfig::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:39998".into(),
            Arc::new(StaticKeystore::new(b"0123456789abcdef")),
        )
    }

    #[tokio::test]
    async fn binds_and_closes_cleanly() {
        let server = Server::new(test_config()).await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn non_handshake_probes_never_create_flows() {
        let server = Server::new(test_config()).await.unwrap();
        let probe = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Application-data content type (23): not a handshake record.
        let mut bogus = vec![23u8];
        bogus.extend_from_slice(&[0u8; 20]);
        probe.send_to(&bogus, server.local_addr()).await.unwrap();
        // Too short to be a record at all.
        probe.send_to(&[22u8, 1, 2], server.local_addr()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.listener.active_flows(), 0);
        assert_eq!(server.listener.stats().datagrams_filtered(), 2);
        server.close().await;
    }
}
