//! Client session orchestrator
//!
//! Accepts plain UDP flows on the bind address and forwards each one,
//! wrapped in DTLS, to a remote endpoint chosen per session:
//!
//! ```text
//! local sender --> UdpListener --> [admission] --> session
//!                                                   |  dial + DTLS handshake
//!                                                   v
//!                                             remote server
//! ```
//!
//! Every session derives a cancellation scope from the client's base scope,
//! optionally bounded by a drawn hard time limit, and runs the packet pump
//! until one side dies. `close()` cancels the base scope, closes the
//! listener and waits for all in-flight sessions.

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

pub use config::{ClientConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_MTU, DEFAULT_NET_TIMEOUT};

use crate::admission::{AllowFn, TimeLimit};
use crate::dialer::DynDialer;
use crate::error::{DtlsPipeError, SessionError};
use crate::listener::{FlowConn, UdpListener, DEFAULT_BACKLOG};
use crate::pump::pair_conn;
use crate::tracker::StaleMode;

type PacketConn = Arc<dyn Conn + Send + Sync>;

/// Shared per-session context, immutable after startup.
struct SessionCtx {
    dialer: DynDialer,
    dtls_config: DtlsConfig,
    timeout: Duration,
    idle_timeout: Duration,
    stale_mode: StaleMode,
    time_limit: TimeLimit,
    allow: AllowFn,
}

/// The client end of the tunnel.
pub struct Client {
    listener: Arc<UdpListener>,
    shutdown: CancellationToken,
    workers: TaskTracker,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Client {
    /// Bind the local listener and start serving flows.
    pub async fn new(mut cfg: ClientConfig) -> Result<Self, DtlsPipeError> {
        cfg.populate_defaults();

        let listener = Arc::new(
            UdpListener::bind(cfg.bind_address, DEFAULT_BACKLOG, None).await?,
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
            psk_identity_hint: Some(cfg.psk_identity.clone().into_bytes()),
            mtu: cfg.mtu,
            ..Default::default()
        };
        if cfg.enable_cid {
            // Send-only: offer the extension, use zero-length local CIDs.
            dtls_config.connection_id_generator = Some(Arc::new(Vec::new));
        }

        let ctx = Arc::new(SessionCtx {
            dialer: DynDialer::new(Arc::clone(&cfg.endpoints)),
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

        info!(listen = %listener.local_addr(), "dtlspipe client listening");

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
        if !(ctx.allow)(flow.peer()) {
            debug!(client = %flow.peer(), "flow rejected by admission policy");
            let _ = flow.close().await;
            continue;
        }
        workers.spawn(serve(Arc::clone(&ctx), flow, shutdown.child_token()));
    }
    debug!("client accept loop stopped");
}

async fn serve(ctx: Arc<SessionCtx>, flow: Arc<FlowConn>, session: CancellationToken) {
    let peer = flow.peer();
    info!(client = %peer, "[+] session");

    arm_time_limit(&ctx.time_limit, &session);

    let remote = tokio::select! {
        () = session.cancelled() => {
            let _ = flow.close().await;
            return;
        }
        res = timeout(ctx.timeout, connect_remote(&ctx)) => match res {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(client = %peer, error = %e, "remote connection failed");
                let _ = flow.close().await;
                session.cancel();
                return;
            }
            Err(_) => {
                warn!(client = %peer, timeout = ?ctx.timeout, "remote connection timed out");
                let _ = flow.close().await;
                session.cancel();
                return;
            }
        },
    };

    let near: PacketConn = flow;
    pair_conn(
        session.clone(),
        near,
        remote,
        ctx.idle_timeout,
        ctx.stale_mode,
    )
    .await;

    session.cancel();
    info!(client = %peer, "[-] session");
}

/// Dial the currently selected endpoint and complete the DTLS handshake.
async fn connect_remote(ctx: &SessionCtx) -> Result<PacketConn, SessionError> {
    let (udp, remote_addr) = ctx.dialer.dial().await?;
    debug!(remote = %remote_addr, "starting DTLS handshake");
    match DTLSConn::new(Arc::clone(&udp), ctx.dtls_config.clone(), true, None).await {
        Ok(dtls) => Ok(Arc::new(dtls)),
        Err(e) => {
            let _ = udp.close().await;
            Err(SessionError::Handshake(e.to_string()))
        }
    }
}

/// Draw the session's hard time limit and arm a canceller for it.
pub(crate) fn arm_time_limit(time_limit: &TimeLimit, session: &CancellationToken) {
    let limit = time_limit.draw();
    if limit.is_zero() {
        return;
    }
    let session = session.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(limit) => {
                debug!(limit = ?limit, "session time limit reached");
                session.cancel();
            }
            () = session.cancelled() => {}
        }
    });
}
