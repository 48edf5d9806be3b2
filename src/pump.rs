//! Bidirectional packet pump
//!
//! [`pair_conn`] couples two packet connections and copies datagrams both
//! ways until either side's error policy says stop. Three tasks share the
//! session's cancellation scope:
//!
//! - one copy loop per direction, each with a per-read idle deadline routed
//!   through the session's [`Tracker`];
//! - a watchdog that closes both connections the moment the scope is
//!   cancelled (base shutdown or the session's hard time limit), unblocking
//!   whatever the copy loops are parked on.
//!
//! A direction that terminates closes its *destination*, which surfaces an
//! error on the peer direction's next read, so one side's death drags the
//! other down within at most one idle period. Copies are per-packet with no
//! buffering across iterations; datagram order within a direction follows
//! the source socket.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use webrtc_util::conn::Conn;

use crate::tracker::{Side, StaleMode, Tracker};

/// Largest datagram carried through the tunnel.
pub const MAX_PKT_BUF: usize = 65536;

type PacketConn = Arc<dyn Conn + Send + Sync>;

/// Pump datagrams between `left` and `right` until the session ends.
///
/// Both connections are closed by the time this returns. The call itself
/// never fails; per-direction errors end the session and are logged at
/// debug level.
pub async fn pair_conn(
    scope: CancellationToken,
    left: PacketConn,
    right: PacketConn,
    idle_timeout: Duration,
    stale_mode: StaleMode,
) {
    let tracker = Arc::new(Tracker::new(stale_mode));
    let copy_done = CancellationToken::new();

    let watchdog = tokio::spawn({
        let left = Arc::clone(&left);
        let right = Arc::clone(&right);
        let scope = scope.clone();
        let copy_done = copy_done.clone();
        async move {
            tokio::select! {
                () = scope.cancelled() => {
                    trace!("session scope cancelled, closing both connections");
                    let _ = left.close().await;
                    let _ = right.close().await;
                }
                () = copy_done.cancelled() => {}
            }
        }
    });

    tokio::join!(
        copy_one_way(
            Arc::clone(&left),
            Arc::clone(&right),
            Side::Left,
            Arc::clone(&tracker),
            idle_timeout,
        ),
        copy_one_way(
            Arc::clone(&right),
            Arc::clone(&left),
            Side::Right,
            Arc::clone(&tracker),
            idle_timeout,
        ),
    );

    copy_done.cancel();
    let _ = watchdog.await;

    // Normal exits close the peer of each direction; make both closes
    // unconditional so cancellation and error paths converge.
    let _ = left.close().await;
    let _ = right.close().await;
}

/// Copy `src` to `dst` until deadline policy, error or close ends it.
///
/// `side` labels the *reading* side for the stale tracker. Transient read
/// errors (a connected UDP socket surfacing an ICMP port-unreachable as
/// `ConnectionReset`, an interrupted syscall) are logged and survived; any
/// other read or write error ends the direction.
async fn copy_one_way(
    src: PacketConn,
    dst: PacketConn,
    side: Side,
    tracker: Arc<Tracker>,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; MAX_PKT_BUF];
    loop {
        match timeout(idle_timeout, src.recv(&mut buf)).await {
            // Idle deadline fired: ask the tracker whether the session
            // survives this quiet period.
            Err(_elapsed) => {
                if tracker.handle_timeout(side) {
                    continue;
                }
                debug!(side = ?side, "dropping stale session");
                break;
            }
            Ok(Ok(n)) => {
                tracker.notify(side);
                if let Err(e) = dst.send(&buf[..n]).await {
                    debug!(side = ?side, error = %e, "write failed");
                    break;
                }
            }
            Ok(Err(e)) => {
                if is_transient(&e) {
                    debug!(side = ?side, error = %e, "ignoring transient read error");
                    continue;
                }
                debug!(side = ?side, error = %e, "read failed");
                break;
            }
        }
    }
    // Wake the opposite direction out of its pending read.
    let _ = dst.close().await;
}

/// Classify a read error as per-packet noise rather than connection death.
fn is_transient(err: &webrtc_util::Error) -> bool {
    match err {
        webrtc_util::Error::Io(io_err) => matches!(
            io_err.0.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}
