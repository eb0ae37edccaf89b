/// Coalesces bursts of matching paths and hands them to the runner one at a
/// time.
///
/// Filesystem notifications arrive in bursts (an editor save is often
/// several events). The batcher waits a fixed quiet period after the first
/// event of a burst, then releases the backlog one path per runner request
/// while it keeps accepting new paths. The handoff is demand-driven: a path
/// leaves the backlog only when the runner asks for it, so a path that
/// changes again while the runner is busy is still collapsed.
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::backlog::Backlog;

/// Fixed window measured from the first event of a burst. Not extended by
/// later events.
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

type Request = oneshot::Sender<String>;

/// Runner side of the handoff.
pub struct Releases {
    requests: mpsc::Sender<Request>,
}

impl Releases {
    /// Waits for the next released path. Returns `None` once the batcher has
    /// exited and nothing more will be released.
    pub async fn next(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(tx).await.ok()?;
        rx.await.ok()
    }
}

/// Creates the two ends of a batcher → runner handoff.
pub fn handoff() -> (Releases, mpsc::Receiver<Request>) {
    let (tx, rx) = mpsc::channel(1);
    (Releases { requests: tx }, rx)
}

/// Batching loop for one rule. Runs until `rx` closes and the backlog has
/// been released, or until the runner goes away.
pub async fn batch(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut requests: mpsc::Receiver<Request>,
    mut backlog: Box<dyn Backlog>,
    quiet: Duration,
) {
    let mut inbound_open = true;

    while inbound_open {
        // ── Idle: wait for the first path of a burst ──────────────────────────
        let Some(first) = rx.recv().await else { break };
        backlog.add(first);

        // ── Quiet period: keep collecting ─────────────────────────────────────
        let timer = tokio::time::sleep(quiet);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                path = rx.recv(), if inbound_open => match path {
                    Some(path) => backlog.add(path),
                    None => inbound_open = false,
                },
            }
        }

        // ── Release: hand out one path per request, still collecting ──────────
        loop {
            tokio::select! {
                path = rx.recv(), if inbound_open => match path {
                    Some(path) => backlog.add(path),
                    None => inbound_open = false,
                },
                request = requests.recv() => {
                    let Some(request) = request else { return };
                    // A dropped request means the runner stopped waiting;
                    // keep the path for the next one.
                    if request.send(backlog.next().to_string()).is_ok() && backlog.remove_one() {
                        break;
                    }
                }
            }
        }
    }
}
