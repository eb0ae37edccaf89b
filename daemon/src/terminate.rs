/// Stops a running command with escalating force.
///
/// Stages: soft interrupt (^C written to the pseudo-terminal), then SIGINT
/// to the whole process group, then SIGKILL to the group, repeated until the
/// instance is reaped. Each stage gets [`ESCALATION_INTERVAL`] to take
/// effect, so a stuck instance is gone after roughly two intervals.
use std::fmt;
use std::io::Write;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::rule::{ProcessHandle, Rule};

pub const ESCALATION_INTERVAL: Duration = Duration::from_millis(500);

/// The terminal interrupt character, what ^C sends.
const ETX: u8 = 3;

/// Signals sent after the soft interrupt, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Interrupt,
    Kill,
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::Interrupt => f.write_str("SIGINT"),
            Escalation::Kill => f.write_str("SIGKILL"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SignalError {
    /// The process group no longer exists; treated as a confirmed stop.
    #[error("no such process")]
    NoSuchProcess,
    #[error("{0}")]
    Failed(String),
}

/// Something that can be stopped in stages.
pub trait Target {
    /// Best-effort soft interrupt. Failures are ignored; the target may
    /// already be gone.
    fn interrupt(&mut self);
    fn signal(&mut self, signal: Escalation) -> Result<(), SignalError>;
}

impl Target for ProcessHandle {
    fn interrupt(&mut self) {
        let _ = self.tty.write_all(&[ETX]);
        let _ = self.tty.flush();
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: Escalation) -> Result<(), SignalError> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            // Without a pid the group cannot be addressed; end the child alone.
            return self
                .killer
                .kill()
                .map_err(|e| SignalError::Failed(e.to_string()));
        };
        let sig = match signal {
            Escalation::Interrupt => Signal::SIGINT,
            Escalation::Kill => Signal::SIGKILL,
        };
        // The child leads its own session, so its pid is also the process
        // group id. A negative pid addresses the whole group.
        kill(Pid::from_raw(-(pid as i32)), sig).map_err(|e| match e {
            Errno::ESRCH => SignalError::NoSuchProcess,
            other => SignalError::Failed(other.to_string()),
        })
    }

    #[cfg(not(unix))]
    fn signal(&mut self, _signal: Escalation) -> Result<(), SignalError> {
        // No process groups here; the PTY killer ends the child directly.
        self.killer
            .kill()
            .map_err(|e| SignalError::Failed(e.to_string()))
    }
}

/// Stops the rule's current instance and waits until it has been reaped.
/// Returns immediately if no instance is running.
pub async fn terminate(rule: &Rule) {
    terminate_with(rule, ESCALATION_INTERVAL).await;
}

pub async fn terminate_with(rule: &Rule, interval: Duration) {
    let (process, done) = {
        let mut lifecycle = rule.lifecycle.lock();
        lifecycle.killed = true;
        (lifecycle.process.take(), lifecycle.done.take())
    };
    let Some(done) = done else { return };
    match process {
        Some(mut process) => escalate(&mut process, done, interval, rule.id).await,
        None => {
            let _ = done.await;
        }
    }
}

/// Runs the escalation sequence against `target` until `done` fires or the
/// target is found to be gone. In the latter case `done` still gets up to one
/// more interval to fire.
pub async fn escalate<T: Target>(
    target: &mut T,
    mut done: oneshot::Receiver<()>,
    interval: Duration,
    rule_id: usize,
) {
    target.interrupt();

    let mut next = Escalation::Interrupt;
    let timer = tokio::time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = &mut done => return,
            _ = &mut timer => {
                tracing::info!("[rule {rule_id}] Sending {next} signal...");
                match target.signal(next) {
                    Ok(()) => {}
                    Err(SignalError::NoSuchProcess) => {
                        // Already reaped; let the exit handler observe the
                        // killed flag before a new instance can reset it.
                        let _ = tokio::time::timeout(interval, &mut done).await;
                        return;
                    }
                    Err(e) => tracing::warn!("[rule {rule_id}] Error killing: {e}"),
                }
                timer.as_mut().reset(tokio::time::Instant::now() + interval);
                next = Escalation::Kill;
            }
        }
    }
}
