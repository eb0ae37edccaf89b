/// Runs a rule's command for each path released by its batcher.
///
/// Commands are attached to a pseudo-terminal so that TTY-aware programs
/// behave as they would interactively, and so that ^C written to the
/// terminal reaches them as a real interrupt. Output is forwarded line by
/// line as [`OutMsg`]s.
use std::io::{BufRead, BufReader, Read};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, ExitStatus, PtySize};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::batch::Releases;
use crate::rule::{OutMsg, ProcessHandle, Rule};
use crate::terminate::terminate;

/// Sent to live-reload clients after a rule with `reload` set completes.
pub const RELOAD_MESSAGE: &str = "reload";

/// Resources shared by every rule's runner.
#[derive(Clone)]
pub struct RunContext {
    /// Sink for command output from all rules.
    pub out: mpsc::UnboundedSender<OutMsg>,
    /// Held from just before spawn until exit when sequential mode is on.
    pub sequential: Option<Arc<AsyncMutex<()>>>,
    /// Inbound channel of the live-reload broadcaster, if one is running.
    pub reload: Option<mpsc::UnboundedSender<String>>,
}

impl RunContext {
    fn notify_reload(&self) {
        if let Some(tx) = &self.reload {
            let _ = tx.send(RELOAD_MESSAGE.to_string());
        }
    }
}

/// Replaces every occurrence of `token` in every argument with `path`.
pub fn substitute(command: &[String], token: &str, path: &str) -> Vec<String> {
    command.iter().map(|arg| arg.replace(token, path)).collect()
}

/// Runner loop for one rule. Service rules are started once up front with an
/// empty path, then restarted for every release. One-shot rules run each
/// release to completion before asking for the next.
pub async fn run_each(releases: Releases, rule: Arc<Rule>, ctx: RunContext) {
    if rule.start_service {
        start_service(&rule, "", &ctx).await;
    }
    while let Some(path) = releases.next().await {
        if rule.start_service {
            start_service(&rule, &path, &ctx).await;
        } else {
            run_once(&rule, &path, &ctx).await;
        }
    }
}

/// Stops the previous instance (if any) and starts a new one without
/// waiting for it to exit.
pub async fn start_service(rule: &Arc<Rule>, path: &str, ctx: &RunContext) {
    if rule.has_instance() {
        tracing::info!("[rule {}] Killing service", rule.id);
        terminate(rule).await;
    }
    tracing::info!("[rule {}] Starting service", rule.id);
    match run_command(rule, path, ctx).await {
        Ok(()) => {
            if rule.reload {
                ctx.notify_reload();
            }
        }
        Err(e) => tracing::error!("[rule {}] {e:#}", rule.id),
    }
}

/// Runs the command and waits for it to exit.
pub async fn run_once(rule: &Arc<Rule>, path: &str, ctx: &RunContext) {
    if let Err(e) = run_command(rule, path, ctx).await {
        tracing::error!("[rule {}] {e:#}", rule.id);
        return;
    }
    let done = rule.lifecycle.lock().done.take();
    if let Some(done) = done {
        let _ = done.await;
    }
}

/// Spawns the rule's command for `path` on a fresh pseudo-terminal and
/// records it as the rule's current instance. Returns once the process is
/// running; its exit is handled in the background and signalled through the
/// lifecycle's `done` channel.
pub async fn run_command(rule: &Arc<Rule>, path: &str, ctx: &RunContext) -> Result<()> {
    let argv = substitute(&rule.command, &rule.substitute, path);
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };

    let sequential_guard = match &ctx.sequential {
        Some(lock) => Some(Arc::clone(lock).lock_owned().await),
        None => None,
    };

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("Failed to open pseudo-terminal")?;
    let reader = pair.master.try_clone_reader()?;
    let tty = pair.master.take_writer()?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);
    cmd.cwd(std::env::current_dir().context("Failed to resolve working directory")?);
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .with_context(|| format!("Failed to start {program:?}"))?;
    // Only the child should hold the slave side, so the reader sees EOF/EIO
    // once the child and its descendants close it.
    drop(pair.slave);

    let (done_tx, done_rx) = oneshot::channel();
    {
        let mut lifecycle = rule.lifecycle.lock();
        lifecycle.killed = false;
        lifecycle.process = Some(ProcessHandle {
            pid: child.process_id(),
            tty,
            killer: child.clone_killer(),
        });
        lifecycle.done = Some(done_rx);
    }

    let out = ctx.out.clone();
    let id = rule.id;
    tokio::task::spawn_blocking(move || pump_output(reader, id, out));

    let rule = Arc::clone(rule);
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let outcome = match tokio::task::spawn_blocking(move || child.wait()).await {
            Ok(Ok(status)) => exit_outcome(&status),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let killed = rule.lifecycle.lock().killed;
        match outcome {
            Ok(()) => {
                if rule.reload && !rule.start_service {
                    ctx.notify_reload();
                }
            }
            Err(e) if !killed => {
                let _ = ctx.out.send(OutMsg::new(rule.id, format!("(error exit: {e})")));
            }
            Err(_) => {}
        }

        drop(sequential_guard);
        let _ = done_tx.send(());
    });

    Ok(())
}

/// Success, or a description of how the process ended. A signal death keeps
/// the signal's name rather than collapsing to an exit code.
fn exit_outcome(status: &ExitStatus) -> Result<(), String> {
    if status.success() {
        Ok(())
    } else {
        Err(status.to_string())
    }
}

/// Forwards terminal output line by line until the terminal closes. Read
/// errors end the stream quietly: the master reports EIO once the child
/// exits, which is the normal end of output.
fn pump_output(reader: Box<dyn Read + Send>, rule_id: usize, out: mpsc::UnboundedSender<OutMsg>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if out.send(OutMsg::new(rule_id, line)).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    // ── substitute ────────────────────────────────────────────────────────────

    #[test]
    fn substitute_replaces_every_occurrence() {
        let command = vec![
            "cp".to_string(),
            "{}".to_string(),
            "backup/{}.{}".to_string(),
            "--verbose".to_string(),
        ];
        assert_eq!(
            substitute(&command, "{}", "a.txt"),
            vec!["cp", "a.txt", "backup/a.txt.a.txt", "--verbose"]
        );
    }

    #[test]
    fn substitute_honours_custom_token() {
        let command = vec!["echo".to_string(), "{} %%".to_string()];
        assert_eq!(substitute(&command, "%%", "x"), vec!["echo", "{} x"]);
    }

    #[test]
    fn substitute_with_empty_path_removes_token() {
        let command = vec!["serve".to_string(), "--changed={}".to_string()];
        assert_eq!(substitute(&command, "{}", ""), vec!["serve", "--changed="]);
    }

    // ── exit_outcome ──────────────────────────────────────────────────────────

    #[test]
    fn exit_outcome_distinguishes_code_and_signal() {
        assert!(exit_outcome(&ExitStatus::with_exit_code(0)).is_ok());
        assert_eq!(
            exit_outcome(&ExitStatus::with_exit_code(3)).unwrap_err(),
            "Exited with code 3"
        );
        let killed = exit_outcome(&ExitStatus::with_signal("Segmentation fault")).unwrap_err();
        assert!(killed.contains("Segmentation fault"), "{killed}");
    }

    // ── process tests ─────────────────────────────────────────────────────────

    #[cfg(unix)]
    mod process {
        use super::*;

        fn make_rule(id: usize, command: &[&str], start_service: bool) -> Arc<Rule> {
            let config = RuleConfig {
                glob: None,
                regex: None,
                command: command.iter().map(|s| s.to_string()).collect(),
                substitute: "{}".to_string(),
                only_files: false,
                only_dirs: false,
                start_service,
                reload: true,
            };
            Arc::new(Rule::from_config(id, &config).unwrap())
        }

        fn make_ctx(
            sequential: bool,
        ) -> (
            RunContext,
            mpsc::UnboundedReceiver<OutMsg>,
            mpsc::UnboundedReceiver<String>,
        ) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (reload_tx, reload_rx) = mpsc::unbounded_channel();
            let ctx = RunContext {
                out: out_tx,
                sequential: sequential.then(|| Arc::new(AsyncMutex::new(()))),
                reload: Some(reload_tx),
            };
            (ctx, out_rx, reload_rx)
        }

        /// Reads output until a line equal to `want` shows up.
        async fn wait_for_line(rx: &mut mpsc::UnboundedReceiver<OutMsg>, want: &str) -> Vec<OutMsg> {
            let mut seen = Vec::new();
            let found = timeout(Duration::from_secs(10), async {
                while let Some(msg) = rx.recv().await {
                    let hit = msg.line == want;
                    seen.push(msg);
                    if hit {
                        return true;
                    }
                }
                false
            })
            .await;
            assert!(matches!(found, Ok(true)), "never saw {want:?}; got {seen:?}");
            seen
        }

        fn current_pid(rule: &Rule) -> u32 {
            rule.lifecycle
                .lock()
                .process
                .as_ref()
                .and_then(|p| p.pid)
                .unwrap()
        }

        fn is_alive(pid: u32) -> bool {
            use nix::sys::signal::kill;
            use nix::unistd::Pid;
            kill(Pid::from_raw(pid as i32), None).is_ok()
        }

        #[tokio::test]
        async fn one_shot_output_is_tagged_with_rule() {
            let rule = make_rule(7, &["echo", "hello {}"], false);
            let (ctx, mut out, mut reload) = make_ctx(false);

            run_once(&rule, "world", &ctx).await;

            let seen = wait_for_line(&mut out, "hello world").await;
            assert!(seen.iter().all(|m| m.rule_id == 7));
            assert_eq!(reload.recv().await.as_deref(), Some(RELOAD_MESSAGE));
            assert!(!rule.has_instance());
        }

        #[tokio::test]
        async fn failing_command_reports_exit_error() {
            let rule = make_rule(2, &["sh", "-c", "exit 3"], false);
            let (ctx, mut out, mut reload) = make_ctx(false);

            run_once(&rule, "", &ctx).await;

            wait_for_line(&mut out, "(error exit: Exited with code 3)").await;
            assert!(reload.try_recv().is_err());
        }

        #[tokio::test]
        async fn signal_death_is_reported_by_signal() {
            let rule = make_rule(4, &["sh", "-c", "kill -TERM $$"], false);
            let (ctx, mut out, mut reload) = make_ctx(false);

            run_once(&rule, "", &ctx).await;

            let line = timeout(Duration::from_secs(10), async {
                while let Some(msg) = out.recv().await {
                    if msg.line.starts_with("(error exit:") {
                        return Some(msg.line);
                    }
                }
                None
            })
            .await
            .unwrap()
            .unwrap();
            assert!(line.starts_with("(error exit: Terminated by "), "{line}");
            assert!(reload.try_recv().is_err());
        }

        #[tokio::test]
        async fn spawn_failure_leaves_rule_usable() {
            let rule = make_rule(0, &["/definitely/not/a/program"], false);
            let (ctx, _out, _reload) = make_ctx(true);

            run_once(&rule, "", &ctx).await;
            assert!(!rule.has_instance());

            // The sequential lock must have been released.
            let lock = ctx.sequential.clone().unwrap();
            assert!(lock.try_lock().is_ok());
        }

        #[tokio::test]
        async fn terminated_service_is_not_reported_as_failure() {
            let rule = make_rule(1, &["sh", "-c", "echo up; exec sleep 30"], true);
            let (ctx, mut out, _reload) = make_ctx(false);

            start_service(&rule, "", &ctx).await;
            wait_for_line(&mut out, "up").await;
            let pid = current_pid(&rule);

            terminate(&rule).await;
            assert!(!is_alive(pid));
            while let Ok(msg) = out.try_recv() {
                assert!(!msg.line.starts_with("(error exit"), "unexpected {msg:?}");
            }
        }

        #[tokio::test]
        async fn service_restart_stops_previous_instance_first() {
            let rule = make_rule(1, &["sh", "-c", "echo started {}; exec sleep 30"], true);
            let (ctx, mut out, mut reload) = make_ctx(false);

            start_service(&rule, "one", &ctx).await;
            wait_for_line(&mut out, "started one").await;
            let first = current_pid(&rule);

            start_service(&rule, "two", &ctx).await;
            assert!(!is_alive(first), "previous instance still running");
            let second = current_pid(&rule);
            assert_ne!(first, second);
            wait_for_line(&mut out, "started two").await;

            assert_eq!(reload.recv().await.as_deref(), Some(RELOAD_MESSAGE));
            assert_eq!(reload.recv().await.as_deref(), Some(RELOAD_MESSAGE));

            terminate(&rule).await;
            assert!(!is_alive(second));
        }

        #[tokio::test]
        async fn service_ignoring_interrupts_is_killed() {
            let rule = make_rule(
                3,
                &["sh", "-c", "trap '' INT; echo ready; while :; do sleep 1; done"],
                true,
            );
            let (ctx, mut out, _reload) = make_ctx(false);

            start_service(&rule, "", &ctx).await;
            wait_for_line(&mut out, "ready").await;
            let pid = current_pid(&rule);

            let started = std::time::Instant::now();
            terminate(&rule).await;
            assert!(!is_alive(pid));
            assert!(started.elapsed() >= crate::terminate::ESCALATION_INTERVAL);
        }

        #[tokio::test]
        async fn sequential_mode_never_overlaps() {
            let dir = tempfile::tempdir().unwrap();
            let marker = dir.path().join("running");
            let marker = marker.to_str().unwrap();
            let script = "mkdir {} || echo OVERLAP; sleep 0.3; rmdir {}; echo finished";
            let a = make_rule(0, &["sh", "-c", script], false);
            let b = make_rule(1, &["sh", "-c", script], false);
            let (ctx, mut out, _reload) = make_ctx(true);

            tokio::join!(run_once(&a, marker, &ctx), run_once(&b, marker, &ctx));

            let mut finished = 0;
            let collected = timeout(Duration::from_secs(10), async {
                while finished < 2 {
                    let Some(msg) = out.recv().await else { break };
                    assert!(!msg.line.contains("OVERLAP"), "rules overlapped: {msg:?}");
                    if msg.line == "finished" {
                        finished += 1;
                    }
                }
            })
            .await;
            assert!(collected.is_ok());
            assert_eq!(finished, 2);
        }
    }
}
