/// Event-to-process pipeline for a set of rules.
///
/// ```text
/// watcher ─▶ fan-out ─┬─▶ filter ─▶ batch ─▶ run   (rule 0)
///                     └─▶ filter ─▶ batch ─▶ run   (rule 1) ...
/// ```
///
/// Every stage is its own task. Stages are joined by unbounded channels,
/// except batch → run, which hands over one path per runner request.
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::batch::{self, QUIET_PERIOD};
use crate::event::DaemonEvent;
use crate::filter::filter_matching;
use crate::rule::Rule;
use crate::runner::{run_each, RunContext};
use crate::terminate::terminate;
use crate::watcher::Watcher;

/// A running pipeline.
pub struct Pipeline {
    rules: Vec<Arc<Rule>>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Registers watches under `root` and starts every stage. Watch errors
    /// are reported on `events`.
    pub fn start(
        root: &Path,
        rules: Vec<Arc<Rule>>,
        ctx: RunContext,
        events: mpsc::Sender<DaemonEvent>,
    ) -> Result<Self> {
        let watcher = Watcher::new(root)?;
        let (names_tx, names_rx) = mpsc::unbounded_channel();

        let mut handles = vec![tokio::spawn(watcher.run(names_tx, events))];
        let mut outs = Vec::with_capacity(rules.len());

        for rule in &rules {
            let (raw_tx, raw_rx) = mpsc::unbounded_channel();
            let (matched_tx, matched_rx) = mpsc::unbounded_channel();
            let (releases, requests) = batch::handoff();
            outs.push(raw_tx);

            handles.push(tokio::spawn(filter_matching(raw_rx, matched_tx, Arc::clone(rule))));
            handles.push(tokio::spawn(batch::batch(
                matched_rx,
                requests,
                rule.new_backlog(),
                QUIET_PERIOD,
            )));
            handles.push(tokio::spawn(run_each(releases, Arc::clone(rule), ctx.clone())));
        }

        handles.push(tokio::spawn(fan_out(names_rx, outs)));

        Ok(Pipeline { rules, handles })
    }

    /// Stops every stage, then terminates any service still running.
    pub async fn stop(self) {
        for handle in &self.handles {
            handle.abort();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        for rule in &self.rules {
            if rule.has_instance() {
                tracing::info!("[rule {}] Killing service", rule.id);
                terminate(rule).await;
            }
        }
    }
}

/// Copies every path from `rx` onto each of `outs`. Rules whose queue has
/// closed are skipped.
pub async fn fan_out(mut rx: mpsc::UnboundedReceiver<String>, outs: Vec<mpsc::UnboundedSender<String>>) {
    while let Some(path) = rx.recv().await {
        for out in &outs {
            let _ = out.send(path.clone());
        }
    }
}
