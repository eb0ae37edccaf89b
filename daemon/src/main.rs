mod backlog;
mod batch;
mod cli;
mod config;
mod event;
mod filter;
mod livereload;
mod logging;
mod output;
mod pipeline;
mod rule;
mod runner;
mod terminate;
mod watcher;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, Mutex};

use crate::cli::Cli;
use crate::event::DaemonEvent;
use crate::rule::Rule;
use crate::runner::RunContext;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = match config::resolve(&cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("[config] {e:#}");
            std::process::exit(2);
        }
    };

    let mut rules = Vec::with_capacity(config.rules.len());
    for (id, rule_config) in config.rules.iter().enumerate() {
        match Rule::from_config(id, rule_config) {
            Ok(rule) => rules.push(Arc::new(rule)),
            Err(e) => {
                tracing::error!("[config] {e:#}");
                std::process::exit(2);
            }
        }
    }

    // ── Output sink ───────────────────────────────────────────────────────────
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(output::print(out_rx, config.decoration));

    // ── Live reload ───────────────────────────────────────────────────────────
    let reload_tx = match &config.websocket_addr {
        Some(addr) => {
            let listener = match livereload::bind(addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("[livereload] {e:#}");
                    std::process::exit(1);
                }
            };
            let broadcaster = Arc::new(livereload::WsBroadcaster::new());
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let broadcaster = Arc::clone(&broadcaster);
                tokio::spawn(async move { broadcaster.run(rx).await });
            }
            tokio::spawn(async move {
                if let Err(e) = livereload::serve(listener, broadcaster).await {
                    tracing::error!("[livereload] {e:#}");
                }
            });
            Some(tx)
        }
        None => None,
    };

    let ctx = RunContext {
        out: out_tx,
        sequential: config.sequential.then(|| Arc::new(Mutex::new(()))),
        reload: reload_tx,
    };

    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(8);

    // Graceful shutdown on Ctrl+C.
    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(DaemonEvent::Shutdown).await;
            }
        });
    }

    // ── Pipeline ──────────────────────────────────────────────────────────────
    let pipeline = match pipeline::Pipeline::start(&config.root, rules, ctx, event_tx) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("[watcher] {e:#}");
            std::process::exit(1);
        }
    };
    tracing::info!("[watcher] Watching {}", config.root.display());

    // ── Event loop ────────────────────────────────────────────────────────────
    let mut exit_code = 0;
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::WatcherFailed(e) => {
                tracing::error!("[watcher] Stopped: {e}");
                exit_code = 1;
                break;
            }
            DaemonEvent::Shutdown => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    pipeline.stop().await;
    std::process::exit(exit_code);
}
