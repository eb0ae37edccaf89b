/// Recursive filesystem watcher.
///
/// Every directory under the root is registered individually (non-recursive
/// watches), and directories that appear later are registered as their
/// create or rename events arrive, walking the new subtree on the blocking
/// pool. Watches are never removed: a deleted directory's watch simply goes
/// quiet.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::event::DaemonEvent;

pub struct Watcher {
    /// Shared with the blocking tasks that walk newly created subtrees.
    inner: Arc<Mutex<RecommendedWatcher>>,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
}

impl Watcher {
    /// Creates the watcher and registers every directory under `root`.
    /// Walk errors are logged and do not fail startup.
    pub fn new(root: &Path) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        register_tree(&mut inner, root, true);
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            events,
        })
    }

    /// Forwards changed paths to `names` until the watch subsystem reports an
    /// error, which is handed to `done` and ends the loop.
    pub async fn run(mut self, names: mpsc::UnboundedSender<String>, done: mpsc::Sender<DaemonEvent>) {
        while let Some(res) = self.events.recv().await {
            match res {
                Ok(event) => {
                    if !self.handle(event, &names).await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!("[watcher] Watch error: {e}");
                    let _ = done.send(DaemonEvent::WatcherFailed(e)).await;
                    return;
                }
            }
        }
    }

    /// Emits the event's paths and registers any new directories. Returns
    /// `false` once nobody is listening.
    async fn handle(&mut self, event: Event, names: &mpsc::UnboundedSender<String>) -> bool {
        tracing::debug!("[watcher] {:?} {:?}", event.kind, event.paths);

        if is_metadata_only(&event.kind) {
            return true;
        }
        let may_add_dirs = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Name(
                    RenameMode::To | RenameMode::Both | RenameMode::Any
                ))
        );

        for path in &event.paths {
            if names.send(normalize(path)).is_err() {
                return false;
            }
            if may_add_dirs {
                self.register_subtree(path.clone()).await;
            }
        }
        true
    }

    /// Registers a newly appeared subtree on the blocking pool. Awaited, so
    /// the watches are in place before the next event is handled.
    async fn register_subtree(&self, root: PathBuf) {
        let inner = Arc::clone(&self.inner);
        let walk = tokio::task::spawn_blocking(move || register_tree(&mut inner.lock(), &root, false));
        if let Err(e) = walk.await {
            tracing::warn!("[watcher] Directory walk failed: {e}");
        }
    }
}

/// Watches `root` and every directory beneath it. Individual files are never
/// registered.
fn register_tree(watcher: &mut RecommendedWatcher, root: &Path, initial: bool) {
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                if let Err(e) = watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
                    tracing::warn!(
                        "[watcher] Error while watching new path {}: {e}",
                        entry.path().display()
                    );
                }
            }
            Ok(_) => {}
            // Paths from rename/create events are often already gone.
            Err(e) if !initial && is_not_found(&e) => {}
            Err(e) => tracing::warn!("[watcher] Error while walking path {}: {e}", root.display()),
        }
    }
}

/// Attribute-only changes and accesses never trigger rules.
fn is_metadata_only(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Access(_) | EventKind::Modify(ModifyKind::Metadata(_)))
}

fn is_not_found(e: &walkdir::Error) -> bool {
    e.io_error()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound)
}

/// Converts an event path to the string handed to rules, without a leading
/// `./`.
pub fn normalize(path: &Path) -> String {
    let text = path.to_string_lossy();
    match text.strip_prefix("./") {
        Some(rest) => rest.to_string(),
        None => text.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, MetadataKind};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn expect_path(rx: &mut mpsc::UnboundedReceiver<String>, want: &Path) {
        let want = normalize(want);
        let found = timeout(Duration::from_secs(5), async {
            while let Some(path) = rx.recv().await {
                if path == want {
                    return true;
                }
            }
            false
        })
        .await;
        assert!(matches!(found, Ok(true)), "never saw {want}");
    }

    /// Event paths are reported under the resolved root on every platform.
    fn scratch_dir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn start(root: &Path) -> (mpsc::UnboundedReceiver<String>, mpsc::Receiver<DaemonEvent>) {
        let watcher = Watcher::new(root).unwrap();
        let (names_tx, names_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::channel(1);
        tokio::spawn(watcher.run(names_tx, done_tx));
        (names_rx, done_rx)
    }

    // ── normalize ─────────────────────────────────────────────────────────────

    #[test]
    fn normalize_strips_leading_dot_slash() {
        assert_eq!(normalize(Path::new("./src/main.rs")), "src/main.rs");
        assert_eq!(normalize(Path::new("src/main.rs")), "src/main.rs");
        assert_eq!(normalize(Path::new("/abs/./x")), "/abs/./x");
    }

    #[test]
    fn metadata_and_access_are_ignored() {
        assert!(is_metadata_only(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))));
        assert!(is_metadata_only(&EventKind::Access(notify::event::AccessKind::Any)));
        assert!(!is_metadata_only(&EventKind::Modify(ModifyKind::Any)));
        assert!(!is_metadata_only(&EventKind::Create(CreateKind::File)));
    }

    // ── handle ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn handle_drops_metadata_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new(dir.path()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let chmod = Event::new(EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)))
            .add_path(PathBuf::from("./a.txt"));
        assert!(watcher.handle(chmod, &tx).await);
        assert!(rx.try_recv().is_err());

        let write = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("./a.txt"));
        assert!(watcher.handle(write, &tx).await);
        assert_eq!(rx.try_recv().unwrap(), "a.txt");
    }

    #[tokio::test]
    async fn handle_reports_closed_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new(dir.path()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let write = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("x"));
        assert!(!watcher.handle(write, &tx).await);
    }

    // ── run ───────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn reports_file_changes() {
        let (_dir, root) = scratch_dir();
        let (mut names, _done) = start(&root);

        let file = root.join("main.go");
        std::fs::write(&file, "package main").unwrap();
        expect_path(&mut names, &file).await;
    }

    #[tokio::test]
    async fn watches_preexisting_subdirectories() {
        let (_dir, root) = scratch_dir();
        let sub = root.join("a").join("b");
        std::fs::create_dir_all(&sub).unwrap();
        let (mut names, _done) = start(&root);

        let file = sub.join("deep.txt");
        std::fs::write(&file, "x").unwrap();
        expect_path(&mut names, &file).await;
    }

    #[tokio::test]
    async fn registers_directories_created_later() {
        let (_dir, root) = scratch_dir();
        let (mut names, _done) = start(&root);

        let sub = root.join("new");
        std::fs::create_dir(&sub).unwrap();
        expect_path(&mut names, &sub).await;
        // The create event has been handled, so the watch is in place.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let file = sub.join("inside.txt");
        std::fs::write(&file, "x").unwrap();
        expect_path(&mut names, &file).await;
    }

    #[tokio::test]
    async fn registers_directories_renamed_into_root() {
        let (_dir, scratch) = scratch_dir();
        let root = scratch.join("watched");
        let staging = scratch.join("staging");
        std::fs::create_dir(&root).unwrap();
        std::fs::create_dir_all(staging.join("moved")).unwrap();
        let (mut names, _done) = start(&root);

        let moved = root.join("moved");
        std::fs::rename(staging.join("moved"), &moved).unwrap();
        expect_path(&mut names, &moved).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let file = moved.join("inside.txt");
        std::fs::write(&file, "x").unwrap();
        expect_path(&mut names, &file).await;
    }

    #[tokio::test]
    async fn forwards_watch_errors_and_stops() {
        let (tx, events) = mpsc::unbounded_channel();
        let mut inner = RecommendedWatcher::new(|_: notify::Result<Event>| {}, NotifyConfig::default()).unwrap();
        let watcher = Watcher {
            inner: Arc::new(Mutex::new(inner)),
            events,
        };

        let (names_tx, _names_rx) = mpsc::unbounded_channel();
        let (done_tx, mut done_rx) = mpsc::channel(1);
        let task = tokio::spawn(watcher.run(names_tx, done_tx));

        tx.send(Err(notify::Error::generic("queue overflow"))).unwrap();
        let event = timeout(Duration::from_secs(5), done_rx.recv()).await.unwrap();
        assert!(matches!(event, Some(DaemonEvent::WatcherFailed(_))));
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
