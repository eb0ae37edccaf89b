pub enum DaemonEvent {
    /// The filesystem watcher hit an unrecoverable error and stopped.
    WatcherFailed(notify::Error),
    /// Ctrl+C received; stop running services and exit.
    Shutdown,
}
