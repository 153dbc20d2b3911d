use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use notify::event::AccessKind;
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Directory to watch for `path`. The file itself may be replaced by
/// rename, so we watch its parent and filter by name.
pub(crate) fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Whether `event` could mean the contents of the file named `target` changed.
pub(crate) fn is_relevant(event: &Event, target: &OsString) -> bool {
    let kind_matters = match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => true,
        EventKind::Access(AccessKind::Close(notify::event::AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        EventKind::Any | EventKind::Other => true,
    };

    kind_matters
        && event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|name| name == target.as_os_str()))
}

fn target_name(path: &Path) -> Result<OsString> {
    path.file_name()
        .map(|name| name.to_os_string())
        .with_context(|| format!("not a file path: {}", path.display()))
}

/// Event handler shared by both watcher kinds: relevant events become one
/// queued signal on `tx`.
fn forward_to(target: OsString, tx: mpsc::Sender<()>) -> impl FnMut(notify::Result<Event>) + Send + 'static {
    move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if is_relevant(&event, &target) {
                tracing::trace!(kind = ?event.kind, "filesystem event");
                // a full queue already holds a pending signal
                let _ = tx.try_send(());
            }
        }
        Err(err) => tracing::warn!("watch error: {err}"),
    }
}

fn watch_parent<W: Watcher>(mut watcher: W, path: &Path) -> Result<W> {
    let dir = watch_dir(path);
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch: {}", dir.display()))?;
    Ok(watcher)
}

/// Start a native watcher that signals `tx` whenever `path` may have changed.
/// The returned watcher must be kept alive.
pub fn watch_file(path: &Path, tx: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
    let handler = forward_to(target_name(path)?, tx);
    let watcher = notify::recommended_watcher(handler).context("failed to create filesystem watcher")?;
    watch_parent(watcher, path)
}

/// Start a [`PollWatcher`] that scans the file's directory every `interval`
/// and signals `tx` when the file's modification time changes, appears or
/// disappears. Covers filesystems where native events are unreliable. The
/// returned watcher must be kept alive.
pub fn poll_file(path: &Path, interval: Duration, tx: mpsc::Sender<()>) -> Result<PollWatcher> {
    let handler = forward_to(target_name(path)?, tx);
    let config = Config::default().with_poll_interval(interval);
    let watcher = PollWatcher::new(handler, config).context("failed to create poll watcher")?;
    watch_parent(watcher, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessMode, CreateKind, DataChange, ModifyKind};
    use tempfile::TempDir;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn only_events_for_the_target_count() {
        let target = OsString::from("inventory.csv");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Any));

        assert!(is_relevant(&event(modify, "/data/inventory.csv"), &target));
        assert!(is_relevant(&event(EventKind::Create(CreateKind::File), "/data/inventory.csv"), &target));
        assert!(!is_relevant(&event(modify, "/data/other.csv"), &target));
        assert!(!is_relevant(&event(EventKind::Access(AccessKind::Read), "/data/inventory.csv"), &target));
        assert!(is_relevant(
            &event(EventKind::Access(AccessKind::Close(AccessMode::Write)), "/data/inventory.csv"),
            &target
        ));
    }

    #[test]
    fn bare_file_names_watch_the_current_dir() {
        assert_eq!(watch_dir(Path::new("inventory.csv")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/data/inventory.csv")), PathBuf::from("/data"));
    }

    #[tokio::test]
    async fn polling_notices_rewrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.csv");
        std::fs::write(&path, "a\n1\n").unwrap();
        std::fs::write(dir.path().join("other.csv"), "b\n").unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let poller = poll_file(&path, Duration::from_millis(20), tx).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        // siblings are filtered out
        std::fs::write(dir.path().join("other.csv"), "b\n2\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        std::fs::write(&path, "a\n1\n2\n").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(signal, Ok(Some(()))));
        drop(poller);
    }

    #[tokio::test]
    async fn polling_notices_the_file_appearing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("inventory.csv");

        let (tx, mut rx) = mpsc::channel(4);
        let _poller = poll_file(&path, Duration::from_millis(20), tx).unwrap();
        std::fs::write(&path, "a\n1\n").unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(signal, Ok(Some(()))));
    }
}
