//! File change watching
//!
//! Polls the configured roots for additions, modifications, and deletions,
//! coalesces bursts of changes through a debounce window, and triggers a
//! server restart once per settled burst. Traversal prunes well-known build
//! and VCS directories without descending into them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::{ProxyConfig, SKIP_DIRECTORIES};
use crate::process::Supervisor;
use crate::protocol::{self, NOTIF_TOOLS_LIST_CHANGED};
use crate::router::ClientWriter;

/// Mapping from watched file path to its last seen modification time,
/// replaced wholesale on every poll cycle that observes a change
pub type WatchSnapshot = HashMap<PathBuf, SystemTime>;

/// How a watched path differs from the previous snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One observed difference between two snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

// ============================================================================
// Snapshot Collection and Diffing
// ============================================================================

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIP_DIRECTORIES.contains(&name))
            .unwrap_or(false)
}

/// Collect the current `{path: mtime}` snapshot over the given roots,
/// restricted to the extension allow-list
pub fn take_snapshot(roots: &[PathBuf], extensions: &[String]) -> WatchSnapshot {
    let mut snapshot = WatchSnapshot::new();

    for root in roots {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_skipped_dir(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("skipping unreadable entry: {e}");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if !extensions.iter().any(|allowed| allowed == ext) {
                continue;
            }

            if let Ok(metadata) = entry.metadata()
                && let Ok(mtime) = metadata.modified()
            {
                snapshot.insert(path.to_path_buf(), mtime);
            }
        }
    }

    snapshot
}

/// Classify every difference between two snapshots
pub fn diff_snapshots(previous: &WatchSnapshot, current: &WatchSnapshot) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for (path, mtime) in current {
        match previous.get(path) {
            None => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Added,
            }),
            Some(previous_mtime) if previous_mtime != mtime => changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }

    for path in previous.keys() {
        if !current.contains_key(path) {
            changes.push(FileChange {
                path: path.clone(),
                kind: ChangeKind::Removed,
            });
        }
    }

    changes
}

// ============================================================================
// Debounce Window
// ============================================================================

/// Coalesces bursts of changes into a single trigger.
///
/// Every observed change pushes the deadline out by the full window; the
/// trigger fires only once the deadline passes with no further changes.
#[derive(Debug)]
pub struct DebounceWindow {
    window: Duration,
    deadline: Option<Instant>,
}

impl DebounceWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
        }
    }

    /// Register a change, (re)arming the window
    pub fn observe_change(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// True exactly once per armed window, after it elapses undisturbed
    pub fn poll_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    #[allow(dead_code)]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }
}

// ============================================================================
// File Watcher
// ============================================================================

/// Polls for file changes and restarts the server once per settled burst
pub struct FileWatcher {
    config: Arc<ProxyConfig>,
    supervisor: Arc<Supervisor>,
    writer: Arc<ClientWriter>,
}

impl FileWatcher {
    pub fn new(
        config: Arc<ProxyConfig>,
        supervisor: Arc<Supervisor>,
        writer: Arc<ClientWriter>,
    ) -> Self {
        Self {
            config,
            supervisor,
            writer,
        }
    }

    /// Run the poll/debounce/restart loop until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            paths = ?self.config.watch_paths,
            debounce = ?self.config.debounce,
            "watching for file changes"
        );

        let mut snapshot = take_snapshot(&self.config.watch_paths, &self.config.watch_extensions);
        let mut debounce = DebounceWindow::new(self.config.debounce);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let current = take_snapshot(&self.config.watch_paths, &self.config.watch_extensions);
            let changes = diff_snapshots(&snapshot, &current);
            if !changes.is_empty() {
                for change in &changes {
                    debug!(path = %change.path.display(), kind = ?change.kind, "file changed");
                }
                snapshot = current;
                debounce.observe_change(Instant::now());
            }

            if debounce.poll_due(Instant::now()) {
                info!("file changes settled, restarting server");
                if self.supervisor.start(true).await {
                    let status = self.supervisor.status().await;
                    info!(
                        restart_count = status.restart_count,
                        last_restart = ?status.last_restart,
                        "server restarted after file change"
                    );
                    let changed = protocol::notification(NOTIF_TOOLS_LIST_CHANGED);
                    if let Err(e) = self.writer.write_line(&changed).await {
                        warn!("failed to notify client of tool list change: {e}");
                    }
                } else {
                    error!("server restart after file change failed");
                }
            }
        }

        debug!("file watcher stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn snapshot_of(entries: &[(&str, u64)]) -> WatchSnapshot {
        entries
            .iter()
            .map(|(path, secs)| {
                (
                    PathBuf::from(path),
                    SystemTime::UNIX_EPOCH + Duration::from_secs(*secs),
                )
            })
            .collect()
    }

    #[test]
    fn test_diff_classifies_all_change_kinds() {
        let previous = snapshot_of(&[("a.rs", 1), ("b.rs", 1), ("c.rs", 1)]);
        let current = snapshot_of(&[("a.rs", 1), ("b.rs", 2), ("d.rs", 1)]);

        let mut changes = diff_snapshots(&previous, &current);
        changes.sort_by(|left, right| left.path.cmp(&right.path));

        assert_eq!(
            changes,
            vec![
                FileChange {
                    path: PathBuf::from("b.rs"),
                    kind: ChangeKind::Modified
                },
                FileChange {
                    path: PathBuf::from("c.rs"),
                    kind: ChangeKind::Removed
                },
                FileChange {
                    path: PathBuf::from("d.rs"),
                    kind: ChangeKind::Added
                },
            ]
        );
    }

    #[test]
    fn test_diff_empty_when_nothing_changed() {
        let snapshot = snapshot_of(&[("a.rs", 1)]);
        assert!(diff_snapshots(&snapshot, &snapshot.clone()).is_empty());
    }

    #[test]
    fn test_snapshot_honors_extension_allow_list_and_skip_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        fs::write(root.join("watched.rs"), "fn main() {}").unwrap();
        fs::write(root.join("ignored.log"), "log line").unwrap();
        fs::write(root.join("no_extension"), "data").unwrap();
        fs::create_dir(root.join("target")).unwrap();
        fs::write(root.join("target").join("skipped.rs"), "fn x() {}").unwrap();
        fs::create_dir(root.join("src")).unwrap();
        fs::write(root.join("src").join("lib.rs"), "pub fn y() {}").unwrap();

        let snapshot = take_snapshot(
            &[root.to_path_buf()],
            &["rs".to_string(), "toml".to_string()],
        );

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(&root.join("watched.rs")));
        assert!(snapshot.contains_key(&root.join("src").join("lib.rs")));
    }

    #[test]
    fn test_snapshot_detects_add_modify_remove_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let extensions = vec!["rs".to_string()];

        fs::write(root.join("a.rs"), "one").unwrap();
        let first = take_snapshot(&[root.to_path_buf()], &extensions);

        // Add, modify (with an explicit future mtime), remove
        fs::write(root.join("b.rs"), "two").unwrap();
        let file = fs::File::options()
            .write(true)
            .open(root.join("a.rs"))
            .unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        drop(file);

        let second = take_snapshot(&[root.to_path_buf()], &extensions);
        let mut changes = diff_snapshots(&first, &second);
        changes.sort_by(|left, right| left.path.cmp(&right.path));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(changes[1].kind, ChangeKind::Added);

        fs::remove_file(root.join("b.rs")).unwrap();
        let third = take_snapshot(&[root.to_path_buf()], &extensions);
        let changes = diff_snapshots(&second, &third);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
    }

    #[test]
    fn test_debounce_coalesces_burst_into_single_trigger() {
        let window = Duration::from_millis(100);
        let mut debounce = DebounceWindow::new(window);
        let start = Instant::now();

        // Five changes, each well inside the window of the previous one
        for i in 0..5 {
            debounce.observe_change(start + Duration::from_millis(i * 20));
        }

        // Not due while changes keep arriving
        assert!(!debounce.poll_due(start + Duration::from_millis(150)));
        // Due exactly once after the last change's window elapses
        assert!(debounce.poll_due(start + Duration::from_millis(200)));
        assert!(!debounce.poll_due(start + Duration::from_millis(300)));
        assert!(!debounce.is_armed());
    }

    #[test]
    fn test_debounce_separated_changes_trigger_individually() {
        let window = Duration::from_millis(100);
        let mut debounce = DebounceWindow::new(window);
        let start = Instant::now();
        let mut fired = 0;

        // Three changes, each separated by more than the window
        for i in 0..3u64 {
            let at = start + Duration::from_millis(i * 500);
            debounce.observe_change(at);
            if debounce.poll_due(at + Duration::from_millis(150)) {
                fired += 1;
            }
        }

        assert_eq!(fired, 3);
    }

    #[test]
    fn test_debounce_unarmed_never_fires() {
        let mut debounce = DebounceWindow::new(Duration::from_millis(100));
        assert!(!debounce.poll_due(Instant::now() + Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_file_change_triggers_one_restart_and_notification() {
        use crate::router::{ClientWriter, PendingQueue};
        use crate::session::SessionTracker;
        use std::sync::Arc;
        use tokio::io::AsyncBufReadExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let mut config = ProxyConfig::from_env(vec!["cat".to_string()]);
        config.watch_paths = vec![root.clone()];
        config.poll_interval = Duration::from_millis(50);
        config.debounce = Duration::from_millis(300);
        config.grace_period = Duration::from_secs(1);
        let config = Arc::new(config);

        let session = Arc::new(SessionTracker::new());
        let pending = Arc::new(PendingQueue::new());
        let (server_tx, _server_rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&config),
            session,
            pending,
            server_tx,
            None,
        ));
        assert!(supervisor.start(false).await);

        let (near, far) = tokio::io::duplex(4096);
        let writer = Arc::new(ClientWriter::new(Box::new(near)));
        let shutdown = CancellationToken::new();
        let watcher = FileWatcher::new(Arc::clone(&config), Arc::clone(&supervisor), writer);
        let watcher_task = tokio::spawn(watcher.run(shutdown.clone()));

        // One burst of changes inside the debounce window
        fs::write(root.join("a.rs"), "fn a() {}").unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        fs::write(root.join("b.rs"), "fn b() {}").unwrap();

        // Exactly one restart fires once the burst settles
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.status().await.restart_count < 2 {
            assert!(Instant::now() < deadline, "watcher never restarted the server");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        // Allow a couple more poll cycles; the count must not move again
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(supervisor.status().await.restart_count, 2);

        // The client was told the tool list changed
        let mut client_out = tokio::io::BufReader::new(far);
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), client_out.read_line(&mut line))
            .await
            .expect("timed out waiting for client notification")
            .unwrap();
        assert!(line.contains("notifications/tools/list_changed"));

        shutdown.cancel();
        let _ = watcher_task.await;
        supervisor.shutdown().await;
    }
}
