//! Change detection by polling.
//!
//! Every registered folder gets its own task that wakes on a fixed interval,
//! lists the folder and reports new or modified files to the registered
//! [`ChangeHandler`] in one call per poll.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use futures::FutureExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::core::{ChangeHandler, MonitoredFolder};
use crate::scanner;

/// Default poll interval
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// How long unregistering waits for a poll task to exit
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

type HandlerSlot = Arc<RwLock<Option<Arc<dyn ChangeHandler>>>>;

struct WatchHandle {
    folder: Arc<Mutex<MonitoredFolder>>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct FolderMonitor {
    scan_interval: Duration,
    join_timeout: Duration,
    handler: HandlerSlot,
    targets: Mutex<HashMap<String, WatchHandle>>,
}

impl FolderMonitor {
    pub fn new(scan_interval: Duration) -> Self {
        Self {
            scan_interval,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            handler: Arc::new(RwLock::new(None)),
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Set the change handler; replaces any earlier one, running poll tasks included
    pub async fn register_callback(&self, handler: Arc<dyn ChangeHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Start watching a folder. An id that is already watched is left alone.
    pub async fn register_folder(&self, mut folder: MonitoredFolder) {
        let mut targets = self.targets.lock().await;
        if targets.contains_key(&folder.upload_id) {
            warn!(upload_id = %folder.upload_id, "Folder already being monitored");
            return;
        }

        folder.last_check = SystemTime::now();
        folder.known_files = match scanner::list_matching(&folder.source_folder, &folder.pattern) {
            Ok(files) => files.into_iter().collect(),
            Err(err) => {
                error!(upload_id = %folder.upload_id, %err, "Initial scan failed");
                BTreeSet::new()
            }
        };

        let upload_id = folder.upload_id.clone();
        info!(
            upload_id = %upload_id,
            folder = %folder.source_folder.display(),
            pattern = %folder.pattern,
            known = folder.known_files.len(),
            "Started monitoring folder"
        );

        let folder = Arc::new(Mutex::new(folder));
        let token = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            upload_id.clone(),
            folder.clone(),
            self.handler.clone(),
            self.scan_interval,
            token.clone(),
        ));

        targets.insert(upload_id, WatchHandle { folder, token, task });
    }

    /// Stop a folder's poll task and forget it
    pub async fn unregister_folder(&self, upload_id: &str) {
        let Some(handle) = self.targets.lock().await.remove(upload_id) else {
            warn!(upload_id, "Folder not being monitored");
            return;
        };

        handle.token.cancel();
        match tokio::time::timeout(self.join_timeout, handle.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(upload_id, %err, "Poll task ended abnormally"),
            Err(_) => warn!(upload_id, timeout = ?self.join_timeout, "Poll task did not stop in time"),
        }

        info!(upload_id, "Stopped monitoring folder");
    }

    pub async fn stop_all(&self) {
        for upload_id in self.monitored_ids().await {
            self.unregister_folder(&upload_id).await;
        }
    }

    pub async fn is_monitoring(&self, upload_id: &str) -> bool {
        self.targets.lock().await.contains_key(upload_id)
    }

    pub async fn monitored_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.targets.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of a watched folder as of its last poll
    pub async fn folder(&self, upload_id: &str) -> Option<MonitoredFolder> {
        let folder = self.targets.lock().await.get(upload_id).map(|h| h.folder.clone())?;
        let snapshot = folder.lock().await.clone();
        Some(snapshot)
    }
}

impl Drop for FolderMonitor {
    fn drop(&mut self) {
        for handle in self.targets.get_mut().values() {
            handle.token.cancel();
        }
    }
}

async fn poll_loop(
    upload_id: String,
    folder: Arc<Mutex<MonitoredFolder>>,
    slot: HandlerSlot,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(changed) = poll_once(&folder).await else {
            continue;
        };
        if changed.is_empty() {
            continue;
        }
        if token.is_cancelled() {
            break;
        }

        let Some(handler) = slot.read().await.clone() else {
            debug!(upload_id = %upload_id, changed = changed.len(), "No change handler registered");
            continue;
        };

        info!(upload_id = %upload_id, changed = changed.len(), "Detected changed files");
        match AssertUnwindSafe(handler.on_changes(&upload_id, changed)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(upload_id = %upload_id, %err, "Change handler failed"),
            Err(_) => error!(upload_id = %upload_id, "Change handler panicked"),
        }
    }

    debug!(upload_id = %upload_id, "Poll task exiting");
}

/// One listing pass. `None` when the folder could not be listed.
async fn poll_once(folder: &Mutex<MonitoredFolder>) -> Option<BTreeSet<PathBuf>> {
    let mut folder = folder.lock().await;
    let check_time = SystemTime::now();

    let current = match scanner::list_matching(&folder.source_folder, &folder.pattern) {
        Ok(files) => files,
        Err(err) => {
            error!(upload_id = %folder.upload_id, %err, "Error checking folder");
            return None;
        }
    };

    let mut changed = BTreeSet::new();
    for path in &current {
        let is_new = !folder.known_files.contains(path);
        let is_modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .map(|modified| modified > folder.last_check)
            .unwrap_or(false);

        if is_new || is_modified {
            changed.insert(path.clone());
        }
    }

    folder.known_files = current.into_iter().collect();
    folder.last_check = check_time;
    Some(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use async_trait::async_trait;
    use filetime::FileTime;
    use tokio::sync::mpsc;
    use crate::core::{Result, TransferError};

    const INTERVAL: Duration = Duration::from_millis(50);
    const WAIT: Duration = Duration::from_secs(3);
    const QUIET: Duration = Duration::from_millis(300);

    struct Forward(mpsc::UnboundedSender<(String, BTreeSet<PathBuf>)>);

    #[async_trait]
    impl ChangeHandler for Forward {
        async fn on_changes(&self, upload_id: &str, changed_files: BTreeSet<PathBuf>) -> Result<()> {
            let _ = self.0.send((upload_id.to_string(), changed_files));
            Ok(())
        }
    }

    /// Fails (or panics) on the first call, forwards afterwards
    struct Flaky {
        calls: AtomicU32,
        panic: bool,
        inner: Forward,
    }

    #[async_trait]
    impl ChangeHandler for Flaky {
        async fn on_changes(&self, upload_id: &str, changed_files: BTreeSet<PathBuf>) -> Result<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                if self.panic {
                    panic!("handler blew up");
                }
                return Err(TransferError::internal("handler failed"));
            }
            self.inner.on_changes(upload_id, changed_files).await
        }
    }

    async fn monitor() -> (FolderMonitor, mpsc::UnboundedReceiver<(String, BTreeSet<PathBuf>)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let monitor = FolderMonitor::new(INTERVAL).with_join_timeout(Duration::from_secs(1));
        monitor.register_callback(Arc::new(Forward(tx))).await;
        (monitor, rx)
    }

    /// Write a file whose mtime is safely before the next poll's check time
    fn write_old(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
        let past = SystemTime::now() - Duration::from_secs(60);
        filetime::set_file_mtime(path, FileTime::from_system_time(past)).unwrap();
    }

    fn touch(path: &Path, content: &str) {
        fs::write(path, content).unwrap();
        filetime::set_file_mtime(path, FileTime::now()).unwrap();
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(String, BTreeSet<PathBuf>)>) -> (String, BTreeSet<PathBuf>) {
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<(String, BTreeSet<PathBuf>)>) {
        assert!(tokio::time::timeout(QUIET, rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_new_file_detected_once() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = monitor().await;
        monitor
            .register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*.txt"))
            .await;

        let file = dir.path().join("a.txt");
        write_old(&file, "hello");

        let (id, changed) = next(&mut rx).await;
        assert_eq!(id, "u1");
        assert_eq!(changed, BTreeSet::from([file.clone()]));
        assert_quiet(&mut rx).await;

        fs::remove_file(&file).unwrap();
        assert_quiet(&mut rx).await;

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn test_modified_file_detected_again() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        let (monitor, mut rx) = monitor().await;
        monitor
            .register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*.txt"))
            .await;

        write_old(&file, "v1");
        assert_eq!(next(&mut rx).await.1, BTreeSet::from([file.clone()]));
        assert_quiet(&mut rx).await;

        touch(&file, "v2");
        assert_eq!(next(&mut rx).await.1, BTreeSet::from([file.clone()]));

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn test_preexisting_files_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_old(&dir.path().join("old.txt"), "old");
        write_old(&dir.path().join("skip.md"), "md");

        let (monitor, mut rx) = monitor().await;
        monitor
            .register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*.txt"))
            .await;
        assert_quiet(&mut rx).await;

        let known = monitor.folder("u1").await.unwrap().known_files;
        assert_eq!(known, BTreeSet::from([dir.path().join("old.txt")]));

        write_old(&dir.path().join("other.md"), "ignored");
        assert_quiet(&mut rx).await;

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn test_burst_is_one_callback() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = FolderMonitor::new(Duration::from_millis(400));
        let (tx, mut rx) = mpsc::unbounded_channel();
        monitor.register_callback(Arc::new(Forward(tx))).await;
        monitor
            .register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*"))
            .await;

        for name in ["a", "b", "c"] {
            write_old(&dir.path().join(name), name);
        }

        let (_, changed) = next(&mut rx).await;
        assert_eq!(changed.len(), 3);

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = monitor().await;
        monitor.register_folder(MonitoredFolder::new("one", one.path(), "b1", "*")).await;
        monitor.register_folder(MonitoredFolder::new("two", two.path(), "b2", "*")).await;
        assert_eq!(monitor.monitored_ids().await, vec!["one".to_string(), "two".to_string()]);

        write_old(&one.path().join("a.txt"), "a");
        write_old(&two.path().join("b.txt"), "b");

        let mut seen = HashMap::new();
        while seen.len() < 2 {
            let (id, changed) = next(&mut rx).await;
            seen.entry(id).or_insert_with(BTreeSet::new).extend(changed);
        }

        assert_eq!(seen["one"], BTreeSet::from([one.path().join("a.txt")]));
        assert_eq!(seen["two"], BTreeSet::from([two.path().join("b.txt")]));

        monitor.stop_all().await;
        assert!(monitor.monitored_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let (monitor, _rx) = monitor().await;

        monitor.register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*")).await;
        monitor.register_folder(MonitoredFolder::new("u1", other.path(), "bucket", "*")).await;

        let folder = monitor.folder("u1").await.unwrap();
        assert_eq!(folder.source_folder, dir.path());

        monitor.stop_all().await;
    }

    #[tokio::test]
    async fn test_unregister_stops_polling() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, mut rx) = monitor().await;
        monitor.register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*")).await;

        monitor.unregister_folder("u1").await;
        assert!(!monitor.is_monitoring("u1").await);

        write_old(&dir.path().join("late.txt"), "late");
        assert_quiet(&mut rx).await;

        // second unregister only warns
        monitor.unregister_folder("u1").await;
    }

    #[tokio::test]
    async fn test_failing_handler_keeps_loop_alive() {
        for panic in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let (tx, mut rx) = mpsc::unbounded_channel();
            let monitor = FolderMonitor::new(INTERVAL);
            monitor
                .register_callback(Arc::new(Flaky {
                    calls: AtomicU32::new(0),
                    panic,
                    inner: Forward(tx),
                }))
                .await;
            monitor.register_folder(MonitoredFolder::new("u1", dir.path(), "bucket", "*")).await;

            write_old(&dir.path().join("first.txt"), "1");
            tokio::time::sleep(INTERVAL * 4).await;
            write_old(&dir.path().join("second.txt"), "2");

            let (_, changed) = next(&mut rx).await;
            assert_eq!(changed, BTreeSet::from([dir.path().join("second.txt")]));

            monitor.stop_all().await;
        }
    }

    #[tokio::test]
    async fn test_vanished_folder_is_logged_and_skipped() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("watched");
        fs::create_dir_all(&dir).unwrap();
        write_old(&dir.join("a.txt"), "a");

        let (monitor, mut rx) = monitor().await;
        monitor.register_folder(MonitoredFolder::new("u1", &dir, "bucket", "*")).await;

        fs::remove_dir_all(&dir).unwrap();
        assert_quiet(&mut rx).await;
        let known = monitor.folder("u1").await.unwrap().known_files;
        assert_eq!(known, BTreeSet::from([dir.join("a.txt")]));

        monitor.stop_all().await;
    }
}
