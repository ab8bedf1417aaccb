//! Debounced recursive file watcher
//!
//! Feeds incremental rebuilds: raw notify events are deduplicated to the
//! most recent event per path, then flushed as one batch to the handler
//! after the configured window of idleness. Ignore rules match directory
//! name components and simple `*` globs against file names, so `target/`,
//! `.git/`, and editor temp files never trigger a rebuild.
//!
//! The watcher carries no graph logic; consumers wire batches into
//! [`GraphBuilder::replace_file`](crate::builder::GraphBuilder::replace_file).

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// One deduplicated change, carrying the most recent event for its path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// Watcher tunables.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Idle window before a pending batch flushes.
    pub debounce: Duration,
    /// Directory or file names ignored wherever they appear in a path.
    pub ignore_names: Vec<String>,
    /// Simple `*` globs matched against the file name.
    pub ignore_globs: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            ignore_names: vec![
                ".git".to_string(),
                "target".to_string(),
                "node_modules".to_string(),
            ],
            ignore_globs: vec!["*.tmp".to_string(), "*.swp".to_string()],
        }
    }
}

/// Recursive watcher over one root directory. Dropping it stops watching;
/// the debounce task ends when the event channel closes.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl FileWatcher {
    /// Watch `root` recursively and deliver debounced batches to `handler`.
    pub fn spawn<H, Fut>(root: impl AsRef<Path>, config: WatcherConfig, handler: H) -> Result<Self>
    where
        H: Fn(Vec<FileChange>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let root = root.as_ref().to_path_buf();
        let (tx, rx) = mpsc::unbounded_channel::<FileChange>();

        let filter = config.clone();
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<notify::Event, notify::Error>| match event {
                Ok(event) => {
                    let kind = match event.kind {
                        notify::EventKind::Create(_) => ChangeKind::Created,
                        notify::EventKind::Modify(_) => ChangeKind::Modified,
                        notify::EventKind::Remove(_) => ChangeKind::Removed,
                        _ => return,
                    };
                    for path in event.paths {
                        if should_ignore(&path, &filter) {
                            continue;
                        }
                        let _ = tx.send(FileChange { path, kind });
                    }
                }
                Err(err) => {
                    error!(error = %err, "file watch error");
                }
            },
        )
        .context("failed to create filesystem watcher")?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch {}", root.display()))?;
        info!(root = %root.display(), "watching directory");

        tokio::spawn(run_debouncer(rx, config.debounce, handler));

        Ok(Self {
            _watcher: watcher,
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Collect events until the stream has been idle for `debounce`, then flush
/// the deduplicated batch. The most recent event per path wins.
async fn run_debouncer<H, Fut>(
    mut rx: mpsc::UnboundedReceiver<FileChange>,
    debounce: Duration,
    handler: H,
) where
    H: Fn(Vec<FileChange>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut pending: HashMap<PathBuf, FileChange> = HashMap::new();
    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(change) => {
                    pending.insert(change.path.clone(), change);
                }
                None => break,
            }
            continue;
        }

        match tokio::time::timeout(debounce, rx.recv()).await {
            Ok(Some(change)) => {
                pending.insert(change.path.clone(), change);
            }
            Ok(None) => {
                flush(&mut pending, &handler).await;
                break;
            }
            Err(_idle) => {
                flush(&mut pending, &handler).await;
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut pending, &handler).await;
    }
}

async fn flush<H, Fut>(pending: &mut HashMap<PathBuf, FileChange>, handler: &H)
where
    H: Fn(Vec<FileChange>) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut batch: Vec<FileChange> = pending.drain().map(|(_, change)| change).collect();
    batch.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(changes = batch.len(), "flushing debounced batch");
    handler(batch).await;
}

/// Ignore when any path component matches an ignored name, or the file name
/// matches an ignore glob.
fn should_ignore(path: &Path, config: &WatcherConfig) -> bool {
    for component in path.components() {
        if let Some(name) = component.as_os_str().to_str() {
            if config.ignore_names.iter().any(|ignored| ignored == name) {
                return true;
            }
        }
    }
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if config
            .ignore_globs
            .iter()
            .any(|glob| glob_matches(glob, name))
        {
            return true;
        }
    }
    false
}

/// Minimal glob: a single `*` matches any run of characters.
fn glob_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            name.len() >= prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        }
        None => pattern == name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn ignore_rules_cover_names_and_globs() {
        let config = WatcherConfig::default();
        assert!(should_ignore(Path::new("proj/.git/HEAD"), &config));
        assert!(should_ignore(Path::new("proj/target/debug/x"), &config));
        assert!(should_ignore(Path::new("proj/src/lib.rs.swp"), &config));
        assert!(should_ignore(Path::new("proj/x.tmp"), &config));
        assert!(!should_ignore(Path::new("proj/src/lib.rs"), &config));
    }

    #[test]
    fn glob_matching_is_prefix_suffix() {
        assert!(glob_matches("*.tmp", "foo.tmp"));
        assert!(glob_matches("foo*", "foobar"));
        assert!(glob_matches("exact", "exact"));
        assert!(!glob_matches("*.tmp", "foo.tmpx"));
        assert!(!glob_matches("exact", "other"));
    }

    #[tokio::test(start_paused = true)]
    async fn debouncer_dedups_to_most_recent_event_per_path() {
        let (tx, rx) = mpsc::unbounded_channel();
        let batches: Arc<Mutex<Vec<Vec<FileChange>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&batches);
        let task = tokio::spawn(run_debouncer(
            rx,
            Duration::from_millis(100),
            move |batch| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(batch);
                }
            },
        ));

        // A burst of writes to one file plus one removal elsewhere.
        for kind in [ChangeKind::Created, ChangeKind::Modified, ChangeKind::Modified] {
            tx.send(FileChange {
                path: PathBuf::from("a.go"),
                kind,
            })
            .unwrap();
        }
        tx.send(FileChange {
            path: PathBuf::from("b.go"),
            kind: ChangeKind::Removed,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let batches = batches.lock();
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].path, PathBuf::from("a.go"));
        assert_eq!(batch[0].kind, ChangeKind::Modified);
        assert_eq!(batch[1].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn watcher_spawns_over_a_real_directory() {
        let dir = TempDir::new().unwrap();
        let watcher = FileWatcher::spawn(dir.path(), WatcherConfig::default(), |_batch| async {});
        let watcher = watcher.unwrap();
        assert_eq!(watcher.root(), dir.path());
    }
}
