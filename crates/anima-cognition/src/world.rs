//! World model: what the being knows about the directory it observes.
//! A `notify`-based watcher feeds `world.file_*` events onto the bus; the
//! model subscribes to them, keeps a bounded change history, and answers
//! the anomaly question for the "analyze" action.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anima_bus_core::{topics, EventBus};
use anima_types::now_epoch;

/// Runtime data directories are not meaningful world signals.
const IGNORED_DIRS: [&str; 6] = ["memory", "logs", "sandbox", ".git", "target", "node_modules"];

/// Days without modification after which an otherwise-active world flags a
/// file as an anomaly candidate.
const ANOMALY_DAYS: f64 = 30.0;

const MAX_CHANGES: usize = 50;

#[derive(Debug, Clone)]
struct FileEntry {
    size: u64,
    modified_at: f64,
}

/// One observed filesystem change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// created | changed | deleted
    pub change_type: String,
    /// Path as published on the bus.
    pub path: String,
    /// Seconds-since-epoch observation time.
    pub at: f64,
}

#[derive(Debug, Default)]
struct WorldInner {
    files: HashMap<PathBuf, FileEntry>,
    changes: VecDeque<ChangeRecord>,
    scanned: bool,
}

/// The world read model.
pub struct WorldModel {
    bus: Arc<EventBus>,
    inner: RwLock<WorldInner>,
}

fn is_ignored(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .map_or(false, |s| IGNORED_DIRS.contains(&s))
    })
}

fn collect_files(root: &Path, out: &mut Vec<(PathBuf, FileEntry)>) {
    let Ok(entries) = std::fs::read_dir(root) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        if is_ignored(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            collect_files(&path, out);
        } else if meta.is_file() {
            let modified_at = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_else(now_epoch);
            out.push((path, FileEntry { size: meta.len(), modified_at }));
        }
    }
}

impl WorldModel {
    /// Create an empty model. Call [`scan`](Self::scan) once at startup.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, inner: RwLock::new(WorldInner::default()) }
    }

    /// Walk the observed directory and (re)build the file map. The first
    /// scan publishes `world.ready`.
    pub async fn scan(&self, root: &Path) -> usize {
        let root = root.to_path_buf();
        let files = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            collect_files(&root, &mut out);
            out
        })
        .await
        .unwrap_or_default();

        let (count, first_scan) = {
            let mut inner = self.inner.write();
            inner.files = files.into_iter().collect();
            let first = !inner.scanned;
            inner.scanned = true;
            (inner.files.len(), first)
        };
        info!(file_count = count, "world scan complete");
        if first_scan {
            self.bus.publish(topics::WORLD_READY, json!({"file_count": count})).await;
        }
        count
    }

    /// Register the `world.file_*` handlers on the bus.
    pub async fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        for (topic, change_type) in [
            (topics::WORLD_FILE_CREATED, "created"),
            (topics::WORLD_FILE_CHANGED, "changed"),
            (topics::WORLD_FILE_DELETED, "deleted"),
        ] {
            let model = Arc::clone(self);
            bus.subscribe(topic, &format!("world_model.{change_type}"), move |payload| {
                let model = Arc::clone(&model);
                async move {
                    let path = payload["path"].as_str().unwrap_or_default().to_string();
                    if !path.is_empty() {
                        model.record_change(change_type, &path).await;
                    }
                    Ok(())
                }
            })
            .await;
        }
    }

    async fn record_change(&self, change_type: &'static str, path: &str) {
        let summary = {
            let mut inner = self.inner.write();
            let path_buf = PathBuf::from(path);
            match change_type {
                "deleted" => {
                    inner.files.remove(&path_buf);
                }
                _ => {
                    let size = std::fs::metadata(&path_buf).map(|m| m.len()).unwrap_or(0);
                    inner
                        .files
                        .insert(path_buf, FileEntry { size, modified_at: now_epoch() });
                }
            }
            inner.changes.push_back(ChangeRecord {
                change_type: change_type.to_string(),
                path: path.to_string(),
                at: now_epoch(),
            });
            while inner.changes.len() > MAX_CHANGES {
                inner.changes.pop_front();
            }
            Self::summary_of(&inner)
        };
        debug!(change_type, path, "world change recorded");
        self.bus.publish(topics::WORLD_UPDATED, json!({"summary": summary})).await;
    }

    fn summary_of(inner: &WorldInner) -> String {
        let last = inner
            .changes
            .back()
            .map(|c| format!("{} {}", c.change_type, c.path))
            .unwrap_or_else(|| "none".to_string());
        format!(
            "{} files observed, {} recent changes, last: {last}",
            inner.files.len(),
            inner.changes.len()
        )
    }

    /// One-line world summary for prompts.
    pub fn summary(&self) -> String {
        Self::summary_of(&self.inner.read())
    }

    /// The most recent changes, newest last.
    pub fn recent_changes(&self, limit: usize) -> Vec<ChangeRecord> {
        let inner = self.inner.read();
        inner.changes.iter().rev().take(limit).rev().cloned().collect()
    }

    /// Files untouched for [`ANOMALY_DAYS`] while the world is otherwise
    /// active. Empty when nothing has changed recently (a quiet world is
    /// not anomalous).
    pub fn detect_anomalies(&self) -> Vec<String> {
        let inner = self.inner.read();
        if inner.changes.is_empty() {
            return Vec::new();
        }
        let cutoff = now_epoch() - ANOMALY_DAYS * 86_400.0;
        let mut stale: Vec<String> = inner
            .files
            .iter()
            .filter(|(_, entry)| entry.modified_at < cutoff)
            .map(|(path, _)| path.display().to_string())
            .collect();
        stale.sort();
        stale.truncate(5);
        stale
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let inner = self.inner.read();
        json!({
            "file_count": inner.files.len(),
            "scanned": inner.scanned,
            "recent_changes": inner.changes.iter().collect::<Vec<_>>(),
        })
    }
}

//─────────────────────────────
//  Filesystem watcher
//─────────────────────────────

/// Bridges native filesystem notifications onto the event bus. The notify
/// backend runs its own thread; events cross into the async world through
/// an unbounded channel drained by one forwarding task.
pub struct WorldWatcher {
    _watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorldWatcher {
    /// Start watching `watch_dir` recursively, publishing `world.file_*`
    /// events.
    pub fn start(bus: Arc<EventBus>, watch_dir: &Path) -> Result<Self> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "watch backend error"),
            },
        )
        .context("creating filesystem watcher")?;
        watcher
            .watch(watch_dir, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", watch_dir.display()))?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        let topic = match event.kind {
                            notify::EventKind::Create(_) => topics::WORLD_FILE_CREATED,
                            notify::EventKind::Modify(_) => topics::WORLD_FILE_CHANGED,
                            notify::EventKind::Remove(_) => topics::WORLD_FILE_DELETED,
                            _ => continue,
                        };
                        for path in &event.paths {
                            if is_ignored(path) {
                                continue;
                            }
                            bus.publish(topic, json!({"path": path.display().to_string()})).await;
                        }
                    }
                }
            }
            debug!("world watcher loop exited");
        });

        info!(dir = %watch_dir.display(), "world watcher started");
        Ok(Self { _watcher: Mutex::new(Some(watcher)), task: Mutex::new(Some(task)), cancel })
    }

    /// Stop the watcher and await the forwarding task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self._watcher.lock().take();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("world watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scan_counts_files_and_publishes_ready() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "b").unwrap();
        // Ignored directories are skipped.
        std::fs::create_dir(dir.path().join("memory")).unwrap();
        std::fs::write(dir.path().join("memory/state.json"), "{}").unwrap();

        let bus = Arc::new(EventBus::default());
        let mut tap = bus.tap();
        let world = WorldModel::new(Arc::clone(&bus));

        assert_eq!(world.scan(dir.path()).await, 2);
        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::WORLD_READY);
        assert_eq!(event.payload["file_count"], 2);
    }

    #[tokio::test]
    async fn file_events_update_changes_and_publish_summary() {
        let bus = Arc::new(EventBus::default());
        let world = Arc::new(WorldModel::new(Arc::clone(&bus)));
        world.subscribe(&bus).await;
        let mut tap = bus.tap();

        bus.publish(topics::WORLD_FILE_CREATED, json!({"path": "/w/new.txt"})).await;

        // First tap event is the publish itself, then world.updated.
        let first = tap.recv().await.unwrap();
        assert_eq!(first.topic, topics::WORLD_FILE_CREATED);
        let second = tap.recv().await.unwrap();
        assert_eq!(second.topic, topics::WORLD_UPDATED);
        assert!(second.payload["summary"].as_str().unwrap().contains("created /w/new.txt"));

        let changes = world.recent_changes(10);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, "created");
    }

    #[tokio::test]
    async fn quiet_world_reports_no_anomalies() {
        let bus = Arc::new(EventBus::default());
        let world = WorldModel::new(bus);
        assert!(world.detect_anomalies().is_empty());
    }

    #[tokio::test]
    async fn change_history_is_bounded() {
        let bus = Arc::new(EventBus::default());
        let world = Arc::new(WorldModel::new(Arc::clone(&bus)));
        world.subscribe(&bus).await;

        for i in 0..60 {
            bus.publish(topics::WORLD_FILE_CHANGED, json!({"path": format!("/w/{i}.txt")})).await;
        }
        assert_eq!(world.recent_changes(100).len(), MAX_CHANGES);
    }
}
