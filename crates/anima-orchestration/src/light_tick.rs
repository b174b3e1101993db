//! The light tick: a fast heartbeat loop that ingests the inbox, rotates
//! state snapshots, and appends the action log. Each iteration subtracts
//! its own wall time from the sleep so a long iteration shortens (never
//! lengthens) the next interval.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use anima_bus_core::{topics, EventBus};
use anima_types::config::PathsConfig;

/// Inbox prefix that elevates a message to `user.urgent`.
pub const URGENT_PREFIX: &str = "!URGENT";

/// Snapshots retained after rotation.
pub const MAX_SNAPSHOTS: usize = 10;

/// The heartbeat loop.
pub struct LightTick {
    interval: Duration,
    bus: Arc<EventBus>,
    inbox_path: PathBuf,
    state_path: PathBuf,
    snapshot_dir: PathBuf,
    actions_log: PathBuf,
    tick_count: AtomicU64,
    cancel: CancellationToken,
}

impl LightTick {
    /// Build the loop from the filesystem layout. The tick counter starts
    /// at zero on every process start; it is deliberately not persisted.
    pub fn new(
        interval: Duration,
        bus: Arc<EventBus>,
        paths: &PathsConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            interval,
            bus,
            inbox_path: paths.inbox.clone(),
            state_path: paths.memory_dir.join("state.json"),
            snapshot_dir: paths.snapshots_dir.clone(),
            actions_log: paths.logs_dir.join("actions.log"),
            tick_count: AtomicU64::new(0),
            cancel,
        }
    }

    /// Ticks completed since process start.
    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    /// Run until the cancellation token fires.
    pub async fn run(self: Arc<Self>) {
        if let Err(e) = tokio::fs::create_dir_all(&self.snapshot_dir).await {
            error!(error = %e, "could not create snapshot directory");
        }
        if let Some(parent) = self.actions_log.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        info!(interval_secs = self.interval.as_secs_f64(), "light tick started");

        loop {
            let started = Instant::now();
            let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;

            self.process_inbox(tick).await;
            self.take_snapshot().await;
            self.log_tick(tick).await;

            let elapsed = started.elapsed();
            let sleep = self.interval.saturating_sub(elapsed);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        info!("light tick stopped");
    }

    /// Read the inbox, classify urgency, truncate the file *before*
    /// delivery so a handler crash cannot re-deliver on the next tick.
    pub async fn process_inbox(&self, tick: u64) {
        let content = match tokio::fs::read_to_string(&self.inbox_path).await {
            Ok(content) => content,
            Err(_) => {
                // Create an empty inbox so the user has somewhere to write.
                let _ = tokio::fs::write(&self.inbox_path, "").await;
                return;
            }
        };
        let content = content.trim();
        if content.is_empty() {
            return;
        }

        let (topic, text) = match content.strip_prefix(URGENT_PREFIX) {
            Some(rest) => (topics::USER_URGENT, rest.trim().to_string()),
            None => (topics::USER_MESSAGE, content.to_string()),
        };

        if let Err(e) = tokio::fs::write(&self.inbox_path, "").await {
            error!(error = %e, "could not clear inbox; skipping delivery to avoid duplication");
            return;
        }

        let preview: String = text.chars().take(80).collect();
        info!(topic, %preview, "inbox message received");
        self.bus.publish(topic, json!({"text": text, "tick": tick})).await;
    }

    /// Copy `state.json` into a timestamped snapshot and drop all but the
    /// newest [`MAX_SNAPSHOTS`].
    pub async fn take_snapshot(&self) {
        if tokio::fs::metadata(&self.state_path).await.is_err() {
            return;
        }
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let dest = self.snapshot_dir.join(format!("state_{stamp}.json"));
        if let Err(e) = tokio::fs::copy(&self.state_path, &dest).await {
            error!(error = %e, "snapshot copy failed");
            return;
        }

        let mut snapshots = Vec::new();
        if let Ok(mut dir) = tokio::fs::read_dir(&self.snapshot_dir).await {
            while let Ok(Some(entry)) = dir.next_entry().await {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with("state_") && name.ends_with(".json") {
                    snapshots.push(entry.path());
                }
            }
        }
        snapshots.sort();
        if snapshots.len() > MAX_SNAPSHOTS {
            let excess = snapshots.len() - MAX_SNAPSHOTS;
            for old in snapshots.into_iter().take(excess) {
                debug!(snapshot = %old.display(), "rotating old snapshot");
                let _ = tokio::fs::remove_file(old).await;
            }
        }
    }

    async fn log_tick(&self, tick: u64) {
        use tokio::io::AsyncWriteExt;
        let stamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");
        let line = format!("[{stamp}] tick={tick} inbox_checked=true snapshot=true\n");
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.actions_log)
            .await
        {
            Ok(mut file) => {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    error!(error = %e, "action log write failed");
                }
            }
            Err(e) => error!(error = %e, "action log open failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(dir: &std::path::Path) -> (Arc<LightTick>, Arc<EventBus>) {
        let paths = PathsConfig::under(dir);
        std::fs::create_dir_all(&paths.memory_dir).unwrap();
        std::fs::create_dir_all(&paths.snapshots_dir).unwrap();
        std::fs::create_dir_all(&paths.logs_dir).unwrap();
        let bus = Arc::new(EventBus::default());
        let tick = Arc::new(LightTick::new(
            Duration::from_millis(50),
            Arc::clone(&bus),
            &paths,
            CancellationToken::new(),
        ));
        (tick, bus)
    }

    #[tokio::test]
    async fn urgent_prefix_is_stripped_and_elevated() {
        let dir = tempfile::tempdir().unwrap();
        let (tick, bus) = fixture(dir.path());
        let mut tap = bus.tap();

        std::fs::write(dir.path().join("inbox.txt"), "!URGENT help").unwrap();
        tick.process_inbox(7).await;

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::USER_URGENT);
        assert_eq!(event.payload, json!({"text": "help", "tick": 7}));

        // The inbox was truncated before delivery.
        let content = std::fs::read_to_string(dir.path().join("inbox.txt")).unwrap();
        assert!(content.is_empty());
    }

    #[tokio::test]
    async fn plain_message_keeps_its_text() {
        let dir = tempfile::tempdir().unwrap();
        let (tick, bus) = fixture(dir.path());
        let mut tap = bus.tap();

        std::fs::write(dir.path().join("inbox.txt"), "  hello there \n").unwrap();
        tick.process_inbox(1).await;

        let event = tap.recv().await.unwrap();
        assert_eq!(event.topic, topics::USER_MESSAGE);
        assert_eq!(event.payload["text"], "hello there");
    }

    #[tokio::test]
    async fn empty_inbox_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (tick, bus) = fixture(dir.path());
        let mut tap = bus.tap();
        tick.process_inbox(1).await;
        assert!(tap.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_inbox_is_created_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (tick, _) = fixture(dir.path());
        tick.process_inbox(1).await;
        assert!(dir.path().join("inbox.txt").exists());
    }

    #[tokio::test]
    async fn snapshot_copies_state_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let (tick, _) = fixture(dir.path());
        let state = dir.path().join("memory/state.json");
        std::fs::write(&state, r#"{"tick_count": 1}"#).unwrap();

        // Pre-seed more snapshots than the cap, with sortable names.
        for i in 0..12 {
            std::fs::write(
                dir.path().join(format!("memory/snapshots/state_2020010{:02}_000000.json", i)),
                "{}",
            )
            .unwrap();
        }
        tick.take_snapshot().await;

        let count = std::fs::read_dir(dir.path().join("memory/snapshots")).unwrap().count();
        assert_eq!(count, MAX_SNAPSHOTS);
    }

    #[tokio::test]
    async fn loop_appends_one_action_line_per_tick_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathsConfig::under(dir.path());
        std::fs::create_dir_all(&paths.memory_dir).unwrap();
        std::fs::create_dir_all(&paths.logs_dir).unwrap();
        let cancel = CancellationToken::new();
        let bus = Arc::new(EventBus::default());
        let tick = Arc::new(LightTick::new(
            Duration::from_millis(30),
            bus,
            &paths,
            cancel.clone(),
        ));

        let handle = tokio::spawn(Arc::clone(&tick).run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let ticks = tick.tick_count();
        assert!(ticks >= 2, "expected several ticks, got {ticks}");
        let log = std::fs::read_to_string(dir.path().join("logs/actions.log")).unwrap();
        assert_eq!(log.lines().count() as u64, ticks);
        assert!(log.lines().next().unwrap().contains("tick=1"));
    }
}
