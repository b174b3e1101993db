//! Runtime assembly: the two long-lived tick loops behind one handle with
//! a deterministic, awaitable stop.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::heavy_tick::HeavyTickOrchestrator;
use crate::light_tick::LightTick;

/// Owns the heavy and light tick tasks. Heavy cycles never overlap: the
/// loop awaits one cycle before sleeping toward the next.
pub struct AnimaRuntime {
    heavy: Arc<HeavyTickOrchestrator>,
    light: Arc<LightTick>,
    heavy_interval: Duration,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AnimaRuntime {
    /// Bundle the loops. Nothing runs until [`start`](Self::start).
    pub fn new(
        heavy: Arc<HeavyTickOrchestrator>,
        light: Arc<LightTick>,
        heavy_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self { heavy, light, heavy_interval, cancel, handles: Mutex::new(Vec::new()) }
    }

    /// Spawn both loops.
    pub fn start(&self) {
        let mut handles = self.handles.lock();

        handles.push(tokio::spawn(Arc::clone(&self.light).run()));

        let heavy = Arc::clone(&self.heavy);
        let interval = self.heavy_interval;
        let cancel = self.cancel.clone();
        handles.push(tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "heavy tick loop started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                // Awaited inline: the next cycle cannot start until this
                // one returns.
                let _ = heavy.run_cycle().await;
            }
            info!("heavy tick loop stopped");
        }));
    }

    /// Cancel both loops, await their termination, and run the heavy
    /// tick's shutdown hook (marks the active goal interrupted and
    /// re-persists it).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.heavy.shutdown();
        info!("runtime stopped");
    }
}
