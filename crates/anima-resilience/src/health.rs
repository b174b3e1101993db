//! Background health monitor. Probes registered services on a fixed
//! interval with a bounded timeout, tracks consecutive failures, and fires
//! listener callbacks on healthy/unhealthy transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use anima_types::now_epoch;

/// An async probe returning whether the service answered correctly.
pub type Probe = Arc<dyn Fn() -> BoxFuture<'static, bool> + Send + Sync>;

/// A listener invoked on healthy/unhealthy transitions.
pub type HealthListener = Arc<dyn Fn(&str, &HealthStatus) + Send + Sync>;

/// Current health of one registered service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Service name.
    pub service: String,
    /// Whether the service is considered healthy.
    pub healthy: bool,
    /// Last probe latency in milliseconds, if the probe returned.
    pub latency_ms: Option<f64>,
    /// Seconds-since-epoch of the last probe.
    pub last_check: f64,
    /// Probe failures since the last success.
    pub consecutive_failures: u32,
    /// Why the last probe was counted as a failure, if it was.
    pub error: Option<String>,
}

struct Service {
    probe: Probe,
    latency_threshold: Duration,
}

/// Periodic background prober of registered services.
pub struct HealthMonitor {
    check_interval: Duration,
    failure_threshold: u32,
    services: Mutex<HashMap<String, Service>>,
    statuses: Mutex<HashMap<String, HealthStatus>>,
    listeners: Mutex<Vec<HealthListener>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor. Nothing runs until [`start`](Self::start).
    pub fn new(check_interval: Duration, failure_threshold: u32) -> Self {
        info!(
            interval_secs = check_interval.as_secs_f64(),
            failure_threshold, "health monitor initialised"
        );
        Self {
            check_interval,
            failure_threshold,
            services: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Register a service. The probe is given `2 × latency_threshold` to
    /// answer before being counted as timed out.
    pub fn register<F, Fut>(&self, name: &str, latency_threshold: Duration, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        let probe: Probe = Arc::new(move || Box::pin(probe()));
        self.services
            .lock()
            .insert(name.to_string(), Service { probe, latency_threshold });
        self.statuses.lock().insert(
            name.to_string(),
            HealthStatus {
                service: name.to_string(),
                healthy: true,
                latency_ms: None,
                last_check: now_epoch(),
                consecutive_failures: 0,
                error: None,
            },
        );
        info!(
            service = name,
            latency_threshold_secs = latency_threshold.as_secs_f64(),
            "service registered"
        );
    }

    /// Add a transition listener.
    pub fn add_listener(&self, listener: HealthListener) {
        self.listeners.lock().push(listener);
    }

    /// Start the background probing loop.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            warn!("health monitor already running");
            return;
        }
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let names: Vec<String> =
                            monitor.services.lock().keys().cloned().collect();
                        for name in names {
                            monitor.check_service(&name).await;
                        }
                    }
                }
            }
            debug!("health monitor loop exited");
        }));
        info!("health monitor started");
    }

    /// Stop the loop and await its termination. Deterministic; no task is
    /// leaked.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("health monitor stopped");
    }

    /// Probe one service and update its status, firing listeners on a
    /// healthy-flag transition.
    pub async fn check_service(&self, name: &str) {
        let (probe, threshold) = {
            let services = self.services.lock();
            let Some(service) = services.get(name) else { return };
            (Arc::clone(&service.probe), service.latency_threshold)
        };

        let start = Instant::now();
        let result = tokio::time::timeout(threshold * 2, (probe.as_ref())()).await;
        let latency = start.elapsed();

        let (ok, latency_ms, failure_reason) = match result {
            Ok(true) if latency <= threshold => (true, Some(latency.as_secs_f64() * 1000.0), None),
            Ok(true) => (
                false,
                Some(latency.as_secs_f64() * 1000.0),
                Some(format!(
                    "latency {:.2}s exceeds threshold {:.2}s",
                    latency.as_secs_f64(),
                    threshold.as_secs_f64()
                )),
            ),
            Ok(false) => (
                false,
                Some(latency.as_secs_f64() * 1000.0),
                Some("probe reported unhealthy".to_string()),
            ),
            Err(_) => (
                false,
                None,
                Some(format!("probe timeout (>{:.2}s)", (threshold * 2).as_secs_f64())),
            ),
        };

        let transition = {
            let mut statuses = self.statuses.lock();
            let Some(status) = statuses.get_mut(name) else { return };
            let was_healthy = status.healthy;

            if ok {
                status.consecutive_failures = 0;
                status.healthy = true;
                status.error = None;
                debug!(service = name, latency_ms = latency_ms.unwrap_or(0.0), "healthy");
            } else {
                status.consecutive_failures += 1;
                // The healthy flag only drops once the failure threshold is
                // reached; one bad probe is noise.
                if status.consecutive_failures >= self.failure_threshold {
                    status.healthy = false;
                }
                warn!(
                    service = name,
                    failures = status.consecutive_failures,
                    threshold = self.failure_threshold,
                    reason = failure_reason.as_deref().unwrap_or("unknown"),
                    "probe failed"
                );
            }
            status.latency_ms = latency_ms;
            status.last_check = now_epoch();
            status.error = failure_reason;

            if was_healthy != status.healthy {
                Some(status.clone())
            } else {
                None
            }
        };

        if let Some(status) = transition {
            self.notify(name, &status);
        }
    }

    fn notify(&self, name: &str, status: &HealthStatus) {
        info!(
            service = name,
            healthy = status.healthy,
            "health transition"
        );
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            // A listener failure must not disturb the monitor; listeners
            // are plain callbacks and cannot raise, so nothing to catch.
            (listener.as_ref())(name, status);
        }
    }

    /// Whether a service is currently considered healthy. Unknown services
    /// are unhealthy.
    pub fn is_healthy(&self, name: &str) -> bool {
        self.statuses.lock().get(name).map_or(false, |s| s.healthy)
    }

    /// Current status of one service.
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.statuses.lock().get(name).cloned()
    }

    /// Snapshot of every service's status.
    pub fn all_statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.lock().clone()
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("check_interval", &self.check_interval)
            .field("failure_threshold", &self.failure_threshold)
            .finish_non_exhaustive()
    }
}
