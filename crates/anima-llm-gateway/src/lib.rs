#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **anima-llm-gateway** – The composite LLM call path for Anima.
//!
//! One logical call passes through, in order: per-tick budget check →
//! token-bucket rate limiter → response cache → circuit breaker → retry
//! with exponential backoff → HTTP to the Ollama backend. On success the
//! response is cached and returned; on final failure the gateway surfaces
//! an empty string (chat) or an empty vector (embed) — it never raises to
//! callers. Steps treat the circuit-open rejection as "LLM unavailable"
//! and fall through to their fallback cache.
//!
//! Cognitive steps consume the gateway through the [`LlmClient`] trait so
//! tests can substitute doubles.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, warn};

use anima_types::Config;

pub mod breaker;
pub mod cache;
pub mod client;
pub mod limiter;

pub use breaker::{BreakerConfig, BreakerStats, CircuitBreaker, CircuitOpen, CircuitState};
pub use cache::{CacheStats, ResponseCache};
pub use client::OllamaClient;
pub use limiter::{LimiterStats, TokenBucket};

/// Default number of call attempts per gateway request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff between attempts.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Message substrings marking a failure as transient and therefore worth
/// retrying; everything else surfaces immediately.
const TRANSIENT_MARKERS: [&str; 3] = ["connection", "timeout", "network"];

/// Classify a failure message as transient (retryable).
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// The call surface cognitive steps consume. Both methods return empty on
/// any failure; neither raises.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One chat completion; empty string on failure.
    async fn chat(&self, prompt: &str, system: &str) -> String;
    /// One embedding; empty vector on failure.
    async fn embed(&self, text: &str) -> Vec<f32>;
    /// Whether the backend currently looks reachable.
    async fn is_available(&self) -> bool;
    /// Reset the per-tick call counter (cycle preamble).
    fn reset_tick_counter(&self);
    /// Calls consumed since the last reset.
    fn calls_this_tick(&self) -> u32;
}

/// Combined gateway statistics for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Circuit breaker state and counters.
    pub circuit_breaker: BreakerStats,
    /// Response-cache counters.
    pub cache: CacheStats,
    /// Chat limiter counters.
    pub chat_limiter: LimiterStats,
    /// Embed limiter counters.
    pub embed_limiter: LimiterStats,
    /// Per-tick budget usage.
    pub budget: BudgetStats,
}

/// Per-tick budget usage.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStats {
    /// Calls consumed this tick.
    pub calls_this_tick: u32,
    /// Configured cap.
    pub max_calls: u32,
    /// Calls remaining.
    pub remaining: u32,
}

/// The process-wide gateway. Cache, limiters and breaker are owned here and
/// mutated only through their own methods.
pub struct LlmGateway {
    client: OllamaClient,
    cache: ResponseCache,
    chat_limiter: TokenBucket,
    embed_limiter: TokenBucket,
    breaker: CircuitBreaker,
    max_calls: u32,
    max_retries: u32,
    base_delay: Duration,
    calls_this_tick: AtomicU32,
}

impl LlmGateway {
    /// Build the gateway from configuration.
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            client: OllamaClient::new(&cfg.ollama)?,
            cache: ResponseCache::new(
                cfg.cache.max_size,
                Duration::from_secs_f64(cfg.cache.ttl_seconds),
            ),
            chat_limiter: TokenBucket::new(
                "chat",
                cfg.rate_limit.chat_rate,
                cfg.rate_limit.chat_burst,
            ),
            embed_limiter: TokenBucket::new(
                "embed",
                cfg.rate_limit.embed_rate,
                cfg.rate_limit.embed_burst,
            ),
            breaker: CircuitBreaker::new("ollama", BreakerConfig::default()),
            max_calls: cfg.resources.budget.max_llm_calls,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            calls_this_tick: AtomicU32::new(0),
        })
    }

    /// Override breaker tuning (used by tests and the service wiring).
    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new("ollama", config);
        self
    }

    /// Override retry tuning.
    pub fn with_retry(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    fn budget_available(&self) -> bool {
        let used = self.calls_this_tick.load(Ordering::SeqCst);
        if used >= self.max_calls {
            warn!(used, max = self.max_calls, "LLM budget exhausted for this tick");
            return false;
        }
        true
    }

    /// Retry a transient-failing operation with exponential backoff. A
    /// non-transient failure surfaces immediately.
    async fn retry_with_backoff<T, F, Fut>(&self, context: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut last_error = None;
        for attempt in 0..self.max_retries {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let message = format!("{e:#}");
                    if !is_transient(&message) {
                        error!(context, error = %message, "non-transient failure");
                        return Err(e);
                    }
                    if attempt + 1 < self.max_retries {
                        warn!(
                            context,
                            attempt = attempt + 1,
                            delay_secs = delay.as_secs_f64(),
                            error = %message,
                            "transient failure, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{context}: no attempts made")))
    }

    /// Combined statistics for introspection.
    pub fn stats(&self) -> GatewayStats {
        let used = self.calls_this_tick.load(Ordering::SeqCst);
        GatewayStats {
            circuit_breaker: self.breaker.stats(),
            cache: self.cache.stats(),
            chat_limiter: self.chat_limiter.stats(),
            embed_limiter: self.embed_limiter.stats(),
            budget: BudgetStats {
                calls_this_tick: used,
                max_calls: self.max_calls,
                remaining: self.max_calls.saturating_sub(used),
            },
        }
    }

    /// Current breaker state, exposed for health checks.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Prune expired response-cache entries.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup_expired()
    }
}

#[async_trait]
impl LlmClient for LlmGateway {
    async fn chat(&self, prompt: &str, system: &str) -> String {
        // Stage 1: per-tick budget.
        if !self.budget_available() {
            return String::new();
        }

        // Stage 2: rate limiter.
        if !self.chat_limiter.acquire_async(1.0).await {
            warn!("chat rate limit exceeded");
            return String::new();
        }

        // Stage 3: response cache.
        if let Some(cached) = self.cache.get(prompt, system) {
            debug!(prompt_len = prompt.len(), "chat cache hit");
            return cached;
        }

        // Stage 4: circuit breaker.
        if let Err(e) = self.breaker.check() {
            warn!(error = %e, "chat blocked by circuit breaker");
            return String::new();
        }

        self.calls_this_tick.fetch_add(1, Ordering::SeqCst);

        // Stages 5-6: retry around the HTTP call.
        match self
            .retry_with_backoff("chat", || self.client.chat_raw(prompt, system))
            .await
        {
            Ok(text) => {
                self.breaker.record_success();
                self.cache.set(prompt, system, &text);
                debug!(chars = text.len(), "chat completed");
                text
            }
            Err(e) => {
                self.breaker.record_failure();
                error!(error = %format!("{e:#}"), "chat failed");
                String::new()
            }
        }
    }

    async fn embed(&self, text: &str) -> Vec<f32> {
        if !self.budget_available() {
            return Vec::new();
        }
        if !self.embed_limiter.acquire_async(1.0).await {
            warn!("embed rate limit exceeded");
            return Vec::new();
        }
        if let Err(e) = self.breaker.check() {
            warn!(error = %e, "embed blocked by circuit breaker");
            return Vec::new();
        }

        self.calls_this_tick.fetch_add(1, Ordering::SeqCst);

        match self
            .retry_with_backoff("embed", || self.client.embed_raw(text))
            .await
        {
            Ok(embedding) => {
                self.breaker.record_success();
                embedding
            }
            Err(e) => {
                self.breaker.record_failure();
                error!(error = %format!("{e:#}"), "embed failed");
                Vec::new()
            }
        }
    }

    async fn is_available(&self) -> bool {
        self.breaker.state() != CircuitState::Open && self.client.ping().await
    }

    fn reset_tick_counter(&self) {
        self.calls_this_tick.store(0, Ordering::SeqCst);
    }

    fn calls_this_tick(&self) -> u32 {
        self.calls_this_tick.load(Ordering::SeqCst)
    }
}
