//! Configuration tree for the Anima runtime.
//!
//! The tree is loaded from a TOML file layered over serde defaults, so a
//! partial file (or none at all) always yields a complete configuration —
//! the only merge discipline the runtime supports. A small set of numeric
//! cadence keys is mutable at runtime through the self-modification
//! pipeline; every mutation is bounds-checked against [`MUTABLE_KEYS`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors surfaced by runtime configuration mutation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The key is not in the runtime-mutable whitelist.
    #[error("config key '{0}' is not runtime-mutable")]
    NotWhitelisted(String),
    /// The value falls outside the enforced bounds for the key.
    #[error("value {value} for '{key}' outside bounds [{min}, {max}]")]
    OutOfBounds {
        /// The offending key.
        key: String,
        /// The rejected value.
        value: f64,
        /// Lower bound, inclusive.
        min: f64,
        /// Upper bound, inclusive.
        max: f64,
    },
}

/// A runtime-mutable configuration key with its enforced numeric bounds.
#[derive(Debug, Clone, Copy)]
pub struct MutableKey {
    /// Dotted key path, e.g. `reflection.every_n_ticks`.
    pub key: &'static str,
    /// Lower bound, inclusive.
    pub min: f64,
    /// Upper bound, inclusive.
    pub max: f64,
}

/// The only configuration keys the self-modification proposal path may
/// mutate at runtime, each with enforced numeric bounds.
pub const MUTABLE_KEYS: &[MutableKey] = &[
    MutableKey { key: "dream.interval_hours", min: 1.0, max: 48.0 },
    MutableKey { key: "reflection.every_n_ticks", min: 2.0, max: 200.0 },
    MutableKey { key: "narrative.every_n_ticks", min: 2.0, max: 500.0 },
    MutableKey { key: "curiosity.ask_every_n_ticks", min: 1.0, max: 100.0 },
    MutableKey { key: "curiosity.max_open_questions", min: 1.0, max: 50.0 },
    MutableKey { key: "attention.min_score", min: 0.0, max: 1.0 },
    MutableKey { key: "attention.top_k", min: 1.0, max: 20.0 },
];

//─────────────────────────────
//  Sections
//─────────────────────────────

/// Loop cadences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicksConfig {
    /// Light-tick interval in seconds.
    pub light_tick_sec: f64,
    /// Heavy-tick interval in seconds.
    pub heavy_tick_sec: f64,
}

impl Default for TicksConfig {
    fn default() -> Self {
        Self { light_tick_sec: 5.0, heavy_tick_sec: 30.0 }
    }
}

/// Model backend bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Base URL of the Ollama server.
    pub base_url: String,
    /// Model used for chat/strategy calls.
    pub strategy_model: String,
    /// Model used for embeddings.
    pub embed_model: String,
    /// Per-request timeout in seconds.
    pub timeout_sec: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            strategy_model: "llama3.2".to_string(),
            embed_model: "nomic-embed-text".to_string(),
            timeout_sec: 30,
        }
    }
}

/// Per-cycle resource caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcesConfig {
    /// Budget sub-section.
    pub budget: BudgetSection,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self { budget: BudgetSection::default() }
    }
}

/// Hard caps applied to the gateway per heavy-tick cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// Default hard cap on LLM calls per heavy-tick cycle.
    pub max_llm_calls: u32,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self { max_llm_calls: 10 }
    }
}

/// Response-cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached responses.
    pub max_size: usize,
    /// Entry time-to-live in seconds.
    pub ttl_seconds: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 100, ttl_seconds: 300.0 }
    }
}

/// Token-bucket parameters for the two gateway operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Chat tokens per second.
    pub chat_rate: f64,
    /// Chat burst capacity.
    pub chat_burst: u32,
    /// Embed tokens per second.
    pub embed_rate: f64,
    /// Embed burst capacity.
    pub embed_burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { chat_rate: 5.0, chat_burst: 10, embed_rate: 20.0, embed_burst: 50 }
    }
}

/// Dream/consolidation cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DreamConfig {
    /// Hours between consolidation passes.
    pub interval_hours: f64,
}

impl Default for DreamConfig {
    fn default() -> Self {
        Self { interval_hours: 6.0 }
    }
}

/// Reflection cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    /// Heavy ticks between reflection passes.
    pub every_n_ticks: u64,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self { every_n_ticks: 12 }
    }
}

/// Narrative/diary cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NarrativeConfig {
    /// Heavy ticks between diary entries.
    pub every_n_ticks: u64,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self { every_n_ticks: 24 }
    }
}

/// Curiosity shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuriosityConfig {
    /// Heavy ticks between new questions.
    pub ask_every_n_ticks: u64,
    /// Cap on simultaneously open questions.
    pub max_open_questions: usize,
}

impl Default for CuriosityConfig {
    fn default() -> Self {
        Self { ask_every_n_ticks: 6, max_open_questions: 10 }
    }
}

/// Attention-filter shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionConfig {
    /// Minimum episode score to pass the filter.
    pub min_score: f64,
    /// Maximum episodes kept after filtering.
    pub top_k: usize,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self { min_score: 0.3, top_k: 5 }
    }
}

/// Memory-store sizing and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Expected embedding dimension; mismatching vectors are rejected.
    pub vector_dim: usize,
    /// Episodes older than this many days are archived.
    pub episode_retention_days: u32,
    /// Vectors older than this many days are deleted.
    pub vector_retention_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { vector_dim: 768, episode_retention_days: 90, vector_retention_days: 30 }
    }
}

/// Introspection HTTP surface binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8765 }
    }
}

/// Filesystem layout. All paths default relative to `root`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Base directory everything else defaults under.
    pub root: PathBuf,
    /// Directory of persisted stores and JSON state.
    pub memory_dir: PathBuf,
    /// User → system plain-text inbox.
    pub inbox: PathBuf,
    /// System → user append-only outbox.
    pub outbox: PathBuf,
    /// Only write target for the "write" action.
    pub sandbox: PathBuf,
    /// Rolling text logs (actions, monologue, decisions).
    pub logs_dir: PathBuf,
    /// Light-tick state snapshots.
    pub snapshots_dir: PathBuf,
    /// Directory the world model observes.
    pub watch_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(Path::new("."))
    }
}

impl PathsConfig {
    /// Derive the standard layout beneath a base directory.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            memory_dir: root.join("memory"),
            inbox: root.join("inbox.txt"),
            outbox: root.join("outbox.txt"),
            sandbox: root.join("sandbox"),
            logs_dir: root.join("logs"),
            snapshots_dir: root.join("memory").join("snapshots"),
            watch_dir: root.to_path_buf(),
        }
    }
}

//─────────────────────────────
//  The tree
//─────────────────────────────

/// The full configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Loop cadences.
    pub ticks: TicksConfig,
    /// Model backend bindings.
    pub ollama: OllamaConfig,
    /// Per-cycle resource caps.
    pub resources: ResourcesConfig,
    /// Response-cache sizing.
    pub cache: CacheConfig,
    /// Rate-limiter parameters.
    pub rate_limit: RateLimitConfig,
    /// Dream cadence.
    pub dream: DreamConfig,
    /// Reflection cadence.
    pub reflection: ReflectionConfig,
    /// Narrative cadence.
    pub narrative: NarrativeConfig,
    /// Curiosity shaping.
    pub curiosity: CuriosityConfig,
    /// Attention shaping.
    pub attention: AttentionConfig,
    /// Memory sizing and retention.
    pub memory: MemoryConfig,
    /// HTTP binding.
    pub http: HttpConfig,
    /// Filesystem layout.
    pub paths: PathsConfig,
}

impl Config {
    /// Load the tree from a TOML file layered over defaults. A missing file
    /// yields the defaults; a malformed file is an error (the only condition
    /// the binary exits non-zero on).
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()?
            .try_deserialize()
    }

    /// Read a runtime-mutable numeric key by its dotted path. Returns `None`
    /// for unknown keys.
    pub fn get_numeric(&self, key: &str) -> Option<f64> {
        match key {
            "dream.interval_hours" => Some(self.dream.interval_hours),
            "reflection.every_n_ticks" => Some(self.reflection.every_n_ticks as f64),
            "narrative.every_n_ticks" => Some(self.narrative.every_n_ticks as f64),
            "curiosity.ask_every_n_ticks" => Some(self.curiosity.ask_every_n_ticks as f64),
            "curiosity.max_open_questions" => Some(self.curiosity.max_open_questions as f64),
            "attention.min_score" => Some(self.attention.min_score),
            "attention.top_k" => Some(self.attention.top_k as f64),
            _ => None,
        }
    }

    /// Mutate a runtime-mutable numeric key, enforcing the whitelist and the
    /// per-key bounds. Returns the previous value.
    pub fn set_numeric(&mut self, key: &str, value: f64) -> Result<f64, ConfigError> {
        let bounds = MUTABLE_KEYS
            .iter()
            .find(|m| m.key == key)
            .ok_or_else(|| ConfigError::NotWhitelisted(key.to_string()))?;
        if !(bounds.min..=bounds.max).contains(&value) {
            return Err(ConfigError::OutOfBounds {
                key: key.to_string(),
                value,
                min: bounds.min,
                max: bounds.max,
            });
        }
        let old = self.get_numeric(key).unwrap_or_default();
        match key {
            "dream.interval_hours" => self.dream.interval_hours = value,
            "reflection.every_n_ticks" => self.reflection.every_n_ticks = value as u64,
            "narrative.every_n_ticks" => self.narrative.every_n_ticks = value as u64,
            "curiosity.ask_every_n_ticks" => self.curiosity.ask_every_n_ticks = value as u64,
            "curiosity.max_open_questions" => self.curiosity.max_open_questions = value as usize,
            "attention.min_score" => self.attention.min_score = value,
            "attention.top_k" => self.attention.top_k = value as usize,
            _ => unreachable!("whitelist and match arms must stay in sync"),
        }
        Ok(old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_complete() {
        let cfg = Config::default();
        assert_eq!(cfg.ticks.light_tick_sec, 5.0);
        assert_eq!(cfg.memory.vector_dim, 768);
        assert_eq!(cfg.rate_limit.chat_burst, 10);
        assert_eq!(cfg.paths.inbox, PathBuf::from("./inbox.txt"));
    }

    #[test]
    fn partial_toml_merges_over_defaults() {
        let dir = std::env::temp_dir().join("anima-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.toml");
        std::fs::write(&path, "[ticks]\nheavy_tick_sec = 45.0\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.ticks.heavy_tick_sec, 45.0);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.ticks.light_tick_sec, 5.0);
        assert_eq!(cfg.ollama.strategy_model, "llama3.2");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/anima.toml")).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn set_numeric_enforces_whitelist() {
        let mut cfg = Config::default();
        let err = cfg.set_numeric("ticks.heavy_tick_sec", 10.0).unwrap_err();
        assert!(matches!(err, ConfigError::NotWhitelisted(_)));
    }

    #[test]
    fn set_numeric_enforces_bounds() {
        let mut cfg = Config::default();
        let err = cfg.set_numeric("attention.min_score", 3.0).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfBounds { .. }));

        let old = cfg.set_numeric("attention.min_score", 0.5).unwrap();
        assert_eq!(old, 0.3);
        assert_eq!(cfg.attention.min_score, 0.5);
    }

    #[test]
    fn get_numeric_covers_every_whitelisted_key() {
        let cfg = Config::default();
        for m in MUTABLE_KEYS {
            assert!(cfg.get_numeric(m.key).is_some(), "missing accessor for {}", m.key);
        }
    }
}
