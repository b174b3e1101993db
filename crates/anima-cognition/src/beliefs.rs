//! Belief system: formed from experience, weighted by confidence, and kept
//! consistent by a contradiction resolver that can weaken or synthesize.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use anima_llm_gateway::LlmClient;
use anima_store::atomic::{atomic_write_json, load_json_or_default};
use anima_types::{clamp_score, now_iso, Priority};

use crate::json_util;
use crate::{CognitionContext, OptionalStep};

/// One held belief.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Belief {
    /// Stable id.
    pub id: u64,
    /// The statement.
    pub text: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Number of supporting observations.
    pub evidence: u32,
    /// Creation timestamp.
    pub created_at: String,
    /// Last update timestamp.
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct BeliefState {
    next_id: u64,
    beliefs: Vec<Belief>,
    contradictions_resolved: u64,
}

#[derive(Debug, Deserialize)]
struct FormedBelief {
    belief: String,
    #[serde(default = "default_confidence")]
    confidence: f64,
}

fn default_confidence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize)]
struct Verdict {
    verdict: String,
}

/// Beliefs with confidence, persisted to `beliefs.json`.
pub struct BeliefSystem {
    path: PathBuf,
    llm: Arc<dyn LlmClient>,
    state: RwLock<BeliefState>,
}

/// Cap on simultaneously held beliefs; the weakest is dropped past it.
const MAX_BELIEFS: usize = 30;

/// Beliefs weakened below this confidence are discarded.
const DISCARD_BELOW: f64 = 0.1;

impl BeliefSystem {
    /// Load (or default) persisted beliefs.
    pub fn new(memory_dir: &Path, llm: Arc<dyn LlmClient>) -> Self {
        let path = memory_dir.join("beliefs.json");
        let state = load_json_or_default(&path);
        Self { path, llm, state: RwLock::new(state) }
    }

    fn persist(&self, state: &BeliefState) {
        if let Err(e) = atomic_write_json(&self.path, state) {
            tracing::error!(error = %e, "failed to persist beliefs");
        }
    }

    /// Insert a belief directly (used by synthesis and tests).
    pub fn insert(&self, text: &str, confidence: f64) -> u64 {
        let mut state = self.state.write();
        let id = state.next_id;
        state.next_id += 1;
        state.beliefs.push(Belief {
            id,
            text: text.trim().to_string(),
            confidence: clamp_score(confidence),
            evidence: 1,
            created_at: now_iso(),
            updated_at: now_iso(),
        });
        if state.beliefs.len() > MAX_BELIEFS {
            state
                .beliefs
                .sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
            state.beliefs.truncate(MAX_BELIEFS);
        }
        self.persist(&state);
        id
    }

    /// Shift one belief's confidence, discarding it when it collapses.
    pub fn adjust_confidence(&self, id: u64, delta: f64) {
        let mut state = self.state.write();
        if let Some(belief) = state.beliefs.iter_mut().find(|b| b.id == id) {
            belief.confidence = clamp_score(belief.confidence + delta);
            belief.updated_at = now_iso();
            if delta > 0.0 {
                belief.evidence += 1;
            }
        }
        state.beliefs.retain(|b| b.confidence >= DISCARD_BELOW);
        self.persist(&state);
    }

    /// All beliefs, strongest first.
    pub fn all(&self) -> Vec<Belief> {
        let mut beliefs = self.state.read().beliefs.clone();
        beliefs.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        beliefs
    }

    /// Contradictions resolved so far.
    pub fn contradictions_resolved(&self) -> u64 {
        self.state.read().contradictions_resolved
    }

    fn count_resolution(&self) {
        let mut state = self.state.write();
        state.contradictions_resolved += 1;
        self.persist(&state);
    }

    /// Prompt fragment with the strongest beliefs.
    pub fn prompt_context(&self, top_n: usize) -> String {
        let beliefs = self.all();
        if beliefs.is_empty() {
            return String::new();
        }
        let lines = beliefs
            .iter()
            .take(top_n)
            .map(|b| format!("  - ({:.2}) {}", b.confidence, b.text))
            .collect::<Vec<_>>()
            .join("\n");
        format!("Beliefs:\n{lines}")
    }

    /// Read model for introspection.
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.read();
        json!({
            "beliefs": state.beliefs,
            "contradictions_resolved": state.contradictions_resolved,
        })
    }

    /// Candidate contradiction pairs: cheap lexical pre-filter that pairs
    /// beliefs sharing a content word, leaving the verdict to the resolver.
    pub fn candidate_pairs(&self) -> Vec<(Belief, Belief)> {
        let beliefs = self.all();
        let mut pairs = Vec::new();
        for (i, a) in beliefs.iter().enumerate() {
            for b in beliefs.iter().skip(i + 1) {
                if share_content_word(&a.text, &b.text) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs.truncate(3);
        pairs
    }
}

fn share_content_word(a: &str, b: &str) -> bool {
    let words = |s: &str| {
        s.to_lowercase()
            .split_whitespace()
            .filter(|w| w.len() > 4)
            .map(str::to_string)
            .collect::<std::collections::HashSet<_>>()
    };
    !words(a).is_disjoint(&words(b))
}

#[async_trait]
impl OptionalStep for BeliefSystem {
    fn name(&self) -> &'static str {
        "beliefs"
    }

    fn priority(&self) -> Priority {
        Priority::Important
    }

    /// Form one belief from the attention context, or reinforce an
    /// existing one when the model restates it.
    async fn run(&self, _tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        if ctx.attention_context.is_empty() {
            return Ok(json!({"formed": false, "reason": "nothing significant"}));
        }
        let prompt = format!(
            "Recent significant episodes:\n{}\n\nState ONE short factual belief about your \
             environment that these episodes support. JSON only:\n\
             {{\"belief\": \"...\", \"confidence\": 0.0-1.0}}",
            ctx.attention_context
        );
        let raw = self
            .llm
            .chat(&prompt, "You are an autonomous system forming beliefs from evidence. Answer ONLY with valid JSON.")
            .await;

        let Some(formed) = json_util::parse_typed::<FormedBelief>(&raw) else {
            debug!("belief formation returned no valid structure");
            return Ok(json!({"formed": false, "reason": "no valid structure"}));
        };

        // Restatement of an existing belief reinforces it instead.
        let existing = self
            .all()
            .into_iter()
            .find(|b| b.text.eq_ignore_ascii_case(formed.belief.trim()));
        if let Some(existing) = existing {
            self.adjust_confidence(existing.id, 0.05);
            return Ok(json!({"formed": false, "reinforced": existing.id}));
        }

        let id = self.insert(&formed.belief, formed.confidence);
        info!(id, "belief formed: {}", formed.belief);
        Ok(json!({"formed": true, "id": id}))
    }
}

/// Contradiction detection and resolution over the belief set. A separate
/// step so its budget and failures are isolated from belief formation.
pub struct ContradictionStep {
    beliefs: Arc<BeliefSystem>,
    llm: Arc<dyn LlmClient>,
}

impl ContradictionStep {
    /// Wrap the shared belief system.
    pub fn new(beliefs: Arc<BeliefSystem>, llm: Arc<dyn LlmClient>) -> Self {
        Self { beliefs, llm }
    }
}

#[async_trait]
impl OptionalStep for ContradictionStep {
    fn name(&self) -> &'static str {
        "contradictions"
    }

    fn priority(&self) -> Priority {
        Priority::Important
    }

    async fn run(&self, _tick: u64, _ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let pairs = self.beliefs.candidate_pairs();
        if pairs.is_empty() {
            return Ok(json!({"checked": 0, "resolved": 0}));
        }

        let mut resolved = 0u32;
        for (a, b) in &pairs {
            let prompt = format!(
                "Belief A: \"{}\" (confidence {:.2})\nBelief B: \"{}\" (confidence {:.2})\n\n\
                 Do these contradict each other? Answer JSON only:\n\
                 {{\"verdict\": \"none|weaken_first|weaken_second|synthesize\"}}",
                a.text, a.confidence, b.text, b.confidence
            );
            let raw = self
                .llm
                .chat(&prompt, "You resolve contradictions between beliefs. Answer ONLY with valid JSON.")
                .await;
            let Some(verdict) = json_util::parse_typed::<Verdict>(&raw) else {
                continue;
            };
            match verdict.verdict.as_str() {
                "weaken_first" => {
                    self.beliefs.adjust_confidence(a.id, -0.15);
                    self.beliefs.count_resolution();
                    resolved += 1;
                }
                "weaken_second" => {
                    self.beliefs.adjust_confidence(b.id, -0.15);
                    self.beliefs.count_resolution();
                    resolved += 1;
                }
                "synthesize" => {
                    // Synthesis always produces a new belief, weakening both
                    // parents; principles are never created here.
                    let text = format!("{} — though {}", a.text.trim_end_matches('.'), b.text);
                    self.beliefs.insert(&text, 0.5);
                    self.beliefs.adjust_confidence(a.id, -0.1);
                    self.beliefs.adjust_confidence(b.id, -0.1);
                    self.beliefs.count_resolution();
                    resolved += 1;
                }
                _ => {}
            }
        }
        Ok(json!({"checked": pairs.len(), "resolved": resolved}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedLlm {
        reply: String,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn chat(&self, _prompt: &str, _system: &str) -> String {
            self.reply.clone()
        }
        async fn embed(&self, _text: &str) -> Vec<f32> {
            Vec::new()
        }
        async fn is_available(&self) -> bool {
            true
        }
        fn reset_tick_counter(&self) {}
        fn calls_this_tick(&self) -> u32 {
            0
        }
    }

    fn system(dir: &Path, reply: &str) -> BeliefSystem {
        BeliefSystem::new(dir, Arc::new(ScriptedLlm { reply: reply.to_string() }))
    }

    #[tokio::test]
    async fn forms_belief_from_valid_json() {
        let dir = tempfile::tempdir().unwrap();
        let beliefs = system(dir.path(), r#"{"belief": "the workspace changes at night", "confidence": 0.7}"#);
        let ctx = CognitionContext {
            attention_context: "  [world.file_changed] config.toml".to_string(),
            ..Default::default()
        };
        let result = beliefs.run(1, &ctx).await.unwrap();
        assert_eq!(result["formed"], true);
        assert_eq!(beliefs.all().len(), 1);
        assert_eq!(beliefs.all()[0].confidence, 0.7);
    }

    #[tokio::test]
    async fn garbage_output_forms_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let beliefs = system(dir.path(), "I think, therefore I am");
        let ctx = CognitionContext {
            attention_context: "something".to_string(),
            ..Default::default()
        };
        let result = beliefs.run(1, &ctx).await.unwrap();
        assert_eq!(result["formed"], false);
        assert!(beliefs.all().is_empty());
    }

    #[test]
    fn weakened_belief_below_floor_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let beliefs = system(dir.path(), "");
        let id = beliefs.insert("fragile belief", 0.2);
        beliefs.adjust_confidence(id, -0.15);
        assert!(beliefs.all().is_empty());
    }

    #[tokio::test]
    async fn synthesize_verdict_creates_new_belief() {
        let dir = tempfile::tempdir().unwrap();
        let beliefs = Arc::new(system(dir.path(), r#"{"verdict": "synthesize"}"#));
        beliefs.insert("the workspace is mostly static", 0.6);
        beliefs.insert("the workspace changes every night", 0.6);

        let step = ContradictionStep::new(
            Arc::clone(&beliefs),
            Arc::new(ScriptedLlm { reply: r#"{"verdict": "synthesize"}"#.to_string() }),
        );
        let result = step.run(1, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["resolved"], 1);
        assert_eq!(beliefs.all().len(), 3);
        assert_eq!(beliefs.contradictions_resolved(), 1);
    }

    #[tokio::test]
    async fn none_verdict_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let beliefs = Arc::new(system(dir.path(), ""));
        beliefs.insert("the workspace is quiet", 0.6);
        beliefs.insert("the workspace is large", 0.6);

        let step = ContradictionStep::new(
            Arc::clone(&beliefs),
            Arc::new(ScriptedLlm { reply: r#"{"verdict": "none"}"#.to_string() }),
        );
        let result = step.run(1, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["resolved"], 0);
        assert_eq!(beliefs.all().len(), 2);
    }
}
