//! Attention filter: scores recent episodes by recency and type weight,
//! keeps the significant ones, and renders the context block injected into
//! the monologue and goal prompts.

use anima_types::{Episode, Outcome};
use chrono::NaiveDateTime;

/// Scoring and filtering over recent episodes.
#[derive(Debug, Clone)]
pub struct AttentionFilter {
    /// Minimum score an episode needs to pass.
    pub min_score: f64,
    /// Maximum episodes kept after filtering.
    pub top_k: usize,
}

fn type_weight(event_type: &str) -> f64 {
    if event_type.starts_with("user.") {
        1.0
    } else if event_type.starts_with("shell.") || event_type == "error" {
        0.85
    } else if event_type.starts_with("world.") {
        0.7
    } else if event_type == "monologue" {
        0.4
    } else {
        0.6
    }
}

fn age_hours(timestamp: &str) -> f64 {
    NaiveDateTime::parse_from_str(timestamp, "%Y-%m-%dT%H:%M:%S")
        .map(|t| {
            let delta = chrono::Local::now().naive_local() - t;
            (delta.num_seconds().max(0) as f64) / 3600.0
        })
        .unwrap_or(24.0)
}

impl AttentionFilter {
    /// Build with the configured shaping parameters.
    pub fn new(min_score: f64, top_k: usize) -> Self {
        Self { min_score, top_k }
    }

    /// Score one episode: type weight decayed by age, with a bump for
    /// failures (they deserve attention).
    pub fn score(&self, episode: &Episode) -> f64 {
        let decay = (-age_hours(&episode.timestamp) / 6.0).exp();
        let mut score = type_weight(&episode.event_type) * decay;
        if episode.outcome == Outcome::Failure {
            score += 0.1;
        }
        score.min(1.0)
    }

    /// Keep the top-k episodes scoring at or above the threshold, highest
    /// first.
    pub fn filter(&self, episodes: &[Episode]) -> Vec<(Episode, f64)> {
        let mut scored: Vec<(Episode, f64)> = episodes
            .iter()
            .map(|e| (e.clone(), self.score(e)))
            .filter(|(_, s)| *s >= self.min_score)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.top_k);
        scored
    }

    /// Render the filtered episodes as a prompt block.
    pub fn build_context(&self, filtered: &[(Episode, f64)]) -> String {
        filtered
            .iter()
            .map(|(e, score)| {
                let desc: String = e.description.chars().take(120).collect();
                format!("  [{} | {} | {:.2}] {}", e.event_type, e.outcome, score, desc)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One-line summary of where attention currently sits.
    pub fn focus_summary(&self, filtered: &[(Episode, f64)]) -> String {
        if filtered.is_empty() {
            return String::new();
        }
        let user = filtered.iter().filter(|(e, _)| e.event_type.starts_with("user.")).count();
        let failures = filtered.iter().filter(|(e, _)| e.outcome == Outcome::Failure).count();
        if user > 0 {
            format!("Focus: {user} recent user interaction(s) demand attention.")
        } else if failures > 0 {
            format!("Focus: {failures} recent failure(s) to understand.")
        } else {
            format!("Focus: routine observation over {} significant episode(s).", filtered.len())
        }
    }
}
