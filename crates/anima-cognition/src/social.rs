//! Social layer: consumes user messages from the bus, drafts replies, and
//! appends them to the outbox with the standard header block.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info};

use anima_bus_core::{topics, EventBus};
use anima_llm_gateway::LlmClient;
use anima_store::EpisodicStore;
use anima_types::{now_iso, Outcome};

use crate::{CognitionContext, OptionalStep};

/// A message parsed back out of the outbox file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxMessage {
    /// Header timestamp, `YYYY-MM-DD HH:MM`.
    pub timestamp: String,
    /// Message body.
    pub text: String,
}

#[derive(Debug, Clone)]
struct PendingMessage {
    text: String,
    urgent: bool,
    tick: u64,
}

/// Inbox/outbox processing behind the optional-step contract.
pub struct SocialLayer {
    outbox_path: PathBuf,
    llm: Arc<dyn LlmClient>,
    episodic: Arc<EpisodicStore>,
    pending: Mutex<VecDeque<PendingMessage>>,
}

/// Pending messages kept when the user is faster than the tick.
const MAX_PENDING: usize = 10;

impl SocialLayer {
    /// Create the layer. Call [`subscribe`](Self::subscribe) to attach it
    /// to the bus.
    pub fn new(outbox_path: &Path, llm: Arc<dyn LlmClient>, episodic: Arc<EpisodicStore>) -> Self {
        Self {
            outbox_path: outbox_path.to_path_buf(),
            llm,
            episodic,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Register the `user.message` / `user.urgent` handlers.
    pub async fn subscribe(self: &Arc<Self>, bus: &EventBus) {
        for (topic, urgent) in [(topics::USER_MESSAGE, false), (topics::USER_URGENT, true)] {
            let layer = Arc::clone(self);
            bus.subscribe(topic, "social_layer", move |payload| {
                let layer = Arc::clone(&layer);
                async move {
                    let text = payload["text"].as_str().unwrap_or_default().to_string();
                    let tick = payload["tick"].as_u64().unwrap_or_default();
                    if !text.is_empty() {
                        layer.enqueue(text, urgent, tick);
                    }
                    Ok(())
                }
            })
            .await;
        }
    }

    fn enqueue(&self, text: String, urgent: bool, tick: u64) {
        let mut pending = self.pending.lock();
        if urgent {
            pending.push_front(PendingMessage { text, urgent, tick });
        } else {
            pending.push_back(PendingMessage { text, urgent, tick });
        }
        while pending.len() > MAX_PENDING {
            pending.pop_back();
        }
    }

    /// Messages waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Append one reply to the outbox under the standard header.
    async fn write_outbox(&self, reply: &str) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M");
        let block = format!("--- [{stamp}] Digital Being ---\n{reply}\n\n");
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.outbox_path)
            .await?;
        file.write_all(block.as_bytes()).await?;
        Ok(())
    }

    /// Parse the outbox file back into structured messages.
    pub async fn read_outbox(&self) -> Vec<OutboxMessage> {
        let Ok(content) = tokio::fs::read_to_string(&self.outbox_path).await else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        let mut current: Option<OutboxMessage> = None;
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("--- [") {
                if let Some(end) = rest.find(']') {
                    if let Some(done) = current.take() {
                        messages.push(done);
                    }
                    current = Some(OutboxMessage {
                        timestamp: rest[..end].to_string(),
                        text: String::new(),
                    });
                    continue;
                }
            }
            if let Some(message) = current.as_mut() {
                if !message.text.is_empty() {
                    message.text.push('\n');
                }
                message.text.push_str(line);
            }
        }
        if let Some(done) = current.take() {
            messages.push(done);
        }
        for message in &mut messages {
            message.text = message.text.trim().to_string();
        }
        messages
    }
}

#[async_trait]
impl OptionalStep for SocialLayer {
    fn name(&self) -> &'static str {
        "social"
    }

    fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(25)
    }

    async fn run(&self, tick: u64, ctx: &CognitionContext) -> anyhow::Result<serde_json::Value> {
        let Some(message) = self.pending.lock().pop_front() else {
            return Ok(json!({"replied": false, "reason": "inbox quiet"}));
        };

        let urgency = if message.urgent { "The user marked this URGENT. " } else { "" };
        let prompt = format!(
            "{}The user wrote:\n{}\n\nYour state: {}\n{}\n\nReply to the user in a few \
             sentences, first person.",
            urgency, message.text, ctx.values_context, ctx.emotion_context
        );
        let reply = self
            .llm
            .chat(&prompt, "You are a digital being conversing with your only user. Be direct and warm.")
            .await;
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            // Put the message back; the next cycle may have a working LLM.
            self.pending.lock().push_front(message);
            return Ok(json!({"replied": false, "reason": "llm unavailable"}));
        }

        if let Err(e) = self.write_outbox(&reply).await {
            error!(error = %e, "outbox write failed");
            self.pending.lock().push_front(message);
            return Ok(json!({"replied": false, "reason": "outbox write failed"}));
        }

        let preview: String = message.text.chars().take(120).collect();
        self.episodic
            .add_episode(
                "social.reply",
                &format!("Replied to user message: {preview}"),
                Outcome::Success,
                Some(json!({"tick": tick, "urgent": message.urgent, "received_tick": message.tick})),
            )
            .await;
        info!(urgent = message.urgent, "replied to user message");
        Ok(json!({"replied": true, "at": now_iso()}))
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

    async fn layer(dir: &Path, reply: &str) -> Arc<SocialLayer> {
        Arc::new(SocialLayer::new(
            &dir.join("outbox.txt"),
            Arc::new(ScriptedLlm { reply: reply.to_string() }),
            Arc::new(EpisodicStore::in_memory().await.unwrap()),
        ))
    }

    #[tokio::test]
    async fn replies_land_in_outbox_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let social = layer(dir.path(), "Hello! I noticed the new file too.").await;
        social.subscribe(&bus).await;

        bus.publish(topics::USER_MESSAGE, json!({"text": "did you see the new file?", "tick": 3}))
            .await;
        assert_eq!(social.pending_count(), 1);

        let result = social.run(4, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["replied"], true);
        assert_eq!(social.pending_count(), 0);

        let messages = social.read_outbox().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "Hello! I noticed the new file too.");
        assert!(!messages[0].timestamp.is_empty());
    }

    #[tokio::test]
    async fn urgent_messages_jump_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::default());
        let social = layer(dir.path(), "ok").await;
        social.subscribe(&bus).await;

        bus.publish(topics::USER_MESSAGE, json!({"text": "later", "tick": 1})).await;
        bus.publish(topics::USER_URGENT, json!({"text": "now!", "tick": 2})).await;

        let front = social.pending.lock().front().cloned().unwrap();
        assert_eq!(front.text, "now!");
        assert!(front.urgent);
    }

    #[tokio::test]
    async fn failed_reply_requeues_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let social = layer(dir.path(), "").await;
        social.enqueue("hello?".to_string(), false, 1);

        let result = social.run(2, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["replied"], false);
        assert_eq!(social.pending_count(), 1);
    }

    #[tokio::test]
    async fn quiet_inbox_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let social = layer(dir.path(), "x").await;
        let result = social.run(1, &CognitionContext::default()).await.unwrap();
        assert_eq!(result["replied"], false);
    }

    #[tokio::test]
    async fn outbox_roundtrips_multiple_messages() {
        let dir = tempfile::tempdir().unwrap();
        let social = layer(dir.path(), "first").await;
        social.write_outbox("first").await.unwrap();
        social.write_outbox("second\nwith two lines").await.unwrap();

        let messages = social.read_outbox().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].text, "second\nwith two lines");
    }
}
