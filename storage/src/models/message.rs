//! Message model: one chat utterance, keyed by `(chat_id, message_id)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed per-row overhead used by the footprint estimator.
pub const MESSAGE_ROW_OVERHEAD_BYTES: u64 = 64;

/// Identity of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub chat_id: i64,
    pub message_id: i64,
}

impl MessageKey {
    pub fn new(chat_id: i64, message_id: i64) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }
}

/// Where a forwarded message originally came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardOrigin {
    pub from_user_id: i64,
    pub from_chat_id: i64,
    pub from_message_id: i64,
    pub forwarded_at: Option<DateTime<Utc>>,
}

/// A stored chat message. Written once on ingress; only `embedding` is attached later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub chat_id: i64,
    pub message_id: i64,
    /// 0 = system / unknown author.
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub caption: String,
    /// 0 = not a reply.
    #[serde(default)]
    pub reply_to_message_id: i64,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub is_voice: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<ForwardOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Message {
    /// Creates a plain text message with no reply, media or vector.
    pub fn new(
        chat_id: i64,
        message_id: i64,
        user_id: i64,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            chat_id,
            message_id,
            user_id,
            is_bot: false,
            timestamp,
            text: text.into(),
            caption: String::new(),
            reply_to_message_id: 0,
            has_media: false,
            is_voice: false,
            forward: None,
            embedding: None,
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.chat_id, self.message_id)
    }

    pub fn with_reply_to(mut self, reply_to_message_id: i64) -> Self {
        self.reply_to_message_id = reply_to_message_id;
        self
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = caption.into();
        self.has_media = true;
        self
    }

    pub fn with_bot(mut self, is_bot: bool) -> Self {
        self.is_bot = is_bot;
        self
    }

    pub fn with_forward(mut self, origin: ForwardOrigin) -> Self {
        self.forward = Some(origin);
        self
    }

    pub fn is_forward(&self) -> bool {
        self.forward.is_some()
    }

    pub fn is_reply(&self) -> bool {
        self.reply_to_message_id != 0
    }

    /// A message with non-blank text or caption can be embedded.
    pub fn is_embeddable(&self) -> bool {
        !self.text.trim().is_empty() || !self.caption.trim().is_empty()
    }

    /// Embeddable and still without a vector.
    pub fn needs_embedding(&self) -> bool {
        self.is_embeddable() && self.embedding.is_none()
    }

    /// Text sent to the embedding provider: text and caption joined by a newline.
    pub fn embedding_text(&self) -> String {
        match (self.text.trim().is_empty(), self.caption.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.text, self.caption),
            (false, true) => self.text.clone(),
            (true, false) => self.caption.clone(),
            (true, true) => String::new(),
        }
    }

    /// Footprint estimate shared by all backends so retention behaves the same everywhere.
    pub fn approx_size(&self) -> u64 {
        let vector_bytes = self
            .embedding
            .as_ref()
            .map(|v| (v.len() * std::mem::size_of::<f32>()) as u64)
            .unwrap_or(0);
        MESSAGE_ROW_OVERHEAD_BYTES + self.text.len() as u64 + self.caption.len() as u64 + vector_bytes
    }
}

/// A message returned by vector search together with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    pub score: f32,
    pub message: Message,
}

/// Orders by descending score, ties broken by recency (newest first).
pub fn rank_by_similarity(results: &mut [ScoredMessage]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.message.timestamp.cmp(&a.message.timestamp))
            .then_with(|| b.message.message_id.cmp(&a.message.message_id))
    });
}

/// Chronological order: timestamp ascending, message id as tie-breaker.
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
}

/// Cosine similarity; 0.0 for empty, mismatched or zero-norm inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot_product / (norm_a * norm_b)
}
