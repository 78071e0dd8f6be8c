//! Text generation seam. Persona agents only see [`TextGenerator`]; the
//! OpenAI client and the offline scripted generator both implement it.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("generator returned an empty response")]
    EmptyResponse,
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;

    fn name(&self) -> &str;
}

/// Offline generator that answers from canned replies. Used when no API key
/// is configured.
///
/// The reply is picked from a hash of the prompt, so one student's
/// conversation never shifts which replies another student sees.
pub struct ScriptedGenerator {
    replies: Vec<String>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        Self { replies }
    }

    fn pick(&self, prompt: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        (hasher.finish() % self.replies.len() as u64) as usize
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new(
            OFFLINE_REPLIES.iter().map(|r| r.to_string()).collect(),
        )
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        if self.replies.is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(self.replies[self.pick(prompt)].clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

const OFFLINE_REPLIES: &[&str] = &[
    "That is a thoughtful place to begin. Every lesson grows the way a garden does: a little attention each day, a little patience, and a willingness to notice what changes. Try choosing one idea from today's lesson and carrying it with you until evening. When the day ends, ask yourself where it showed up, even in a small way, and what you felt when it did.",
    "Let's look at this from a few angles. First, think about what the lesson is asking of you in plain words. Next, think of someone you admire who already lives this way and what they actually do. Finally, notice one moment tomorrow where you could do the same. Understanding grows when the idea, the example and the action meet.",
    "There is something worth sitting with here. Before answering quickly, take a slow breath and let the question settle. What part of it feels closest to your own life right now? Meaning often arrives quietly, in the space after we stop searching so hard, so give yourself that space and see what you notice.",
    "You are asking exactly the kind of question that helps learning stick. Write down one sentence that sums up the lesson in your own words, then one sentence about why it matters to you, and one small thing you will try this week. Coming back to those sentences later will show you how much you have grown.",
];
