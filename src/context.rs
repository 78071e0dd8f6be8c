//! Rolling conversation state shared by all personas for one
//! (student, lesson) pair.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::logging;
use crate::persona::Persona;
use crate::truncate_chars;

/// Turns exposed to a persona through [`ConversationContext::persona_view`]
pub const PERSONA_VIEW_TURNS: usize = 5;
/// Turns carried in a handoff payload
pub const HANDOFF_TURNS: usize = 3;
const MAX_UNRESOLVED_QUESTIONS: usize = 10;

const POSITIVE_WORDS: &[&str] = &["thank", "great", "love", "amazing", "wonderful", "helpful"];
const STRUGGLE_WORDS: &[&str] = &["confused", "difficult", "hard", "frustrated", "stuck"];

// ============ Student State ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Neutral,
    Positive,
    Challenged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engagement {
    Low,
    Medium,
    High,
}

impl Mood {
    fn from_text(text: &str) -> Mood {
        let lowered = text.to_lowercase();
        if POSITIVE_WORDS.iter().any(|w| lowered.contains(w)) {
            Mood::Positive
        } else if STRUGGLE_WORDS.iter().any(|w| lowered.contains(w)) {
            Mood::Challenged
        } else {
            Mood::Neutral
        }
    }
}

impl Engagement {
    fn from_text(text: &str) -> Engagement {
        let len = text.chars().count();
        if len > 50 {
            Engagement::High
        } else if len < 10 {
            Engagement::Low
        } else {
            Engagement::Medium
        }
    }
}

// ============ Conversation Context ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub persona: Persona,
    pub user_text: String,
    pub agent_text: String,
    pub timestamp: DateTime<Utc>,
    pub fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub note: String,
    pub response_length: usize,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonaView {
    pub recent_turns: Vec<Turn>,
    pub other_insights: BTreeMap<Persona, Vec<Insight>>,
    pub mood: Mood,
    pub engagement: Engagement,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub chain_id: String,
    pub student_id: String,
    pub lesson_id: Option<String>,
    pub total_interactions: usize,
    pub personas_used: Vec<Persona>,
    pub current_persona: Option<Persona>,
    pub mood: Mood,
    pub engagement: Engagement,
    pub concepts_covered: Vec<String>,
    pub unresolved_questions: usize,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationContext {
    pub student_id: String,
    pub lesson_id: Option<String>,
    pub chain_id: String,
    pub turns: Vec<Turn>,
    pub insights: BTreeMap<Persona, Vec<Insight>>,
    pub mood: Mood,
    pub engagement: Engagement,
    pub unresolved_questions: Vec<String>,
    pub concepts_covered: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(student_id: &str, lesson_id: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            student_id: student_id.to_string(),
            lesson_id: lesson_id.map(str::to_string),
            chain_id: uuid::Uuid::new_v4().to_string(),
            turns: Vec::new(),
            insights: BTreeMap::new(),
            mood: Mood::Neutral,
            engagement: Engagement::Medium,
            unresolved_questions: Vec::new(),
            concepts_covered: BTreeSet::new(),
            created_at: now,
            last_active: now,
        }
    }

    /// Append one exchange and re-derive the student state from it.
    ///
    /// `lesson_tags` are the current lesson's tags; any tag mentioned in the
    /// exchange is added to `concepts_covered`.
    pub fn record_turn(
        &mut self,
        persona: Persona,
        user_text: &str,
        agent_text: &str,
        fallback: bool,
        lesson_tags: &[String],
    ) {
        let now = Utc::now();

        self.turns.push(Turn {
            persona,
            user_text: user_text.to_string(),
            agent_text: agent_text.to_string(),
            timestamp: now,
            fallback,
        });

        self.insights.entry(persona).or_default().push(Insight {
            note: format!("responded to \"{}\"", truncate_chars(user_text.trim(), 60)),
            response_length: agent_text.chars().count(),
            recorded_at: now,
        });

        self.engagement = Engagement::from_text(user_text);
        self.mood = Mood::from_text(user_text);
        self.track_question(user_text, fallback);

        let exchange = format!("{} {}", user_text, agent_text).to_lowercase();
        for tag in lesson_tags {
            if !tag.is_empty() && exchange.contains(&tag.to_lowercase()) {
                self.concepts_covered.insert(tag.clone());
            }
        }

        self.last_active = now;
    }

    /// A question answered by a fallback stays open until a generated reply
    /// answers the same question.
    fn track_question(&mut self, user_text: &str, fallback: bool) {
        let question = user_text.trim();
        if !question.contains('?') {
            return;
        }
        let normalized = question.to_lowercase();

        if fallback {
            let known = self
                .unresolved_questions
                .iter()
                .any(|q| q.to_lowercase() == normalized);
            if !known {
                self.unresolved_questions.push(question.to_string());
                if self.unresolved_questions.len() > MAX_UNRESOLVED_QUESTIONS {
                    self.unresolved_questions.remove(0);
                }
            }
        } else {
            self.unresolved_questions
                .retain(|q| q.to_lowercase() != normalized);
        }
    }

    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        let start = self.turns.len().saturating_sub(n);
        &self.turns[start..]
    }

    pub fn current_persona(&self) -> Option<Persona> {
        self.turns.last().map(|t| t.persona)
    }

    pub fn insight_count(&self, persona: Persona) -> usize {
        self.insights.get(&persona).map(Vec::len).unwrap_or(0)
    }

    pub fn personas_used(&self) -> Vec<Persona> {
        let used: BTreeSet<Persona> = self.turns.iter().map(|t| t.persona).collect();
        used.into_iter().collect()
    }

    /// What `persona` gets to see: recent turns plus the other personas'
    /// insights.
    pub fn persona_view(&self, persona: Persona) -> PersonaView {
        PersonaView {
            recent_turns: self.recent_turns(PERSONA_VIEW_TURNS).to_vec(),
            other_insights: self
                .insights
                .iter()
                .filter(|(p, _)| **p != persona)
                .map(|(p, v)| (*p, v.clone()))
                .collect(),
            mood: self.mood,
            engagement: self.engagement,
        }
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            chain_id: self.chain_id.clone(),
            student_id: self.student_id.clone(),
            lesson_id: self.lesson_id.clone(),
            total_interactions: self.turns.len(),
            personas_used: self.personas_used(),
            current_persona: self.current_persona(),
            mood: self.mood,
            engagement: self.engagement,
            concepts_covered: self.concepts_covered.iter().cloned().collect(),
            unresolved_questions: self.unresolved_questions.len(),
            created_at: self.created_at,
            last_active: self.last_active,
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.last_active > ttl
    }
}

// ============ Context Store ============

pub type SharedContext = Arc<Mutex<ConversationContext>>;

/// Lock a context, recovering the data if a previous holder panicked.
pub fn lock(context: &Mutex<ConversationContext>) -> MutexGuard<'_, ConversationContext> {
    context.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Index of live conversation contexts. Each context has its own lock, so
/// turns for different students never contend.
#[derive(Default)]
pub struct ContextStore {
    contexts: DashMap<String, SharedContext>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(student_id: &str, lesson_id: Option<&str>) -> String {
        match lesson_id {
            Some(lesson) => format!("{}_{}", student_id, lesson),
            None => student_id.to_string(),
        }
    }

    pub fn get_or_create(&self, student_id: &str, lesson_id: Option<&str>) -> SharedContext {
        let key = Self::key(student_id, lesson_id);
        self.contexts
            .entry(key)
            .or_insert_with(|| {
                logging::log_memory(
                    Some(student_id),
                    &format!("New conversation context (lesson={})", lesson_id.unwrap_or("-")),
                );
                Arc::new(Mutex::new(ConversationContext::new(student_id, lesson_id)))
            })
            .clone()
    }

    pub fn get(&self, student_id: &str, lesson_id: Option<&str>) -> Option<SharedContext> {
        self.contexts
            .get(&Self::key(student_id, lesson_id))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drop every context idle for longer than `ttl`. Returns how many were
    /// removed.
    pub fn evict_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let before = self.contexts.len();
        self.contexts.retain(|_, context| !lock(&**context).is_idle(now, ttl));
        let evicted = before.saturating_sub(self.contexts.len());
        if evicted > 0 {
            logging::log_memory(None, &format!("Evicted {} idle conversation contexts", evicted));
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(ContextStore::key("s1", Some("l1")), "s1_l1");
        assert_eq!(ContextStore::key("s1", None), "s1");
    }

    #[test]
    fn test_get_or_create_is_shared() {
        let store = ContextStore::new();
        let a = store.get_or_create("s1", Some("l1"));
        let b = store.get_or_create("s1", Some("l1"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
        store.get_or_create("s1", None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_record_turn_updates_state() {
        let mut ctx = ConversationContext::new("s1", None);
        ctx.record_turn(Persona::Practice, "thank you, that was great", "You're welcome!", false, &[]);
        assert_eq!(ctx.turns.len(), 1);
        assert_eq!(ctx.mood, Mood::Positive);
        assert_eq!(ctx.engagement, Engagement::Medium);
        assert_eq!(ctx.insight_count(Persona::Practice), 1);
        assert_eq!(ctx.current_persona(), Some(Persona::Practice));

        ctx.record_turn(Persona::Concept, "stuck", "Let's look again.", false, &[]);
        assert_eq!(ctx.mood, Mood::Challenged);
        assert_eq!(ctx.engagement, Engagement::Low);
    }

    #[test]
    fn test_long_message_is_high_engagement() {
        let mut ctx = ConversationContext::new("s1", None);
        let long = "I tried the breathing exercise every morning this week and it helped me";
        ctx.record_turn(Persona::Practice, long, "Wonderful.", false, &[]);
        assert_eq!(ctx.engagement, Engagement::High);
    }

    #[test]
    fn test_unresolved_questions_follow_fallbacks() {
        let mut ctx = ConversationContext::new("s1", None);
        ctx.record_turn(Persona::Concept, "What is karma?", "fallback", true, &[]);
        ctx.record_turn(Persona::Concept, "what is karma?", "fallback", true, &[]);
        assert_eq!(ctx.unresolved_questions.len(), 1);

        ctx.record_turn(Persona::Concept, "What is karma?", "Karma is action and its fruit.", false, &[]);
        assert!(ctx.unresolved_questions.is_empty());
    }

    #[test]
    fn test_concepts_from_lesson_tags() {
        let mut ctx = ConversationContext::new("s1", Some("l1"));
        let tags = vec!["kindness".to_string(), "honesty".to_string()];
        ctx.record_turn(Persona::Practice, "How can I show Kindness?", "Start small.", false, &tags);
        assert_eq!(ctx.summary().concepts_covered, vec!["kindness".to_string()]);
    }

    #[test]
    fn test_persona_view_excludes_own_insights() {
        let mut ctx = ConversationContext::new("s1", None);
        for i in 0..7 {
            let persona = if i % 2 == 0 { Persona::Practice } else { Persona::Concept };
            ctx.record_turn(persona, &format!("message {}", i), "reply", false, &[]);
        }
        let view = ctx.persona_view(Persona::Practice);
        assert_eq!(view.recent_turns.len(), PERSONA_VIEW_TURNS);
        assert_eq!(view.recent_turns.last().unwrap().user_text, "message 6");
        assert!(view.other_insights.contains_key(&Persona::Concept));
        assert!(!view.other_insights.contains_key(&Persona::Practice));
    }

    #[test]
    fn test_summary_counts() {
        let mut ctx = ConversationContext::new("s1", Some("l1"));
        ctx.record_turn(Persona::Practice, "hi there friend", "hello", false, &[]);
        ctx.record_turn(Persona::Reflection, "why am I here?", "fallback", true, &[]);
        let summary = ctx.summary();
        assert_eq!(summary.total_interactions, 2);
        assert_eq!(summary.personas_used, vec![Persona::Practice, Persona::Reflection]);
        assert_eq!(summary.current_persona, Some(Persona::Reflection));
        assert_eq!(summary.unresolved_questions, 1);
    }

    #[test]
    fn test_evict_idle() {
        let store = ContextStore::new();
        let stale = store.get_or_create("old", None);
        lock(&stale).last_active = Utc::now() - chrono::Duration::hours(10);
        store.get_or_create("fresh", None);

        let evicted = store.evict_idle(Utc::now(), chrono::Duration::hours(6));
        assert_eq!(evicted, 1);
        assert!(store.get("old", None).is_none());
        assert!(store.get("fresh", None).is_some());
    }
}
