//! Persona memory
//!
//! Each (student, persona) pair keeps:
//! - a profile (interaction count, progress markers, mastered concepts)
//! - a window of recent exchanges used for prompting and repetition checks
//! - snippets searched by keyword overlap to personalize prompts
//!
//! Cached memories are dropped after sitting idle, the same way conversation
//! contexts are; the next request reloads them from the database.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::Database;
use crate::error::Result;
use crate::logging;
use crate::persona::Persona;
use crate::truncate_chars;

/// Exchanges kept in the rolling window
pub const EXCHANGE_WINDOW: usize = 20;
/// Snippets held per memory, both when loading and as new ones arrive
const SNIPPET_LIMIT: usize = 200;
const RELEVANT_SNIPPETS: usize = 3;
const PROMPT_EXCHANGES: usize = 4;
/// Performance at which the Concept persona marks lesson concepts as mastered
const MASTERY_PERFORMANCE: f64 = 0.8;

// ============ Types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnippetKind {
    Conversation,
    Progress,
    Observation,
    /// Marks where the exchange window was cleared
    Reset,
}

impl SnippetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetKind::Conversation => "conversation",
            SnippetKind::Progress => "progress",
            SnippetKind::Observation => "observation",
            SnippetKind::Reset => "reset",
        }
    }

    pub fn from_str(s: &str) -> Option<SnippetKind> {
        match s {
            "conversation" => Some(SnippetKind::Conversation),
            "progress" => Some(SnippetKind::Progress),
            "observation" => Some(SnippetKind::Observation),
            "reset" => Some(SnippetKind::Reset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnippet {
    pub kind: SnippetKind,
    pub content: String,
    pub agent_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub lesson_id: String,
    pub performance: f64,
    pub insights: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub student_id: String,
    pub persona: Persona,
    pub total_interactions: u64,
    pub last_interaction: Option<DateTime<Utc>>,
    pub progress_markers: Vec<ProgressMarker>,
    pub mastered_concepts: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl PersonaProfile {
    pub fn new(student_id: &str, persona: Persona) -> Self {
        Self {
            student_id: student_id.to_string(),
            persona,
            total_interactions: 0,
            last_interaction: None,
            progress_markers: Vec::new(),
            mastered_concepts: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Exchange {
    pub user_text: String,
    pub agent_text: String,
    pub timestamp: DateTime<Utc>,
}

/// Memory-derived context handed to a persona before it answers.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryContext {
    pub profile: PersonaProfile,
    pub relevant_memories: Vec<MemorySnippet>,
    pub recent_exchanges: Vec<Exchange>,
    pub summary: String,
}

// ============ Persona Memory ============

#[derive(Debug, Clone)]
pub struct PersonaMemory {
    pub profile: PersonaProfile,
    exchanges: VecDeque<Exchange>,
    snippets: Vec<MemorySnippet>,
    last_used: DateTime<Utc>,
}

impl PersonaMemory {
    pub fn new(profile: PersonaProfile, snippets: Vec<MemorySnippet>) -> Self {
        let mut exchanges = VecDeque::with_capacity(EXCHANGE_WINDOW);
        for snippet in &snippets {
            if snippet.kind == SnippetKind::Reset {
                exchanges.clear();
                continue;
            }
            if snippet.kind != SnippetKind::Conversation {
                continue;
            }
            if let Some(agent_text) = &snippet.agent_text {
                exchanges.push_back(Exchange {
                    user_text: snippet.content.clone(),
                    agent_text: agent_text.clone(),
                    timestamp: snippet.created_at,
                });
                if exchanges.len() > EXCHANGE_WINDOW {
                    exchanges.pop_front();
                }
            }
        }
        let mut memory = Self {
            profile,
            exchanges,
            snippets: Vec::new(),
            last_used: Utc::now(),
        };
        for snippet in snippets {
            memory.push_snippet(snippet);
        }
        memory
    }

    /// Agent texts of the last `n` exchanges, oldest first.
    pub fn recent_responses(&self, n: usize) -> Vec<&str> {
        let start = self.exchanges.len().saturating_sub(n);
        self.exchanges
            .iter()
            .skip(start)
            .map(|e| e.agent_text.as_str())
            .collect()
    }

    pub fn recent_exchanges(&self, n: usize) -> Vec<Exchange> {
        let start = self.exchanges.len().saturating_sub(n);
        self.exchanges.iter().skip(start).cloned().collect()
    }

    fn push_exchange(&mut self, user_text: &str, agent_text: &str, at: DateTime<Utc>) {
        self.exchanges.push_back(Exchange {
            user_text: user_text.to_string(),
            agent_text: agent_text.to_string(),
            timestamp: at,
        });
        if self.exchanges.len() > EXCHANGE_WINDOW {
            self.exchanges.pop_front();
        }
    }

    fn push_snippet(&mut self, snippet: MemorySnippet) {
        if snippet.kind == SnippetKind::Reset {
            return;
        }
        self.snippets.push(snippet);
        if self.snippets.len() > SNIPPET_LIMIT {
            let excess = self.snippets.len() - SNIPPET_LIMIT;
            self.snippets.drain(..excess);
        }
    }

    pub fn snippet_count(&self) -> usize {
        self.snippets.len()
    }

    /// Snippets sharing the most words (4+ letters) with `query`; ties go to
    /// the newer snippet.
    pub fn relevant_snippets(&self, query: &str, k: usize) -> Vec<MemorySnippet> {
        let terms = significant_words(query);
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize, &MemorySnippet)> = self
            .snippets
            .iter()
            .enumerate()
            .filter_map(|(i, snippet)| {
                let words = significant_words(&snippet.content);
                let overlap = terms.intersection(&words).count();
                (overlap > 0).then_some((overlap, i, snippet))
            })
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));

        scored.into_iter().take(k).map(|(_, _, s)| s.clone()).collect()
    }

    pub fn context_for(&self, query: &str) -> MemoryContext {
        let summary = match self.profile.last_interaction {
            Some(last) => format!(
                "{} earlier conversations with the {}, most recently on {}; {} lessons reviewed",
                self.profile.total_interactions,
                self.profile.persona.display_name(),
                last.format("%Y-%m-%d"),
                self.profile.progress_markers.len()
            ),
            None => format!("First conversation with the {}", self.profile.persona.display_name()),
        };

        MemoryContext {
            profile: self.profile.clone(),
            relevant_memories: self.relevant_snippets(query, RELEVANT_SNIPPETS),
            recent_exchanges: self.recent_exchanges(PROMPT_EXCHANGES),
            summary,
        }
    }
}

fn significant_words(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4)
        .map(|w| w.to_lowercase())
        .collect()
}

// ============ Memory Store ============

type SharedMemory = Arc<Mutex<PersonaMemory>>;

fn lock(memory: &Mutex<PersonaMemory>) -> MutexGuard<'_, PersonaMemory> {
    memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Persona memories, loaded lazily from the database and cached per
/// (student, persona).
pub struct MemoryStore {
    db: Arc<Database>,
    cache: DashMap<(String, Persona), SharedMemory>,
}

impl MemoryStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            cache: DashMap::new(),
        }
    }

    fn handle(&self, student_id: &str, persona: Persona) -> Result<SharedMemory> {
        let key = (student_id.to_string(), persona);
        if let Some(existing) = self.cache.get(&key) {
            let memory = existing.value().clone();
            drop(existing);
            lock(&memory).last_used = Utc::now();
            return Ok(memory);
        }

        let profile = self
            .db
            .get_persona_profile(student_id, persona)?
            .unwrap_or_else(|| PersonaProfile::new(student_id, persona));
        let snippets = self.db.recent_snippets(student_id, persona, SNIPPET_LIMIT)?;
        let loaded = Arc::new(Mutex::new(PersonaMemory::new(profile, snippets)));

        // Another request may have loaded it meanwhile; keep whichever won.
        Ok(self.cache.entry(key).or_insert(loaded).value().clone())
    }

    pub fn context(&self, student_id: &str, persona: Persona, query: &str) -> Result<MemoryContext> {
        let memory = self.handle(student_id, persona)?;
        let guard = lock(&memory);
        Ok(guard.context_for(query))
    }

    pub fn recent_responses(&self, student_id: &str, persona: Persona, n: usize) -> Result<Vec<String>> {
        let memory = self.handle(student_id, persona)?;
        let guard = lock(&memory);
        Ok(guard.recent_responses(n).into_iter().map(str::to_string).collect())
    }

    pub fn profile(&self, student_id: &str, persona: Persona) -> Result<PersonaProfile> {
        let memory = self.handle(student_id, persona)?;
        let guard = lock(&memory);
        Ok(guard.profile.clone())
    }

    /// Remember an accepted exchange.
    pub fn record_exchange(&self, student_id: &str, persona: Persona, user_text: &str, agent_text: &str) -> Result<()> {
        let memory = self.handle(student_id, persona)?;
        let now = Utc::now();
        let snippet = MemorySnippet {
            kind: SnippetKind::Conversation,
            content: user_text.to_string(),
            agent_text: Some(agent_text.to_string()),
            created_at: now,
        };

        let profile = {
            let mut guard = lock(&memory);
            guard.push_exchange(user_text, agent_text, now);
            guard.push_snippet(snippet.clone());
            guard.profile.total_interactions += 1;
            guard.profile.last_interaction = Some(now);
            guard.profile.clone()
        };

        self.db.insert_snippet(student_id, persona, &snippet)?;
        self.db.save_persona_profile(&profile)?;
        Ok(())
    }

    /// Add a progress marker for a lesson. The Concept persona also records
    /// the insights as mastered concepts when performance is high.
    pub fn record_progress(
        &self,
        student_id: &str,
        persona: Persona,
        lesson_id: &str,
        performance: f64,
        insights: &[String],
    ) -> Result<PersonaProfile> {
        let memory = self.handle(student_id, persona)?;
        let now = Utc::now();
        let snippet = MemorySnippet {
            kind: SnippetKind::Progress,
            content: format!(
                "Lesson {} reviewed with performance {:.2}: {}",
                lesson_id,
                performance,
                truncate_chars(&insights.join("; "), 200)
            ),
            agent_text: None,
            created_at: now,
        };

        let profile = {
            let mut guard = lock(&memory);
            guard.profile.progress_markers.push(ProgressMarker {
                lesson_id: lesson_id.to_string(),
                performance,
                insights: insights.to_vec(),
                recorded_at: now,
            });
            if persona == Persona::Concept && performance >= MASTERY_PERFORMANCE {
                for insight in insights {
                    if !guard.profile.mastered_concepts.contains(insight) {
                        guard.profile.mastered_concepts.push(insight.clone());
                    }
                }
            }
            guard.push_snippet(snippet.clone());
            guard.profile.clone()
        };

        self.db.insert_snippet(student_id, persona, &snippet)?;
        self.db.save_persona_profile(&profile)?;
        logging::log_memory(
            Some(student_id),
            &format!("{} progress marker for lesson {} ({:.2})", persona, lesson_id, performance),
        );
        Ok(profile)
    }

    /// Forget the recent exchange window, keeping profile and snippets. The
    /// reset is stored so a reload from the database starts clean too.
    pub fn reset_recent(&self, student_id: &str, persona: Persona) -> Result<()> {
        let memory = self.handle(student_id, persona)?;
        let marker = MemorySnippet {
            kind: SnippetKind::Reset,
            content: String::new(),
            agent_text: None,
            created_at: Utc::now(),
        };
        lock(&memory).exchanges.clear();
        self.db.insert_snippet(student_id, persona, &marker)?;
        logging::log_memory(Some(student_id), &format!("{} recent exchanges cleared", persona));
        Ok(())
    }

    /// Drop cached memories unused for longer than `ttl`.
    pub fn evict_idle(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, memory| now - lock(&**memory).last_used <= ttl);
        let evicted = before.saturating_sub(self.cache.len());
        if evicted > 0 {
            logging::log_memory(None, &format!("Evicted {} idle persona memories", evicted));
        }
        evicted
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    #[test]
    fn test_first_context_is_empty() {
        let store = store();
        let ctx = store.context("s1", Persona::Practice, "gratitude").unwrap();
        assert_eq!(ctx.profile.total_interactions, 0);
        assert!(ctx.relevant_memories.is_empty());
        assert!(ctx.summary.starts_with("First conversation"));
    }

    #[test]
    fn test_record_exchange_updates_profile_and_window() {
        let store = store();
        for i in 0..25 {
            store
                .record_exchange("s1", Persona::Practice, &format!("question {}", i), &format!("answer {}", i))
                .unwrap();
        }
        let profile = store.profile("s1", Persona::Practice).unwrap();
        assert_eq!(profile.total_interactions, 25);

        let responses = store.recent_responses("s1", Persona::Practice, 4).unwrap();
        assert_eq!(responses, vec!["answer 21", "answer 22", "answer 23", "answer 24"]);

        let ctx = store.context("s1", Persona::Practice, "anything").unwrap();
        assert_eq!(ctx.recent_exchanges.len(), 4);
    }

    #[test]
    fn test_relevance_by_keyword_overlap() {
        let store = store();
        store
            .record_exchange("s1", Persona::Concept, "Why does gratitude matter?", "Gratitude shifts attention.")
            .unwrap();
        store
            .record_exchange("s1", Persona::Concept, "Tell me about patience", "Patience is strength.")
            .unwrap();
        store
            .record_exchange("s1", Persona::Concept, "More on gratitude and patience please", "Both grow together.")
            .unwrap();

        let ctx = store.context("s1", Persona::Concept, "gratitude and patience").unwrap();
        assert_eq!(ctx.relevant_memories.len(), 3);
        assert_eq!(ctx.relevant_memories[0].content, "More on gratitude and patience please");
    }

    #[test]
    fn test_memory_survives_cache_reload() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let first = MemoryStore::new(db.clone());
        first.record_exchange("s1", Persona::Reflection, "what is purpose?", "Purpose is a direction.").unwrap();

        let second = MemoryStore::new(db);
        let profile = second.profile("s1", Persona::Reflection).unwrap();
        assert_eq!(profile.total_interactions, 1);
        assert_eq!(
            second.recent_responses("s1", Persona::Reflection, 4).unwrap(),
            vec!["Purpose is a direction."]
        );
    }

    #[test]
    fn test_concept_mastery_from_progress() {
        let store = store();
        let insights = vec!["ahimsa".to_string(), "satya".to_string()];
        let concept = store
            .record_progress("s1", Persona::Concept, "l1", 0.9, &insights)
            .unwrap();
        assert_eq!(concept.mastered_concepts, insights);
        assert_eq!(concept.progress_markers.len(), 1);

        let practice = store
            .record_progress("s1", Persona::Practice, "l1", 0.9, &insights)
            .unwrap();
        assert!(practice.mastered_concepts.is_empty());

        let low = store
            .record_progress("s1", Persona::Concept, "l2", 0.5, &["dana".to_string()])
            .unwrap();
        assert_eq!(low.mastered_concepts.len(), 2);
    }

    #[test]
    fn test_cached_snippets_are_capped() {
        let store = store();
        store
            .record_exchange("s1", Persona::Practice, "Tell me about elephants", "an answer")
            .unwrap();
        for i in 0..SNIPPET_LIMIT + 10 {
            store
                .record_exchange("s1", Persona::Practice, &format!("question {}", i), "an answer")
                .unwrap();
        }
        store.record_progress("s1", Persona::Practice, "l1", 0.5, &[]).unwrap();

        let memory = store.handle("s1", Persona::Practice).unwrap();
        let guard = lock(&memory);
        assert_eq!(guard.snippet_count(), SNIPPET_LIMIT);
        // Oldest snippets go first.
        assert!(guard.relevant_snippets("elephants", 3).is_empty());
    }

    #[test]
    fn test_reset_recent_survives_reload() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let first = MemoryStore::new(db.clone());
        for i in 0..4 {
            first
                .record_exchange("s1", Persona::Concept, &format!("question {}", i), "same answer")
                .unwrap();
        }
        first.reset_recent("s1", Persona::Concept).unwrap();
        assert!(first.recent_responses("s1", Persona::Concept, 4).unwrap().is_empty());

        let second = MemoryStore::new(db);
        assert!(second.recent_responses("s1", Persona::Concept, 4).unwrap().is_empty());
        assert_eq!(second.profile("s1", Persona::Concept).unwrap().total_interactions, 4);

        second.record_exchange("s1", Persona::Concept, "question 5", "fresh answer").unwrap();
        assert_eq!(
            second.recent_responses("s1", Persona::Concept, 4).unwrap(),
            vec!["fresh answer"]
        );
    }

    #[test]
    fn test_evict_idle_memories() {
        let store = store();
        store.profile("s1", Persona::Practice).unwrap();
        store.profile("s2", Persona::Reflection).unwrap();
        assert_eq!(store.cached(), 2);

        let ttl = chrono::Duration::hours(6);
        assert_eq!(store.evict_idle(Utc::now(), ttl), 0);
        assert_eq!(store.evict_idle(Utc::now() + chrono::Duration::hours(7), ttl), 2);
        assert_eq!(store.cached(), 0);

        // Evicted memories reload on demand.
        assert_eq!(store.profile("s1", Persona::Practice).unwrap().total_interactions, 0);
    }
}
