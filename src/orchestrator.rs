use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::agent::{AgentReply, CallerContext, FallbackReason, PersonaAgent};
use crate::context::{self, ChainSummary, ContextStore};
use crate::curriculum::{Category, Curriculum, LearningPaths, Lesson, LessonRef, Level};
use crate::db::Database;
use crate::error::{GurukulError, Result};
use crate::generator::TextGenerator;
use crate::logging;
use crate::memory::{MemoryStore, PersonaProfile};
use crate::persona::Persona;
use crate::progress::{
    InteractionSource, LessonCompletion, LessonStart, ProgressTracker, QueryPath, QuizProgress, StudentPreferences,
    StudentRecord, StudentSummary,
};
use crate::quiz::{self, QuizResult, SafeQuestion};
use crate::router::{self, Router, RoutingDecision};
use crate::truncate_chars;

/// Shared turns handed to the agent for prompting
const PROMPT_HISTORY: usize = 4;

// ============ Response Types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyKind {
    Generated,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatContext {
    pub agent_profile: PersonaProfile,
    pub transition_suggestion: RoutingDecision,
    pub chain_summary: ChainSummary,
    pub reply_kind: ReplyKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<FallbackReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub agent_type: Persona,
    pub student_id: String,
    pub context: ChatContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentSuggestion {
    pub suggested_agent: Persona,
    pub suggested_query_path: QueryPath,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub generator: String,
    pub lessons_loaded: usize,
    pub active_contexts: usize,
    pub cached_memories: usize,
    pub students: i64,
    pub lesson_records: i64,
    pub memory_snippets: i64,
}

// ============ Orchestrator ============

/// Ties routing, persona agents, conversation contexts, memory and lesson
/// progress together. One instance serves every request.
pub struct Orchestrator {
    practice: PersonaAgent,
    concept: PersonaAgent,
    reflection: PersonaAgent,
    generator_name: String,
    router: Router,
    contexts: Arc<ContextStore>,
    memory: Arc<MemoryStore>,
    progress: ProgressTracker,
    curriculum: RwLock<Curriculum>,
    db: Arc<Database>,
}

impl Orchestrator {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        db: Arc<Database>,
        curriculum: Curriculum,
        generation_timeout: Duration,
    ) -> Self {
        let memory = Arc::new(MemoryStore::new(db.clone()));
        let contexts = Arc::new(ContextStore::new());
        let agent = |persona| PersonaAgent::new(persona, generator.clone(), memory.clone(), generation_timeout);

        Self {
            practice: agent(Persona::Practice),
            concept: agent(Persona::Concept),
            reflection: agent(Persona::Reflection),
            generator_name: generator.name().to_string(),
            router: Router::new(contexts.clone()),
            contexts,
            memory,
            progress: ProgressTracker::new(db.clone()),
            curriculum: RwLock::new(curriculum),
            db,
        }
    }

    fn agent(&self, persona: Persona) -> &PersonaAgent {
        match persona {
            Persona::Practice => &self.practice,
            Persona::Concept => &self.concept,
            Persona::Reflection => &self.reflection,
        }
    }

    fn curriculum(&self) -> RwLockReadGuard<'_, Curriculum> {
        self.curriculum.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lesson(&self, lesson_id: &str) -> Result<Lesson> {
        self.curriculum().require(lesson_id).cloned()
    }

    // ============ Conversation ============

    /// Answer one student message with the named persona.
    pub async fn chat(
        &self,
        agent_type: &str,
        student_id: &str,
        message: &str,
        caller: Option<CallerContext>,
    ) -> Result<ChatResponse> {
        let persona = parse_persona(agent_type)?;
        require_student(student_id)?;
        if message.trim().is_empty() {
            return Err(GurukulError::invalid("message must not be empty"));
        }

        let mut caller = caller.unwrap_or_default();
        let lesson = self.resolve_lesson(student_id, &caller);
        let lesson_id = lesson.as_ref().map(|l| l.id.clone());
        if let Some(lesson) = &lesson {
            caller.insert("current_lesson".to_string(), lesson_prompt_context(lesson, persona));
        }

        let suggestion = self.router.suggest(persona, message, student_id, lesson_id.as_deref());

        let shared = self.contexts.get_or_create(student_id, lesson_id.as_deref());
        let history = {
            let ctx = context::lock(&shared);
            ctx.recent_turns(PROMPT_HISTORY).to_vec()
        };

        let reply = self.agent(persona).respond(student_id, message, &caller, &history).await;

        let tags = lesson.as_ref().map(|l| l.tags().to_vec()).unwrap_or_default();
        let chain_summary = {
            let mut ctx = context::lock(&shared);
            ctx.record_turn(persona, message, reply.text(), reply.is_fallback(), &tags);
            ctx.summary()
        };

        if let Some(lesson_id) = &lesson_id {
            let recorded = self.progress.record_interaction(
                student_id,
                lesson_id,
                InteractionSource::from(persona),
                persona.default_query_path(),
                message,
                reply.text().chars().count(),
                None,
            );
            if let Err(e) = recorded {
                logging::log_error(Some(student_id), &format!("Failed to record lesson interaction: {}", e));
            }
        }

        let agent_profile = self.memory.profile(student_id, persona).unwrap_or_else(|e| {
            logging::log_error(Some(student_id), &format!("{} profile unavailable: {}", persona, e));
            PersonaProfile::new(student_id, persona)
        });

        logging::log_agent(
            Some(student_id),
            &format!(
                "chat persona={} lesson={} kind={} input=\"{}\"",
                persona,
                lesson_id.as_deref().unwrap_or("-"),
                if reply.is_fallback() { "fallback" } else { "generated" },
                truncate_chars(message, 60)
            ),
        );

        let fallback_reason = reply.fallback_reason();
        let reply_kind = match reply {
            AgentReply::Generated(_) => ReplyKind::Generated,
            AgentReply::Fallback { .. } => ReplyKind::Fallback,
        };

        Ok(ChatResponse {
            response: reply.into_text(),
            agent_type: persona,
            student_id: student_id.to_string(),
            context: ChatContext {
                agent_profile,
                transition_suggestion: suggestion,
                chain_summary,
                reply_kind,
                fallback_reason,
            },
        })
    }

    /// The student's current lesson wins; otherwise a string `current_lesson`
    /// in the caller context is tried as a lesson id. A storage error is
    /// logged and treated as no current lesson.
    fn resolve_lesson(&self, student_id: &str, caller: &CallerContext) -> Option<Lesson> {
        let current = self.progress.current_lesson(student_id).unwrap_or_else(|e| {
            logging::log_error(Some(student_id), &format!("Current lesson unavailable: {}", e));
            None
        });
        let lesson_id = match current {
            Some(id) => Some(id),
            None => caller
                .get("current_lesson")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        lesson_id.and_then(|id| self.curriculum().get(&id).cloned())
    }

    /// Cold-start routing for a first message.
    pub fn select_initial(&self, message: &str) -> RoutingDecision {
        self.router.select_initial(message)
    }

    /// Read-only transition check; the conversation is not modified.
    pub fn suggest_transition(
        &self,
        current_agent: &str,
        message: &str,
        student_id: &str,
        lesson_id: Option<&str>,
    ) -> Result<RoutingDecision> {
        let current = parse_persona(current_agent)?;
        require_student(student_id)?;
        Ok(self.router.suggest(current, message, student_id, lesson_id))
    }

    pub fn chain_summary(&self, student_id: &str, lesson_id: Option<&str>) -> Result<ChainSummary> {
        let shared = self
            .contexts
            .get(student_id, lesson_id)
            .ok_or_else(|| GurukulError::not_found("Conversation chain", ContextStore::key(student_id, lesson_id)))?;
        let ctx = context::lock(&shared);
        Ok(ctx.summary())
    }

    pub fn agent_profile(&self, agent_type: &str, student_id: &str) -> Result<PersonaProfile> {
        let persona = parse_persona(agent_type)?;
        self.memory.profile(student_id, persona)
    }

    /// Record lesson performance with every persona.
    pub fn update_progress(
        &self,
        student_id: &str,
        lesson_id: &str,
        performance: f64,
        insights: &[String],
    ) -> Result<Vec<PersonaProfile>> {
        require_student(student_id)?;
        if !(0.0..=1.0).contains(&performance) {
            return Err(GurukulError::invalid(format!(
                "performance must be between 0 and 1, got {}",
                performance
            )));
        }

        let profiles = Persona::ALL
            .iter()
            .map(|&persona| {
                self.memory
                    .record_progress(student_id, persona, lesson_id, performance, insights)
            })
            .collect::<Result<Vec<_>>>()?;

        logging::log_progress(
            Some(student_id),
            &format!("Progress for lesson {} recorded with all personas ({:.2})", lesson_id, performance),
        );
        Ok(profiles)
    }

    /// Drop conversation contexts idle for longer than `ttl`.
    /// Drop idle conversation contexts and cached persona memories.
    pub fn evict_idle(&self, ttl: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        self.contexts.evict_idle(now, ttl) + self.memory.evict_idle(now, ttl)
    }

    // ============ Lessons ============

    pub fn start_lesson(&self, student_id: &str, lesson_id: &str) -> Result<LessonStart> {
        require_student(student_id)?;
        let curriculum = self.curriculum();
        let lesson = curriculum.require(lesson_id)?;
        self.progress.start_lesson(student_id, lesson, &curriculum)
    }

    /// Log an interaction that happened outside `chat`.
    pub fn lesson_interaction(
        &self,
        student_id: &str,
        lesson_id: &str,
        agent_type: &str,
        query_path: &str,
        user_input: &str,
    ) -> Result<()> {
        let source = InteractionSource::from_str(agent_type)
            .ok_or_else(|| GurukulError::UnknownPersona(agent_type.to_string()))?;
        let path = QueryPath::from_str(query_path)
            .ok_or_else(|| GurukulError::invalid(format!("unknown query path: {}", query_path)))?;
        self.lesson(lesson_id)?;

        let recorded = self
            .progress
            .record_interaction(student_id, lesson_id, source, path, user_input, 0, Some(1.0))?;
        if !recorded {
            return Err(GurukulError::not_found(
                "Active lesson session",
                format!("{}/{}", student_id, lesson_id),
            ));
        }
        Ok(())
    }

    /// Which persona should take the next message of the current lesson.
    pub fn suggest_agent(&self, student_id: &str, user_input: &str, current_agent: Option<&str>) -> Result<AgentSuggestion> {
        let current = current_agent.map(parse_persona).transpose()?;

        let Some(lesson_id) = self.progress.current_lesson(student_id)? else {
            return Ok(AgentSuggestion {
                suggested_agent: Persona::Practice,
                suggested_query_path: QueryPath::Practical,
                reasoning: "Starting with practical guidance for new learners".to_string(),
            });
        };

        let counts = self
            .progress
            .lesson_progress(student_id, &lesson_id)?
            .map(|p| p.persona_counts)
            .unwrap_or_default();
        let (persona, path) = router::suggest_for_lesson(current, user_input, &counts);

        let reasoning = match persona {
            Persona::Practice => "Your question suggests you want to practice and apply concepts",
            Persona::Concept => "Your question indicates you want to understand concepts more deeply",
            Persona::Reflection => "Your question shows you're ready for philosophical reflection",
        };

        logging::log_routing(
            Some(student_id),
            &format!("lesson {} suggests {} ({})", lesson_id, persona, path.as_str()),
        );

        Ok(AgentSuggestion {
            suggested_agent: persona,
            suggested_query_path: path,
            reasoning: reasoning.to_string(),
        })
    }

    pub fn complete_lesson(
        &self,
        student_id: &str,
        lesson_id: &str,
        quiz_score: Option<f64>,
        indicators: Vec<String>,
    ) -> Result<LessonCompletion> {
        let curriculum = self.curriculum();
        self.progress
            .complete_lesson(student_id, lesson_id, quiz_score, indicators, &curriculum)
    }

    pub fn student_summary(&self, student_id: &str) -> Result<StudentSummary> {
        self.progress.summary(student_id)
    }

    pub fn update_preferences(&self, student_id: &str, preferences: StudentPreferences) -> Result<StudentRecord> {
        require_student(student_id)?;
        self.progress.update_preferences(student_id, preferences)
    }

    // ============ Quiz ============

    /// Score an answer and log it against the lesson as an assessment.
    pub fn submit_quiz(
        &self,
        student_id: &str,
        lesson_id: &str,
        question_id: &str,
        answer: &Value,
        agent_type: Option<&str>,
    ) -> Result<QuizResult> {
        let persona = agent_type.map(parse_persona).transpose()?.unwrap_or(Persona::Practice);
        let lesson = self.lesson(lesson_id)?;
        let result = quiz::evaluate(&lesson, question_id, answer, persona)?;

        let recorded = self.progress.record_interaction(
            student_id,
            lesson_id,
            InteractionSource::Quiz,
            QueryPath::Assessment,
            &format!("Quiz: {}", question_id),
            0,
            Some(result.score),
        )?;

        logging::log_progress(
            Some(student_id),
            &format!(
                "Quiz {}/{} scored {:.2}{}",
                lesson_id,
                question_id,
                result.score,
                if recorded { "" } else { " (lesson not started, not recorded)" }
            ),
        );
        Ok(result)
    }

    pub fn quiz_progress(&self, student_id: &str, lesson_id: &str) -> Result<QuizProgress> {
        let total = self.lesson(lesson_id)?.quiz.len();
        self.progress.quiz_progress(student_id, lesson_id, total)
    }

    pub fn quiz_questions(&self, lesson_id: &str) -> Result<Vec<SafeQuestion>> {
        Ok(quiz::safe_questions(&self.lesson(lesson_id)?))
    }

    // ============ Curriculum ============

    pub fn lessons(&self) -> Vec<LessonRef> {
        self.curriculum().lessons().map(LessonRef::from).collect()
    }

    pub fn lesson_detail(&self, lesson_id: &str) -> Result<Lesson> {
        self.lesson(lesson_id)
    }

    pub fn lessons_by_level(&self, level: &str, category: Option<&str>) -> Result<Vec<Lesson>> {
        let level = Level::from_str(level).ok_or_else(|| GurukulError::invalid(format!("unknown level: {}", level)))?;
        let category = category
            .map(|c| Category::from_str(c).ok_or_else(|| GurukulError::invalid(format!("unknown category: {}", c))))
            .transpose()?;
        Ok(self
            .curriculum()
            .by_level(level, category)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn learning_paths(&self) -> Result<LearningPaths> {
        self.curriculum().learning_paths()
    }

    /// Re-read lessons from the directory they were loaded from. The current
    /// curriculum stays in place if loading fails.
    pub fn reload_curriculum(&self) -> Result<usize> {
        let dir = self
            .curriculum()
            .source_dir()
            .map(|d| d.to_path_buf())
            .ok_or_else(|| GurukulError::curriculum("curriculum was not loaded from a directory"))?;

        let fresh = Curriculum::load_dir(&dir)?;
        for warning in fresh.validate_dependencies() {
            logging::log_curriculum(&format!("Warning: {}", warning));
        }
        let count = fresh.len();
        *self.curriculum.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(count)
    }

    pub fn health(&self) -> Result<HealthStatus> {
        Ok(HealthStatus {
            status: "healthy",
            generator: self.generator_name.clone(),
            lessons_loaded: self.curriculum().len(),
            active_contexts: self.contexts.len(),
            cached_memories: self.memory.cached(),
            students: self.db.count_students()?,
            lesson_records: self.db.count_lesson_progress()?,
            memory_snippets: self.db.count_snippets()?,
        })
    }

    #[cfg(test)]
    pub(crate) fn context(&self, student_id: &str, lesson_id: Option<&str>) -> Option<context::ConversationContext> {
        let shared = self.contexts.get(student_id, lesson_id)?;
        let ctx = context::lock(&shared).clone();
        Some(ctx)
    }
}

fn parse_persona(agent_type: &str) -> Result<Persona> {
    Persona::from_str(agent_type).ok_or_else(|| GurukulError::UnknownPersona(agent_type.to_string()))
}

fn require_student(student_id: &str) -> Result<()> {
    if student_id.trim().is_empty() {
        return Err(GurukulError::invalid("student_id must not be empty"));
    }
    Ok(())
}

/// Lesson fields the persona prompt reads, overriding anything the caller sent.
fn lesson_prompt_context(lesson: &Lesson, persona: Persona) -> Value {
    json!({
        "id": lesson.id,
        "title": lesson.title,
        "level": lesson.level,
        "category": lesson.category,
        "learning_objectives": lesson.learning_objectives.for_persona(persona),
    })
}
