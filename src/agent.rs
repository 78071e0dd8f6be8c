use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::context::Turn;
use crate::generator::{GenerationError, TextGenerator};
use crate::logging;
use crate::memory::{MemoryContext, MemoryStore};
use crate::persona::Persona;
use crate::truncate_chars;

/// Caller-supplied context for a single reply. Keys are free-form; the agent
/// reads `current_lesson` (object with `title` and `learning_objectives`, or
/// a bare title) and passes everything else to the prompt verbatim.
pub type CallerContext = Map<String, Value>;

const MIN_INPUT_CHARS: usize = 3;
const MIN_OUTPUT_CHARS: usize = 10;
/// Recorded responses examined by the repetition check
const REPETITION_WINDOW: usize = 4;
const MAX_DISTINCT_WHEN_REPETITIVE: usize = 2;
const PROMPT_TURNS: usize = 4;
const SNIPPET_CHARS: usize = 100;
const LOG_INPUT_CHARS: usize = 60;

// ============ Reply ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    ShortInput,
    Repetitive,
    GenerationFailed,
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    Generated(String),
    Fallback { text: String, reason: FallbackReason },
}

impl AgentReply {
    pub fn text(&self) -> &str {
        match self {
            AgentReply::Generated(text) => text,
            AgentReply::Fallback { text, .. } => text,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, AgentReply::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<FallbackReason> {
        match self {
            AgentReply::Generated(_) => None,
            AgentReply::Fallback { reason, .. } => Some(*reason),
        }
    }

    pub fn into_text(self) -> String {
        match self {
            AgentReply::Generated(text) => text,
            AgentReply::Fallback { text, .. } => text,
        }
    }
}

// ============ Persona Agent ============

pub struct PersonaAgent {
    persona: Persona,
    generator: Arc<dyn TextGenerator>,
    memory: Arc<MemoryStore>,
    timeout: Duration,
}

impl PersonaAgent {
    pub fn new(
        persona: Persona,
        generator: Arc<dyn TextGenerator>,
        memory: Arc<MemoryStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            persona,
            generator,
            memory,
            timeout,
        }
    }

    pub fn persona(&self) -> Persona {
        self.persona
    }

    /// Produce one reply. Never fails: generation problems and rejected
    /// output both become a fallback reply.
    ///
    /// `history` is the shared conversation; when it is empty the persona's
    /// own recent exchanges are used instead.
    pub async fn respond(
        &self,
        student_id: &str,
        user_text: &str,
        caller: &CallerContext,
        history: &[Turn],
    ) -> AgentReply {
        let memory = match self.memory.context(student_id, self.persona, user_text) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                logging::log_error(
                    Some(student_id),
                    &format!("{} memory unavailable: {}", self.persona, e),
                );
                None
            }
        };
        let merged = merge_context(memory.as_ref(), caller);

        if let Some(reason) = self.short_circuit(student_id, user_text) {
            // One fallback per run of repeated replies; the next message
            // starts from an empty window.
            if reason == FallbackReason::Repetitive {
                if let Err(e) = self.memory.reset_recent(student_id, self.persona) {
                    logging::log_error(
                        Some(student_id),
                        &format!("{} failed to reset recent exchanges: {}", self.persona, e),
                    );
                }
            }
            return self.contextual_fallback(student_id, user_text, &merged, reason);
        }

        let prompt = self.build_prompt(user_text, &merged, memory.as_ref(), history);

        let generated = match tokio::time::timeout(self.timeout, self.generator.generate(&prompt)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout(self.timeout)),
        };

        let text = match generated {
            Ok(text) => text,
            Err(e) => {
                logging::log_error(
                    Some(student_id),
                    &format!(
                        "{} generation failed via {} ({}); input=\"{}\"",
                        self.persona,
                        self.generator.name(),
                        e,
                        truncate_chars(user_text, LOG_INPUT_CHARS)
                    ),
                );
                return AgentReply::Fallback {
                    text: self.persona.fallback().to_string(),
                    reason: FallbackReason::GenerationFailed,
                };
            }
        };

        let text = text.trim().to_string();
        if !is_acceptable(user_text, &text) {
            return self.contextual_fallback(student_id, user_text, &merged, FallbackReason::Rejected);
        }

        if let Err(e) = self.memory.record_exchange(student_id, self.persona, user_text, &text) {
            logging::log_error(
                Some(student_id),
                &format!("{} failed to record exchange: {}", self.persona, e),
            );
        }

        logging::log_agent(
            Some(student_id),
            &format!("{} replied ({} chars)", self.persona, text.chars().count()),
        );
        AgentReply::Generated(text)
    }

    fn short_circuit(&self, student_id: &str, user_text: &str) -> Option<FallbackReason> {
        if user_text.trim().chars().count() < MIN_INPUT_CHARS {
            return Some(FallbackReason::ShortInput);
        }

        let recent = self
            .memory
            .recent_responses(student_id, self.persona, REPETITION_WINDOW)
            .unwrap_or_default();
        if recent.len() >= REPETITION_WINDOW {
            let distinct: HashSet<&str> = recent.iter().map(String::as_str).collect();
            if distinct.len() <= MAX_DISTINCT_WHEN_REPETITIVE {
                return Some(FallbackReason::Repetitive);
            }
        }
        None
    }

    fn contextual_fallback(
        &self,
        student_id: &str,
        user_text: &str,
        merged: &CallerContext,
        reason: FallbackReason,
    ) -> AgentReply {
        logging::log_agent(
            Some(student_id),
            &format!(
                "{} fallback ({:?}); input=\"{}\"",
                self.persona,
                reason,
                truncate_chars(user_text, LOG_INPUT_CHARS)
            ),
        );

        let text = match lesson_title(merged) {
            Some(title) => format!(
                "{} Since we're working on \"{}\", which part of it would you like to look at next?",
                self.persona.fallback(),
                title
            ),
            None => self.persona.fallback().to_string(),
        };
        AgentReply::Fallback { text, reason }
    }

    fn build_prompt(
        &self,
        user_text: &str,
        merged: &CallerContext,
        memory: Option<&MemoryContext>,
        history: &[Turn],
    ) -> String {
        let persona = self.persona;
        let mut sections = vec![
            persona.system_prompt().to_string(),
            format!("## Your character\n{}", persona.personality().format_for_prompt()),
        ];

        if let Some(title) = lesson_title(merged) {
            let mut lesson = format!("## Current lesson\n{}", title);
            let objectives = lesson_objectives(merged);
            if !objectives.is_empty() {
                lesson.push_str("\nLearning objectives:");
                for objective in objectives {
                    lesson.push_str(&format!("\n- {}", objective));
                }
            }
            sections.push(lesson);
        }

        let extra: Vec<String> = merged
            .iter()
            .filter(|(k, _)| !MEMORY_KEYS.contains(&k.as_str()) && k.as_str() != "current_lesson")
            .map(|(k, v)| format!("- {}: {}", k, compact(v)))
            .collect();
        if !extra.is_empty() {
            sections.push(format!("## Student context\n{}", extra.join("\n")));
        }

        let turns = format_turns(history, memory);
        if !turns.is_empty() {
            sections.push(format!("## Recent conversation\n{}", turns));
        }

        let notes = remembered(merged);
        if !notes.is_empty() {
            sections.push(format!("## What you remember\n{}", notes.join("\n")));
        }

        sections.push(format!(
            "## Guidelines\n- Stay in character as the {}.\n- Keep the conversation on the current lesson and the student's question.\n- Be kind, age-appropriate and encouraging; never shame the student.\n- Do not repeat the student's words back as your answer.\n- Write at least 150 words.",
            persona.display_name()
        ));

        sections.push(format!("## Student says\n{}", user_text.trim()));

        sections.join("\n\n")
    }
}

/// Keys the memory layer contributes to the merged context.
const MEMORY_KEYS: &[&str] = &["agent_profile", "relevant_memories", "memory_summary"];

/// Memory-derived keys first, then caller keys on top.
pub fn merge_context(memory: Option<&MemoryContext>, caller: &CallerContext) -> CallerContext {
    let mut merged = Map::new();
    if let Some(memory) = memory {
        merged.insert("agent_profile".to_string(), json!(memory.profile));
        merged.insert("relevant_memories".to_string(), json!(memory.relevant_memories));
        merged.insert("memory_summary".to_string(), json!(memory.summary));
    }
    for (key, value) in caller {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn lesson_title(context: &CallerContext) -> Option<String> {
    match context.get("current_lesson")? {
        Value::String(title) if !title.trim().is_empty() => Some(title.clone()),
        Value::Object(lesson) => lesson
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn lesson_objectives(context: &CallerContext) -> Vec<String> {
    context
        .get("current_lesson")
        .and_then(|l| l.get("learning_objectives"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn format_turns(history: &[Turn], memory: Option<&MemoryContext>) -> String {
    if !history.is_empty() {
        let start = history.len().saturating_sub(PROMPT_TURNS);
        return history[start..]
            .iter()
            .map(|t| format!("Student: {}\n{}: {}", t.user_text, t.persona.display_name(), t.agent_text))
            .collect::<Vec<_>>()
            .join("\n");
    }
    memory
        .map(|m| {
            m.recent_exchanges
                .iter()
                .map(|e| format!("Student: {}\nYou: {}", e.user_text, e.agent_text))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Summary and relevant memories as they stand after merging, so caller
/// values for either key replace the stored ones.
fn remembered(merged: &CallerContext) -> Vec<String> {
    let mut notes = Vec::new();
    match merged.get("memory_summary") {
        Some(Value::Null) | None => {}
        Some(summary) => notes.push(compact(summary)),
    }
    if let Some(memories) = merged.get("relevant_memories") {
        let items: Vec<&Value> = match memories {
            Value::Array(items) => items.iter().collect(),
            Value::Null => Vec::new(),
            other => vec![other],
        };
        for item in items {
            let content = match item.get("content").and_then(Value::as_str) {
                Some(content) => content.to_string(),
                None => compact(item),
            };
            notes.push(format!("- {}", snippet_line(&content)));
        }
    }
    notes
}

fn snippet_line(content: &str) -> String {
    if content.chars().count() > SNIPPET_CHARS {
        format!("{}...", truncate_chars(content, SNIPPET_CHARS))
    } else {
        content.to_string()
    }
}

fn compact(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rejects near-empty output and output that just echoes the input.
fn is_acceptable(user_text: &str, output: &str) -> bool {
    let output_len = output.chars().count();
    if output_len < MIN_OUTPUT_CHARS {
        return false;
    }
    let input = user_text.trim().to_lowercase();
    let input_len = input.chars().count();
    if !input.is_empty() && output.to_lowercase().contains(&input) && output_len < 2 * input_len {
        return false;
    }
    true
}
