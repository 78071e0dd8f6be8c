use serde::Serialize;
use std::sync::Arc;

use crate::context::{self, ContextStore, ConversationContext, Engagement, Insight, Mood, Turn, HANDOFF_TURNS};
use crate::curriculum::Level;
use crate::keywords::{LESSON_KEYWORDS, ROUTING_KEYWORDS};
use crate::logging;
use crate::persona::Persona;
use crate::progress::{PersonaCounts, QueryPath};
use crate::transition::{self, TransitionRule};

/// Bonus for a message that opens with a question word matching a persona
const QUESTION_TYPE_BONUS: f64 = 3.0;
/// Cold-start score that maps to full confidence
const FULL_CONFIDENCE_SCORE: f64 = 6.0;
const DEFAULT_ROUTING_CONFIDENCE: f64 = 0.5;

// ============ Routing Decision ============

#[derive(Debug, Clone, Serialize)]
pub struct StudentState {
    pub mood: Mood,
    pub engagement: Engagement,
    pub concepts_covered: Vec<String>,
}

/// Handoff payload attached when a transition is recommended.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionContext {
    pub from: Persona,
    pub to: Persona,
    pub handoff_summary: String,
    pub previous_insights: Vec<Insight>,
    pub student_state: StudentState,
    pub recent_turns: Vec<Turn>,
    pub unresolved_questions: Vec<String>,
    pub recommended_approach: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub should_transition: bool,
    pub recommended_persona: Persona,
    pub confidence: f64,
    pub reason: String,
    pub transition_context: Option<TransitionContext>,
}

impl RoutingDecision {
    fn stay(current: Persona) -> Self {
        Self {
            should_transition: false,
            recommended_persona: current,
            confidence: 1.0,
            reason: "no strong transition signal".to_string(),
            transition_context: None,
        }
    }
}

// ============ Router ============

pub struct Router {
    contexts: Arc<ContextStore>,
}

impl Router {
    pub fn new(contexts: Arc<ContextStore>) -> Self {
        Self { contexts }
    }

    /// Cold-start routing for a first message. Always recommends a switch.
    pub fn select_initial(&self, text: &str) -> RoutingDecision {
        select_initial(text)
    }

    /// Decide whether the conversation should move away from `current`.
    ///
    /// Creates the context if it doesn't exist yet, but never changes its
    /// history or student state.
    pub fn suggest(
        &self,
        current: Persona,
        text: &str,
        student_id: &str,
        lesson_id: Option<&str>,
    ) -> RoutingDecision {
        let shared = self.contexts.get_or_create(student_id, lesson_id);
        let ctx = context::lock(&shared);

        let decision = match transition::best_transition(current, text, &ctx) {
            Some((rule, confidence)) => RoutingDecision {
                should_transition: true,
                recommended_persona: rule.to,
                confidence,
                reason: format!(
                    "message signals a move from {} to {}",
                    rule.from.display_name(),
                    rule.to.display_name()
                ),
                transition_context: Some(build_handoff(rule, &ctx)),
            },
            None => RoutingDecision::stay(current),
        };
        drop(ctx);

        logging::log_routing(
            Some(student_id),
            &format!(
                "suggest from={} -> {} (transition={}, confidence={:.2})",
                current,
                decision.recommended_persona,
                decision.should_transition,
                decision.confidence
            ),
        );

        decision
    }
}

fn build_handoff(rule: &TransitionRule, ctx: &ConversationContext) -> TransitionContext {
    TransitionContext {
        from: rule.from,
        to: rule.to,
        handoff_summary: format!(
            "Handing over from the {} to the {}",
            rule.from.display_name(),
            rule.to.display_name()
        ),
        previous_insights: ctx.insights.get(&rule.from).cloned().unwrap_or_default(),
        student_state: StudentState {
            mood: ctx.mood,
            engagement: ctx.engagement,
            concepts_covered: ctx.concepts_covered.iter().cloned().collect(),
        },
        recent_turns: ctx.recent_turns(HANDOFF_TURNS).to_vec(),
        unresolved_questions: ctx.unresolved_questions.clone(),
        recommended_approach: transition::recommended_approach(rule.from, rule.to).to_string(),
    }
}

/// Keyword scores plus a bonus for the opening question word. Highest score
/// wins; ties resolve in `Persona::ALL` order.
pub fn select_initial(text: &str) -> RoutingDecision {
    let mut scores = ROUTING_KEYWORDS.score(text);
    let lowered = text.trim().to_lowercase();

    if lowered.starts_with("how") {
        *scores.entry(Persona::Practice).or_insert(0.0) += QUESTION_TYPE_BONUS;
    } else if lowered.starts_with("why") {
        *scores.entry(Persona::Concept).or_insert(0.0) += QUESTION_TYPE_BONUS;
    } else if lowered.starts_with("what")
        && (lowered.contains("meaning") || lowered.contains("purpose"))
    {
        *scores.entry(Persona::Reflection).or_insert(0.0) += QUESTION_TYPE_BONUS;
    }

    let mut best = Persona::Practice;
    let mut best_score = 0.0;
    for persona in Persona::ALL {
        let score = scores.get(&persona).copied().unwrap_or(0.0);
        if score > best_score {
            best = persona;
            best_score = score;
        }
    }

    if best_score <= 0.0 {
        return RoutingDecision {
            should_transition: true,
            recommended_persona: Persona::Practice,
            confidence: DEFAULT_ROUTING_CONFIDENCE,
            reason: "default routing".to_string(),
            transition_context: None,
        };
    }

    RoutingDecision {
        should_transition: true,
        recommended_persona: best,
        confidence: (best_score / FULL_CONFIDENCE_SCORE).min(1.0),
        reason: format!("keyword routing to {} (score {:.1})", best.display_name(), best_score),
        transition_context: None,
    }
}

// ============ Lesson-level Recommendations ============

/// Starting persona for a lesson: the student's preference if set, otherwise
/// by lesson level and prior activity.
pub fn recommend_for_lesson(level: Level, counts: &PersonaCounts, preferred: Option<Persona>) -> Persona {
    if let Some(persona) = preferred {
        return persona;
    }
    if level == Level::Seed || counts.total() == 0 {
        Persona::Practice
    } else if level == Level::Tree {
        Persona::Concept
    } else {
        Persona::Reflection
    }
}

/// Suggest the next persona inside a lesson, balancing keyword fit against
/// how often each persona has already been used.
pub fn suggest_for_lesson(current: Option<Persona>, text: &str, counts: &PersonaCounts) -> (Persona, QueryPath) {
    if text.trim().chars().count() < 3 {
        return (Persona::Concept, QueryPath::Conceptual);
    }

    let mut scores = LESSON_KEYWORDS.score(text);
    for (persona, base) in [
        (Persona::Practice, 0.1),
        (Persona::Concept, 0.2),
        (Persona::Reflection, 0.1),
    ] {
        *scores.entry(persona).or_insert(0.0) += base;
    }

    let total = counts.total();
    if total > 0 {
        for persona in Persona::ALL {
            let used = counts.get(persona);
            let share = used as f64 / total as f64;
            let score = scores.entry(persona).or_insert(0.0);
            if used == 0 {
                *score += 1.0;
            } else if share > 0.6 {
                *score -= 0.8;
            } else if share > 0.4 {
                *score -= 0.4;
            }
        }
    }

    if let Some(current) = current {
        let score = scores.entry(current).or_insert(0.0);
        if *score < 1.5 {
            *score -= 0.6;
        }
    }

    let persona = if scores.values().all(|s| *s <= 0.0) {
        counts.least_used()
    } else {
        let mut best = Persona::Practice;
        let mut best_score = f64::MIN;
        for persona in Persona::ALL {
            let score = scores.get(&persona).copied().unwrap_or(0.0);
            if score > best_score {
                best = persona;
                best_score = score;
            }
        }
        best
    };

    (persona, persona.default_query_path())
}
