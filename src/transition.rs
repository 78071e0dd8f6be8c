//! Persona-to-persona transition rules.
//!
//! Each rule covers one ordered pair of personas. A rule fires when
//! `0.7 * trigger_score + 0.3 * context_score` reaches its threshold.

use crate::context::ConversationContext;
use crate::persona::Persona;

const TRIGGER_WEIGHT: f64 = 0.7;
const CONTEXT_WEIGHT: f64 = 0.3;
/// Insights the source persona needs before it is considered "warmed up"
const INSIGHT_DEPTH: usize = 3;

/// A trigger keyword and the surface forms that count as a hit for it.
#[derive(Debug)]
pub struct Trigger {
    pub keyword: &'static str,
    pub forms: &'static [&'static str],
}

impl Trigger {
    fn found_in(&self, lowered: &str) -> bool {
        self.forms.iter().any(|form| lowered.contains(form))
    }
}

#[derive(Debug)]
pub struct TransitionRule {
    pub from: Persona,
    pub to: Persona,
    pub triggers: &'static [Trigger],
    pub threshold: f64,
}

impl TransitionRule {
    /// Fraction of this rule's triggers present in `text`.
    pub fn trigger_score(&self, text: &str) -> f64 {
        if self.triggers.is_empty() {
            return 0.0;
        }
        let lowered = text.to_lowercase();
        let found = self.triggers.iter().filter(|t| t.found_in(&lowered)).count();
        found as f64 / self.triggers.len() as f64
    }

    /// Returns `(should_transition, confidence)`.
    pub fn evaluate(&self, text: &str, context: &ConversationContext) -> (bool, f64) {
        let confidence = (TRIGGER_WEIGHT * self.trigger_score(text)
            + CONTEXT_WEIGHT * context_score(self.from, context))
        .clamp(0.0, 1.0);
        (confidence >= self.threshold, confidence)
    }
}

/// Bonus for a well-explored source persona and for open questions.
pub fn context_score(from: Persona, context: &ConversationContext) -> f64 {
    let mut score = 0.0;
    if context.insight_count(from) >= INSIGHT_DEPTH {
        score += 0.3;
    }
    if !context.unresolved_questions.is_empty() {
        score += 0.2;
    }
    score
}

/// Pick the strongest rule out of `current` that clears its own threshold.
/// Ties go to the rule declared first.
pub fn best_transition(
    current: Persona,
    text: &str,
    context: &ConversationContext,
) -> Option<(&'static TransitionRule, f64)> {
    let mut best: Option<(&'static TransitionRule, f64)> = None;

    for rule in TRANSITION_RULES.iter().filter(|r| r.from == current) {
        let (fires, confidence) = rule.evaluate(text, context);
        if !fires {
            continue;
        }
        match best {
            Some((_, top)) if confidence <= top => {}
            _ => best = Some((rule, confidence)),
        }
    }

    best
}

/// How the receiving persona should pick up the conversation.
pub fn recommended_approach(from: Persona, to: Persona) -> &'static str {
    match (from, to) {
        (Persona::Practice, Persona::Concept) => {
            "Build on what the student has practiced to uncover the principle underneath it"
        }
        (Persona::Concept, Persona::Reflection) => {
            "Carry the student's understanding toward personal meaning and inner insight"
        }
        (Persona::Reflection, Persona::Practice) => {
            "Ground the student's reflections in one small daily action"
        }
        (Persona::Concept, Persona::Practice) => {
            "Turn the principle the student now understands into a concrete practice"
        }
        (Persona::Practice, Persona::Reflection) => {
            "Invite the student to reflect on what their practice means to them"
        }
        (Persona::Reflection, Persona::Concept) => {
            "Clarify the student's insight with a clear conceptual framework"
        }
        _ => "Continue gently from the previous perspective",
    }
}

// ============ Rule Table ============

pub static TRANSITION_RULES: [TransitionRule; 6] = [
    TransitionRule {
        from: Persona::Practice,
        to: Persona::Concept,
        triggers: &[
            Trigger { keyword: "why", forms: &["why", "explain", "understand", "because"] },
            Trigger { keyword: "principle", forms: &["principle", "concept", "theory", "important", "matter"] },
        ],
        threshold: 0.6,
    },
    TransitionRule {
        from: Persona::Concept,
        to: Persona::Reflection,
        triggers: &[
            Trigger { keyword: "meaning", forms: &["meaning", "mean", "purpose", "deeper"] },
            Trigger { keyword: "soul", forms: &["soul", "spirit", "divine", "conscious", "sacred"] },
        ],
        threshold: 0.6,
    },
    TransitionRule {
        from: Persona::Reflection,
        to: Persona::Practice,
        triggers: &[
            Trigger { keyword: "how", forms: &["how", "steps", "way to"] },
            Trigger { keyword: "practice", forms: &["practice", "apply", "daily", "habit", "routine", "implement"] },
        ],
        threshold: 0.6,
    },
    TransitionRule {
        from: Persona::Concept,
        to: Persona::Practice,
        triggers: &[
            Trigger { keyword: "practice", forms: &["practice", "try", "exercise", "do this", "steps"] },
            Trigger { keyword: "apply", forms: &["apply", "implement", "daily", "routine", "habit"] },
        ],
        threshold: 0.7,
    },
    TransitionRule {
        from: Persona::Practice,
        to: Persona::Reflection,
        triggers: &[
            Trigger { keyword: "meaning", forms: &["meaning", "mean", "purpose", "why"] },
            Trigger { keyword: "soul", forms: &["soul", "spirit", "feel", "experience", "divine"] },
        ],
        threshold: 0.7,
    },
    TransitionRule {
        from: Persona::Reflection,
        to: Persona::Concept,
        triggers: &[
            Trigger { keyword: "understand", forms: &["understand", "explain", "clarify", "what is"] },
            Trigger { keyword: "principle", forms: &["principle", "concept", "framework", "theory", "how does"] },
        ],
        threshold: 0.7,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_context() -> ConversationContext {
        ConversationContext::new("student", None)
    }

    #[test]
    fn test_rules_cover_every_ordered_pair() {
        let mut pairs = std::collections::HashSet::new();
        for rule in TRANSITION_RULES.iter() {
            assert_ne!(rule.from, rule.to);
            assert!((0.0..=1.0).contains(&rule.threshold));
            assert!(pairs.insert((rule.from, rule.to)));
        }
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn test_trigger_score_bounds() {
        let rule = &TRANSITION_RULES[0];
        assert_eq!(rule.trigger_score(""), 0.0);
        assert_eq!(rule.trigger_score("why is this principle important?"), 1.0);
        assert_eq!(rule.trigger_score("explain it"), 0.5);
    }

    #[test]
    fn test_soul_question_moves_practice_to_reflection() {
        let ctx = empty_context();
        let (rule, confidence) =
            best_transition(Persona::Practice, "What does this mean for my soul?", &ctx).unwrap();
        assert_eq!(rule.to, Persona::Reflection);
        assert!(confidence >= 0.6);
    }

    #[test]
    fn test_tie_goes_to_first_declared_rule() {
        let ctx = empty_context();
        let text = "why is this principle about meaning for my soul?";
        let fired: Vec<(Persona, f64)> = TRANSITION_RULES
            .iter()
            .filter(|r| r.from == Persona::Practice)
            .map(|r| (r.to, r.evaluate(text, &ctx)))
            .filter(|(_, (fires, _))| *fires)
            .map(|(to, (_, confidence))| (to, confidence))
            .collect();
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].1, fired[1].1);

        let (rule, _) = best_transition(Persona::Practice, text, &ctx).unwrap();
        assert_eq!(rule.to, Persona::Concept);
    }

    #[test]
    fn test_no_signal_no_transition() {
        let ctx = empty_context();
        assert!(best_transition(Persona::Concept, "ok thanks", &ctx).is_none());
    }

    #[test]
    fn test_context_score_adds_up() {
        let mut ctx = empty_context();
        assert_eq!(context_score(Persona::Practice, &ctx), 0.0);
        for _ in 0..3 {
            ctx.record_turn(Persona::Practice, "tell me more", "sure", false, &[]);
        }
        assert!((context_score(Persona::Practice, &ctx) - 0.3).abs() < 1e-9);
        ctx.unresolved_questions.push("what now?".to_string());
        assert!((context_score(Persona::Practice, &ctx) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_context_lifts_partial_trigger_over_threshold() {
        let mut ctx = empty_context();
        for _ in 0..3 {
            ctx.record_turn(Persona::Practice, "tell me more", "sure", false, &[]);
        }
        ctx.unresolved_questions.push("what now?".to_string());
        let rule = &TRANSITION_RULES[0];
        let (fires, confidence) = rule.evaluate("can you explain?", &ctx);
        // 0.7 * 0.5 + 0.3 * 0.5
        assert!((confidence - 0.5).abs() < 1e-9);
        assert!(!fires);
        let (fires, _) = rule.evaluate("why does this principle work?", &ctx);
        assert!(fires);
    }

    #[test]
    fn test_confidence_within_bounds() {
        let mut ctx = empty_context();
        for _ in 0..5 {
            ctx.record_turn(Persona::Reflection, "hmm?", "fallback", true, &[]);
        }
        for rule in TRANSITION_RULES.iter() {
            let (_, confidence) =
                rule.evaluate("how does this principle explain my daily practice?", &ctx);
            assert!((0.0..=1.0).contains(&confidence));
        }
    }

    #[test]
    fn test_every_pair_has_an_approach() {
        for rule in TRANSITION_RULES.iter() {
            assert_ne!(
                recommended_approach(rule.from, rule.to),
                recommended_approach(Persona::Practice, Persona::Practice)
            );
        }
    }
}
