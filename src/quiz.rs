//! Quiz scoring. Answers arrive as raw JSON values so that index answers
//! (`0`), boolean answers and free text share one request shape.

use serde::Serialize;
use serde_json::Value;

use crate::curriculum::{Lesson, QuizItem, QuizKind};
use crate::error::{GurukulError, Result};
use crate::persona::Persona;

const REFLECTION_FULL_CHARS: usize = 50;
const REFLECTION_PARTIAL_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub correct: bool,
    pub score: f64,
}

impl Score {
    fn full() -> Self {
        Self { correct: true, score: 1.0 }
    }

    fn zero() -> Self {
        Self { correct: false, score: 0.0 }
    }
}

/// A question as shown to students: no answers.
#[derive(Debug, Clone, Serialize)]
pub struct SafeQuestion {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuizKind,
    pub question: String,
    pub options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

impl From<&QuizItem> for SafeQuestion {
    fn from(item: &QuizItem) -> Self {
        Self {
            id: item.id.clone(),
            kind: item.kind,
            question: item.question.clone(),
            options: item.options.clone(),
            guidance: item.guidance.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuizResult {
    pub question_id: String,
    pub correct: bool,
    pub score: f64,
    pub explanation: Option<String>,
    pub agent_feedback: Option<String>,
    pub next_question: Option<SafeQuestion>,
}

pub fn score_answer(item: &QuizItem, answer: &Value) -> Score {
    match item.kind {
        QuizKind::MultipleChoice | QuizKind::TrueFalse | QuizKind::Scenario => {
            match &item.correct_answer {
                Some(expected) if answer_matches(item, expected, answer) => Score::full(),
                _ => Score::zero(),
            }
        }
        QuizKind::Reflection => {
            let length = answer_text(answer).trim().chars().count();
            if length > REFLECTION_FULL_CHARS {
                Score { correct: true, score: 1.0 }
            } else if length > REFLECTION_PARTIAL_CHARS {
                Score { correct: true, score: 0.7 }
            } else {
                Score { correct: false, score: 0.3 }
            }
        }
        QuizKind::ShortAnswer => {
            let given = answer_text(answer).trim().to_lowercase();
            if given.is_empty() {
                return Score::zero();
            }
            let expected = item
                .correct_answer
                .iter()
                .map(answer_text)
                .chain(item.sample_answers.iter().cloned());
            let matched = expected
                .map(|e| e.trim().to_lowercase())
                .any(|e| e == given);
            if matched {
                Score::full()
            } else {
                Score::zero()
            }
        }
    }
}

/// Exact JSON equality; an option index also matches the option's text.
fn answer_matches(item: &QuizItem, expected: &Value, answer: &Value) -> bool {
    if expected == answer {
        return true;
    }
    match (expected.as_u64(), answer.as_str()) {
        (Some(index), Some(text)) => item
            .options
            .get(index as usize)
            .map(|option| option.trim().eq_ignore_ascii_case(text.trim()))
            .unwrap_or(false),
        _ => false,
    }
}

fn answer_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Persona feedback for an item, falling back to the legacy key.
pub fn feedback_for(item: &QuizItem, persona: Persona) -> Option<String> {
    item.agent_specific_feedback
        .get(persona.as_str())
        .or_else(|| item.agent_specific_feedback.get(persona.legacy_name()))
        .cloned()
}

pub fn safe_questions(lesson: &Lesson) -> Vec<SafeQuestion> {
    lesson.quiz.iter().map(SafeQuestion::from).collect()
}

pub fn evaluate(lesson: &Lesson, question_id: &str, answer: &Value, persona: Persona) -> Result<QuizResult> {
    let (index, item) = lesson
        .quiz_item(question_id)
        .ok_or_else(|| GurukulError::not_found("Quiz question", question_id))?;

    let score = score_answer(item, answer);
    Ok(QuizResult {
        question_id: item.id.clone(),
        correct: score.correct,
        score: score.score,
        explanation: item.explanation.clone(),
        agent_feedback: feedback_for(item, persona),
        next_question: lesson.quiz.get(index + 1).map(SafeQuestion::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::tests::lesson;
    use serde_json::json;

    #[test]
    fn test_multiple_choice() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let item = &lesson.quiz[0];
        assert_eq!(score_answer(item, &json!(0)), Score::full());
        assert_eq!(score_answer(item, &json!("helping")), Score::full());
        assert_eq!(score_answer(item, &json!(1)), Score::zero());
    }

    #[test]
    fn test_reflection_scores_by_length() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let item = &lesson.quiz[1];
        let long = "I helped my younger brother with his homework even though I was tired.";
        assert_eq!(score_answer(item, &json!(long)).score, 1.0);

        let medium = score_answer(item, &json!("I shared my lunch today"));
        assert!(medium.correct);
        assert_eq!(medium.score, 0.7);

        let short = score_answer(item, &json!("not sure"));
        assert!(!short.correct);
        assert_eq!(short.score, 0.3);
    }

    #[test]
    fn test_short_answer_accepts_samples() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let item = &lesson.quiz[2];
        assert!(score_answer(item, &json!(" Kindness ")).correct);
        assert!(score_answer(item, &json!("compassion")).correct);
        assert!(!score_answer(item, &json!("anger")).correct);
        assert!(!score_answer(item, &json!("")).correct);
    }

    #[test]
    fn test_evaluate_feedback_and_next() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let result = evaluate(&lesson, "q1", &json!(0), Persona::Concept).unwrap();
        assert!(result.correct);
        assert_eq!(result.agent_feedback.as_deref(), Some("Helping reflects care."));
        assert_eq!(result.next_question.map(|q| q.id), Some("q2".to_string()));

        let last = evaluate(&lesson, "q3", &json!("kindness"), Persona::Reflection).unwrap();
        assert!(last.agent_feedback.is_none());
        assert!(last.next_question.is_none());
    }

    #[test]
    fn test_unknown_question() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let err = evaluate(&lesson, "q9", &json!(0), Persona::Practice).unwrap_err();
        assert!(matches!(err, GurukulError::NotFound { .. }));
    }

    #[test]
    fn test_safe_questions_hide_answers() {
        let lesson = lesson("l1", "Seed", "dharma", &[]);
        let questions = safe_questions(&lesson);
        assert_eq!(questions.len(), 3);
        let json = serde_json::to_value(&questions).unwrap();
        assert!(json[0].get("correct_answer").is_none());
        assert!(json[2].get("sample_answers").is_none());
        assert_eq!(json[0]["type"], "multiple_choice");
    }
}
