//! Weighted keyword scoring.
//!
//! A [`KeywordTable`] maps each persona to tiers of keywords. Scoring counts
//! case-insensitive substring hits, so "meditat" also matches "meditation"
//! (and "mean" matches "meaningful").

use once_cell::sync::Lazy;
use std::collections::BTreeMap;

use crate::persona::Persona;

#[derive(Debug, Clone)]
pub struct KeywordTier {
    pub weight: f64,
    pub keywords: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct KeywordTable {
    categories: Vec<(Persona, Vec<KeywordTier>)>,
    multiplier: f64,
}

impl KeywordTable {
    pub fn new(categories: Vec<(Persona, Vec<KeywordTier>)>) -> Self {
        Self {
            categories,
            multiplier: 1.0,
        }
    }

    /// Scale every category score by `multiplier`.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Score `text` against every persona. Personas missing from the table
    /// score zero. Empty text scores zero everywhere.
    pub fn score(&self, text: &str) -> BTreeMap<Persona, f64> {
        let lowered = text.to_lowercase();
        let mut scores: BTreeMap<Persona, f64> = Persona::ALL.iter().map(|p| (*p, 0.0)).collect();

        if lowered.trim().is_empty() {
            return scores;
        }

        for (persona, tiers) in &self.categories {
            let raw: f64 = tiers
                .iter()
                .map(|tier| {
                    let hits = tier
                        .keywords
                        .iter()
                        .filter(|k| lowered.contains(*k))
                        .count();
                    tier.weight * hits as f64
                })
                .sum();
            *scores.entry(*persona).or_insert(0.0) += raw * self.multiplier;
        }

        scores
    }
}

/// Cold-start routing table.
pub static ROUTING_KEYWORDS: Lazy<KeywordTable> = Lazy::new(|| {
    KeywordTable::new(vec![
        (
            Persona::Practice,
            vec![
                KeywordTier {
                    weight: 2.0,
                    keywords: &["how", "practice", "steps", "exercise", "try", "apply", "implement", "show me", "guide"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["daily", "routine", "habit", "action", "technique", "method", "start", "begin"],
                },
            ],
        ),
        (
            Persona::Concept,
            vec![
                KeywordTier {
                    weight: 2.0,
                    keywords: &["why", "explain", "understand", "concept", "principle", "because", "what is"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["reason", "theory", "idea", "knowledge", "wisdom", "connection", "relationship", "framework", "important"],
                },
            ],
        ),
        (
            Persona::Reflection,
            vec![
                KeywordTier {
                    weight: 2.0,
                    keywords: &["soul", "spirit", "divine", "deeper", "purpose", "meaning", "consciousness"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["feel", "believe", "reflect", "contemplate", "meditat", "inner", "philosoph"],
                },
            ],
        ),
    ])
});

/// Table used when suggesting a persona inside an active lesson.
pub static LESSON_KEYWORDS: Lazy<KeywordTable> = Lazy::new(|| {
    KeywordTable::new(vec![
        (
            Persona::Practice,
            vec![
                KeywordTier {
                    weight: 1.0,
                    keywords: &["how", "practice", "do", "steps", "exercise", "try", "apply", "use", "implement", "show", "guide"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["daily", "routine", "habit", "action", "technique", "method", "way", "start", "begin"],
                },
            ],
        ),
        (
            Persona::Concept,
            vec![
                KeywordTier {
                    weight: 1.0,
                    keywords: &["why", "what", "explain", "understand", "concept", "meaning", "principle", "because"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["reason", "theory", "idea", "knowledge", "wisdom", "connection", "relationship", "framework"],
                },
            ],
        ),
        (
            Persona::Reflection,
            vec![
                KeywordTier {
                    weight: 1.0,
                    keywords: &["soul", "spirit", "divine", "deeper", "purpose", "meaning", "spiritual", "consciousness"],
                },
                KeywordTier {
                    weight: 0.5,
                    keywords: &["feel", "think", "believe", "reflect", "contemplate", "meditate", "inner", "philosophical"],
                },
            ],
        ),
    ])
    .with_multiplier(2.0)
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_scores_zero() {
        let scores = ROUTING_KEYWORDS.score("   ");
        assert!(scores.values().all(|s| *s == 0.0));
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn test_tier_weights() {
        let scores = ROUTING_KEYWORDS.score("How do I practice gratitude daily?");
        assert_eq!(scores[&Persona::Practice], 4.5);
        assert_eq!(scores[&Persona::Concept], 0.0);
    }

    #[test]
    fn test_case_insensitive_substring() {
        let scores = ROUTING_KEYWORDS.score("I love MEDITATION");
        assert_eq!(scores[&Persona::Reflection], 0.5);
    }

    #[test]
    fn test_multiplier_applies() {
        let scores = LESSON_KEYWORDS.score("explain");
        assert_eq!(scores[&Persona::Concept], 2.0);
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let a = ROUTING_KEYWORDS.score("why does my soul feel restless?");
        let b = ROUTING_KEYWORDS.score("why does my soul feel restless?");
        assert_eq!(a, b);
    }
}
