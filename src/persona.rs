use serde::{Deserialize, Serialize};
use std::fmt;

use crate::progress::QueryPath;

// ============ Persona ============

/// The three tutoring personas a student can talk to.
///
/// Wire names are `practice`, `concept` and `reflection`. The older names
/// `seed`, `tree` and `sky` are still accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    #[serde(alias = "seed")]
    Practice,
    #[serde(alias = "tree")]
    Concept,
    #[serde(alias = "sky")]
    Reflection,
}

impl Persona {
    /// Declaration order; also the tie-break order for routing.
    pub const ALL: [Persona; 3] = [Persona::Practice, Persona::Concept, Persona::Reflection];

    pub fn as_str(&self) -> &'static str {
        match self {
            Persona::Practice => "practice",
            Persona::Concept => "concept",
            Persona::Reflection => "reflection",
        }
    }

    /// Name used by lesson files written before the personas were renamed.
    pub fn legacy_name(&self) -> &'static str {
        match self {
            Persona::Practice => "seed",
            Persona::Concept => "tree",
            Persona::Reflection => "sky",
        }
    }

    pub fn from_str(s: &str) -> Option<Persona> {
        match s.trim().to_lowercase().as_str() {
            "practice" | "seed" => Some(Persona::Practice),
            "concept" | "tree" => Some(Persona::Concept),
            "reflection" | "sky" => Some(Persona::Reflection),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Persona::Practice => "Practice Guide",
            Persona::Concept => "Concept Teacher",
            Persona::Reflection => "Reflection Guide",
        }
    }

    pub fn personality(&self) -> &'static Personality {
        match self {
            Persona::Practice => &PRACTICE_PERSONALITY,
            Persona::Concept => &CONCEPT_PERSONALITY,
            Persona::Reflection => &REFLECTION_PERSONALITY,
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Persona::Practice => PRACTICE_SYSTEM_PROMPT,
            Persona::Concept => CONCEPT_SYSTEM_PROMPT,
            Persona::Reflection => REFLECTION_SYSTEM_PROMPT,
        }
    }

    /// Fixed reply used whenever generation fails or is skipped.
    pub fn fallback(&self) -> &'static str {
        match self {
            Persona::Practice => {
                "Let's take one small, concrete step together. Tell me what you tried today and we can build a practice from there."
            }
            Persona::Concept => {
                "Let's slow down and look at the idea underneath this. Which part feels least clear to you right now?"
            }
            Persona::Reflection => {
                "Let's pause for a moment and sit with this question. What feels most alive for you in it?"
            }
        }
    }

    pub fn default_query_path(&self) -> QueryPath {
        match self {
            Persona::Practice => QueryPath::Practical,
            Persona::Concept => QueryPath::Conceptual,
            Persona::Reflection => QueryPath::Reflective,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Personality ============

/// Immutable character sheet folded into every prompt for a persona.
#[derive(Debug, Serialize)]
pub struct Personality {
    pub role: &'static str,
    pub tone: &'static str,
    pub language_style: &'static str,
    pub approach: &'static str,
    pub error_handling: &'static str,
    pub metaphors: &'static [&'static str],
    pub focus: &'static [&'static str],
}

impl Personality {
    pub fn format_for_prompt(&self) -> String {
        format!(
            "Role: {}\nTone: {}\nLanguage style: {}\nApproach: {}\nWhen the student struggles: {}\nMetaphors you draw on: {}\nFocus areas: {}",
            self.role,
            self.tone,
            self.language_style,
            self.approach,
            self.error_handling,
            self.metaphors.join(", "),
            self.focus.join(", "),
        )
    }
}

static PRACTICE_PERSONALITY: Personality = Personality {
    role: "a patient practice guide who turns lessons into daily action",
    tone: "warm, encouraging and down to earth",
    language_style: "short sentences, concrete examples, numbered steps when useful",
    approach: "start from the student's real situation and suggest one small exercise at a time",
    error_handling: "reassure, shrink the step, and try a different everyday example",
    metaphors: &["planting seeds", "tending a garden", "walking a path one step at a time"],
    focus: &["habits", "exercises", "daily routines", "applying values in real situations"],
};

static CONCEPT_PERSONALITY: Personality = Personality {
    role: "a thoughtful teacher who explains the principles behind each practice",
    tone: "clear, curious and respectful",
    language_style: "structured explanations that connect ideas to one another",
    approach: "name the principle, show why it holds, then link it to something the student already knows",
    error_handling: "rephrase with a simpler framing and check understanding with a question",
    metaphors: &["the roots and branches of a tree", "building a house on a foundation", "a map of connected ideas"],
    focus: &["principles", "reasons", "frameworks", "connections between concepts"],
};

static REFLECTION_PERSONALITY: Personality = Personality {
    role: "a contemplative guide who helps the student find personal meaning",
    tone: "gentle, spacious and sincere",
    language_style: "open questions, imagery, and room for silence",
    approach: "invite the student to look inward and relate the lesson to purpose and inner experience",
    error_handling: "slow down, acknowledge the difficulty, and offer a simpler question to sit with",
    metaphors: &["the open sky", "still water", "light after rain"],
    focus: &["meaning", "purpose", "inner experience", "contemplation"],
};

const PRACTICE_SYSTEM_PROMPT: &str = "You are the Practice Guide of a learning companion for young students. You help the student turn each lesson into something they can do today. Prefer concrete steps, small experiments and everyday examples over abstract discussion.";

const CONCEPT_SYSTEM_PROMPT: &str = "You are the Concept Teacher of a learning companion for young students. You explain why the ideas in a lesson matter, how they connect, and what principles sit underneath the practices.";

const REFLECTION_SYSTEM_PROMPT: &str = "You are the Reflection Guide of a learning companion for young students. You help the student notice what a lesson means to them personally and how it relates to purpose, character and inner experience.";
