//! Lesson store: JSON lesson files, validation and learning paths.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{GurukulError, Result};
use crate::logging;
use crate::persona::Persona;

// ============ Lesson Schema ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Foundation,
    Seed,
    Tree,
    Sky,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Foundation => "Foundation",
            Level::Seed => "Seed",
            Level::Tree => "Tree",
            Level::Sky => "Sky",
        }
    }

    pub fn from_str(s: &str) -> Option<Level> {
        match s.trim().to_lowercase().as_str() {
            "foundation" => Some(Level::Foundation),
            "seed" => Some(Level::Seed),
            "tree" => Some(Level::Tree),
            "sky" => Some(Level::Sky),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Foundation,
    Dharma,
    Artha,
    Kama,
    Moksha,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Foundation => "foundation",
            Category::Dharma => "dharma",
            Category::Artha => "artha",
            Category::Kama => "kama",
            Category::Moksha => "moksha",
        }
    }

    pub fn from_str(s: &str) -> Option<Category> {
        match s.trim().to_lowercase().as_str() {
            "foundation" => Some(Category::Foundation),
            "dharma" => Some(Category::Dharma),
            "artha" => Some(Category::Artha),
            "kama" => Some(Category::Kama),
            "moksha" => Some(Category::Moksha),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuizKind {
    MultipleChoice,
    TrueFalse,
    ShortAnswer,
    Reflection,
    Scenario,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: QuizKind,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub correct_answer: Option<Value>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub sample_answers: Vec<String>,
    #[serde(default)]
    pub guidance: Option<String>,
    /// Keyed by persona name (`practice`) or legacy name (`seed`)
    #[serde(default)]
    pub agent_specific_feedback: BTreeMap<String, String>,
}

/// Either a flat list or an overall list plus per-persona lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LearningObjectives {
    List(Vec<String>),
    Structured {
        overall: Vec<String>,
        #[serde(default)]
        by_agent: BTreeMap<String, Vec<String>>,
    },
}

impl LearningObjectives {
    pub fn overall(&self) -> &[String] {
        match self {
            LearningObjectives::List(items) => items,
            LearningObjectives::Structured { overall, .. } => overall,
        }
    }

    /// Overall objectives followed by the ones specific to `persona`.
    pub fn for_persona(&self, persona: Persona) -> Vec<String> {
        let mut items = self.overall().to_vec();
        if let LearningObjectives::Structured { by_agent, .. } = self {
            let specific = by_agent
                .get(persona.as_str())
                .or_else(|| by_agent.get(persona.legacy_name()));
            if let Some(specific) = specific {
                items.extend(specific.iter().cloned());
            }
        }
        items
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Media {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub videos: Vec<String>,
    #[serde(default)]
    pub audio: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonContent {
    pub text: String,
    #[serde(default)]
    pub media: Media,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LessonMetadata {
    pub created_by: Option<String>,
    pub created_date: Option<String>,
    pub last_modified: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub difficulty: u8,
}

impl Default for LessonMetadata {
    fn default() -> Self {
        Self {
            created_by: None,
            created_date: None,
            last_modified: None,
            version: None,
            tags: Vec::new(),
            difficulty: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: String,
    pub title: String,
    pub level: Level,
    pub category: Category,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    pub learning_objectives: LearningObjectives,
    pub estimated_duration: u32,
    pub content: LessonContent,
    pub quiz: Vec<QuizItem>,
    #[serde(default)]
    pub tts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_paths: Option<Value>,
    #[serde(default)]
    pub metadata: LessonMetadata,
}

impl Lesson {
    /// Checks the rules serde can't express. Returns the first problem found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("lesson id is empty".to_string());
        }
        if self.title.trim().is_empty() {
            return Err("title is empty".to_string());
        }
        if self.learning_objectives.overall().is_empty() {
            return Err("at least one learning objective is required".to_string());
        }
        if self.estimated_duration < 1 {
            return Err("estimated_duration must be at least 1".to_string());
        }
        if self.quiz.is_empty() {
            return Err("at least one quiz item is required".to_string());
        }
        if !(1..=5).contains(&self.metadata.difficulty) {
            return Err(format!("difficulty {} is outside 1-5", self.metadata.difficulty));
        }
        let mut seen = BTreeSet::new();
        for item in &self.quiz {
            if !seen.insert(item.id.as_str()) {
                return Err(format!("duplicate quiz id {}", item.id));
            }
        }
        if self.prerequisites.iter().any(|p| p == &self.id) {
            return Err("lesson lists itself as a prerequisite".to_string());
        }
        Ok(())
    }

    pub fn tags(&self) -> &[String] {
        &self.metadata.tags
    }

    pub fn quiz_item(&self, id: &str) -> Option<(usize, &QuizItem)> {
        self.quiz.iter().enumerate().find(|(_, q)| q.id == id)
    }
}

// ============ Curriculum ============

pub type LearningPaths = BTreeMap<Category, BTreeMap<Level, Vec<String>>>;

#[derive(Debug, Clone, Serialize)]
pub struct PathPosition {
    pub category: Category,
    pub level: Level,
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct LessonRef {
    pub id: String,
    pub title: String,
    pub level: Level,
    pub category: Category,
}

impl From<&Lesson> for LessonRef {
    fn from(lesson: &Lesson) -> Self {
        Self {
            id: lesson.id.clone(),
            title: lesson.title.clone(),
            level: lesson.level,
            category: lesson.category,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Curriculum {
    lessons: BTreeMap<String, Lesson>,
    source_dir: Option<PathBuf>,
}

impl Curriculum {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_lessons(lessons: Vec<Lesson>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for lesson in lessons {
            lesson
                .validate()
                .map_err(|e| GurukulError::curriculum(format!("{}: {}", lesson.id, e)))?;
            if map.contains_key(&lesson.id) {
                return Err(GurukulError::curriculum(format!("duplicate lesson id {}", lesson.id)));
            }
            map.insert(lesson.id.clone(), lesson);
        }
        Ok(Self {
            lessons: map,
            source_dir: None,
        })
    }

    pub fn load_lesson(path: &Path) -> Result<Lesson> {
        let raw = fs::read_to_string(path)?;
        let lesson: Lesson = serde_json::from_str(&raw).map_err(|e| {
            GurukulError::curriculum(format!("{}: invalid lesson JSON: {}", path.display(), e))
        })?;
        lesson
            .validate()
            .map_err(|e| GurukulError::curriculum(format!("{}: {}", path.display(), e)))?;
        Ok(lesson)
    }

    /// Load every `*.json` file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(GurukulError::curriculum(format!(
                "lessons directory not found: {}",
                dir.display()
            )));
        }

        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json"))
            .collect();
        paths.sort();

        let mut lessons = Vec::with_capacity(paths.len());
        for path in &paths {
            lessons.push(Self::load_lesson(path)?);
        }

        let mut curriculum = Self::from_lessons(lessons)?;
        curriculum.source_dir = Some(dir.to_path_buf());
        logging::log_curriculum(&format!(
            "Loaded {} lessons from {}",
            curriculum.len(),
            dir.display()
        ));
        Ok(curriculum)
    }

    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    pub fn len(&self) -> usize {
        self.lessons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lessons.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Lesson> {
        self.lessons.get(id)
    }

    pub fn require(&self, id: &str) -> Result<&Lesson> {
        self.get(id).ok_or_else(|| GurukulError::not_found("Lesson", id))
    }

    pub fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.lessons.values()
    }

    pub fn by_level(&self, level: Level, category: Option<Category>) -> Vec<&Lesson> {
        self.lessons
            .values()
            .filter(|l| l.level == level && category.map_or(true, |c| l.category == c))
            .collect()
    }

    /// Lessons that list `id` as a prerequisite.
    pub fn dependents(&self, id: &str) -> Vec<&Lesson> {
        self.lessons
            .values()
            .filter(|l| l.prerequisites.iter().any(|p| p == id))
            .collect()
    }

    /// One message per prerequisite that names an unknown lesson.
    pub fn validate_dependencies(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for lesson in self.lessons.values() {
            for prereq in &lesson.prerequisites {
                if !self.lessons.contains_key(prereq) {
                    issues.push(format!(
                        "{} requires unknown lesson {}",
                        lesson.id, prereq
                    ));
                }
            }
        }
        issues
    }

    pub fn prerequisites_met(&self, id: &str, finished: &BTreeSet<String>) -> bool {
        self.get(id)
            .map(|l| l.prerequisites.iter().all(|p| finished.contains(p)))
            .unwrap_or(false)
    }

    /// Lesson ids grouped by category and level, each group ordered so that
    /// prerequisites come first.
    pub fn learning_paths(&self) -> Result<LearningPaths> {
        let mut groups: BTreeMap<(Category, Level), Vec<&Lesson>> = BTreeMap::new();
        for lesson in self.lessons.values() {
            groups
                .entry((lesson.category, lesson.level))
                .or_default()
                .push(lesson);
        }

        let mut paths: LearningPaths = BTreeMap::new();
        for ((category, level), lessons) in groups {
            let ordered = topological_order(&lessons)?;
            paths.entry(category).or_default().insert(level, ordered);
        }
        Ok(paths)
    }

    pub fn path_position(&self, id: &str) -> Result<Option<PathPosition>> {
        let lesson = match self.get(id) {
            Some(lesson) => lesson,
            None => return Ok(None),
        };
        let paths = self.learning_paths()?;
        let position = paths
            .get(&lesson.category)
            .and_then(|levels| levels.get(&lesson.level))
            .and_then(|ids| {
                ids.iter().position(|i| i == id).map(|index| PathPosition {
                    category: lesson.category,
                    level: lesson.level,
                    index,
                    total: ids.len(),
                })
            });
        Ok(position)
    }
}

/// Depth-first ordering over prerequisites inside one group. Prerequisites
/// outside the group are ignored.
fn topological_order(lessons: &[&Lesson]) -> Result<Vec<String>> {
    let by_id: BTreeMap<&str, &Lesson> = lessons.iter().map(|l| (l.id.as_str(), *l)).collect();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut visiting: BTreeSet<&str> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(lessons.len());

    fn visit<'a>(
        lesson: &'a Lesson,
        by_id: &BTreeMap<&'a str, &'a Lesson>,
        visited: &mut BTreeSet<&'a str>,
        visiting: &mut BTreeSet<&'a str>,
        ordered: &mut Vec<String>,
    ) -> Result<()> {
        let id = lesson.id.as_str();
        if visited.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(GurukulError::curriculum(format!(
                "circular dependency detected involving lesson {}",
                id
            )));
        }
        for prereq in &lesson.prerequisites {
            if let Some(next) = by_id.get(prereq.as_str()) {
                visit(*next, by_id, visited, visiting, ordered)?;
            }
        }
        visiting.remove(id);
        visited.insert(id);
        ordered.push(lesson.id.clone());
        Ok(())
    }

    for lesson in lessons {
        visit(*lesson, &by_id, &mut visited, &mut visiting, &mut ordered)?;
    }
    Ok(ordered)
}
