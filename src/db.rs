use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{GurukulError, Result};
use crate::memory::{MemorySnippet, PersonaProfile, SnippetKind};
use crate::persona::Persona;
use crate::progress::{
    InteractionRecord, InteractionSource, LessonProgress, LessonState, QueryPath, StudentRecord,
};

/// SQLite store for students, lesson progress and persona memory.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            -- One row per student
            CREATE TABLE IF NOT EXISTS students (
                student_id TEXT PRIMARY KEY,
                current_lesson TEXT,
                preferences TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Lesson state machine per (student, lesson)
            CREATE TABLE IF NOT EXISTS lesson_progress (
                student_id TEXT NOT NULL,
                lesson_id TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                quiz_scores TEXT NOT NULL DEFAULT '[]',
                persona_counts TEXT NOT NULL DEFAULT '{}',
                quiz_attempts INTEGER NOT NULL DEFAULT 0,
                query_paths_used TEXT NOT NULL DEFAULT '[]',
                mastery_indicators TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (student_id, lesson_id)
            );

            -- Most recent interactions per (student, lesson)
            CREATE TABLE IF NOT EXISTS lesson_interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                lesson_id TEXT NOT NULL,
                source TEXT NOT NULL,
                query_path TEXT NOT NULL,
                user_input TEXT NOT NULL,
                response_length INTEGER NOT NULL,
                quality_score REAL,
                timestamp TEXT NOT NULL
            );

            -- Persona profile per (student, persona)
            CREATE TABLE IF NOT EXISTS persona_profiles (
                student_id TEXT NOT NULL,
                persona TEXT NOT NULL,
                total_interactions INTEGER NOT NULL DEFAULT 0,
                last_interaction TEXT,
                progress_markers TEXT NOT NULL DEFAULT '[]',
                mastered_concepts TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                PRIMARY KEY (student_id, persona)
            );

            -- Conversation and progress snippets per (student, persona)
            CREATE TABLE IF NOT EXISTS memory_snippets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                persona TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                agent_text TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_lesson
                ON lesson_interactions(student_id, lesson_id);
            CREATE INDEX IF NOT EXISTS idx_snippets_owner
                ON memory_snippets(student_id, persona);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&conn)
    }

    #[cfg(test)]
    pub(crate) fn drop_table(&self, table: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(&format!("DROP TABLE {}", table))?;
            Ok(())
        })
    }

    // ============ Students ============

    pub fn get_student(&self, student_id: &str) -> Result<Option<StudentRecord>> {
        self.with_connection(|conn| {
            let row: Option<(Option<String>, String, String, String)> = conn
                .query_row(
                    "SELECT current_lesson, preferences, created_at, updated_at
                     FROM students WHERE student_id = ?1",
                    [student_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;

            match row {
                Some((current_lesson, preferences, created_at, updated_at)) => Ok(Some(StudentRecord {
                    student_id: student_id.to_string(),
                    current_lesson,
                    preferences: serde_json::from_str(&preferences)?,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    pub fn save_student(&self, student: &StudentRecord) -> Result<()> {
        let preferences = serde_json::to_string(&student.preferences)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO students (student_id, current_lesson, preferences, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(student_id) DO UPDATE SET
                    current_lesson = excluded.current_lesson,
                    preferences = excluded.preferences,
                    updated_at = excluded.updated_at",
                params![
                    student.student_id,
                    student.current_lesson,
                    preferences,
                    student.created_at.to_rfc3339(),
                    student.updated_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    pub fn count_students(&self) -> Result<i64> {
        self.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM students", [], |row| row.get(0))?)
        })
    }

    // ============ Lesson Progress ============

    pub fn save_lesson_progress(&self, progress: &LessonProgress) -> Result<()> {
        let quiz_scores = serde_json::to_string(&progress.quiz_scores)?;
        let persona_counts = serde_json::to_string(&progress.persona_counts)?;
        let query_paths = serde_json::to_string(&progress.query_paths_used)?;
        let indicators = serde_json::to_string(&progress.mastery_indicators)?;

        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO lesson_progress
                    (student_id, lesson_id, state, started_at, completed_at, attempts, quiz_scores,
                     persona_counts, quiz_attempts, query_paths_used, mastery_indicators)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    progress.student_id,
                    progress.lesson_id,
                    progress.state.as_str(),
                    progress.started_at.map(|t| t.to_rfc3339()),
                    progress.completed_at.map(|t| t.to_rfc3339()),
                    progress.attempts,
                    quiz_scores,
                    persona_counts,
                    progress.quiz_attempts,
                    query_paths,
                    indicators
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_lesson_progress(&self, student_id: &str, lesson_id: &str) -> Result<Option<LessonProgress>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    &format!("{} WHERE student_id = ?1 AND lesson_id = ?2", PROGRESS_SELECT),
                    params![student_id, lesson_id],
                    ProgressRow::from_row,
                )
                .optional()?;
            row.map(ProgressRow::into_progress).transpose()
        })
    }

    pub fn list_lesson_progress(&self, student_id: &str) -> Result<Vec<LessonProgress>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE student_id = ?1 ORDER BY started_at ASC",
                PROGRESS_SELECT
            ))?;
            let rows = stmt
                .query_map([student_id], ProgressRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(ProgressRow::into_progress).collect()
        })
    }

    pub fn count_lesson_progress(&self) -> Result<i64> {
        self.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM lesson_progress", [], |row| row.get(0))?)
        })
    }

    // ============ Interactions ============

    /// Append an interaction and drop all but the newest `keep` for that
    /// (student, lesson).
    pub fn append_interaction(&self, record: &InteractionRecord, keep: usize) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO lesson_interactions
                    (student_id, lesson_id, source, query_path, user_input, response_length, quality_score, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.student_id,
                    record.lesson_id,
                    record.source.as_str(),
                    record.query_path.as_str(),
                    record.user_input,
                    record.response_length as i64,
                    record.quality_score,
                    record.timestamp.to_rfc3339()
                ],
            )?;
            conn.execute(
                "DELETE FROM lesson_interactions
                 WHERE student_id = ?1 AND lesson_id = ?2 AND id NOT IN (
                    SELECT id FROM lesson_interactions
                    WHERE student_id = ?1 AND lesson_id = ?2
                    ORDER BY id DESC LIMIT ?3
                 )",
                params![record.student_id, record.lesson_id, keep as i64],
            )?;
            Ok(())
        })
    }

    /// Newest `limit` interactions, oldest first.
    pub fn recent_interactions(&self, student_id: &str, lesson_id: &str, limit: usize) -> Result<Vec<InteractionRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source, query_path, user_input, response_length, quality_score, timestamp
                 FROM lesson_interactions
                 WHERE student_id = ?1 AND lesson_id = ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![student_id, lesson_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut records = Vec::with_capacity(rows.len());
            for (source, path, user_input, response_length, quality_score, timestamp) in rows {
                records.push(InteractionRecord {
                    student_id: student_id.to_string(),
                    lesson_id: lesson_id.to_string(),
                    source: InteractionSource::from_str(&source)
                        .ok_or_else(|| corrupt("interaction source", &source))?,
                    query_path: QueryPath::from_str(&path).ok_or_else(|| corrupt("query path", &path))?,
                    user_input,
                    response_length: response_length.max(0) as usize,
                    quality_score,
                    timestamp: parse_time(&timestamp)?,
                });
            }
            records.reverse();
            Ok(records)
        })
    }

    // ============ Persona Memory ============

    pub fn get_persona_profile(&self, student_id: &str, persona: Persona) -> Result<Option<PersonaProfile>> {
        self.with_connection(|conn| {
            let row: Option<(i64, Option<String>, String, String, String)> = conn
                .query_row(
                    "SELECT total_interactions, last_interaction, progress_markers, mastered_concepts, created_at
                     FROM persona_profiles WHERE student_id = ?1 AND persona = ?2",
                    params![student_id, persona.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
                )
                .optional()?;

            match row {
                Some((total, last, markers, mastered, created_at)) => Ok(Some(PersonaProfile {
                    student_id: student_id.to_string(),
                    persona,
                    total_interactions: total.max(0) as u64,
                    last_interaction: last.as_deref().map(parse_time).transpose()?,
                    progress_markers: serde_json::from_str(&markers)?,
                    mastered_concepts: serde_json::from_str(&mastered)?,
                    created_at: parse_time(&created_at)?,
                })),
                None => Ok(None),
            }
        })
    }

    pub fn save_persona_profile(&self, profile: &PersonaProfile) -> Result<()> {
        let markers = serde_json::to_string(&profile.progress_markers)?;
        let mastered = serde_json::to_string(&profile.mastered_concepts)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO persona_profiles
                    (student_id, persona, total_interactions, last_interaction, progress_markers, mastered_concepts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    profile.student_id,
                    profile.persona.as_str(),
                    profile.total_interactions as i64,
                    profile.last_interaction.map(|t| t.to_rfc3339()),
                    markers,
                    mastered,
                    profile.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    pub fn insert_snippet(&self, student_id: &str, persona: Persona, snippet: &MemorySnippet) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO memory_snippets (student_id, persona, kind, content, agent_text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    student_id,
                    persona.as_str(),
                    snippet.kind.as_str(),
                    snippet.content,
                    snippet.agent_text,
                    snippet.created_at.to_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    /// Newest `limit` snippets, oldest first.
    pub fn recent_snippets(&self, student_id: &str, persona: Persona, limit: usize) -> Result<Vec<MemorySnippet>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT kind, content, agent_text, created_at
                 FROM memory_snippets
                 WHERE student_id = ?1 AND persona = ?2
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![student_id, persona.as_str(), limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut snippets = Vec::with_capacity(rows.len());
            for (kind, content, agent_text, created_at) in rows {
                snippets.push(MemorySnippet {
                    kind: SnippetKind::from_str(&kind).ok_or_else(|| corrupt("snippet kind", &kind))?,
                    content,
                    agent_text,
                    created_at: parse_time(&created_at)?,
                });
            }
            snippets.reverse();
            Ok(snippets)
        })
    }

    pub fn count_snippets(&self) -> Result<i64> {
        self.with_connection(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM memory_snippets", [], |row| row.get(0))?)
        })
    }
}

// ============ Row Helpers ============

const PROGRESS_SELECT: &str = "SELECT student_id, lesson_id, state, started_at, completed_at, attempts, quiz_scores,
        persona_counts, quiz_attempts, query_paths_used, mastery_indicators
     FROM lesson_progress";

struct ProgressRow {
    student_id: String,
    lesson_id: String,
    state: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    attempts: i64,
    quiz_scores: String,
    persona_counts: String,
    quiz_attempts: i64,
    query_paths_used: String,
    mastery_indicators: String,
}

impl ProgressRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            student_id: row.get(0)?,
            lesson_id: row.get(1)?,
            state: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            attempts: row.get(5)?,
            quiz_scores: row.get(6)?,
            persona_counts: row.get(7)?,
            quiz_attempts: row.get(8)?,
            query_paths_used: row.get(9)?,
            mastery_indicators: row.get(10)?,
        })
    }

    fn into_progress(self) -> Result<LessonProgress> {
        Ok(LessonProgress {
            state: LessonState::from_str(&self.state).ok_or_else(|| corrupt("lesson state", &self.state))?,
            started_at: self.started_at.as_deref().map(parse_time).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            attempts: self.attempts.max(0) as u32,
            quiz_scores: serde_json::from_str(&self.quiz_scores)?,
            persona_counts: serde_json::from_str(&self.persona_counts)?,
            quiz_attempts: self.quiz_attempts.max(0) as u32,
            query_paths_used: serde_json::from_str(&self.query_paths_used)?,
            mastery_indicators: serde_json::from_str(&self.mastery_indicators)?,
            student_id: self.student_id,
            lesson_id: self.lesson_id,
        })
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| corrupt("timestamp", raw))
}

fn corrupt(what: &str, value: &str) -> GurukulError {
    GurukulError::Storage(format!("{} {}", what, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{PersonaCounts, StudentPreferences};

    #[test]
    fn test_student_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_student("s1").unwrap().is_none());

        let mut student = StudentRecord::new("s1");
        student.current_lesson = Some("l1".to_string());
        student.preferences = StudentPreferences {
            preferred_persona: Some(Persona::Concept),
            learning_style: Some("visual".to_string()),
            pace: None,
        };
        db.save_student(&student).unwrap();

        let loaded = db.get_student("s1").unwrap().unwrap();
        assert_eq!(loaded.current_lesson.as_deref(), Some("l1"));
        assert_eq!(loaded.preferences, student.preferences);
        assert_eq!(db.count_students().unwrap(), 1);

        student.current_lesson = None;
        db.save_student(&student).unwrap();
        assert!(db.get_student("s1").unwrap().unwrap().current_lesson.is_none());
    }

    #[test]
    fn test_progress_persists_collections() {
        let db = Database::open_in_memory().unwrap();
        let mut progress = LessonProgress::new("s1", "l1");
        progress.state = LessonState::InProgress;
        progress.started_at = Some(Utc::now());
        progress.quiz_scores = vec![0.5, 1.0];
        progress.persona_counts = PersonaCounts { practice: 2, concept: 1, reflection: 0 };
        progress.query_paths_used.insert(QueryPath::Practical);
        db.save_lesson_progress(&progress).unwrap();

        let loaded = db.get_lesson_progress("s1", "l1").unwrap().unwrap();
        assert_eq!(loaded.state, LessonState::InProgress);
        assert_eq!(loaded.quiz_scores, vec![0.5, 1.0]);
        assert_eq!(loaded.persona_counts.practice, 2);
        assert!(loaded.query_paths_used.contains(&QueryPath::Practical));
        assert_eq!(db.list_lesson_progress("s1").unwrap().len(), 1);
        assert!(db.get_lesson_progress("s1", "other").unwrap().is_none());
    }

    #[test]
    fn test_interactions_trimmed_to_keep() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            db.append_interaction(
                &InteractionRecord {
                    student_id: "s1".into(),
                    lesson_id: "l1".into(),
                    source: InteractionSource::Quiz,
                    query_path: QueryPath::Assessment,
                    user_input: format!("answer {}", i),
                    response_length: 3,
                    quality_score: Some(1.0),
                    timestamp: Utc::now(),
                },
                3,
            )
            .unwrap();
        }
        let records = db.recent_interactions("s1", "l1", 10).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].user_input, "answer 2");
        assert_eq!(records[2].user_input, "answer 4");
    }

    #[test]
    fn test_snippets_are_per_persona() {
        let db = Database::open_in_memory().unwrap();
        let snippet = MemorySnippet {
            kind: SnippetKind::Conversation,
            content: "how do I practice patience?".into(),
            agent_text: Some("Start with one breath.".into()),
            created_at: Utc::now(),
        };
        db.insert_snippet("s1", Persona::Practice, &snippet).unwrap();
        assert_eq!(db.recent_snippets("s1", Persona::Practice, 10).unwrap().len(), 1);
        assert!(db.recent_snippets("s1", Persona::Concept, 10).unwrap().is_empty());
        assert_eq!(db.count_snippets().unwrap(), 1);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("gurukul.db");
        let db = Database::open(&path).unwrap();
        db.save_student(&StudentRecord::new("s1")).unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        assert!(reopened.get_student("s1").unwrap().is_some());
    }
}
