//! Structured logging module for Gurukul
//!
//! Events go to the console and to a daily file in the configured log
//! directory, grouped by category:
//! - ROUTING: persona selection and transition suggestions
//! - AGENT: response generation and fallbacks
//! - MEMORY: persona memory and conversation context changes
//! - PROGRESS: lesson lifecycle and quiz results
//! - CURRICULUM: lesson loading and validation
//! - ERROR: errors absorbed or returned to callers

use chrono::Utc;
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{GurukulError, Result};

/// Log file prefix; the appender adds a `.YYYY-MM-DD` suffix.
pub const LOG_FILE_PREFIX: &str = "gurukul.log";

/// Days a log file is kept before `cleanup_old_logs` removes it
const LOG_RETENTION_DAYS: i64 = 7;

/// Log categories for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Routing,
    Agent,
    Memory,
    Progress,
    Curriculum,
    Error,
}

impl LogCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Routing => "ROUTING",
            LogCategory::Agent => "AGENT",
            LogCategory::Memory => "MEMORY",
            LogCategory::Progress => "PROGRESS",
            LogCategory::Curriculum => "CURRICULUM",
            LogCategory::Error => "ERROR",
        }
    }
}

/// Initialize the logging system: console plus a daily rolling file.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process.
pub fn init_logging(log_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .try_init()
        .map_err(|e| GurukulError::Config(format!("logging already initialized: {}", e)))?;

    log(LogCategory::Progress, None, "Gurukul logging initialized");

    Ok(guard)
}

/// Log a message with category and optional student context
pub fn log(category: LogCategory, student_id: Option<&str>, message: &str) {
    let student = student_id.unwrap_or("-");
    match category {
        LogCategory::Error => {
            tracing::error!(category = category.as_str(), student, "{}", message)
        }
        _ => tracing::info!(category = category.as_str(), student, "{}", message),
    }
}

/// Log a routing decision (which persona, why, confidence)
pub fn log_routing(student_id: Option<&str>, message: &str) {
    log(LogCategory::Routing, student_id, message);
}

/// Log an agent response event
pub fn log_agent(student_id: Option<&str>, message: &str) {
    log(LogCategory::Agent, student_id, message);
}

/// Log a memory or context event
pub fn log_memory(student_id: Option<&str>, message: &str) {
    log(LogCategory::Memory, student_id, message);
}

/// Log a lesson or quiz progress event
pub fn log_progress(student_id: Option<&str>, message: &str) {
    log(LogCategory::Progress, student_id, message);
}

/// Log a curriculum loading event
pub fn log_curriculum(message: &str) {
    log(LogCategory::Curriculum, None, message);
}

/// Log an error
pub fn log_error(student_id: Option<&str>, message: &str) {
    log(LogCategory::Error, student_id, message);
}

/// Clean up old log files (keep last 7 days)
pub fn cleanup_old_logs(log_dir: &Path) -> Result<usize> {
    let mut deleted = 0;

    if !log_dir.exists() {
        return Ok(0);
    }

    let cutoff = Utc::now() - chrono::Duration::days(LOG_RETENTION_DAYS);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();

        let is_log = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            if let Ok(modified) = metadata.modified() {
                let modified_time: chrono::DateTime<Utc> = modified.into();
                if modified_time < cutoff && fs::remove_file(&path).is_ok() {
                    deleted += 1;
                }
            }
        }
    }

    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_keeps_fresh_logs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gurukul.log.2026-10-19"), "line\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "unrelated\n").unwrap();

        let deleted = cleanup_old_logs(dir.path()).unwrap();
        assert_eq!(deleted, 0);
        assert!(dir.path().join("gurukul.log.2026-10-19").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn test_cleanup_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(cleanup_old_logs(&missing).unwrap(), 0);
    }
}
