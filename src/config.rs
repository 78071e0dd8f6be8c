//! Runtime configuration read from the environment (and `.env`).

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GurukulError, Result};

const DEFAULT_BIND: &str = "0.0.0.0:8000";
const DEFAULT_LESSONS_DIR: &str = "./curriculum/lessons";
const DEFAULT_DB_PATH: &str = "./gurukul.db";
const DEFAULT_LOG_DIR: &str = "./logs";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONTEXT_TTL_HOURS: i64 = 6;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub lessons_dir: PathBuf,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_filter: String,
    pub openai_api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub generation_timeout: Duration,
    pub context_ttl: chrono::Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.to_string(),
            lessons_dir: PathBuf::from(DEFAULT_LESSONS_DIR),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            log_filter: "info".to_string(),
            openai_api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            generation_timeout: Duration::from_secs(DEFAULT_GENERATION_TIMEOUT_SECS),
            context_ttl: chrono::Duration::hours(DEFAULT_CONTEXT_TTL_HOURS),
        }
    }
}

impl Config {
    /// Load `.env` if present, then read every setting from the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let timeout_secs: u64 = parse_or(
            get("GURUKUL_GENERATION_TIMEOUT_SECS"),
            "GURUKUL_GENERATION_TIMEOUT_SECS",
            DEFAULT_GENERATION_TIMEOUT_SECS,
        )?;
        let ttl_hours: i64 = parse_or(
            get("GURUKUL_CONTEXT_TTL_HOURS"),
            "GURUKUL_CONTEXT_TTL_HOURS",
            DEFAULT_CONTEXT_TTL_HOURS,
        )?;
        if ttl_hours <= 0 {
            return Err(GurukulError::Config(
                "GURUKUL_CONTEXT_TTL_HOURS must be positive".to_string(),
            ));
        }

        Ok(Self {
            bind_addr: get("GURUKUL_BIND").unwrap_or(defaults.bind_addr),
            lessons_dir: get("GURUKUL_LESSONS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.lessons_dir),
            db_path: get("GURUKUL_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            log_dir: get("GURUKUL_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.log_dir),
            log_filter: get("GURUKUL_LOG").unwrap_or(defaults.log_filter),
            openai_api_key: get("OPENAI_API_KEY"),
            model: get("GURUKUL_MODEL").unwrap_or(defaults.model),
            temperature: parse_or(
                get("GURUKUL_TEMPERATURE"),
                "GURUKUL_TEMPERATURE",
                DEFAULT_TEMPERATURE,
            )?,
            generation_timeout: Duration::from_secs(timeout_secs),
            context_ttl: chrono::Duration::hours(ttl_hours),
        })
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| GurukulError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.generation_timeout, Duration::from_secs(30));
        assert_eq!(config.context_ttl, chrono::Duration::hours(6));
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("GURUKUL_BIND", "127.0.0.1:9000"),
            ("GURUKUL_TEMPERATURE", "0.2"),
            ("GURUKUL_CONTEXT_TTL_HOURS", "1"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert!((config.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.context_ttl, chrono::Duration::hours(1));
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_blank_key_is_unset() {
        let config = Config::from_lookup(lookup_from(&[("OPENAI_API_KEY", "  ")])).unwrap();
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_malformed_number_is_config_error() {
        let err = Config::from_lookup(lookup_from(&[("GURUKUL_GENERATION_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, GurukulError::Config(_)));
    }

    #[test]
    fn test_ttl_must_be_positive() {
        let err =
            Config::from_lookup(lookup_from(&[("GURUKUL_CONTEXT_TTL_HOURS", "0")])).unwrap_err();
        assert!(matches!(err, GurukulError::Config(_)));
    }
}
