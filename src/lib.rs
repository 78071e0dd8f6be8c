pub mod agent;
pub mod api;
pub mod config;
pub mod context;
pub mod curriculum;
pub mod db;
pub mod error;
pub mod generator;
pub mod keywords;
pub mod logging;
pub mod memory;
pub mod openai;
pub mod orchestrator;
pub mod persona;
pub mod progress;
pub mod quiz;
pub mod router;
pub mod transition;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use config::Config;
use curriculum::Curriculum;
use db::Database;
use generator::{ScriptedGenerator, TextGenerator};
use openai::OpenAIClient;
use orchestrator::Orchestrator;

/// How often idle conversation contexts are swept
const CONTEXT_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// First `max` characters of `s`, never splitting a character.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ============ Startup ============

/// Lessons from disk, or an empty curriculum when they can't be loaded. The
/// server still answers chat without lessons.
fn load_curriculum(dir: &Path) -> Curriculum {
    match Curriculum::load_dir(dir) {
        Ok(curriculum) => {
            for warning in curriculum.validate_dependencies() {
                logging::log_curriculum(&format!("Warning: {}", warning));
            }
            curriculum
        }
        Err(e) => {
            logging::log_error(None, &format!("Curriculum not loaded: {}", e));
            Curriculum::empty()
        }
    }
}

fn build_generator(config: &Config) -> Result<Arc<dyn TextGenerator>, generator::GenerationError> {
    match &config.openai_api_key {
        Some(key) => {
            logging::log_agent(None, &format!("Using OpenAI model {}", config.model));
            Ok(Arc::new(OpenAIClient::new(key, &config.model, config.temperature)?))
        }
        None => {
            logging::log_agent(None, "OPENAI_API_KEY not set, using offline replies");
            Ok(Arc::new(ScriptedGenerator::default()))
        }
    }
}

fn spawn_context_sweeper(orchestrator: Arc<Orchestrator>, ttl: chrono::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONTEXT_SWEEP_INTERVAL);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            orchestrator.evict_idle(ttl);
        }
    });
}

// ============ Run ============

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;

    let _log_guard = logging::init_logging(&config.log_dir, &config.log_filter)?;
    match logging::cleanup_old_logs(&config.log_dir) {
        Ok(0) => {}
        Ok(removed) => tracing::info!("Removed {} old log files", removed),
        Err(e) => logging::log_error(None, &format!("Log cleanup failed: {}", e)),
    }

    let db = Arc::new(Database::open(&config.db_path)?);
    let curriculum = load_curriculum(&config.lessons_dir);
    let generator = build_generator(&config)?;

    let orchestrator = Arc::new(Orchestrator::new(
        generator,
        db,
        curriculum,
        config.generation_timeout,
    ));
    spawn_context_sweeper(orchestrator.clone(), config.context_ttl);

    let app = api::router(orchestrator);
    let listener = TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Gurukul listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
