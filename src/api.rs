//! HTTP surface. Handlers parse requests, call the orchestrator and map
//! `GurukulError` to status codes through its `IntoResponse` impl.

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::agent::CallerContext;
use crate::context::ChainSummary;
use crate::curriculum::{LearningPaths, Lesson, LessonRef};
use crate::error::Result;
use crate::memory::PersonaProfile;
use crate::orchestrator::{AgentSuggestion, ChatResponse, HealthStatus, Orchestrator};
use crate::progress::{LessonCompletion, LessonStart, QuizProgress, StudentPreferences, StudentRecord, StudentSummary};
use crate::quiz::{QuizResult, SafeQuestion};
use crate::router::RoutingDecision;

pub type AppState = Arc<Orchestrator>;

// ============ Request Types ============

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub agent_type: String,
    pub student_id: String,
    pub message: String,
    #[serde(default)]
    pub context: Option<CallerContext>,
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ChainSuggestionQuery {
    pub current_agent: String,
    pub user_input: String,
    pub lesson_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LessonQuery {
    pub lesson_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProgressUpdate {
    pub student_id: String,
    pub lesson_id: String,
    pub performance: f64,
    #[serde(default)]
    pub insights: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct LessonStartRequest {
    pub student_id: String,
    pub lesson_id: String,
}

#[derive(Debug, Deserialize)]
pub struct LessonInteractionRequest {
    pub student_id: String,
    pub lesson_id: String,
    pub agent_type: String,
    pub query_path: String,
    pub user_input: String,
}

#[derive(Debug, Deserialize)]
pub struct SuggestAgentQuery {
    pub user_input: String,
    pub current_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LessonCompletionRequest {
    pub student_id: String,
    pub lesson_id: String,
    pub quiz_score: Option<f64>,
    #[serde(default)]
    pub mastery_indicators: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct QuizSubmission {
    pub student_id: String,
    pub lesson_id: String,
    pub quiz_id: String,
    pub answer: Value,
    /// Accepted for compatibility; not scored.
    #[allow(dead_code)]
    pub time_taken: Option<f64>,
    pub agent_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LevelQuery {
    pub category: Option<String>,
}

/// Free-form notes arrive either as a list or as an object; both become
/// plain strings.
fn notes_from(value: Option<Value>) -> Vec<String> {
    let text = |v: &Value| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    match value {
        Some(Value::Array(items)) => items.iter().map(text).collect(),
        Some(Value::Object(map)) => map.iter().map(|(k, v)| format!("{}: {}", k, text(v))).collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => vec![text(&other)],
    }
}

// ============ Router ============

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agents/chat", post(chat))
        .route("/api/agents/route", post(route_message))
        .route("/api/agents/chain-suggestion/{student_id}", get(chain_suggestion))
        .route("/api/agents/chain-summary/{student_id}", get(chain_summary))
        .route("/api/agents/{agent_type}/{student_id}/profile", get(agent_profile))
        .route("/api/agents/progress", post(update_progress))
        .route("/api/lessons/start", post(start_lesson))
        .route("/api/lessons/interact", post(lesson_interaction))
        .route("/api/lessons/suggest-agent/{student_id}", get(suggest_agent))
        .route("/api/lessons/complete", post(complete_lesson))
        .route("/api/students/{student_id}/progress", get(student_progress))
        .route("/api/students/{student_id}/preferences", post(update_preferences))
        .route("/api/quiz/submit", post(submit_quiz))
        .route("/api/quiz/progress/{student_id}/{lesson_id}", get(quiz_progress))
        .route("/api/quiz/questions/{lesson_id}", get(quiz_questions))
        .route("/api/curriculum/lessons", get(list_lessons))
        .route("/api/curriculum/lessons/{lesson_id}", get(get_lesson))
        .route("/api/curriculum/lessons/level/{level}", get(lessons_by_level))
        .route("/api/curriculum/learning-paths", get(learning_paths))
        .route("/api/curriculum/reload", post(reload_curriculum))
        .route("/api/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============ Agents ============

async fn chat(State(orch): State<AppState>, Json(body): Json<ChatRequest>) -> Result<Json<ChatResponse>> {
    let response = orch
        .chat(&body.agent_type, &body.student_id, &body.message, body.context)
        .await?;
    Ok(Json(response))
}

async fn route_message(State(orch): State<AppState>, Json(body): Json<RouteRequest>) -> Json<RoutingDecision> {
    Json(orch.select_initial(&body.message))
}

async fn chain_suggestion(
    State(orch): State<AppState>,
    Path(student_id): Path<String>,
    Query(query): Query<ChainSuggestionQuery>,
) -> Result<Json<RoutingDecision>> {
    let decision = orch.suggest_transition(
        &query.current_agent,
        &query.user_input,
        &student_id,
        query.lesson_id.as_deref(),
    )?;
    Ok(Json(decision))
}

async fn chain_summary(
    State(orch): State<AppState>,
    Path(student_id): Path<String>,
    Query(query): Query<LessonQuery>,
) -> Result<Json<ChainSummary>> {
    Ok(Json(orch.chain_summary(&student_id, query.lesson_id.as_deref())?))
}

async fn agent_profile(
    State(orch): State<AppState>,
    Path((agent_type, student_id)): Path<(String, String)>,
) -> Result<Json<PersonaProfile>> {
    Ok(Json(orch.agent_profile(&agent_type, &student_id)?))
}

async fn update_progress(State(orch): State<AppState>, Json(body): Json<ProgressUpdate>) -> Result<Json<Value>> {
    let insights = notes_from(body.insights);
    let profiles = orch.update_progress(&body.student_id, &body.lesson_id, body.performance, &insights)?;
    Ok(Json(json!({
        "status": "progress_updated",
        "profiles": profiles,
    })))
}

// ============ Lessons ============

async fn start_lesson(State(orch): State<AppState>, Json(body): Json<LessonStartRequest>) -> Result<Json<LessonStart>> {
    Ok(Json(orch.start_lesson(&body.student_id, &body.lesson_id)?))
}

async fn lesson_interaction(
    State(orch): State<AppState>,
    Json(body): Json<LessonInteractionRequest>,
) -> Result<Json<Value>> {
    orch.lesson_interaction(
        &body.student_id,
        &body.lesson_id,
        &body.agent_type,
        &body.query_path,
        &body.user_input,
    )?;
    Ok(Json(json!({ "status": "interaction_recorded" })))
}

async fn suggest_agent(
    State(orch): State<AppState>,
    Path(student_id): Path<String>,
    Query(query): Query<SuggestAgentQuery>,
) -> Result<Json<AgentSuggestion>> {
    let suggestion = orch.suggest_agent(&student_id, &query.user_input, query.current_agent.as_deref())?;
    Ok(Json(suggestion))
}

async fn complete_lesson(
    State(orch): State<AppState>,
    Json(body): Json<LessonCompletionRequest>,
) -> Result<Json<LessonCompletion>> {
    let indicators = notes_from(body.mastery_indicators);
    let completion = orch.complete_lesson(&body.student_id, &body.lesson_id, body.quiz_score, indicators)?;
    Ok(Json(completion))
}

async fn student_progress(State(orch): State<AppState>, Path(student_id): Path<String>) -> Result<Json<StudentSummary>> {
    Ok(Json(orch.student_summary(&student_id)?))
}

async fn update_preferences(
    State(orch): State<AppState>,
    Path(student_id): Path<String>,
    Json(body): Json<StudentPreferences>,
) -> Result<Json<StudentRecord>> {
    Ok(Json(orch.update_preferences(&student_id, body)?))
}

// ============ Quiz ============

async fn submit_quiz(State(orch): State<AppState>, Json(body): Json<QuizSubmission>) -> Result<Json<QuizResult>> {
    let result = orch.submit_quiz(
        &body.student_id,
        &body.lesson_id,
        &body.quiz_id,
        &body.answer,
        body.agent_type.as_deref(),
    )?;
    Ok(Json(result))
}

async fn quiz_progress(
    State(orch): State<AppState>,
    Path((student_id, lesson_id)): Path<(String, String)>,
) -> Result<Json<QuizProgress>> {
    Ok(Json(orch.quiz_progress(&student_id, &lesson_id)?))
}

async fn quiz_questions(State(orch): State<AppState>, Path(lesson_id): Path<String>) -> Result<Json<Vec<SafeQuestion>>> {
    Ok(Json(orch.quiz_questions(&lesson_id)?))
}

// ============ Curriculum ============

async fn list_lessons(State(orch): State<AppState>) -> Json<Vec<LessonRef>> {
    Json(orch.lessons())
}

async fn get_lesson(State(orch): State<AppState>, Path(lesson_id): Path<String>) -> Result<Json<Lesson>> {
    Ok(Json(orch.lesson_detail(&lesson_id)?))
}

async fn lessons_by_level(
    State(orch): State<AppState>,
    Path(level): Path<String>,
    Query(query): Query<LevelQuery>,
) -> Result<Json<Vec<Lesson>>> {
    Ok(Json(orch.lessons_by_level(&level, query.category.as_deref())?))
}

async fn learning_paths(State(orch): State<AppState>) -> Result<Json<LearningPaths>> {
    Ok(Json(orch.learning_paths()?))
}

async fn reload_curriculum(State(orch): State<AppState>) -> Result<Json<Value>> {
    let count = orch.reload_curriculum()?;
    Ok(Json(json!({ "status": "reloaded", "lessons_loaded": count })))
}

async fn health(State(orch): State<AppState>) -> Result<Json<HealthStatus>> {
    Ok(Json(orch.health()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curriculum::tests::sample_curriculum;
    use crate::db::Database;
    use crate::generator::ScriptedGenerator;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> Router {
        let orch = Orchestrator::new(
            Arc::new(ScriptedGenerator::default()),
            Arc::new(Database::open_in_memory().unwrap()),
            sample_curriculum(),
            Duration::from_secs(1),
        );
        router(Arc::new(orch))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health() {
        let app = app();
        let (status, json) = send(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["lessons_loaded"], 4);
        assert_eq!(json["generator"], "scripted");
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let app = app();
        let body = json!({
            "agent_type": "tree",
            "student_id": "s1",
            "message": "Why is compassion important?"
        });
        let (status, json) = send(&app, "POST", "/api/agents/chat", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["agent_type"], "concept");
        assert_eq!(json["student_id"], "s1");
        assert_eq!(json["context"]["reply_kind"], "generated");
        assert_eq!(json["context"]["chain_summary"]["total_interactions"], 1);

        let (status, summary) = send(&app, "GET", "/api/agents/chain-summary/s1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["total_interactions"], 1);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_bad_request() {
        let app = app();
        let body = json!({ "agent_type": "wizard", "student_id": "s1", "message": "hello there" });
        let (status, json) = send(&app, "POST", "/api/agents/chat", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["detail"], "Invalid agent type: wizard");
    }

    #[tokio::test]
    async fn test_route_picks_practice() {
        let app = app();
        let body = json!({ "message": "How do I practice gratitude daily?" });
        let (status, json) = send(&app, "POST", "/api/agents/route", Some(body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recommended_persona"], "practice");
        assert_eq!(json["should_transition"], true);
    }

    #[tokio::test]
    async fn test_chain_suggestion_query() {
        let app = app();
        let uri = "/api/agents/chain-suggestion/s1?current_agent=practice&user_input=What%20does%20this%20mean%20for%20my%20soul%3F";
        let (status, json) = send(&app, "GET", uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recommended_persona"], "reflection");
    }

    #[tokio::test]
    async fn test_missing_chain_is_not_found() {
        let app = app();
        let (status, _) = send(&app, "GET", "/api/agents/chain-summary/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_lesson_quiz_flow() {
        let app = app();
        let start = json!({ "student_id": "s1", "lesson_id": "dharma_seed_001" });
        let (status, json) = send(&app, "POST", "/api/lessons/start", Some(start)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recommended_persona"], "practice");
        assert_eq!(json["query_path"], "practical");

        let (status, questions) = send(&app, "GET", "/api/quiz/questions/dharma_seed_001", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(questions[0].get("correct_answer").is_none());

        let answer = json!({
            "student_id": "s1",
            "lesson_id": "dharma_seed_001",
            "quiz_id": "q1",
            "answer": 0,
            "time_taken": 4.5,
            "agent_type": "seed"
        });
        let (status, result) = send(&app, "POST", "/api/quiz/submit", Some(answer)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["correct"], true);
        assert_eq!(result["agent_feedback"], "Try helping someone today.");
        assert_eq!(result["next_question"]["id"], "q2");

        let (status, progress) = send(&app, "GET", "/api/quiz/progress/s1/dharma_seed_001", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(progress["quiz_attempts"], 1);

        let interaction = json!({
            "student_id": "s1",
            "lesson_id": "dharma_seed_001",
            "agent_type": "sky",
            "query_path": "reflective",
            "user_input": "I keep thinking about why kindness feels good"
        });
        let (status, ack) = send(&app, "POST", "/api/lessons/interact", Some(interaction)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["status"], "interaction_recorded");

        let complete = json!({
            "student_id": "s1",
            "lesson_id": "dharma_seed_001",
            "quiz_score": 0.95,
            "mastery_indicators": { "reflection": "deep" }
        });
        let (status, completion) = send(&app, "POST", "/api/lessons/complete", Some(complete)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(completion["state"], "mastered");

        let (status, summary) = send(&app, "GET", "/api/students/s1/progress", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["lessons_mastered"], 1);
    }

    #[tokio::test]
    async fn test_curriculum_queries() {
        let app = app();
        let (status, lessons) = send(&app, "GET", "/api/curriculum/lessons", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(lessons.as_array().map(Vec::len), Some(4));

        let (status, seed) = send(&app, "GET", "/api/curriculum/lessons/level/seed?category=dharma", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(seed.as_array().map(Vec::len), Some(2));

        let (status, _) = send(&app, "GET", "/api/curriculum/lessons/level/cloud", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "GET", "/api/curriculum/lessons/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, paths) = send(&app, "GET", "/api/curriculum/learning-paths", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paths["dharma"]["Seed"][0], "dharma_seed_001");
    }

    #[test]
    fn test_notes_from_shapes() {
        assert_eq!(notes_from(Some(json!(["a", "b"]))), vec!["a", "b"]);
        assert_eq!(notes_from(Some(json!({ "focus": "good" }))), vec!["focus: good"]);
        assert!(notes_from(None).is_empty());
    }
}
