use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Json,
    },
};
use crew_core::{
    bootstrap, config,
    db::Db,
    dispatcher::Dispatcher,
    events::EventBus,
    router::Router,
    types::{AgentProfile, Approval, NewTask, TaskStatus},
    workflow::Workflow,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub bus: EventBus,
    pub home: PathBuf,
    pub start_time: Instant,
    pub dispatcher: Arc<Dispatcher>,
    pub router: Arc<Router>,
}

impl AppState {
    fn workflow(&self) -> Workflow {
        Workflow::new(Arc::clone(&self.db), self.bus.clone())
    }
}

// ── Error helpers ─────────────────────────────────────────────────────────

fn internal(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    tracing::error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn bad_request(message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.to_string() })),
    )
}

fn not_found(message: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": message.to_string() })),
    )
}

// ── Request bodies ────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
    pub repo_path: Option<String>,
    #[serde(default = "default_agent_count")]
    pub agent_count: usize,
    #[serde(default)]
    pub model: String,
}

fn default_agent_count() -> usize {
    2
}

#[derive(Deserialize)]
pub struct TeamQuery {
    pub team: String,
}

#[derive(Deserialize)]
pub struct CreateTaskBody {
    pub team: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub dri: Option<String>,
}

#[derive(Deserialize)]
pub struct RejectBody {
    pub team: String,
    pub reason: String,
}

#[derive(Deserialize)]
pub struct AssignBody {
    pub team: String,
    pub dri: String,
}

#[derive(Deserialize)]
pub struct TeamActionBody {
    pub team: String,
}

#[derive(Deserialize)]
pub struct MessagesQuery {
    pub team: String,
    pub agent: String,
    #[serde(default)]
    pub peer: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct SendMessageBody {
    pub team: String,
    pub recipient: String,
    pub body: String,
    pub sender: Option<String>,
}

// ── Projects ──────────────────────────────────────────────────────────────

pub async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let teams = state.db.list_teams().map_err(internal)?;
    let mut projects = Vec::new();
    for team in teams {
        let agents = config::read_roster(&state.home, &team).map_err(internal)?;
        projects.push(json!({
            "name": team,
            "agents": agents.iter().map(|a| &a.name).collect::<Vec<_>>(),
        }));
    }
    Ok(Json(json!({ "projects": projects })))
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if let Err(e) = bootstrap::validate_team_name(&body.name) {
        return Err(bad_request(e));
    }

    let names = bootstrap::default_agent_names(body.agent_count.max(1));
    let mut agents = vec![AgentProfile {
        name: format!("{}-manager", body.name),
        role: "manager".into(),
        model: body.model.clone(),
    }];
    agents.extend(names.into_iter().map(|name| AgentProfile {
        name,
        role: "engineer".into(),
        model: body.model.clone(),
    }));

    bootstrap::bootstrap(&state.home, &state.db, &body.name, &agents).map_err(internal)?;

    if let Some(repo_path) = &body.repo_path {
        bootstrap::register_repo(
            &state.home,
            &state.db,
            &body.name,
            std::path::Path::new(repo_path),
            None,
            Approval::Auto,
            None,
        )
        .map_err(bad_request)?;
    }

    state
        .bus
        .broadcast(crew_core::events::Event::teams_refresh());
    Ok((StatusCode::CREATED, Json(json!({ "name": body.name }))))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<TeamQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let tasks = state.db.list_tasks(&q.team, None).map_err(internal)?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTaskBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if !state.db.team_exists(&body.team).map_err(internal)? {
        return Err(not_found(format!("unknown team '{}'", body.team)));
    }
    let task = state
        .db
        .create_task(
            &body.team,
            NewTask {
                title: body.title,
                description: body.description,
                dri: None,
            },
        )
        .map_err(internal)?;
    if let Some(dri) = body.dri {
        let task = state
            .workflow()
            .assign_task(&body.team, task.id, &dri)
            .map_err(bad_request)?;
        return Ok((StatusCode::CREATED, Json(json!({ "task": task }))));
    }
    Ok((StatusCode::CREATED, Json(json!({ "task": task }))))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<TeamQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .db
        .get_task(&q.team, id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("task #{id} not found")))?;
    Ok(Json(json!({ "task": task })))
}

pub async fn reject_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RejectBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .db
        .get_task(&body.team, id)
        .map_err(internal)?
        .ok_or_else(|| not_found(format!("task #{id} not found")))?;
    if !matches!(task.status, TaskStatus::InReview | TaskStatus::InApproval) {
        return Err(bad_request(format!(
            "task #{id} is '{}'; only in_review or in_approval tasks can be rejected",
            task.status
        )));
    }
    let manager = config::team_manager(&state.home, &body.team);
    let task = state
        .workflow()
        .reject(&body.team, id, &body.reason, manager.as_deref())
        .map_err(internal)?;
    Ok(Json(json!({ "task": task })))
}

pub async fn assign_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AssignBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let roster = config::read_roster(&state.home, &body.team).map_err(internal)?;
    if !roster.iter().any(|a| a.name == body.dri) {
        return Err(bad_request(format!(
            "'{}' is not an agent of team '{}'",
            body.dri, body.team
        )));
    }
    let task = state
        .workflow()
        .assign_task(&body.team, id, &body.dri)
        .map_err(bad_request)?;
    Ok(Json(json!({ "task": task })))
}

pub async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TeamActionBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .workflow()
        .approve_review(&body.team, id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "task": task })))
}

pub async fn release_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TeamActionBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .workflow()
        .release_to_merge(&body.team, id, true)
        .map_err(bad_request)?;
    Ok(Json(json!({ "task": task })))
}

pub async fn discard_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TeamActionBody>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let task = state
        .workflow()
        .discard(&body.team, id)
        .map_err(bad_request)?;
    Ok(Json(json!({ "task": task })))
}

// ── Messages ──────────────────────────────────────────────────────────────

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let messages = state
        .db
        .recent_conversation(&q.team, &q.agent, q.peer.as_deref(), q.limit.unwrap_or(50))
        .map_err(internal)?;
    Ok(Json(json!({ "messages": messages })))
}

pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let sender = body
        .sender
        .or_else(|| config::get_boss(&state.home))
        .ok_or_else(|| bad_request("no sender given and no boss configured"))?;
    let id = state
        .db
        .send_message(&body.team, &sender, &body.recipient, &body.body)
        .map_err(internal)?;
    state.bus.broadcast(crew_core::events::Event::message_delivered(
        &body.team,
        &sender,
        &body.recipient,
    ));
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// Drain boss-bound messages the Router queued for the UI.
pub async fn drain_notifications(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "notifications": state.router.boss_queue.drain() }))
}

// ── Status ────────────────────────────────────────────────────────────────

pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let teams = state.db.list_teams().map_err(internal)?;
    Ok(Json(json!({
        "uptime_seconds": state.start_time.elapsed().as_secs(),
        "teams": teams,
        "turns_in_flight": state.dispatcher.in_flight_count(),
    })))
}

// ── SSE events ────────────────────────────────────────────────────────────

pub async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let rx = state.bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok::<_, std::convert::Infallible>(SseEvent::default().data(data)))
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("ping"),
    )
}

// ── Route table ───────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> axum::Router {
    use axum::routing::{get, post};
    axum::Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task))
        .route("/tasks/:id/reject", post(reject_task))
        .route("/tasks/:id/assign", post(assign_task))
        .route("/tasks/:id/approve", post(approve_task))
        .route("/tasks/:id/release", post(release_task))
        .route("/tasks/:id/discard", post(discard_task))
        .route("/messages", get(list_messages).post(send_message))
        .route("/notifications", get(drain_notifications))
        .route("/status", get(get_status))
        .route("/events", get(sse_events))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
