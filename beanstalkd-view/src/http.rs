/**
 * API HTTP BEANSTALKD-VIEW - Surface web du tableau de bord
 *
 * RÔLE :
 * Expose chaque vue et chaque action du tableau de bord sous forme JSON.
 * Une route = une opération du cœur (agrégation ou routage sur le pool)
 * suivie de la mise en forme de la réponse.
 *
 * ROUTES :
 * - Lecture : /, /tube/{tube}, /peek/{tube}/{type}, /api/tubes, /peeks
 * - Actions : /add_job, /delete/{tube}/{job_id}, /pause, /kick
 * - Supervision : /health, /system/health
 *
 * ERREURS :
 * - Aucune instance joignable -> 503 (état d'erreur dédié, pas de données partielles)
 * - Panne réseau ou réponse inattendue -> 502
 * - Action sans résultat sur aucune instance -> 200 avec { ok: false, message }
 * - Nom de tube hors grammaire beanstalkd -> 400, rien n'est envoyé au démon
 */

use crate::client::is_valid_tube_name;
use crate::error::BeanstalkError;
use crate::models::{self, DashboardView, JobView, PeekKind, Stats, TubePeeks, TubesSummary};
use crate::state::AppState;
use crate::stats;
use axum::extract::{Form, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

const PEEK_MISS: &str = "No job was found, or an error occurred while trying to peek at the next job.";

pub fn build_router(app_state: AppState) -> Router {
    let mount = app_state.cfg.mount_path();
    let routes = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/", get(get_dashboard))
        .route("/tube/{tube}", get(get_tube))
        .route("/peek/{tube}/{kind}", get(peek))
        .route("/api/tubes", get(get_tubes_summary))
        .route("/peeks", get(get_peeks))
        .route("/add_job", post(add_job))
        .route("/delete/{tube}/{job_id}", get(delete_job))
        .route("/pause", post(pause_tube))
        .route("/kick", post(kick))
        .with_state(app_state)
        .layer(middleware::from_fn(log_requests));

    match mount {
        Some(prefix) => Router::new().nest(&prefix, routes),
        None => routes,
    }
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(req).await;
    tracing::debug!(
        "[http] {} {} -> {} ({} ms)",
        method,
        path,
        response.status(),
        started.elapsed().as_millis()
    );
    response
}

#[derive(Debug)]
pub enum AppError {
    Beanstalk(BeanstalkError),
    BadRequest(String),
    NotFound(String),
}

impl From<BeanstalkError> for AppError {
    fn from(err: BeanstalkError) -> Self {
        Self::Beanstalk(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Beanstalk(BeanstalkError::NotConnected) => {
                (StatusCode::SERVICE_UNAVAILABLE, BeanstalkError::NotConnected.to_string())
            }
            AppError::Beanstalk(e @ BeanstalkError::InvalidTubeName(_)) => {
                (StatusCode::BAD_REQUEST, e.to_string())
            }
            AppError::Beanstalk(e) => {
                tracing::warn!("[http] beanstalkd error: {}", e);
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };
        (status, Json(serde_json::json!({ "ok": false, "error": message }))).into_response()
    }
}

/// Résultat d'une action opérateur (remplace le message flash)
#[derive(Debug, Serialize, Deserialize)]
pub struct Outcome {
    pub ok: bool,
    pub message: String,
}

impl Outcome {
    fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self { ok: true, message: message.into() })
    }

    fn failure(message: impl Into<String>) -> Json<Self> {
        Json(Self { ok: false, message: message.into() })
    }
}

/// Entier "à la to_i" : chiffres en tête, sinon 0
fn lenient_u32(raw: &str) -> u32 {
    u32::try_from(lenient_u64(raw)).unwrap_or(u32::MAX)
}

fn lenient_u64(raw: &str) -> u64 {
    models::leading_digits(raw)
}

fn require_tube(tube: &str) -> Result<&str, AppError> {
    let tube = tube.trim();
    if tube.is_empty() {
        return Err(AppError::BadRequest("tube name is required".into()));
    }
    if !is_valid_tube_name(tube) {
        return Err(AppError::BadRequest(format!("invalid tube name: {tube:?}")));
    }
    Ok(tube)
}

// GET / (vue principale)
async fn get_dashboard(State(app): State<AppState>) -> Result<Json<DashboardView>, AppError> {
    Ok(Json(stats::dashboard(&app.pool).await?))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<crate::health::ViewHealth> {
    Json(app.health_tracker.get_health(&app.pool))
}

// GET /tube/{tube} (stats d'un tube)
async fn get_tube(
    State(app): State<AppState>,
    Path(tube): Path<String>,
) -> Result<Json<Stats>, AppError> {
    let tube = require_tube(&tube)?;
    match app.pool.stats_tube(tube).await? {
        Some(stats) => Ok(Json(stats)),
        None => Err(AppError::NotFound(format!("tube {tube} not found"))),
    }
}

// GET /peek/{tube}/{type} (prochain job ready / delayed / buried)
async fn peek(
    State(app): State<AppState>,
    Path((tube, kind)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let tube = require_tube(&tube)?;
    let kind = PeekKind::from_param(&kind);
    let found: Option<JobView> = stats::peek_tube(&app.pool, tube, kind).await?;
    Ok(match found {
        Some(job) => Json(job).into_response(),
        None => Json(serde_json::json!({ "error": PEEK_MISS })).into_response(),
    })
}

// GET /api/tubes (résumé rafraîchi côté client)
async fn get_tubes_summary(State(app): State<AppState>) -> Result<Json<TubesSummary>, AppError> {
    Ok(Json(stats::tubes_summary(&app.pool).await?))
}

// GET /peeks (prochains jobs de tous les tubes)
async fn get_peeks(
    State(app): State<AppState>,
) -> Result<Json<BTreeMap<String, TubePeeks>>, AppError> {
    Ok(Json(stats::peek_all(&app.pool).await?))
}

#[derive(Debug, Deserialize)]
struct AddJobForm {
    tube: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    delay: String,
    #[serde(default)]
    ttr: String,
}

// POST /add_job
async fn add_job(
    State(app): State<AppState>,
    Form(form): Form<AddJobForm>,
) -> Result<Json<Outcome>, AppError> {
    let tube = require_tube(&form.tube)?;
    let body: serde_json::Value = serde_json::from_str(&form.body)
        .map_err(|e| AppError::BadRequest(format!("job body is not valid JSON: {e}")))?;

    // corps stocké : [tube, body]
    let payload = serde_json::json!([tube, body]).to_string().into_bytes();
    let payload = payload.as_slice();
    let (priority, delay, ttr) = (
        lenient_u32(&form.priority),
        lenient_u32(&form.delay),
        lenient_u32(&form.ttr),
    );

    let inserted = app
        .pool
        .on_tube(tube, |conn| async move { conn.put(tube, payload, priority, delay, ttr).await })
        .await?;

    Ok(match inserted {
        Some(id) => Outcome::success(format!("Added job {id}")),
        None => Outcome::failure("Error adding job"),
    })
}

// GET /delete/{tube}/{job_id}
async fn delete_job(
    State(app): State<AppState>,
    Path((tube, job_id)): Path<(String, String)>,
) -> Result<Json<Outcome>, AppError> {
    let tube = require_tube(&tube)?;
    let id = lenient_u64(&job_id);

    let deleted = app
        .pool
        .on_tube(tube, |conn| async move { conn.delete(id).await })
        .await?;

    Ok(match deleted {
        Some(()) => Outcome::success(format!("Deleted Job {job_id}")),
        None => Outcome::failure(format!("Error deleting Job {job_id}")),
    })
}

#[derive(Debug, Deserialize)]
struct PauseForm {
    tube: String,
    #[serde(default)]
    delay: String,
}

// POST /pause
async fn pause_tube(
    State(app): State<AppState>,
    Form(form): Form<PauseForm>,
) -> Result<Json<Outcome>, AppError> {
    let tube = require_tube(&form.tube)?;
    let delay = lenient_u32(&form.delay);

    let paused = app
        .pool
        .on_tube(tube, |conn| async move { conn.pause_tube(tube, delay).await })
        .await?;

    Ok(match paused {
        Some(()) => Outcome::success(format!(
            "Paused {tube}. No jobs will be reserved for {delay} seconds."
        )),
        None => Outcome::failure(format!("Error pausing {tube}.")),
    })
}

#[derive(Debug, Deserialize)]
struct KickForm {
    tube: String,
    #[serde(default)]
    bound: String,
}

// POST /kick
async fn kick(
    State(app): State<AppState>,
    Form(form): Form<KickForm>,
) -> Result<Json<Outcome>, AppError> {
    let tube = require_tube(&form.tube)?;
    let bound = lenient_u32(&form.bound);

    let kicked = app
        .pool
        .on_tube(tube, |conn| async move { conn.kick(tube, bound).await })
        .await?;

    Ok(match kicked {
        Some(count) => Outcome::success(format!("Kicked {tube} for {count} jobs.")),
        None => Outcome::failure(format!("Error kicking {tube}.")),
    })
}
