//! Operator dashboard: status, configuration, manual push and log filter.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::admission::{AdmissionPool, AdmissionStats};
use super::error::{ApiError, ApiResult};
use super::session::{SessionManager, cookie_name};
use crate::config::ConfigStore;
use crate::logging::LoggingConfig;
use crate::push::{Journal, JournalSnapshot};
use crate::status::{NamedStatus, StatusRegistry};

/// Starts a full push on request.
pub trait PushTrigger: Send + Sync {
    /// Returns `false` when a push is already running.
    fn push_now(&self) -> bool;
}

/// Shared state of the dashboard handlers.
#[derive(Clone)]
pub struct DashboardState {
    pub config: Arc<ConfigStore>,
    pub journal: Arc<Journal>,
    pub status: Arc<StatusRegistry>,
    pub sessions: Arc<SessionManager>,
    pub admission: Arc<AdmissionPool>,
    pub push: Arc<dyn PushTrigger>,
    pub logging: Option<Arc<LoggingConfig>>,
    /// Port the dashboard listens on; names the session cookie.
    pub port: u16,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub statuses: Vec<NamedStatus>,
    pub journal: JournalSnapshot,
    pub admission: AdmissionStats,
    pub sessions: usize,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub generation: u64,
    pub file: Option<String>,
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    pub started: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogFilter {
    pub filter: String,
}

pub fn dashboard_router(state: DashboardState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/config", get(get_config))
        .route("/push", post(start_push))
        .route("/log-filter", get(get_log_filter).put(update_log_filter))
        .layer(middleware::from_fn_with_state(state.clone(), session_cookie))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Attach the session for this request, issuing a cookie for new sessions.
async fn session_cookie(
    State(state): State<DashboardState>,
    request: Request,
    next: Next,
) -> Response {
    let name = cookie_name(state.port);
    let presented = request
        .headers()
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string());

    let session = state.sessions.get_or_create(presented.as_deref());
    let mut response = next.run(request).await;

    if session.is_new {
        let cookie = format!("{name}={}; Path=/; HttpOnly; SameSite=Strict", session.id);
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Could not encode session cookie"),
        }
    }
    response
}

async fn get_status(State(state): State<DashboardState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        statuses: state.status.collect(),
        journal: state.journal.snapshot(),
        admission: state.admission.stats(),
        sessions: state.sessions.len(),
    })
}

async fn get_config(State(state): State<DashboardState>) -> Json<ConfigResponse> {
    let snapshot = state.config.snapshot();
    Json(ConfigResponse {
        generation: snapshot.generation(),
        file: state
            .config
            .config_file()
            .map(|path| path.display().to_string()),
        values: snapshot.raw_values(),
    })
}

async fn start_push(State(state): State<DashboardState>) -> ApiResult<Response> {
    if state.push.push_now() {
        info!("Full push requested from dashboard");
        Ok((StatusCode::ACCEPTED, Json(PushResponse { started: true })).into_response())
    } else {
        Err(ApiError::conflict("A full push is already in progress"))
    }
}

fn logging(state: &DashboardState) -> ApiResult<&Arc<LoggingConfig>> {
    state
        .logging
        .as_ref()
        .ok_or_else(|| ApiError::service_unavailable("Logging configuration not available"))
}

async fn get_log_filter(State(state): State<DashboardState>) -> ApiResult<Json<LogFilter>> {
    Ok(Json(LogFilter {
        filter: logging(&state)?.get_filter(),
    }))
}

async fn update_log_filter(
    State(state): State<DashboardState>,
    Json(request): Json<LogFilter>,
) -> ApiResult<Json<LogFilter>> {
    logging(&state)?
        .set_filter(&request.filter)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    info!(filter = %request.filter, "Log filter updated from dashboard");
    Ok(Json(request))
}
