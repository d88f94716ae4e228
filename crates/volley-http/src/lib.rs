//! HTTP control surface for the volley sender.
//!
//! Routes are a thin translation layer: parse the body, call the
//! [`SessionCoordinator`], map domain errors onto status codes. All state
//! lives behind the coordinator.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::info;

use volley_core::coordinator::{LoginStep, SessionCoordinator, StatusSnapshot};
use volley_core::domain::SendMode;
use volley_core::errors::{AuthError, ProviderError};
use volley_core::Error;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
}

/// Build the full route table over a shared coordinator.
pub fn router(coordinator: Arc<SessionCoordinator>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/auth/request-code", post(request_code_handler))
        .route("/auth/code", post(submit_code_handler))
        .route("/auth/password", post(submit_password_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/send", post(start_send_handler))
        .route("/send/stop", post(stop_send_handler))
        .route("/monitor/target", post(monitor_target_handler))
        .with_state(AppState { coordinator })
}

/// Bind and serve until the listener fails or the process is stopped.
pub async fn serve(bind: &str, coordinator: Arc<SessionCoordinator>) -> anyhow::Result<()> {
    let app = router(coordinator);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("listening on {bind}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Domain error carried out of a handler, rendered as a JSON body.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let mut body = json!({ "error": self.0.to_string() });
        if let Some(wait) = self.0.flood_retry_after() {
            body["retry_after_seconds"] = json!(wait.as_secs());
        }
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Auth(AuthError::InvalidPhoneNumber) => StatusCode::BAD_REQUEST,
        Error::Auth(_) => StatusCode::UNAUTHORIZED,
        Error::NotAuthenticated => StatusCode::UNAUTHORIZED,
        Error::NoPendingLogin | Error::AlreadyRunning => StatusCode::CONFLICT,
        Error::Provider(ProviderError::InvalidTarget(_)) => StatusCode::BAD_REQUEST,
        Error::Provider(ProviderError::Flood { .. }) => StatusCode::TOO_MANY_REQUESTS,
        Error::Provider(ProviderError::Disconnected) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.coordinator.status().await)
}

#[derive(serde::Deserialize)]
struct RequestCodeBody {
    phone: String,
}

async fn request_code_handler(
    State(state): State<AppState>,
    Json(body): Json<RequestCodeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.request_code(&body.phone).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(serde::Deserialize)]
struct SubmitCodeBody {
    code: String,
}

async fn submit_code_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitCodeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let step = state.coordinator.submit_code(&body.code).await?;
    Ok(Json(json!({
        "authenticated": step == LoginStep::Authenticated,
        "needs_password": step == LoginStep::NeedsPassword,
    })))
}

#[derive(serde::Deserialize)]
struct SubmitPasswordBody {
    password: String,
}

async fn submit_password_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitPasswordBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.submit_password(&body.password).await?;
    Ok(Json(json!({ "authenticated": true })))
}

async fn logout_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.coordinator.logout().await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(serde::Deserialize)]
struct SendBody {
    recipient: String,
    mode: SendMode,
    /// Pre-split rows of cells, as the table UI submits them.
    rows: Option<Vec<Vec<String>>>,
    /// Raw pasted text, one row per line, cells split on commas.
    text: Option<String>,
}

async fn start_send_handler(
    State(state): State<AppState>,
    Json(body): Json<SendBody>,
) -> Response {
    let rows = match (body.rows, body.text.as_deref()) {
        (Some(rows), _) if !rows.is_empty() => rows,
        (_, Some(text)) => parse_rows(text),
        _ => Vec::new(),
    };
    if rows.iter().all(Vec::is_empty) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "nothing to send" })),
        )
            .into_response();
    }

    match state
        .coordinator
        .start_send(&body.recipient, body.mode, rows)
        .await
    {
        // The job runs detached; progress is reported through /status.
        Ok(_handle) => Json(json!({ "ok": true })).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

async fn stop_send_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let stopped = state.coordinator.stop_send().await;
    Json(json!({ "stopped": stopped }))
}

#[derive(serde::Deserialize)]
struct MonitorTargetBody {
    target: String,
}

async fn monitor_target_handler(
    State(state): State<AppState>,
    Json(body): Json<MonitorTargetBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let peer = state.coordinator.set_monitor_target(&body.target).await?;
    Ok(Json(json!({ "ok": true, "target": peer.name })))
}

/// Split pasted text into rows of cells. One row per line, cells on
/// commas, blank cells and blank lines dropped.
fn parse_rows(text: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| {
            line.split(',')
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|cells| !cells.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pasted_text_splits_into_rows_and_cells() {
        let rows = parse_rows("1, 2\n3,4\n\n5");
        assert_eq!(
            rows,
            vec![
                vec!["1".to_string(), "2".to_string()],
                vec!["3".to_string(), "4".to_string()],
                vec!["5".to_string()],
            ]
        );
    }

    #[test]
    fn blank_cells_and_lines_are_dropped() {
        assert!(parse_rows("").is_empty());
        assert!(parse_rows("  \n,,\n").is_empty());
        assert_eq!(
            parse_rows("a,,b"),
            vec![vec!["a".to_string(), "b".to_string()]]
        );
    }

    #[test]
    fn auth_failures_map_to_unauthorized() {
        assert_eq!(
            status_for(&AuthError::InvalidCode.into()),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&Error::NotAuthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&AuthError::InvalidPhoneNumber.into()),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn job_and_login_conflicts_map_to_conflict() {
        assert_eq!(status_for(&Error::AlreadyRunning), StatusCode::CONFLICT);
        assert_eq!(status_for(&Error::NoPendingLogin), StatusCode::CONFLICT);
    }

    #[test]
    fn provider_failures_map_by_kind() {
        assert_eq!(
            status_for(&ProviderError::InvalidTarget("@nobody".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(
                &ProviderError::Flood {
                    retry_after: Duration::from_secs(30),
                }
                .into()
            ),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&ProviderError::Disconnected.into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&Error::External("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn flood_responses_carry_the_backoff() {
        let err = ApiError(
            ProviderError::Flood {
                retry_after: Duration::from_secs(42),
            }
            .into(),
        );
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
