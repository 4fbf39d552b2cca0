//! HTTP API over the session service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bellhop::{AuthOutcome, BellhopError, SessionId, SessionService, VisibilityMode};
use serde::Deserialize;
use serde_json::json;

pub fn router(service: Arc<SessionService>) -> Router {
	Router::new()
		.route("/healthz", get(healthz))
		.route("/sessions", post(create_session))
		.route("/sessions/{id}", get(session_info))
		.route("/sessions/{id}", delete(close_session))
		.route("/sessions/{id}/authenticate", post(authenticate))
		.route("/sessions/{id}/switch-user", post(switch_user))
		.route("/sessions/{id}/visibility", post(switch_visibility))
		.route("/sessions/{id}/probe", get(probe))
		.with_state(service)
}

struct ApiError {
	status: StatusCode,
	message: String,
}

impl ApiError {
	fn bad_request(message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			message: message.into(),
		}
	}
}

impl From<BellhopError> for ApiError {
	fn from(err: BellhopError) -> Self {
		let status = match &err {
			BellhopError::NotFound(_) => StatusCode::NOT_FOUND,
			BellhopError::SessionBusy(_) => StatusCode::CONFLICT,
			BellhopError::ResourceAllocation(_) => StatusCode::SERVICE_UNAVAILABLE,
			BellhopError::Config(_) => StatusCode::BAD_REQUEST,
			BellhopError::SolverUnavailable(_) | BellhopError::SolverTimeout | BellhopError::Mailbox(_) => StatusCode::BAD_GATEWAY,
			BellhopError::ChallengeUnsolvable { .. } | BellhopError::OtpRejected | BellhopError::OtpTimeout => StatusCode::BAD_GATEWAY,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		Self { status, message: err.to_string() }
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(self.status, Json(json!({ "error": self.message }))).into_response()
	}
}

fn parse_id(raw: &str) -> Result<SessionId, ApiError> {
	raw.parse().map_err(|_| ApiError::bad_request(format!("invalid session id: {raw}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
	#[serde(default)]
	owner: Option<String>,
	/// Run the login ritual as part of creation.
	#[serde(default)]
	authenticate: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchUserRequest {
	account: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VisibilityRequest {
	mode: VisibilityMode,
}

async fn healthz(State(service): State<Arc<SessionService>>) -> impl IntoResponse {
	Json(json!({ "status": "ok", "sessions": service.lifecycle().registry().len() }))
}

async fn create_session(State(service): State<Arc<SessionService>>, Json(req): Json<CreateSessionRequest>) -> Result<Response, ApiError> {
	if req.authenticate {
		let (id, outcome) = service.create_authenticated_session(req.owner).await?;
		return Ok((StatusCode::CREATED, Json(json!({ "id": id, "auth": outcome }))).into_response());
	}
	let id = service.create_session(req.owner).await?;
	Ok((StatusCode::CREATED, Json(json!({ "id": id }))).into_response())
}

async fn authenticate(State(service): State<Arc<SessionService>>, Path(id): Path<String>) -> Result<Response, ApiError> {
	match service.authenticate(parse_id(&id)?).await? {
		outcome @ AuthOutcome::Authenticated { .. } => Ok(Json(outcome).into_response()),
		AuthOutcome::Failed { reason } => Err(service.failure_error(reason).into()),
	}
}

async fn switch_user(State(service): State<Arc<SessionService>>, Path(id): Path<String>, Json(req): Json<SwitchUserRequest>) -> Result<Response, ApiError> {
	service.switch_user(parse_id(&id)?, &req.account).await?;
	Ok(StatusCode::NO_CONTENT.into_response())
}

async fn switch_visibility(State(service): State<Arc<SessionService>>, Path(id): Path<String>, Json(req): Json<VisibilityRequest>) -> Result<Response, ApiError> {
	service.switch_visibility(parse_id(&id)?, req.mode).await?;
	Ok(StatusCode::NO_CONTENT.into_response())
}

async fn probe(State(service): State<Arc<SessionService>>, Path(id): Path<String>) -> Result<Response, ApiError> {
	let authenticated = service.test_authentication(parse_id(&id)?).await?;
	Ok(Json(json!({ "authenticated": authenticated })).into_response())
}

async fn session_info(State(service): State<Arc<SessionService>>, Path(id): Path<String>) -> Result<Response, ApiError> {
	let info = service.session_info(parse_id(&id)?).await?;
	Ok(Json(info).into_response())
}

async fn close_session(State(service): State<Arc<SessionService>>, Path(id): Path<String>) -> Result<Response, ApiError> {
	service.close_session(parse_id(&id)?).await?;
	Ok(StatusCode::NO_CONTENT.into_response())
}
