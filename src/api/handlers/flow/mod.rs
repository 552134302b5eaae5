//! Flow endpoints for the member portal and staff console front doors.
//!
//! Flow Overview:
//! 1) `POST /v1/flow` opens a flow instance and returns its bearer token.
//! 2) The UI submits events (`email`, `password`, `code`, `resend`,
//!    `external`, `abandon`) and renders whatever phase comes back.
//! 3) `POST /v1/flow/{id}/identity` is the session watcher's entry point; it
//!    defers instead of granting a session while a check is in flight.
//!
//! Security boundaries:
//! - Every request after open must present the flow token; only its hash is
//!   kept server-side.
//! - Rate limits run before any backend work.
//! - Session tokens appear in exactly one response, on the `authenticated`
//!   phase.

pub mod rate_limit;
mod tokens;
pub mod types;
mod utils;

use axum::{
    extract::{Extension, Path},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::flow::{
    Audience, FlowEngine, FlowError, FlowEvent, FlowPolicy, FlowReply, ObserveOutcome,
};
use crate::identity::{HttpIdentityBackend, IdentityToken};

use rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter};
use tokens::FlowTokens;
use types::{
    CodeRequest, EmailRequest, ExternalSignInRequest, FlowResponse, IdentityObservedRequest,
    ObserveResponse, PasswordRequest, StartFlowRequest, StartFlowResponse,
};
use utils::{extract_client_ip, normalize_email, valid_email};

/// Header carrying the flow bearer token.
pub const FLOW_TOKEN_HEADER: &str = "x-gatehouse-flow";

/// Shared state for the flow endpoints.
pub struct FlowState {
    engine: Arc<FlowEngine<HttpIdentityBackend>>,
    tokens: FlowTokens,
    rate_limiter: Arc<dyn RateLimiter>,
}

impl FlowState {
    #[must_use]
    pub fn new(
        engine: Arc<FlowEngine<HttpIdentityBackend>>,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            engine,
            tokens: FlowTokens::new(),
            rate_limiter,
        }
    }

    fn limited_by_ip(&self, headers: &HeaderMap, action: RateLimitAction) -> bool {
        let client_ip = extract_client_ip(headers);
        self.rate_limiter.check_ip(client_ip.as_deref(), action) == RateLimitDecision::Limited
    }

    fn limited_by_email(&self, email: &str, action: RateLimitAction) -> bool {
        self.rate_limiter.check_email(email, action) == RateLimitDecision::Limited
    }
}

/// Open a new flow instance for an audience.
#[utoipa::path(
    post,
    path = "/v1/flow",
    request_body = StartFlowRequest,
    responses(
        (status = 201, description = "Flow opened", body = StartFlowResponse),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn start_flow(
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<StartFlowRequest>>,
) -> impl IntoResponse {
    let request: StartFlowRequest = match payload {
        Some(Json(payload)) => payload,
        None => return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response(),
    };

    if state.limited_by_ip(&headers, RateLimitAction::StartFlow) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let policy = match request.audience {
        Audience::MemberPortal => FlowPolicy::member(),
        Audience::StaffConsole => FlowPolicy::staff(),
    };

    let flow_id = state.engine.begin(policy);
    let flow_token = match state.tokens.issue(flow_id) {
        Ok(token) => token,
        Err(err) => {
            error!("Failed to issue flow token: {err}");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let response = StartFlowResponse {
        flow_id: flow_id.to_string(),
        flow_token,
        phase: crate::flow::Phase::EmailEntry,
    };
    (StatusCode::CREATED, Json(response)).into_response()
}

/// Current phase of a flow, so a reloaded page can resume mid-flow.
#[utoipa::path(
    get,
    path = "/v1/flow/{flow_id}",
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Current phase", body = FlowResponse),
        (status = 401, description = "Missing or invalid flow token"),
        (status = 410, description = "Flow expired", body = String)
    ),
    tag = "flow"
)]
pub async fn flow_status(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };

    match state.engine.phase(flow_id) {
        Ok(phase) => {
            let mut response = FlowResponse::from(FlowReply::at(phase));
            response.code_check = state.engine.code_check(flow_id).unwrap_or(None);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(_) => expired_response(&state, flow_id),
    }
}

/// Submit an email for classification.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/email",
    request_body = EmailRequest,
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Next phase", body = FlowResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 410, description = "Flow expired", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn submit_email(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<EmailRequest>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return (StatusCode::BAD_REQUEST, "Invalid email".to_string()).into_response();
    }

    if state.limited_by_ip(&headers, RateLimitAction::Lookup)
        || state.limited_by_email(&email, RateLimitAction::Lookup)
    {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let result = state
        .engine
        .submit(flow_id, FlowEvent::EmailSubmitted { email })
        .await;
    reply_response(&state, flow_id, result)
}

/// Submit the primary credential, or start enrollment with a display name.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/password",
    request_body = PasswordRequest,
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Next phase", body = FlowResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 410, description = "Flow expired", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn submit_password(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<PasswordRequest>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    if request.password.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing password".to_string()).into_response();
    }

    if state.limited_by_ip(&headers, RateLimitAction::Verify) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let event = FlowEvent::PasswordSubmitted {
        password: request.password.into(),
        display_name: request.display_name,
    };
    let result = state.engine.submit(flow_id, event).await;
    reply_response(&state, flow_id, result)
}

/// Submit a one-time code (email, two-factor, or first enrollment code).
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/code",
    request_body = CodeRequest,
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Next phase", body = FlowResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 410, description = "Flow expired", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn submit_code(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<CodeRequest>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    let code = request.code.trim().to_string();
    if code.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing code".to_string()).into_response();
    }

    if state.limited_by_ip(&headers, RateLimitAction::Code) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let result = state
        .engine
        .submit(flow_id, FlowEvent::CodeSubmitted { code })
        .await;
    reply_response(&state, flow_id, result)
}

/// Request a fresh challenge, invalidating the previous one.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/resend",
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Next phase", body = FlowResponse),
        (status = 410, description = "Flow expired", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn resend(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };

    if state.limited_by_ip(&headers, RateLimitAction::Resend) {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let result = state.engine.submit(flow_id, FlowEvent::ResendRequested).await;
    reply_response(&state, flow_id, result)
}

/// Federated provider callback relay.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/external",
    request_body = ExternalSignInRequest,
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Next phase", body = FlowResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 410, description = "Flow expired", body = String),
        (status = 429, description = "Rate limited", body = String)
    ),
    tag = "flow"
)]
pub async fn external_sign_in(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<ExternalSignInRequest>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };

    let email = normalize_email(&request.email);
    if !valid_email(&email) || request.provider_token.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Invalid provider result".to_string()).into_response();
    }

    if state.limited_by_ip(&headers, RateLimitAction::Verify)
        || state.limited_by_email(&email, RateLimitAction::Verify)
    {
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limited".to_string()).into_response();
    }

    let event = FlowEvent::ExternalSignInCompleted {
        token: IdentityToken::new(request.provider_token.trim()),
        email,
        is_new_identity: request.is_new_identity,
    };
    let result = state.engine.submit(flow_id, event).await;
    reply_response(&state, flow_id, result)
}

/// Session watcher: an ambient identity token was observed.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/identity",
    request_body = IdentityObservedRequest,
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Applied or deferred", body = ObserveResponse),
        (status = 400, description = "Validation error", body = String),
        (status = 410, description = "Flow expired", body = String)
    ),
    tag = "flow"
)]
pub async fn identity_observed(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
    payload: Option<Json<IdentityObservedRequest>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };
    let Some(Json(request)) = payload else {
        return (StatusCode::BAD_REQUEST, "Missing payload".to_string()).into_response();
    };
    if request.token.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing token".to_string()).into_response();
    }

    match state
        .engine
        .observe_identity_token(flow_id, IdentityToken::new(request.token.trim()))
    {
        Ok(ObserveOutcome::Completed(reply)) => {
            let response = ObserveResponse {
                phase: reply.phase,
                deferred: false,
                session_token: reply.session.map(|token| token.expose().to_string()),
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Ok(ObserveOutcome::Deferred(phase)) => {
            let response = ObserveResponse {
                phase,
                deferred: true,
                session_token: None,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(FlowError::SessionExpired) => expired_response(&state, flow_id),
        Err(err) => {
            error!("Identity observation failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Abandon the flow, destroying its credential draft and pending timers.
#[utoipa::path(
    post,
    path = "/v1/flow/{flow_id}/abandon",
    params(
        ("flow_id" = String, Path, description = "Flow instance id"),
        ("X-Gatehouse-Flow" = String, Header, description = "Flow bearer token")
    ),
    responses(
        (status = 200, description = "Flow abandoned", body = FlowResponse),
        (status = 410, description = "Flow expired", body = String)
    ),
    tag = "flow"
)]
pub async fn abandon_flow(
    Path(flow_id): Path<String>,
    headers: HeaderMap,
    state: Extension<Arc<FlowState>>,
) -> impl IntoResponse {
    let flow_id = match authorize_flow(&state, &headers, &flow_id) {
        Ok(flow_id) => flow_id,
        Err(response) => return response,
    };

    let result = state.engine.submit(flow_id, FlowEvent::Abandon).await;
    state.tokens.remove(flow_id);
    reply_response(&state, flow_id, result)
}

fn authorize_flow(
    state: &FlowState,
    headers: &HeaderMap,
    flow_id: &str,
) -> Result<Uuid, axum::response::Response> {
    let Ok(flow_id) = Uuid::parse_str(flow_id.trim()) else {
        return Err((StatusCode::BAD_REQUEST, "Invalid flow id".to_string()).into_response());
    };
    let presented = headers
        .get(FLOW_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let Some(presented) = presented else {
        return Err((StatusCode::UNAUTHORIZED, "Missing flow token".to_string()).into_response());
    };
    if !state.tokens.verify(flow_id, presented) {
        return Err((StatusCode::UNAUTHORIZED, "Invalid flow token".to_string()).into_response());
    }
    Ok(flow_id)
}

fn reply_response(
    state: &FlowState,
    flow_id: Uuid,
    result: Result<FlowReply, FlowError>,
) -> axum::response::Response {
    match result {
        Ok(reply) => (StatusCode::OK, Json(FlowResponse::from(reply))).into_response(),
        Err(FlowError::SessionExpired) => expired_response(state, flow_id),
        Err(err) => {
            error!("Flow submit failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn expired_response(state: &FlowState, flow_id: Uuid) -> axum::response::Response {
    state.tokens.remove(flow_id);
    (StatusCode::GONE, "Flow expired".to_string()).into_response()
}
