//! Request/response types for flow endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::flow::{CodeCheckState, FlowError, FlowReply, Phase, RecoveryAction};
use crate::identity::{MemberInfo, TwoFactorSetup};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StartFlowRequest {
    pub audience: crate::flow::Audience,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct StartFlowResponse {
    pub flow_id: String,
    /// Presented on every subsequent request via `X-Gatehouse-Flow`.
    pub flow_token: String,
    pub phase: Phase,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct PasswordRequest {
    pub password: String,
    /// Required when starting enrollment from `portal_creatable`.
    pub display_name: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CodeRequest {
    pub code: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ExternalSignInRequest {
    pub provider_token: String,
    pub email: String,
    pub is_new_identity: bool,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct IdentityObservedRequest {
    pub token: String,
}

/// Normalized failure with the next recoverable action.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct FlowErrorBody {
    pub error: FlowError,
    pub message: String,
    pub recovery: RecoveryAction,
    pub clear_password: bool,
    pub clear_code: bool,
}

impl From<FlowError> for FlowErrorBody {
    fn from(error: FlowError) -> Self {
        Self {
            message: error.to_string(),
            recovery: error.recovery(),
            clear_password: error.clears_password(),
            clear_code: error.clears_code(),
            error,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct FlowResponse {
    pub phase: Phase,
    pub error: Option<FlowErrorBody>,
    pub member: Option<MemberInfo>,
    pub setup: Option<TwoFactorSetup>,
    /// Present exactly once, when enrollment completes.
    pub backup_codes: Option<Vec<String>>,
    pub session_token: Option<String>,
    pub retry_after_seconds: Option<u64>,
    /// Progress of the current code verification, on status reads.
    pub code_check: Option<CodeCheckState>,
}

impl From<FlowReply> for FlowResponse {
    fn from(reply: FlowReply) -> Self {
        Self {
            phase: reply.phase,
            error: reply.error.map(FlowErrorBody::from),
            member: reply.member,
            setup: reply.setup,
            backup_codes: reply.backup_codes,
            session_token: reply.session.map(|token| token.expose().to_string()),
            retry_after_seconds: reply.retry_after_seconds,
            code_check: None,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ObserveResponse {
    pub phase: Phase,
    /// True when the signal was deferred because a check was still running
    /// or the phase does not accept it yet.
    pub deferred: bool,
    pub session_token: Option<String>,
}
