use utoipa::OpenApi;

use crate::api::handlers::{flow, health};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        flow::start_flow,
        flow::flow_status,
        flow::submit_email,
        flow::submit_password,
        flow::submit_code,
        flow::resend,
        flow::external_sign_in,
        flow::identity_observed,
        flow::abandon_flow,
    ),
    components(schemas(
        health::Health,
        flow::types::StartFlowRequest,
        flow::types::StartFlowResponse,
        flow::types::EmailRequest,
        flow::types::PasswordRequest,
        flow::types::CodeRequest,
        flow::types::ExternalSignInRequest,
        flow::types::IdentityObservedRequest,
        flow::types::FlowErrorBody,
        flow::types::FlowResponse,
        flow::types::ObserveResponse,
        crate::flow::Phase,
        crate::flow::FlowError,
        crate::flow::RecoveryAction,
        crate::flow::Audience,
        crate::flow::CodeCheckState,
        crate::identity::MemberInfo,
        crate::identity::TwoFactorSetup,
    )),
    tags(
        (name = "flow", description = "Front-door account access flow API"),
        (name = "health", description = "Service health"),
    )
)]
struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}

#[cfg(test)]
mod tests {
    use super::openapi;

    #[test]
    fn openapi_documents_every_flow_route() {
        let spec = openapi();
        let paths = &spec.paths.paths;
        for path in [
            "/health",
            "/v1/flow",
            "/v1/flow/{flow_id}",
            "/v1/flow/{flow_id}/email",
            "/v1/flow/{flow_id}/password",
            "/v1/flow/{flow_id}/code",
            "/v1/flow/{flow_id}/resend",
            "/v1/flow/{flow_id}/external",
            "/v1/flow/{flow_id}/identity",
            "/v1/flow/{flow_id}/abandon",
        ] {
            assert!(paths.contains_key(path), "missing path: {path}");
        }
    }
}
