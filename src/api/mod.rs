use crate::cli::globals::GlobalArgs;
use crate::flow::{FlowEngine, FlowTiming};
use crate::identity::HttpIdentityBackend;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{get, post},
    Router,
};
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug_span, info, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use openapi::openapi;

use handlers::flow::rate_limit::NoopRateLimiter;
use handlers::flow::FlowState;

pub const GIT_COMMIT_HASH: &str = match crate::built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, globals: &GlobalArgs) -> Result<()> {
    let backend = HttpIdentityBackend::new(&globals.identity_url, globals.identity_token.clone())
        .context("Failed to build identity backend client")?;

    let engine = Arc::new(FlowEngine::new(Arc::new(backend), FlowTiming::new()));
    // Expired flow instances and credential drafts die in the background.
    let _sweeper = engine.spawn_sweeper(SWEEP_INTERVAL);

    let flow_state = Arc::new(FlowState::new(
        Arc::clone(&engine),
        Arc::new(NoopRateLimiter),
    ));

    let origin = frontend_origin(&globals.frontend_url)?;
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(handlers::flow::FLOW_TOKEN_HEADER),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(origin))
        .allow_credentials(true);

    let app = Router::new()
        .route("/", get(handlers::root::root))
        .route(
            "/health",
            get(handlers::health::health).options(handlers::health::health),
        )
        .route("/v1/flow", post(handlers::flow::start_flow))
        .route("/v1/flow/:flow_id", get(handlers::flow::flow_status))
        .route("/v1/flow/:flow_id/email", post(handlers::flow::submit_email))
        .route(
            "/v1/flow/:flow_id/password",
            post(handlers::flow::submit_password),
        )
        .route("/v1/flow/:flow_id/code", post(handlers::flow::submit_code))
        .route("/v1/flow/:flow_id/resend", post(handlers::flow::resend))
        .route(
            "/v1/flow/:flow_id/external",
            post(handlers::flow::external_sign_in),
        )
        .route(
            "/v1/flow/:flow_id/identity",
            post(handlers::flow::identity_observed),
        )
        .route(
            "/v1/flow/:flow_id/abandon",
            post(handlers::flow::abandon_flow),
        )
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(flow_state)),
        );

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

/// Exact CORS origin for the configured frontend.
fn frontend_origin(frontend_url: &str) -> Result<HeaderValue> {
    let url = Url::parse(frontend_url).context("Error parsing frontend URL")?;
    let origin = url.origin().ascii_serialization();
    HeaderValue::from_str(&origin).context("Error building CORS origin header")
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    debug_span!("http-request", path, ?headers, request_id)
}

#[cfg(test)]
mod tests {
    use super::frontend_origin;

    #[test]
    fn frontend_origin_strips_paths() {
        let origin = frontend_origin("https://portal.example.org/app/").expect("origin parses");
        assert_eq!(origin.to_str().ok(), Some("https://portal.example.org"));
    }

    #[test]
    fn frontend_origin_keeps_explicit_ports() {
        let origin = frontend_origin("http://localhost:5173").expect("origin parses");
        assert_eq!(origin.to_str().ok(), Some("http://localhost:5173"));
    }

    #[test]
    fn frontend_origin_rejects_garbage() {
        assert!(frontend_origin("not a url").is_err());
    }
}
