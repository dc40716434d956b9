use std::net::SocketAddr;

use axum::extract::{Request, State};
use axum::http::header;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use trio_core::CompletionError;
use trio_wire::{ArchitectRequest, DeveloperRequest, ErrorEnvelope, HealthResponse, PromptRequest};

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("trio server listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/global/health", get(global_health))
        .route("/agents/ba", post(run_business_analyst))
        .route("/agents/system-architect", post(run_system_architect))
        .route("/agents/developer", post(run_developer))
        .layer(cors)
        .layer(middleware::from_fn_with_state(state.clone(), auth_gate))
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    if request.uri().path() == "/global/health" {
        return next.run(request).await;
    }

    let Some(expected) = state.api_token() else {
        return next.run(request).await;
    };

    let provided = extract_request_token(request.headers());
    if provided.as_deref() == Some(expected) {
        return next.run(request).await;
    }

    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(ErrorEnvelope {
            error: "Unauthorized: missing or invalid API token".to_string(),
            code: Some("AUTH_REQUIRED".to_string()),
        }),
    )
        .into_response()
}

fn extract_request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-trio-token")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())?;
    let trimmed = auth.trim();
    let bearer = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?;
    let token = bearer.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

async fn root() -> impl IntoResponse {
    Json(json!({"Hello": "World"}))
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let providers = state
        .providers
        .list()
        .into_iter()
        .map(|p| p.id)
        .collect::<Vec<_>>();
    Json(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_token_required: state.api_token().is_some(),
        providers,
    })
}

// Each handler owns a token that is cancelled when the handler future is
// dropped, which aborts the in-flight completion call on client disconnect.

async fn run_business_analyst(
    State(state): State<AppState>,
    Json(input): Json<PromptRequest>,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state.runner.business_analyst(input, cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => cancelled_response(err),
    }
}

async fn run_system_architect(
    State(state): State<AppState>,
    Json(input): Json<ArchitectRequest>,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state.runner.system_architect(input, cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => cancelled_response(err),
    }
}

async fn run_developer(
    State(state): State<AppState>,
    Json(input): Json<DeveloperRequest>,
) -> Response {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    match state.runner.developer(input, cancel).await {
        Ok(resp) => Json(resp).into_response(),
        Err(err) => cancelled_response(err),
    }
}

fn cancelled_response(err: CompletionError) -> Response {
    tracing::info!("agent request ended early: {err}");
    (
        StatusCode::REQUEST_TIMEOUT,
        Json(ErrorEnvelope {
            error: err.to_string(),
            code: Some("REQUEST_CANCELLED".to_string()),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;
    use trio_core::{AgentRegistry, AgentRunner};
    use trio_providers::{AppConfig, ProviderRegistry};
    use trio_tools::ToolRegistry;

    fn test_state(api_token: Option<&str>) -> AppState {
        // No providers configured: the registry falls back to the local echo provider.
        let providers = ProviderRegistry::new(AppConfig::default());
        let runner = AgentRunner::new(
            AgentRegistry::default(),
            providers.clone(),
            ToolRegistry::new(),
        );
        AppState::new(runner, providers, api_token.map(str::to_string))
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.expect("response");
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, payload)
    }

    fn post_json(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).expect("request")
    }

    #[tokio::test]
    async fn health_is_open_and_reports_token_requirement() {
        let app = app_router(test_state(Some("secret")));
        let req = Request::builder()
            .uri("/global/health")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["healthy"], json!(true));
        assert_eq!(payload["apiTokenRequired"], json!(true));
        assert_eq!(payload["providers"], json!(["local"]));
    }

    #[tokio::test]
    async fn agent_routes_require_token_when_configured() {
        let app = app_router(test_state(Some("secret")));
        let (status, payload) = send(
            app.clone(),
            post_json("/agents/ba", None, json!({"prompt": "todo app"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(payload["code"], json!("AUTH_REQUIRED"));

        let (status, _) = send(
            app.clone(),
            post_json("/agents/ba", Some("wrong"), json!({"prompt": "todo app"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, payload) = send(
            app,
            post_json("/agents/ba", Some("secret"), json!({"prompt": "todo app"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["response"], json!("Echo: todo app"));
        assert_eq!(payload["tokens"]["total_tokens"], json!(0));
    }

    #[tokio::test]
    async fn custom_token_header_is_accepted() {
        let app = app_router(test_state(Some("secret")));
        let req = Request::builder()
            .uri("/")
            .header("x-trio-token", "secret")
            .body(Body::empty())
            .expect("request");
        let (status, payload) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload, json!({"Hello": "World"}));
    }

    #[tokio::test]
    async fn blank_token_leaves_routes_open() {
        let app = app_router(test_state(Some("   ")));
        let req = Request::builder().uri("/").body(Body::empty()).expect("request");
        let (status, _) = send(app, req).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn developer_route_returns_developer_shape() {
        let app = app_router(test_state(None));
        let (status, payload) = send(
            app,
            post_json(
                "/agents/developer",
                None,
                json!({
                    "prompt": "slugify",
                    "current_folder": {"test/slug.test.ts": "it()"},
                    "tdd_enabled": true
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["files_count"], json!(1));
        assert_eq!(
            payload["state"]["files"]["test/slug.test.ts"],
            json!("it()")
        );
        assert_eq!(payload["state"]["summary"], Value::Null);
        assert!(payload["response"]
            .as_str()
            .is_some_and(|text| text.starts_with("Echo: **System Architect Requirements:**")));
        assert!(payload["time_taken_seconds"].is_f64());
    }

    #[tokio::test]
    async fn system_architect_accepts_plain_prompt() {
        let app = app_router(test_state(None));
        let (status, payload) = send(
            app,
            post_json("/agents/system-architect", None, json!({"prompt": "PRD"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(payload["response"]
            .as_str()
            .is_some_and(|text| text.starts_with("Echo: ") && text.ends_with("\n\nPRD")));
    }

    #[tokio::test]
    async fn system_architect_with_only_bad_entries_returns_error_body() {
        let app = app_router(test_state(None));
        let (status, payload) = send(
            app,
            post_json(
                "/agents/system-architect",
                None,
                json!({"conversation": [{"type": "image", "role": "user", "content": "x"}]}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(payload["response"]
            .as_str()
            .is_some_and(|text| text.starts_with("Error: ")));
        assert_eq!(payload["tokens"]["total_tokens"], json!(0));
    }

    #[test]
    fn extracts_bearer_and_custom_header_tokens() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().expect("header"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("abc"));
        headers.insert("x-trio-token", "xyz".parse().expect("header"));
        assert_eq!(extract_request_token(&headers).as_deref(), Some("xyz"));
        let mut empty = HeaderMap::new();
        empty.insert(header::AUTHORIZATION, "Bearer   ".parse().expect("header"));
        assert!(extract_request_token(&empty).is_none());
    }
}
