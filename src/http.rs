//! HTTP gateway
//!
//! `/api/screenshot` accepts any method with a JSON body, is guarded by the
//! per-client rate limiter, and answers with the rendered file.
//! `GET /health` reports pool and queue state.

use crate::{
    client_key, Config, HealthReport, RateDecision, RateLimiter, RenderError, RenderRequest,
    RenderResponse, RenderService, RATE_LIMIT_MESSAGE,
};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::info;

pub const RATE_LIMIT_REMAINING_HEADER: &str = "rate-limit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "rate-limit-reset";
pub const RATE_LIMIT_TOTAL_HEADER: &str = "rate-limit-total";

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RenderService>,
    pub limiter: RateLimiter,
}

impl AppState {
    pub fn new(service: Arc<RenderService>) -> Self {
        let config = service.config();
        let limiter = RateLimiter::new(
            config.rate_limit_window,
            config.rate_limit_max,
            config.rate_limit_max_keys,
        );
        Self { service, limiter }
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/screenshot", any(render_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(api)
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Bind the configured address and serve until `shutdown` flips to `true`.
pub async fn serve(
    config: &Config,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RenderError> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("server start completed, listening on {}", addr);

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // A dropped sender also ends the server.
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn render_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request = RenderRequest::from_body(&body);
    if let Err(e) = request.validate() {
        info!("rejected request: {}", e);
        return RenderResponse::failure(&e).into_response();
    }

    // Dropping `rx` when the client disconnects marks the job as abandoned.
    let (tx, rx) = oneshot::channel::<RenderResponse>();
    let _handle = state.service.submit(request, Box::new(tx));

    match rx.await {
        Ok(response) => response.into_response(),
        Err(_) => RenderResponse::failure(&RenderError::QueueClosed).into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport::collect(&state.service).await)
}

async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let key = client_key(&addr);
    let decision = state.limiter.check(&key);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        crate::metrics::record_rate_limited();
        info!("{}", RenderError::RateLimitExceeded(key));
        let mut response = (StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_MESSAGE).into_response();
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs()));
        response
    };

    apply_rate_headers(response.headers_mut(), &decision);
    response
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    headers.insert(
        RATE_LIMIT_REMAINING_HEADER,
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        RATE_LIMIT_RESET_HEADER,
        HeaderValue::from(decision.reset_epoch_secs),
    );
    headers.insert(RATE_LIMIT_TOTAL_HEADER, HeaderValue::from(decision.total));
}

impl IntoResponse for RenderResponse {
    fn into_response(self) -> Response {
        let mut response =
            (self.status, [(CONTENT_TYPE, self.content_type)], self.body).into_response();
        if let Some(disposition) = self.content_disposition {
            if let Ok(value) = HeaderValue::from_str(&disposition) {
                response.headers_mut().insert(CONTENT_DISPOSITION, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_app, FakeLauncher};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn post(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/screenshot")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    #[tokio::test]
    async fn test_missing_target_is_bad_request() {
        let app = test_app(Config::default(), FakeLauncher::new()).await;
        let router = app.router();

        let response = router.oneshot(post(r##"{"selector": "#app"}"##)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_bytes(response).await, b"arguments error");
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let app = test_app(Config::default(), FakeLauncher::new()).await;
        let router = app.router();

        let response = router.oneshot(post("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pdf_attachment_headers() {
        let app = test_app(Config::default(), FakeLauncher::new()).await;
        let router = app.router();

        let response = router
            .oneshot(post(r#"{"url": "https://example.com", "type": "pdf"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(
            response.headers()[CONTENT_DISPOSITION],
            "attachment; filename=file.pdf"
        );
        assert_eq!(response.headers()[RATE_LIMIT_TOTAL_HEADER], "100");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "99");
    }

    #[tokio::test]
    async fn test_any_method_is_accepted() {
        let app = test_app(Config::default(), FakeLauncher::new()).await;
        let router = app.router();

        let request = Request::builder()
            .method("GET")
            .uri("/api/screenshot")
            .body(Body::from(r#"{"html": "<p>hello</p>"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_fourth_request() {
        let config = Config {
            rate_limit_max: 3,
            ..Default::default()
        };
        let app = test_app(config, FakeLauncher::new()).await;
        let router = app.router();

        for expected_remaining in ["2", "1", "0"] {
            let response = router
                .clone()
                .oneshot(post(r#"{"html": "<p/>"}"#))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(
                response.headers()[RATE_LIMIT_REMAINING_HEADER],
                expected_remaining
            );
        }

        let response = router.oneshot(post(r#"{"html": "<p/>"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(RETRY_AFTER));
        assert!(response.headers().contains_key(RATE_LIMIT_RESET_HEADER));
        assert_eq!(body_bytes(response).await, b"please slow");
    }

    #[tokio::test]
    async fn test_rate_limit_is_per_client() {
        let config = Config {
            rate_limit_max: 1,
            ..Default::default()
        };
        let app = test_app(config, FakeLauncher::new()).await;
        let router = app.router();

        let first = router.clone().oneshot(post(r#"{"html": "<p/>"}"#)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let same_client = router.oneshot(post(r#"{"html": "<p/>"}"#)).await.unwrap();
        assert_eq!(same_client.status(), StatusCode::TOO_MANY_REQUESTS);

        let other_client = app
            .client([10, 1, 2, 3])
            .oneshot(post(r#"{"html": "<p/>"}"#))
            .await
            .unwrap();
        assert_eq!(other_client.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_pool() {
        let config = Config {
            pool_size: 2,
            max_queue: 2,
            ..Default::default()
        };
        let app = test_app(config, FakeLauncher::new()).await;
        let router = app.router();

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(json["overall"], "healthy");
        assert_eq!(json["pool"]["size"], 2);
        assert_eq!(json["queue"]["concurrency"], 2);
    }

    #[tokio::test]
    async fn test_render_failure_is_internal_error() {
        let config = Config {
            render_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let launcher = FakeLauncher::new().render_delay(Duration::from_secs(5));
        let app = test_app(config, launcher).await;
        let router = app.router();

        let response = router
            .oneshot(post(r#"{"url": "https://slow.example.com"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_bytes(response).await, b"internal error");
    }
}
