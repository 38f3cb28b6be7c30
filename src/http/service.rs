//! Request handlers.

use std::time::Instant;

use axum::extract::{MatchedPath, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::AppState;
use crate::error::ThrottlexError;
use crate::ratelimit::{EvaluateRequest, Policy};

/// A [`ThrottlexError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub ThrottlexError);

impl From<ThrottlexError> for ApiError {
    fn from(err: ThrottlexError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ThrottlexError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ThrottlexError::PolicyNotFound => StatusCode::NOT_FOUND,
            e if e.is_backend_unavailable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self.status() {
            StatusCode::UNPROCESSABLE_ENTITY => "VALIDATION",
            StatusCode::NOT_FOUND => "NOT_FOUND",
            StatusCode::SERVICE_UNAVAILABLE => "BACKEND_UNAVAILABLE",
            _ => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

/// Evaluate one request against its tenant's quota.
///
/// Answers 200 when admitted and 429 when rejected, with the
/// `X-RateLimit-*` headers on both.
#[instrument(
    skip_all,
    fields(
        request_id = %Uuid::new_v4(),
        tenant_id = %request.tenant_id,
        route = %request.route
    )
)]
pub async fn evaluate(
    State(state): State<AppState>,
    request: Json<EvaluateRequest>,
) -> Result<Response, ApiError> {
    let Json(request) = request;
    request.validate()?;

    let evaluation = state.limiter.evaluate(&request).await?;

    let mut headers = HeaderMap::new();
    for (name, value) in evaluation.headers.pairs() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }

    let status = if evaluation.decision.allow {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    debug!(status = status.as_u16(), "Evaluation answered");
    Ok((status, headers, Json(evaluation.decision)).into_response())
}

/// Create or replace a policy.
#[instrument(
    skip_all,
    fields(
        request_id = %Uuid::new_v4(),
        tenant_id = %policy.tenant_id,
        route = ?policy.route
    )
)]
pub async fn create_policy(
    State(state): State<AppState>,
    policy: Json<Policy>,
) -> Result<(StatusCode, Json<Policy>), ApiError> {
    let Json(policy) = policy;
    let saved = state.limiter.create_policy(&policy).await?;
    Ok((StatusCode::CREATED, Json(saved)))
}

#[instrument(skip(state), fields(request_id = %Uuid::new_v4()))]
pub async fn list_policies(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<Policy>>, ApiError> {
    let policies = state.limiter.list_policies(&tenant_id).await?;
    Ok(Json(policies))
}

/// Query of `DELETE /policies/{tenant_id}`. No route means the tenant-wide
/// policy.
#[derive(Debug, Default, Deserialize)]
pub struct DeleteParams {
    pub route: Option<String>,
}

#[instrument(skip(state), fields(request_id = %Uuid::new_v4()))]
pub async fn delete_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<StatusCode, ApiError> {
    let route = params.route.as_deref().filter(|r| !r.is_empty());
    if state.limiter.delete_policy(&tenant_id, route).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ThrottlexError::PolicyNotFound.into())
    }
}

/// Health report body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub store: bool,
    pub version: String,
}

/// Liveness; reports `degraded` when the store does not answer.
pub async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let store = state.limiter.health_check().await;
    Json(HealthStatus {
        status: if store { "healthy" } else { "degraded" }.to_string(),
        store,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness; 503 while the store is unreachable.
pub async fn ready(State(state): State<AppState>) -> StatusCode {
    if state.limiter.health_check().await {
        StatusCode::OK
    } else {
        warn!("Not ready: state store unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<AppState>) -> Result<Response, ApiError> {
    let body = state.metrics.encode()?;
    Ok(([(header::CONTENT_TYPE, state.metrics.content_type())], body).into_response())
}

/// Count and time each request under its route template.
pub async fn track_http(
    State(state): State<AppState>,
    matched: Option<MatchedPath>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let endpoint = match matched {
        Some(path) => path.as_str().to_string(),
        None => request.uri().path().to_string(),
    };

    let response = next.run(request).await;

    state.metrics.observe_http(
        &method,
        &endpoint,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::metrics::{Metrics, PrometheusObserver};
    use crate::ratelimit::{
        Algorithm, DefaultPolicy, FailureMode, LimiterSettings, ManualClock, RateLimiter, Scope,
    };
    use crate::store::MemoryStore;

    fn state() -> AppState {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = Arc::new(MemoryStore::new(clock.clone()));
        let metrics = Arc::new(Metrics::new().unwrap());
        let limiter = RateLimiter::new(
            store,
            LimiterSettings {
                default_policy: DefaultPolicy {
                    algorithm: Algorithm::FixedWindow,
                    limit: 100,
                    window_seconds: 60,
                },
                failure_mode: FailureMode::Closed,
            },
        )
        .with_clock(clock)
        .with_observer(Arc::new(PrometheusObserver::new(metrics.clone())));
        AppState::new(Arc::new(limiter), metrics)
    }

    fn route_policy(limit: u64) -> Policy {
        Policy {
            tenant_id: "acme".to_string(),
            route: Some("/orders".to_string()),
            scope: Scope::TenantRoute,
            algorithm: Algorithm::FixedWindow,
            limit,
            window_seconds: 60,
            burst: 0,
            ttl_seconds: None,
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_evaluate_allows_then_rejects() {
        let state = state();
        create_policy(State(state.clone()), Json(route_policy(1)))
            .await
            .unwrap();

        let request = EvaluateRequest::new("acme", "/orders");
        let response = evaluate(State(state.clone()), Json(request.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "1");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        let body = body_json(response).await;
        assert_eq!(body["allow"], true);
        assert_eq!(body["resetAt"], 1_700_000_060i64);

        let response = evaluate(State(state), Json(request)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        let body = body_json(response).await;
        assert_eq!(body["allow"], false);
        assert_eq!(body["remaining"], 0);
    }

    #[tokio::test]
    async fn test_evaluate_rejects_invalid_request() {
        let err = evaluate(State(state()), Json(EvaluateRequest::new("", "/orders")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_create_policy_validates() {
        let mut policy = route_policy(1);
        policy.route = None;
        let err = create_policy(State(state()), Json(policy)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_policy_admin_routes() {
        let state = state();
        let (status, Json(saved)) = create_policy(State(state.clone()), Json(route_policy(5)))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(saved, route_policy(5));

        let Json(listed) = list_policies(State(state.clone()), Path("acme".to_string()))
            .await
            .unwrap();
        assert_eq!(listed, vec![route_policy(5)]);

        let params = || DeleteParams {
            route: Some("/orders".to_string()),
        };
        let status = delete_policy(State(state.clone()), Path("acme".to_string()), Query(params()))
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let err = delete_policy(State(state), Path("acme".to_string()), Query(params()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let state = state();
        let Json(health) = health(State(state.clone())).await;
        assert_eq!(health.status, "healthy");
        assert!(health.store);
        assert_eq!(ready(State(state)).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_reports_evaluations() {
        let state = state();
        create_policy(State(state.clone()), Json(route_policy(1)))
            .await
            .unwrap();
        let request = EvaluateRequest::new("acme", "/orders");
        evaluate(State(state.clone()), Json(request.clone())).await.unwrap();
        evaluate(State(state.clone()), Json(request)).await.unwrap();

        let response = metrics(State(state)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("throttlex_evaluate_total"));
        assert!(text.contains("result=\"allowed\""));
        assert!(text.contains("result=\"blocked\""));
        assert!(text.contains("throttlex_policies_total"));
        assert!(text.contains("algorithm=\"SLIDING_WINDOW\""));
        assert!(text.contains("throttlex_evaluate_duration_seconds_count"));
    }

    #[test]
    fn test_error_status_mapping() {
        let status = |e: ThrottlexError| ApiError(e).status();
        assert_eq!(status(ThrottlexError::Backend("down".into())), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            status(ThrottlexError::Timeout(std::time::Duration::from_millis(1))),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status(ThrottlexError::Config("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
