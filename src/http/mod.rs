//! HTTP interface around the rate limiter.

mod server;
mod service;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

pub use server::HttpServer;
pub use service::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<Metrics>) -> Self {
        Self { limiter, metrics }
    }
}

/// Build the service routes.
///
/// Every matched route is counted and timed under its route template.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/evaluate", post(service::evaluate))
        .route("/policies", post(service::create_policy))
        .route(
            "/policies/:tenant_id",
            get(service::list_policies).delete(service::delete_policy),
        )
        .route("/health", get(service::health))
        .route("/ready", get(service::ready))
        .route("/metrics", get(service::metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            service::track_http,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::ratelimit::{Algorithm, DefaultPolicy, FailureMode, LimiterSettings, ManualClock};
    use crate::store::MemoryStore;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_requests_are_counted_by_route_template() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(0))));
        let limiter = RateLimiter::new(
            store,
            LimiterSettings {
                default_policy: DefaultPolicy {
                    algorithm: Algorithm::FixedWindow,
                    limit: 10,
                    window_seconds: 60,
                },
                failure_mode: FailureMode::Closed,
            },
        );
        let metrics = Arc::new(Metrics::new().unwrap());
        let app = router(AppState::new(Arc::new(limiter), metrics.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        assert!(get(addr, "/health").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/policies/acme").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/policies/other").await.starts_with("HTTP/1.1 200"));

        let count = |endpoint: &str| {
            metrics
                .http_requests_total
                .with_label_values(&["GET", endpoint, "200"])
                .get()
        };
        assert_eq!(count("/health"), 1);
        assert_eq!(count("/policies/:tenant_id"), 2);
        assert_eq!(
            metrics
                .http_request_duration
                .with_label_values(&["GET", "/policies/:tenant_id"])
                .get_sample_count(),
            2
        );

        let scrape = get(addr, "/metrics").await;
        assert!(scrape.starts_with("HTTP/1.1 200"));
        assert!(scrape.contains("throttlex_http_requests_total"));
        assert!(scrape.contains("endpoint=\"/health\""));
    }
}
