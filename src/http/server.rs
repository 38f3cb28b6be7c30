//! HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use super::{router, AppState};
use crate::error::Result;
use crate::metrics::Metrics;
use crate::ratelimit::RateLimiter;

/// HTTP server for the rate limit service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
    /// Collectors served on `/metrics`
    metrics: Arc<Metrics>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>, metrics: Arc<Metrics>) -> Self {
        Self {
            addr,
            rate_limiter,
            metrics,
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// In-flight requests finish before this returns once `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(AppState::new(self.rate_limiter, self.metrics));
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                e.into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, DefaultPolicy, FailureMode, LimiterSettings, ManualClock};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_serve_stops_on_signal() {
        let store = Arc::new(MemoryStore::new(Arc::new(ManualClock::new(0))));
        let limiter = Arc::new(RateLimiter::new(
            store,
            LimiterSettings {
                default_policy: DefaultPolicy {
                    algorithm: Algorithm::FixedWindow,
                    limit: 10,
                    window_seconds: 60,
                },
                failure_mode: FailureMode::Closed,
            },
        ));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        HttpServer::new(addr, limiter, Arc::new(Metrics::new().unwrap()))
            .serve_with_shutdown(async {})
            .await
            .unwrap();
    }
}
