//! HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::pipeline::{run_pipeline, Pipeline};
use super::routes::{routes, AppState};
use crate::error::Result;

/// Assemble the routes with the middleware pipeline wrapped around them.
pub fn router(state: AppState, pipeline: Pipeline) -> Router {
    routes()
        .with_state(state)
        .layer(from_fn_with_state(Arc::new(pipeline), run_pipeline))
}

/// HTTP server for the auth endpoints.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AppState, pipeline: Pipeline) -> Self {
        Self {
            addr,
            router: router(state, pipeline),
        }
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
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
    use crate::auth::testing::FakeProvider;
    use crate::auth::AuthGuard;
    use crate::ratelimit::{RateLimitRules, RateLimiter};

    #[tokio::test]
    async fn test_server_shuts_down_on_signal() {
        let limiter = Arc::new(RateLimiter::in_memory());
        let guard = Arc::new(AuthGuard::new(
            limiter.clone(),
            Arc::new(FakeProvider::with_password("x")),
            RateLimitRules::default(),
        ));
        let server = HttpServer::new(
            "127.0.0.1:0".parse().unwrap(),
            AppState { guard },
            Pipeline::new(limiter, false),
        );

        server.serve_with_shutdown(async {}).await.unwrap();
    }
}
