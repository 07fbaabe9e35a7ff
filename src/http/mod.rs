//! HTTP surface: login, registration and health endpoints behind the
//! middleware pipeline.

mod pipeline;
mod response;
mod routes;
mod server;

pub use pipeline::{
    run_pipeline, ClientIp, ContentTypeConfig, CorsConfig, Pipeline, RateLimitStageConfig,
    RequestLoggingConfig, SecurityHeadersConfig, Stage, API_ACTION,
};
pub use response::{error_response, success, too_many_requests};
pub use routes::{routes, AppState};
pub use server::{router, HttpServer};
