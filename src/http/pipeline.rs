//! Ordered request/response middleware.
//!
//! A [`Pipeline`] is a list of [`Stage`]s run in declared order. On the way
//! in a stage may answer the request itself (CORS preflight, unsupported
//! content type, rate limit); on the way out every stage gets a chance to
//! decorate the response, including responses produced by an earlier stage.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::response::error_response;
use crate::auth::AuthError;
use crate::config::BouncerConfig;
use crate::ratelimit::{LimitRule, RateLimiter};

/// Action name for the generic per-IP request limit.
pub const API_ACTION: &str = "api";

/// Placeholder identifier when the peer address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

/// The resolved client address, inserted into request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

/// Response hardening headers.
#[derive(Debug, Clone, Default)]
pub struct SecurityHeadersConfig {
    /// Emit `Strict-Transport-Security` with this max-age
    pub hsts_max_age: Option<u64>,
}

/// Cross-origin resource sharing.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<Method>,
    pub allowed_headers: Vec<String>,
    pub max_age_secs: u64,
}

impl CorsConfig {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self {
            allowed_origins,
            allowed_methods: vec![
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
                Method::PATCH,
            ],
            allowed_headers: [
                "Content-Type",
                "Authorization",
                "X-Requested-With",
                "Accept",
                "Origin",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_age_secs: 86400,
        }
    }

    fn allows(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestLoggingConfig {
    pub excluded_paths: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ContentTypeConfig {
    /// Media types accepted for request bodies, compared without parameters
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitStageConfig {
    pub rule: LimitRule,
    /// Paths that are never counted, such as load balancer health checks
    pub excluded_paths: Vec<String>,
}

/// One middleware step.
#[derive(Debug, Clone)]
pub enum Stage {
    SecurityHeaders(SecurityHeadersConfig),
    Cors(CorsConfig),
    RequestLogging(RequestLoggingConfig),
    ContentType(ContentTypeConfig),
    RateLimit(RateLimitStageConfig),
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::SecurityHeaders(_) => "security_headers",
            Stage::Cors(_) => "cors",
            Stage::RequestLogging(_) => "request_logging",
            Stage::ContentType(_) => "content_type",
            Stage::RateLimit(_) => "rate_limit",
        }
    }
}

/// What the request phase learned that the response phase needs.
#[derive(Debug, Default)]
struct RequestContext {
    request_id: Option<Uuid>,
    origin: Option<String>,
}

/// The ordered stage list plus the shared pieces stages need.
pub struct Pipeline {
    stages: Vec<Stage>,
    limiter: Arc<RateLimiter>,
    trust_forwarded_for: bool,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(limiter: Arc<RateLimiter>, trust_forwarded_for: bool) -> Self {
        Self {
            stages: Vec::new(),
            limiter,
            trust_forwarded_for,
        }
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Build the standard stage list from configuration.
    pub fn from_config(config: &BouncerConfig, limiter: Arc<RateLimiter>) -> Self {
        let http = &config.http;
        let mut pipeline = Self::new(limiter, config.server.trust_forwarded_for)
            .with_stage(Stage::SecurityHeaders(SecurityHeadersConfig {
                hsts_max_age: http.hsts_max_age,
            }))
            .with_stage(Stage::Cors(CorsConfig::new(http.allowed_origins.clone())))
            .with_stage(Stage::RequestLogging(RequestLoggingConfig {
                excluded_paths: http.log_excluded_paths.clone(),
            }))
            .with_stage(Stage::ContentType(ContentTypeConfig {
                allowed: http.allowed_content_types.clone(),
            }));

        if http.api_rate_limit {
            pipeline = pipeline.with_stage(Stage::RateLimit(RateLimitStageConfig {
                rule: config.rate_limiting.limits.api_ip,
                excluded_paths: http.rate_limit_excluded_paths.clone(),
            }));
        }

        pipeline
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Resolve the client address for rate limiting and logging.
    pub fn client_ip(&self, request: &Parts) -> String {
        if self.trust_forwarded_for {
            let forwarded = request
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }

        request
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }

    /// Run request-phase stages. Returns a response when a stage answers the
    /// request itself.
    async fn on_request(
        &self,
        request: &Parts,
        ip: &str,
        context: &mut RequestContext,
    ) -> Option<Response> {
        for stage in &self.stages {
            match stage {
                Stage::SecurityHeaders(_) => {}
                Stage::Cors(_) => {
                    if request.method == Method::OPTIONS {
                        return Some(StatusCode::NO_CONTENT.into_response());
                    }
                }
                Stage::RequestLogging(config) => {
                    let path = request.uri.path();
                    if config.excluded_paths.iter().any(|p| p == path) {
                        continue;
                    }
                    let request_id = Uuid::new_v4();
                    context.request_id = Some(request_id);
                    info!(
                        request_id = %request_id,
                        method = %request.method,
                        uri = %request.uri,
                        ip = ip,
                        user_agent = request
                            .headers
                            .get(header::USER_AGENT)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("Unknown"),
                        "HTTP request"
                    );
                }
                Stage::ContentType(config) => {
                    if let Some(response) = check_content_type(request, config) {
                        return Some(response);
                    }
                }
                Stage::RateLimit(config) => {
                    let path = request.uri.path();
                    if config.excluded_paths.iter().any(|p| p == path) {
                        continue;
                    }
                    let rule = config.rule;
                    // Only the denial's retry hint reaches the client.
                    if let Err(e) = self
                        .limiter
                        .check_and_increment(ip, API_ACTION, rule.max_attempts, rule.window_secs)
                        .await
                    {
                        warn!(ip = ip, error = %e, "Request refused by rate limiter");
                        return Some(AuthError::from(e).into_response());
                    }
                }
            }
        }

        None
    }

    /// Run response-phase stages.
    fn on_response(&self, response: &mut Response, context: &RequestContext, started: Instant) {
        for stage in &self.stages {
            match stage {
                Stage::SecurityHeaders(config) => {
                    apply_security_headers(response.headers_mut(), config)
                }
                Stage::Cors(config) => {
                    if let Some(origin) = context.origin.as_deref() {
                        apply_cors_headers(response.headers_mut(), config, origin);
                    }
                }
                Stage::RequestLogging(_) => {
                    if let Some(request_id) = context.request_id {
                        info!(
                            request_id = %request_id,
                            status = response.status().as_u16(),
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "HTTP response"
                        );
                    }
                }
                Stage::ContentType(_) | Stage::RateLimit(_) => {}
            }
        }
    }
}

/// Axum middleware entry point; install with `from_fn_with_state`.
pub async fn run_pipeline(
    State(pipeline): State<Arc<Pipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let (mut parts, body) = request.into_parts();
    let ip = pipeline.client_ip(&parts);
    parts.extensions.insert(ClientIp(ip.clone()));

    let mut context = RequestContext {
        origin: parts
            .headers
            .get(header::ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        ..RequestContext::default()
    };

    let mut response = match pipeline.on_request(&parts, &ip, &mut context).await {
        Some(response) => {
            debug!(ip = %ip, status = response.status().as_u16(), "Request answered by pipeline");
            response
        }
        None => next.run(Request::from_parts(parts, body)).await,
    };

    pipeline.on_response(&mut response, &context, started);
    response
}

fn check_content_type(request: &Parts, config: &ContentTypeConfig) -> Option<Response> {
    if request.method == Method::GET {
        return None;
    }

    let content_type = request
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .unwrap_or_default();

    if content_type.is_empty()
        || config
            .allowed
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(content_type))
    {
        return None;
    }

    Some(error_response(
        StatusCode::UNSUPPORTED_MEDIA_TYPE,
        format!(
            "Unsupported content type. Allowed types: {}",
            config.allowed.join(", ")
        ),
    ))
}

fn apply_security_headers(headers: &mut HeaderMap, config: &SecurityHeadersConfig) {
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(
            "default-src 'self'; object-src 'none'; frame-ancestors 'none'; base-uri 'self'; form-action 'self'",
        ),
    );
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static(
            "camera=self, microphone=self, geolocation=self, payment=self, usb=self, bluetooth=self",
        ),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    headers.remove(header::SERVER);

    if let Some(max_age) = config.hsts_max_age {
        if let Ok(value) =
            HeaderValue::from_str(&format!("max-age={max_age}; includeSubDomains; preload"))
        {
            headers.insert(header::STRICT_TRANSPORT_SECURITY, value);
        }
    }
}

fn apply_cors_headers(headers: &mut HeaderMap, config: &CorsConfig, origin: &str) {
    if !config.allows(origin) {
        return;
    }
    let Ok(origin) = HeaderValue::from_str(origin) else {
        return;
    };

    let methods = config
        .allowed_methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ");

    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    if let Ok(value) = HeaderValue::from_str(&methods) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }
    if let Ok(value) = HeaderValue::from_str(&config.allowed_headers.join(", ")) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from(config.max_age_secs),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
}
