//! HTTP/1.1 front end: routing, CORS, security headers, body limits and
//! per-client rate limiting around the [`ExecutionService`].

use crate::config::ServerConfig;
use crate::execution::{ExecutionFailure, ExecutionService};
use crate::rate_limit::{RateDecision, RateLimiter};
use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{self, HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const EXECUTE_PATH: &str = "/api/execute";
const HEALTH_PATH: &str = "/health";
const RATE_LIMITED: &str = "Too many requests from this IP, please try again later.";

type HttpResponse = Response<Full<Bytes>>;

/// Shared, read-only state for every connection.
pub(crate) struct AppState {
    service: Arc<ExecutionService>,
    limiter: Option<RateLimiter>,
    cors_origin: HeaderValue,
    max_body_bytes: usize,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("service", &self.service)
            .field("limiter", &self.limiter)
            .field("cors_origin", &self.cors_origin)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

impl AppState {
    pub(crate) fn new(service: Arc<ExecutionService>, config: &ServerConfig) -> Result<Self> {
        let cors_origin = HeaderValue::from_str(config.cors_origin.trim())
            .with_context(|| format!("invalid server.cors_origin: {}", config.cors_origin))?;
        Ok(Self {
            service,
            limiter: RateLimiter::from_config(&config.rate_limit),
            cors_origin,
            max_body_bytes: config.max_body_bytes.max(1),
        })
    }
}

/// Accept connections until `shutdown` fires, then drain open connections
/// and wait for in-flight executions to release their containers.
pub(crate) async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    info!(addr = %local, "http server listening");

    let connections = TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let state = Arc::clone(&state);
                    let shutdown = shutdown.clone();
                    connections.spawn(serve_connection(stream, peer, state, shutdown));
                }
                Err(error) => warn!(error = %error, "failed to accept connection"),
            },
            () = shutdown.cancelled() => break,
        }
    }

    info!(open = connections.len(), "http server shutting down");
    connections.close();
    connections.wait().await;
    state.service.shutdown().await;
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(route(req, peer.ip(), &state).await) }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        () = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    if let Err(error) = result {
        debug!(peer = %peer, error = %error, "connection closed with error");
    }
}

/// Dispatch one request. Generic over the body so tests can drive it
/// without a socket.
pub(crate) async fn route<B>(req: Request<B>, client: IpAddr, state: &AppState) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let mut response = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => preflight(),
        (&Method::GET, HEALTH_PATH) => health(),
        (_, p) if p.starts_with("/api/") => match limit(state, client) {
            Err(rejected) => rejected,
            Ok(decision) => {
                let mut response = if method == Method::POST && p == EXECUTE_PATH {
                    execute(req.into_body(), state).await
                } else {
                    not_found()
                };
                if let Some(decision) = decision {
                    rate_headers(&mut response, decision);
                }
                response
            }
        },
        _ => not_found(),
    };

    apply_common_headers(&mut response, state);
    debug!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "request handled"
    );
    response
}

async fn execute<B>(body: B, state: &AppState) -> HttpResponse
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(body, state.max_body_bytes).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(error) if error.downcast_ref::<LengthLimitError>().is_some() => {
            return json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &json!({ "error": "Request body too large" }),
            );
        }
        Err(error) => {
            debug!(error = %error, "failed to read request body");
            return json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": "Failed to read request body" }),
            );
        }
    };

    match state.service.execute(&body).await {
        Ok(result) => json_response(StatusCode::OK, &result),
        Err(failure) => failure_response(&failure),
    }
}

fn failure_response(failure: &ExecutionFailure) -> HttpResponse {
    let error = &failure.error;
    if error.is_client_error() {
        json_response(
            StatusCode::BAD_REQUEST,
            &json!({
                "error": error.to_string(),
                "execution_id": failure.correlation_id,
                "success": false,
                "execution_time": 0,
            }),
        )
    } else {
        json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &json!({
                "error": error.to_string(),
                "execution_time": u64::try_from(failure.elapsed.as_millis()).unwrap_or(u64::MAX),
                "execution_id": failure.correlation_id,
                "success": false,
            }),
        )
    }
}

/// `Ok(None)` when limiting is off, `Err` holds the 429 response.
fn limit(state: &AppState, client: IpAddr) -> Result<Option<RateDecision>, HttpResponse> {
    let Some(limiter) = &state.limiter else {
        return Ok(None);
    };
    let decision = limiter.check(client);
    if decision.allowed {
        return Ok(Some(decision));
    }
    info!(client = %client, "request rate limited");
    let mut response = json_response(
        StatusCode::TOO_MANY_REQUESTS,
        &json!({ "error": RATE_LIMITED }),
    );
    rate_headers(&mut response, decision);
    Err(response)
}

fn rate_headers(response: &mut HttpResponse, decision: RateDecision) {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("ratelimit-limit"),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("ratelimit-remaining"),
        HeaderValue::from(decision.remaining),
    );
    headers.insert(
        HeaderName::from_static("ratelimit-reset"),
        HeaderValue::from(decision.reset_secs),
    );
}

fn health() -> HttpResponse {
    json_response(
        StatusCode::OK,
        &json!({ "status": "ok", "timestamp": chrono::Utc::now().to_rfc3339() }),
    )
}

fn not_found() -> HttpResponse {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({
            "error": "Not found",
            "message": "The requested endpoint does not exist",
        }),
    )
}

fn preflight() -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"));
    response
}

fn apply_common_headers(response: &mut HttpResponse, state: &AppState) {
    let headers = response.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, state.cors_origin.clone());
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> HttpResponse {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|error| {
        warn!(error = %error, "failed to serialize response");
        br#"{"error":"Internal server error"}"#.to_vec()
    });
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    response
}
