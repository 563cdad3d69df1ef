//! Loopback admin API: liveness, version, stats and cache invalidation

use crate::dispatcher::Dispatcher;
use crate::pool::ConnectionPool;
use crate::resolver::normalize_host;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const INVALIDATE_PREFIX: &str = "/domains/invalidate/";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static header")
}

/// Shared by every admin connection
pub struct AdminState {
    dispatcher: Arc<Dispatcher>,
    pool: Option<Arc<ConnectionPool>>,
    auth_token: String,
}

impl AdminState {
    pub fn new(dispatcher: Arc<Dispatcher>, auth_token: String) -> Self {
        Self {
            dispatcher,
            pool: None,
            auth_token,
        }
    }

    pub fn with_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    fn stats(&self) -> serde_json::Value {
        let domains = self.dispatcher.domains();
        let mut body = serde_json::json!({
            "dispatcher": self.dispatcher.stats().snapshot(),
            "domain_cache": {
                "entries": domains.cached_len(),
                "counters": domains.stats().snapshot(),
            },
            "rate_limit": self.dispatcher.limiter().snapshot(),
            "executor": self.dispatcher.executor().stats().snapshot(),
        });
        if let Some(pool) = &self.pool {
            let stats = pool.stats();
            body["pool"] = serde_json::json!({
                "total_requests": stats.get_total_requests(),
                "failed_requests": stats.get_failed_requests(),
                "max_idle_per_host": pool.config().max_idle_per_host,
            });
        }
        body
    }
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, state: AdminState, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            state: Arc::new(state),
            shutdown_rx,
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.state.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(stream: S, state: Arc<AdminState>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle_admin_request(&req, &state)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth).eq(expected_token))
        .unwrap_or(false)
}

/// Route one admin request. Nothing here awaits, so the body is never read.
pub fn handle_admin_request<B>(req: &Request<B>, state: &AdminState) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Liveness: no auth, no side effects
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/stats") => {
            if !check_auth(req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            json_response(StatusCode::OK, state.stats())
        }

        (&Method::POST, path) if path.starts_with(INVALIDATE_PREFIX) => {
            if !check_auth(req, &state.auth_token) {
                warn!(path, "Unauthorized admin API request");
                return response(StatusCode::UNAUTHORIZED, "unauthorized");
            }
            let raw = path.strip_prefix(INVALIDATE_PREFIX).unwrap_or("");
            match normalize_host(raw) {
                Some(host) => {
                    let invalidated = state.dispatcher.domains().invalidate(&host);
                    json_response(
                        StatusCode::OK,
                        serde_json::json!({ "host": host, "invalidated": invalidated }),
                    )
                }
                None => response(StatusCode::BAD_REQUEST, "invalid host"),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
