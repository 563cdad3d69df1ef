//! Dispatch executor: forwards a validated request to its target and
//! translates invocation failures into terminal errors.

use crate::config::InvokeConfig;
use crate::error::{panic_message, DispatchError};
use crate::invoke::{ComputeInvoker, InvokeError};
use crate::request::{full_body, DispatchRequest, DispatchTarget, ProxyBody, X_REQUEST_ID};
use futures::FutureExt;
use http_body_util::{BodyExt, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, HOST};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, Uri, Version};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
/// Target identifier as seen by the compute unit
pub const X_DISPATCH_TARGET: &str = "x-dispatch-target";
/// Strategy that selected the target
pub const X_DISPATCH_STRATEGY: &str = "x-dispatch-strategy";
/// Custom domain the request arrived on, when that is how it was routed
pub const X_DISPATCH_DOMAIN: &str = "x-dispatch-domain";

const IDEMPOTENCY_KEY: &str = "idempotency-key";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_retry_body_bytes: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &InvokeConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            retry_backoff: config.retry_backoff(),
            max_retry_body_bytes: config.max_retry_body_bytes,
        }
    }
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self::from_config(&InvokeConfig::default())
    }
}

#[derive(Debug, Default)]
pub struct ExecutorStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl ExecutorStats {
    pub fn get_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn get_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "attempts": self.get_attempts(),
            "retries": self.get_retries(),
            "failures": self.get_failures(),
        })
    }
}

pub struct DispatchExecutor {
    invoker: Arc<dyn ComputeInvoker>,
    settings: ExecutorSettings,
    stats: Arc<ExecutorStats>,
}

impl DispatchExecutor {
    pub fn new(invoker: Arc<dyn ComputeInvoker>, settings: ExecutorSettings) -> Self {
        Self {
            invoker,
            settings,
            stats: Arc::new(ExecutorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ExecutorStats> {
        Arc::clone(&self.stats)
    }

    /// Invoke the target and relay its response unchanged.
    ///
    /// Bodies within `max_retry_body_bytes` are buffered so they can be
    /// replayed. A transient failure gets one retry after a short backoff
    /// when the method is retry-safe, or for any method when the connection
    /// was refused before anything was sent. Everything else fails on the
    /// first error.
    pub async fn execute(
        &self,
        target: &DispatchTarget,
        request: DispatchRequest,
    ) -> Result<Response<ProxyBody>, DispatchError> {
        let (parts, body) = build_forward_request(target, request)?.into_parts();

        let retry_safe = is_retry_safe(&parts.method, &parts.headers);
        let replayable = body
            .size_hint()
            .upper()
            .is_some_and(|n| n <= self.settings.max_retry_body_bytes as u64);

        let result = if replayable {
            let bytes = match Limited::new(body, self.settings.max_retry_body_bytes).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    debug!(target_id = %target.identifier, error = %e, "Client request body unreadable");
                    return Err(DispatchError::RequestBody(e.to_string()));
                }
            };

            match self.attempt(target, replay(&parts, &bytes)).await {
                Err(e) if e.is_transient() && (retry_safe || e.never_sent()) => {
                    warn!(target_id = %target.identifier, error = %e, "Transient invocation failure, retrying once");
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(self.settings.retry_backoff).await;
                    self.attempt(target, replay(&parts, &bytes)).await
                }
                other => other,
            }
        } else {
            self.attempt(target, Request::from_parts(parts, body)).await
        };

        result.map_err(|e| {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
            translate(target, e)
        })
    }

    async fn attempt(
        &self,
        target: &DispatchTarget,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, InvokeError> {
        self.stats.attempts.fetch_add(1, Ordering::Relaxed);

        let invocation = AssertUnwindSafe(self.invoker.invoke(target, request)).catch_unwind();
        match tokio::time::timeout(self.settings.request_timeout, invocation).await {
            Ok(Ok(result)) => result,
            Ok(Err(payload)) => Err(InvokeError::Internal(format!(
                "invoker panicked: {}",
                panic_message(payload.as_ref())
            ))),
            Err(_) => Err(InvokeError::Timeout(self.settings.request_timeout)),
        }
    }
}

fn translate(target: &DispatchTarget, err: InvokeError) -> DispatchError {
    match err {
        InvokeError::NotFound(id) => {
            debug!(target_id = %id, "Target has no compute unit");
            DispatchError::TargetNotFound(id)
        }
        e @ (InvokeError::Connect(_) | InvokeError::Unavailable(_) | InvokeError::Timeout(_)) => {
            warn!(target_id = %target.identifier, error = %e, "Target unavailable");
            DispatchError::TargetUnavailable {
                target: target.identifier.clone(),
                reason: e.to_string(),
            }
        }
        InvokeError::Internal(msg) => {
            error!(target_id = %target.identifier, error = %msg, "Invocation failed unexpectedly");
            DispatchError::Internal(msg)
        }
    }
}

/// Methods that may be replayed, or any request carrying an idempotency key
pub fn is_retry_safe(method: &Method, headers: &HeaderMap) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE | Method::PUT | Method::DELETE
    ) || headers.contains_key(IDEMPOTENCY_KEY)
}

fn replay(parts: &Parts, body: &Bytes) -> Request<ProxyBody> {
    let mut req = Request::new(full_body(body.clone()));
    *req.method_mut() = parts.method.clone();
    *req.uri_mut() = parts.uri.clone();
    *req.version_mut() = parts.version;
    *req.headers_mut() = parts.headers.clone();
    req
}

/// Rewrite the inbound request for the target: forwarded path, proxy
/// headers and, for the credentialed forms, no platform `Authorization`.
pub fn build_forward_request(
    target: &DispatchTarget,
    request: DispatchRequest,
) -> Result<Request<ProxyBody>, DispatchError> {
    let client_ip = request.client_addr().ip();
    let is_tls = request.is_tls();
    let request_id = request.request_id().to_string();
    let original_host = request.raw_host().map(String::from);

    let (mut parts, body) = request.into_inner().into_parts();

    parts.uri = target
        .forwarded_path
        .parse::<Uri>()
        .map_err(|e| DispatchError::Internal(format!("invalid forwarded path: {}", e)))?;
    // The upstream client speaks HTTP/1.1 regardless of the inbound version
    parts.version = Version::HTTP_11;

    let headers = &mut parts.headers;

    // Overwrite rather than append: this dispatcher is the first trusted hop
    set_header(headers, X_FORWARDED_FOR, &client_ip.to_string());
    if let Some(host) = &original_host {
        set_header(headers, X_FORWARDED_HOST, host);
        if !headers.contains_key(HOST) {
            set_header(headers, HOST.as_str(), host);
        }
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(if is_tls { "https" } else { "http" }),
    );
    set_header(headers, X_REQUEST_ID, &request_id);
    set_header(headers, X_DISPATCH_TARGET, &target.identifier);
    headers.insert(
        X_DISPATCH_STRATEGY,
        HeaderValue::from_static(target.strategy.as_str()),
    );
    match &target.domain {
        Some(domain) => set_header(headers, X_DISPATCH_DOMAIN, &domain.host),
        // Never let a client supply it
        None => {
            headers.remove(X_DISPATCH_DOMAIN);
        }
    }

    if target.strategy.requires_credentials() {
        headers.remove(AUTHORIZATION);
    }

    Ok(Request::from_parts(parts, body))
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        headers.insert(name, value);
    }
}
