//! The dispatch pipeline
//!
//! Stages run in a fixed order and each either enriches the request context
//! or ends the request with a terminal error:
//!
//! 1. classify (host/path resolver)
//! 2. reserved-name guard
//! 3. custom domain lookup, with the guard re-applied to its target
//! 4. auth gate
//! 5. rate limiter
//! 6. executor
//!
//! [`Dispatcher::handle`] is the outer boundary: errors become JSON
//! responses and panics become `INTERNAL_ERROR`.

use crate::auth::{AuthGate, IdentityVerifier};
use crate::config::Config;
use crate::domains::{CacheSettings, DomainResolver, DomainStore, LookupError};
use crate::error::{panic_message, DispatchError};
use crate::executor::{DispatchExecutor, ExecutorSettings};
use crate::invoke::ComputeInvoker;
use crate::ratelimit::{Identity, RateLimiter};
use crate::request::{DispatchRequest, DispatchStrategy, DispatchTarget, DomainRoute, ProxyBody, X_REQUEST_ID};
use crate::reserved::ReservedNameSet;
use crate::resolver::{Resolution, Resolver};
use futures::FutureExt;
use hyper::header::HeaderValue;
use hyper::Response;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

#[derive(Debug, Default)]
pub struct DispatcherStats {
    requests: AtomicU64,
    dispatched: AtomicU64,
    rejected: AtomicU64,
    panics: AtomicU64,
}

impl DispatcherStats {
    pub fn get_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn get_dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn get_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "requests": self.get_requests(),
            "dispatched": self.get_dispatched(),
            "rejected": self.get_rejected(),
            "panics": self.panics.load(Ordering::Relaxed),
        })
    }
}

pub struct Dispatcher {
    resolver: Resolver,
    reserved: Arc<ReservedNameSet>,
    domains: Arc<DomainResolver>,
    auth: AuthGate,
    limiter: Arc<RateLimiter>,
    executor: DispatchExecutor,
    stats: DispatcherStats,
}

impl Dispatcher {
    pub fn new(
        resolver: Resolver,
        reserved: Arc<ReservedNameSet>,
        domains: Arc<DomainResolver>,
        auth: AuthGate,
        limiter: Arc<RateLimiter>,
        executor: DispatchExecutor,
    ) -> Self {
        Self {
            resolver,
            reserved,
            domains,
            auth,
            limiter,
            executor,
            stats: DispatcherStats::default(),
        }
    }

    /// Wire every stage from configuration around the three collaborators
    pub fn from_config(
        config: &Config,
        store: Arc<dyn DomainStore>,
        verifier: Arc<dyn IdentityVerifier>,
        invoker: Arc<dyn ComputeInvoker>,
    ) -> Self {
        let settings = CacheSettings::from_config(&config.domains, config.platform.max_identifier_len);
        Self::new(
            Resolver::new(&config.platform),
            Arc::new(ReservedNameSet::from_config(&config.reserved)),
            Arc::new(DomainResolver::new(store, settings)),
            AuthGate::new(verifier, config.auth.verify_timeout()),
            Arc::new(RateLimiter::from_config(&config.rate_limit)),
            DispatchExecutor::new(invoker, ExecutorSettings::from_config(&config.invoke)),
        )
    }

    pub fn domains(&self) -> &Arc<DomainResolver> {
        &self.domains
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn executor(&self) -> &DispatchExecutor {
        &self.executor
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Handle one request end to end. Never fails and never unwinds.
    pub async fn handle(&self, request: DispatchRequest) -> Response<ProxyBody> {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);
        let request_id = request.request_id().to_string();
        let span = info_span!("dispatch", request_id = %request_id, method = %request.method());

        let outcome = AssertUnwindSafe(self.dispatch(request))
            .catch_unwind()
            .instrument(span)
            .await;

        let mut response = match outcome {
            Ok(Ok(response)) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                return response;
            }
            Ok(Err(err)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                log_terminal(&request_id, &err);
                err.into_response()
            }
            Err(payload) => {
                self.stats.panics.fetch_add(1, Ordering::Relaxed);
                let message = panic_message(payload.as_ref());
                error!(request_id, panic = %message, "Dispatch pipeline panicked");
                DispatchError::Internal(message).into_response()
            }
        };

        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        response
    }

    /// Run the stage pipeline, returning the first terminal error
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Response<ProxyBody>, DispatchError> {
        let resolution = self.resolver.resolve(&request)?;
        let strategy = resolution.strategy();
        debug!(%strategy, host = request.raw_host().unwrap_or_default(), path = request.path(), "Request classified");

        if let Resolution::Target(target) = &resolution {
            self.reserved.check(&target.identifier, strategy)?;
        }

        let target = match resolution {
            Resolution::Target(target) => target,
            Resolution::CustomDomain { host, forwarded_path } => {
                let target = self.resolve_custom_domain(host.clone(), forwarded_path).await?;
                // Answer exactly like an unmapped host so the mapping stays private
                if let Err(err) = self.reserved.check(&target.identifier, strategy) {
                    warn!(host = %host, target_id = %target.identifier, error = %err, "Custom domain maps to a reserved target");
                    return Err(DispatchError::NotFound(host));
                }
                target
            }
        };

        let auth = self.auth.authorize(request.headers(), strategy).await?;

        let identity = Identity::from_context(&auth, request.client_addr().ip());
        let decision = self.limiter.admit(&identity, &target.identifier)?;

        debug!(
            target_id = %target.identifier,
            %strategy,
            authenticated = auth.is_authenticated(),
            remaining = decision.remaining,
            forwarded_path = %target.forwarded_path,
            domain = ?target.domain.as_ref().map(|d| d.host.as_str()),
            domain_updated_at = ?target.domain.as_ref().map(|d| d.updated_at),
            "Dispatching"
        );

        self.executor.execute(&target, request).await
    }

    async fn resolve_custom_domain(
        &self,
        host: String,
        forwarded_path: String,
    ) -> Result<DispatchTarget, DispatchError> {
        match self.domains.resolve(&host).await {
            Ok(resolved) => {
                let mut target = DispatchTarget::new(resolved.target, DispatchStrategy::CustomDomain, forwarded_path);
                target.domain = Some(DomainRoute {
                    host,
                    updated_at: resolved.updated_at,
                });
                Ok(target)
            }
            Err(LookupError::NotFound) => Err(DispatchError::NotFound(host)),
            Err(e @ (LookupError::Timeout(_) | LookupError::Store(_))) => {
                Err(DispatchError::DependencyUnavailable(e.to_string()))
            }
        }
    }
}

/// Client errors are routine; dependency and target failures are not
fn log_terminal(request_id: &str, err: &DispatchError) {
    let code = err.code().as_header_value();
    match err {
        DispatchError::Internal(_) => error!(request_id, code, error = %err, "Request failed"),
        _ if err.code().status_code().is_server_error() => {
            warn!(request_id, code, error = %err, "Request failed")
        }
        _ => debug!(request_id, code, error = %err, "Request rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthContext, JwtVerifier, VerifyError};
    use crate::config::PlatformConfig;
    use crate::domains::{CustomDomainRecord, StaticDomainStore};
    use crate::error::X_DISPATCH_ERROR;
    use crate::invoke::InvokeError;
    use crate::request::{empty_body, full_body};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use http_body_util::BodyExt;
    use hyper::header::{AUTHORIZATION, HOST, RETRY_AFTER};
    use hyper::{Request, StatusCode};
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const SECRET: &str = "dispatcher-test-secret";

    struct CountingStore {
        inner: StaticDomainStore,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DomainStore for CountingStore {
        async fn lookup_custom_domain(&self, host: &str) -> anyhow::Result<Option<CustomDomainRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup_custom_domain(host).await
        }
    }

    struct CountingVerifier {
        inner: JwtVerifier,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl IdentityVerifier for CountingVerifier {
        async fn verify(&self, credential: &str) -> Result<AuthContext, VerifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.verify(credential).await
        }
    }

    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, String)>>,
        panic_on: Option<&'static str>,
    }

    #[async_trait]
    impl ComputeInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            target: &DispatchTarget,
            request: Request<ProxyBody>,
        ) -> Result<Response<ProxyBody>, InvokeError> {
            let path = request.uri().to_string();
            self.calls.lock().push((target.identifier.clone(), path));
            if self.panic_on == Some(target.identifier.as_str()) {
                panic!("tenant invoker bug");
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("x-tenant", target.identifier.as_str())
                .body(full_body(format!("hello from {}", target.identifier)))
                .unwrap())
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<CountingStore>,
        verifier: Arc<CountingVerifier>,
        invoker: Arc<RecordingInvoker>,
        jwt: JwtVerifier,
    }

    impl Harness {
        fn new() -> Self {
            Self::build(100, None)
        }

        fn build(quota: u64, panic_on: Option<&'static str>) -> Self {
            let store = StaticDomainStore::new();
            store.upsert(CustomDomainRecord::new("custom.example.com", "acme"));
            let mut revoked = CustomDomainRecord::new("revoked.example.com", "acme");
            revoked.active = false;
            store.upsert(revoked);
            store.upsert(CustomDomainRecord::new("sneaky.example.com", "admin"));

            let store = Arc::new(CountingStore {
                inner: store,
                calls: AtomicUsize::new(0),
            });
            let jwt = JwtVerifier::new(SECRET, None, None, 0);
            let verifier = Arc::new(CountingVerifier {
                inner: jwt.clone(),
                calls: AtomicUsize::new(0),
            });
            let invoker = Arc::new(RecordingInvoker {
                panic_on,
                ..Default::default()
            });

            let reserved = ReservedNameSet::new(["api", "www", "admin"]).with_internal_allow(["api"]);
            let dispatcher = Dispatcher::new(
                Resolver::new(&PlatformConfig::default()),
                Arc::new(reserved),
                Arc::new(DomainResolver::new(store.clone(), CacheSettings::default())),
                AuthGate::new(verifier.clone(), Duration::from_millis(200)),
                Arc::new(RateLimiter::new(quota, quota, Duration::from_secs(60))),
                DispatchExecutor::new(
                    invoker.clone(),
                    ExecutorSettings {
                        request_timeout: Duration::from_secs(1),
                        retry_backoff: Duration::from_millis(1),
                        max_retry_body_bytes: 1024,
                    },
                ),
            );

            Self {
                dispatcher,
                store,
                verifier,
                invoker,
                jwt,
            }
        }

        fn token(&self, ttl: ChronoDuration) -> String {
            self.jwt.create_token("ops", &["dispatch"], ttl).unwrap()
        }

        fn invocations(&self) -> Vec<(String, String)> {
            self.invoker.calls.lock().clone()
        }

        fn store_calls(&self) -> usize {
            self.store.calls.load(Ordering::SeqCst)
        }

        fn verifier_calls(&self) -> usize {
            self.verifier.calls.load(Ordering::SeqCst)
        }

        async fn send(&self, host: &str, uri: &str, token: Option<&str>) -> Response<ProxyBody> {
            let mut builder = Request::builder().uri(uri).header(HOST, host);
            if let Some(token) = token {
                builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
            }
            let addr: SocketAddr = "192.0.2.10:50000".parse().unwrap();
            let request = DispatchRequest::new(builder.body(empty_body()).unwrap(), addr);
            self.dispatcher.handle(request).await
        }
    }

    fn error_code(response: &Response<ProxyBody>) -> &str {
        response
            .headers()
            .get(X_DISPATCH_ERROR)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    async fn body_string(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_wildcard_subdomain_without_credential() {
        let h = Harness::new();
        let response = h.send("myapp.platform.dev", "/about", None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-tenant").unwrap(), "myapp");
        assert_eq!(body_string(response).await, "hello from myapp");
        assert_eq!(h.invocations(), vec![("myapp".to_string(), "/about".to_string())]);
        assert_eq!(h.verifier_calls(), 0);
        assert_eq!(h.store_calls(), 0);
    }

    #[tokio::test]
    async fn test_custom_domain_active_and_revoked() {
        let h = Harness::new();

        let response = h.send("custom.example.com", "/pricing?plan=pro", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            h.invocations(),
            vec![("acme".to_string(), "/pricing?plan=pro".to_string())]
        );

        let revoked = h.send("revoked.example.com", "/", None).await;
        let unmapped = h.send("nobody.example.org", "/", None).await;
        assert_eq!(revoked.status(), StatusCode::NOT_FOUND);
        assert_eq!(unmapped.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(&revoked), "NOT_FOUND");
        assert_eq!(error_code(&unmapped), "NOT_FOUND");
        assert_eq!(body_string(revoked).await, body_string(unmapped).await);
        assert_eq!(h.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_custom_domain_served_from_cache() {
        let h = Harness::new();
        for _ in 0..5 {
            let response = h.send("custom.example.com", "/", None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(h.store_calls(), 1);
    }

    #[tokio::test]
    async fn test_path_dispatch_with_valid_and_expired_credential() {
        let h = Harness::new();

        let token = h.token(ChronoDuration::hours(1));
        let response = h.send("platform.dev", "/dispatch/acme/status", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.invocations(), vec![("acme".to_string(), "/status".to_string())]);

        let expired = h.token(ChronoDuration::seconds(-300));
        let response = h.send("platform.dev", "/dispatch/acme/status", Some(&expired)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(error_code(&response), "UNAUTHORIZED");
        assert_eq!(h.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_downstream_calls() {
        let h = Harness::new();

        for uri in ["/dispatch/acme/status", "/dispatch?worker=acme"] {
            let response = h.send("custom.example.com", uri, None).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        assert_eq!(h.verifier_calls(), 0);
        assert_eq!(h.store_calls(), 0);
        assert!(h.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_allow_listed_name_via_query_only() {
        let h = Harness::new();
        let token = h.token(ChronoDuration::hours(1));

        let response = h.send("platform.dev", "/dispatch?worker=api", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.invocations(), vec![("api".to_string(), "/".to_string())]);

        let response = h.send("api.platform.dev", "/", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(error_code(&response), "FORBIDDEN_TARGET");

        let response = h.send("platform.dev", "/dispatch?worker=admin", Some(&token)).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(h.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_wildcard_forbidden_regardless_of_auth() {
        let h = Harness::new();
        let token = h.token(ChronoDuration::hours(1));
        for host in ["www.platform.dev", "ADMIN.platform.dev", "api.platform.dev:443"] {
            for credential in [None, Some(token.as_str())] {
                let response = h.send(host, "/", credential).await;
                assert_eq!(response.status(), StatusCode::FORBIDDEN, "{}", host);
            }
        }
        assert!(h.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_custom_domain_to_reserved_target_looks_unmapped() {
        let h = Harness::new();
        let reserved = h.send("sneaky.example.com", "/", None).await;
        let unmapped = h.send("nobody.example.com", "/", None).await;

        assert_eq!(reserved.status(), StatusCode::NOT_FOUND);
        assert_eq!(reserved.status(), unmapped.status());
        assert_eq!(error_code(&reserved), "NOT_FOUND");
        assert_eq!(error_code(&reserved), error_code(&unmapped));
        assert_eq!(body_string(reserved).await, body_string(unmapped).await);
        assert!(h.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unrouted_hosts() {
        let h = Harness::new();

        let response = h.send("bad_host!", "/", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(&response), "MALFORMED_ROUTE");

        let response = h.send("platform.dev", "/", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(&response), "NO_ROUTE");
        assert!(h.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_after_quota() {
        let h = Harness::build(2, None);

        for _ in 0..2 {
            let response = h.send("myapp.platform.dev", "/", None).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = h.send("myapp.platform.dev", "/", None).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(RETRY_AFTER).is_some());
        assert_eq!(h.invocations().len(), 2);

        // Separate target, separate counter
        let response = h.send("other.platform.dev", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_invoker_panic_is_isolated() {
        let h = Harness::build(100, Some("boom"));

        let response = h.send("boom.platform.dev", "/", None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(&response), "INTERNAL_ERROR");
        let body = body_string(response).await;
        assert!(!body.contains("tenant invoker bug"));

        let response = h.send("fine.platform.dev", "/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_error_responses_carry_request_id() {
        let h = Harness::new();
        let response = h.send("platform.dev", "/", None).await;
        assert!(response.headers().get(X_REQUEST_ID).is_some());
        assert_eq!(h.dispatcher.stats().get_rejected(), 1);
        assert_eq!(h.dispatcher.stats().get_requests(), 1);
    }
}
