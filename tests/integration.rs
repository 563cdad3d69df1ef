//! Integration tests for Edgedispatch

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use edgedispatch::admin::{AdminServer, AdminState};
use edgedispatch::auth::JwtVerifier;
use edgedispatch::config::{Config, DomainStoreKind};
use edgedispatch::db::SqliteDomainStore;
use edgedispatch::dispatcher::Dispatcher;
use edgedispatch::domains::{CustomDomainRecord, DomainStore, StaticDomainStore};
use edgedispatch::invoke::{HttpInvoker, TargetRegistry};
use edgedispatch::pool::{ConnectionPool, PoolConfig};
use edgedispatch::proxy::DispatchServer;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const JWT_SECRET: &str = "integration-secret";
const ADMIN_TOKEN: &str = "test-token";

/// Wait for a port to become available (server listening)
async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if TcpStream::connect(format!("127.0.0.1:{}", port))
            .await
            .is_ok()
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Send a raw HTTP/1.1 request and read the whole response
async fn send_raw(port: u16, request: String) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

/// Send HTTP request with custom Host header (for dispatch testing)
async fn http_get_with_host(port: u16, path: &str, host: &str) -> Result<String, Box<dyn std::error::Error>> {
    send_raw(
        port,
        format!("GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", path, host),
    )
    .await
}

/// Send HTTP request with custom Host header and a bearer token
async fn http_get_with_auth(
    port: u16,
    path: &str,
    host: &str,
    token: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    send_raw(
        port,
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\nConnection: close\r\n\r\n",
            path, host, token
        ),
    )
    .await
}

async fn http_post_with_auth(port: u16, path: &str, token: &str) -> Result<String, Box<dyn std::error::Error>> {
    send_raw(
        port,
        format!(
            "POST {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nAuthorization: Bearer {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            path, port, token
        ),
    )
    .await
}

fn response_body(response: &str) -> &str {
    response.split_once("\r\n\r\n").map(|(_, body)| body).unwrap_or("")
}

/// Start an echo application that describes what it received
async fn start_backend(port: u16) -> JoinHandle<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("none")
                            .to_string()
                    };
                    let body = format!(
                        "target={} strategy={} domain={} path={} auth={} forwarded_host={}",
                        header("x-dispatch-target"),
                        header("x-dispatch-strategy"),
                        header("x-dispatch-domain"),
                        req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
                        header("authorization"),
                        header("x-forwarded-host"),
                    );
                    Ok::<_, hyper::Error>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    })
}

fn test_config(backend_port: u16) -> Config {
    let mut config = Config::default();
    config.reserved.names = vec!["api".to_string(), "www".to_string(), "admin".to_string()];
    config.auth.jwt_secret = Some(JWT_SECRET.to_string());

    let mut targets = HashMap::new();
    targets.insert("acme".to_string(), format!("127.0.0.1:{}", backend_port));
    targets.insert("globex".to_string(), format!("127.0.0.1:{}", backend_port));
    // Nothing listens here
    targets.insert("offline".to_string(), "127.0.0.1:1".to_string());
    config.invoke.targets = targets;
    config.invoke.request_timeout_secs = 5;
    config
}

fn static_store() -> StaticDomainStore {
    let store = StaticDomainStore::new();
    store.upsert(CustomDomainRecord::new("custom.example.com", "acme"));
    let mut revoked = CustomDomainRecord::new("revoked.example.com", "acme");
    revoked.active = false;
    store.upsert(revoked);
    store
}

fn token() -> String {
    JwtVerifier::new(JWT_SECRET, None, None, 0)
        .create_token("user-1", &["dispatch"], chrono::Duration::minutes(5))
        .unwrap()
}

struct TestStack {
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl TestStack {
    async fn start(config: Config, store: Arc<dyn DomainStore>, proxy_port: u16, admin_port: u16) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = Arc::new(ConnectionPool::new(PoolConfig::from_server(&config.server)));
        let verifier = Arc::new(JwtVerifier::from_config(
            &config.auth,
            config.auth.jwt_secret.as_deref().unwrap(),
        ));
        let invoker = Arc::new(HttpInvoker::new(
            TargetRegistry::from_config(&config.invoke),
            Arc::clone(&pool),
        ));
        let dispatcher = Arc::new(Dispatcher::from_config(&config, store, verifier, invoker));

        let proxy_addr: SocketAddr = format!("127.0.0.1:{}", proxy_port).parse().unwrap();
        let server = DispatchServer::new(proxy_addr, Arc::clone(&dispatcher), shutdown_rx.clone());
        let proxy_handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        let admin_addr: SocketAddr = format!("127.0.0.1:{}", admin_port).parse().unwrap();
        let state = AdminState::new(Arc::clone(&dispatcher), ADMIN_TOKEN.to_string()).with_pool(pool);
        let admin = AdminServer::new(admin_addr, state, shutdown_rx);
        let admin_handle = tokio::spawn(async move {
            let _ = admin.run().await;
        });

        assert!(wait_for_port(proxy_port, Duration::from_secs(2)).await);
        assert!(wait_for_port(admin_port, Duration::from_secs(2)).await);

        Self {
            dispatcher,
            shutdown_tx,
            handles: vec![proxy_handle, admin_handle],
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// Configuration Tests
// ============================================================================

#[test]
fn test_full_config_parsing() {
    let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
pool_max_idle_per_host = 16

[platform]
domain = "apps.example.net"
dispatch_prefix = "/run"
query_param = "app"
dispatch_hosts = ["apps.example.net"]

[reserved]
names = ["api", "www"]
internal_allow = ["api"]

[domains]
store = "sqlite"
database = "/var/lib/edgedispatch/domains.db"
cache_ttl_secs = 60
negative_ttl_secs = 5

[auth]
jwt_secret = "s3cret"
audience = "dispatch"

[rate_limit]
requests_per_window = 100
anonymous_requests_per_window = 10
window_secs = 30

[invoke]
upstream_template = "{target}.svc.internal:8080"

[invoke.targets]
acme = "10.0.0.5:9000"
"#;

    let config: Config = toml::from_str(toml).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server.admin_port, 9000);
    assert_eq!(config.server.pool_max_idle_per_host, 16);
    assert_eq!(config.platform.dispatch_prefix, "/run");
    assert_eq!(config.platform.dispatch_hosts, vec!["apps.example.net".to_string()]);
    assert_eq!(config.domains.store, DomainStoreKind::Sqlite);
    assert_eq!(config.domains.cache_ttl(), Duration::from_secs(60));
    assert_eq!(config.auth.audience.as_deref(), Some("dispatch"));
    assert_eq!(config.rate_limit.anonymous_quota(), 10);

    let registry = TargetRegistry::from_config(&config.invoke);
    assert_eq!(registry.upstream_for("acme").as_deref(), Some("10.0.0.5:9000"));
    assert_eq!(registry.upstream_for("globex").as_deref(), Some("globex.svc.internal:8080"));
}

#[test]
fn test_invalid_config_reports_every_problem() {
    let toml = r#"
[platform]
dispatch_prefix = "run"

[domains]
store = "sqlite"

[invoke]
upstream_template = "static.internal:8080"
"#;

    let config: Config = toml::from_str(toml).unwrap();
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("dispatch_prefix"), "{}", err);
    assert!(err.contains("domains.database"), "{}", err);
    assert!(err.contains("upstream_template"), "{}", err);
}

// ============================================================================
// Dispatch Tests
// ============================================================================

#[tokio::test]
async fn test_wildcard_dispatch_end_to_end() {
    let proxy_port = 31010;
    let admin_port = 31011;
    let backend_port = 31012;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_host(proxy_port, "/hello?x=1", "acme.platform.dev").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    let body = response_body(&response);
    assert!(body.contains("target=acme"), "Body: {}", body);
    assert!(body.contains("strategy=wildcard-subdomain"), "Body: {}", body);
    assert!(body.contains("domain=none"), "Body: {}", body);
    assert!(body.contains("path=/hello?x=1"), "Body: {}", body);
    assert!(body.contains("forwarded_host=acme.platform.dev"), "Body: {}", body);

    // Host names are case-insensitive and may carry a port
    let response = http_get_with_host(proxy_port, "/", "GLOBEX.Platform.Dev:8080").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response_body(&response).contains("target=globex"));

    // The credential is left for the application on host-based dispatch
    let response = http_get_with_auth(proxy_port, "/", "acme.platform.dev", "app-session").await.unwrap();
    assert!(response_body(&response).contains("auth=Bearer app-session"), "Response: {}", response);

    assert_eq!(stack.dispatcher.stats().get_dispatched(), 3);

    stack.stop().await;
    backend.abort();
}

#[tokio::test]
async fn test_custom_domain_dispatch() {
    let proxy_port = 31020;
    let admin_port = 31021;
    let backend_port = 31022;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_host(proxy_port, "/shop", "custom.example.com").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    let body = response_body(&response);
    assert!(body.contains("target=acme"), "Body: {}", body);
    assert!(body.contains("strategy=custom-domain"), "Body: {}", body);
    assert!(body.contains("domain=custom.example.com"), "Body: {}", body);
    assert!(body.contains("path=/shop"), "Body: {}", body);

    // Second request is answered from the cache
    let response = http_get_with_host(proxy_port, "/", "custom.example.com").await.unwrap();
    assert!(response.contains("200 OK"));
    assert_eq!(stack.dispatcher.domains().stats().get_store_queries(), 1);

    let response = http_get_with_host(proxy_port, "/", "revoked.example.com").await.unwrap();
    assert!(response.contains("404"), "Response: {}", response);
    assert!(response.contains("NOT_FOUND"), "Response: {}", response);
    assert!(!response.contains("revoked.example.com\""), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "unknown.example.org").await.unwrap();
    assert!(response.contains("404"), "Response: {}", response);
    assert!(response.to_lowercase().contains("x-request-id"), "Response: {}", response);

    stack.stop().await;
    backend.abort();
}

#[tokio::test]
async fn test_path_dispatch_requires_credential() {
    let proxy_port = 31030;
    let admin_port = 31031;
    let backend_port = 31032;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_host(proxy_port, "/dispatch/acme/status", "platform.dev").await.unwrap();
    assert!(response.contains("401"), "Response: {}", response);
    assert!(response.contains("UNAUTHORIZED"), "Response: {}", response);

    let response = http_get_with_auth(proxy_port, "/dispatch/acme/status", "platform.dev", "not-a-jwt")
        .await
        .unwrap();
    assert!(response.contains("401"), "Response: {}", response);

    let response = http_get_with_auth(proxy_port, "/dispatch/acme/status?verbose=1", "platform.dev", &token())
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    let body = response_body(&response);
    assert!(body.contains("target=acme"), "Body: {}", body);
    assert!(body.contains("strategy=path"), "Body: {}", body);
    assert!(body.contains("path=/status?verbose=1"), "Body: {}", body);
    // The platform credential never reaches the application
    assert!(body.contains("auth=none"), "Body: {}", body);

    stack.stop().await;
    backend.abort();
}

#[tokio::test]
async fn test_query_dispatch() {
    let proxy_port = 31040;
    let admin_port = 31041;
    let backend_port = 31042;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_auth(proxy_port, "/dispatch?worker=globex&page=2", "platform.dev", &token())
        .await
        .unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    let body = response_body(&response);
    assert!(body.contains("target=globex"), "Body: {}", body);
    assert!(body.contains("strategy=query"), "Body: {}", body);
    assert!(body.contains("path=/?page=2"), "Body: {}", body);

    let response = http_get_with_auth(proxy_port, "/dispatch?worker=a&worker=b", "platform.dev", &token())
        .await
        .unwrap();
    assert!(response.contains("400"), "Response: {}", response);
    assert!(response.contains("MALFORMED_ROUTE"), "Response: {}", response);

    stack.stop().await;
    backend.abort();
}

#[tokio::test]
async fn test_reserved_and_unroutable_requests() {
    let proxy_port = 31050;
    let admin_port = 31051;
    let backend_port = 31052;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_host(proxy_port, "/", "admin.platform.dev").await.unwrap();
    assert!(response.contains("403"), "Response: {}", response);
    assert!(response.contains("FORBIDDEN_TARGET"), "Response: {}", response);

    let response = http_get_with_auth(proxy_port, "/dispatch/www/", "platform.dev", &token())
        .await
        .unwrap();
    assert!(response.contains("FORBIDDEN_TARGET"), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "platform.dev").await.unwrap();
    assert!(response.contains("NO_ROUTE"), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "bad_label.platform.dev").await.unwrap();
    assert!(response.contains("MALFORMED_ROUTE"), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "ghost.platform.dev").await.unwrap();
    assert!(response.contains("502"), "Response: {}", response);
    assert!(response.contains("TARGET_NOT_FOUND"), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "offline.platform.dev").await.unwrap();
    assert!(response.contains("503"), "Response: {}", response);
    assert!(response.contains("TARGET_UNAVAILABLE"), "Response: {}", response);

    assert_eq!(stack.dispatcher.stats().get_dispatched(), 0);

    stack.stop().await;
    backend.abort();
}

#[tokio::test]
async fn test_rate_limit_through_listener() {
    let proxy_port = 31060;
    let admin_port = 31061;
    let backend_port = 31062;

    let backend = start_backend(backend_port).await;
    let mut config = test_config(backend_port);
    config.rate_limit.requests_per_window = 2;
    config.rate_limit.window_secs = 3600;
    let stack = TestStack::start(config, Arc::new(static_store()), proxy_port, admin_port).await;

    for _ in 0..2 {
        let response = http_get_with_host(proxy_port, "/", "acme.platform.dev").await.unwrap();
        assert!(response.contains("200 OK"), "Response: {}", response);
    }

    let response = http_get_with_host(proxy_port, "/", "acme.platform.dev").await.unwrap();
    assert!(response.contains("429"), "Response: {}", response);
    assert!(response.contains("RATE_LIMITED"), "Response: {}", response);
    assert!(response.to_lowercase().contains("retry-after"), "Response: {}", response);

    // Quotas are per target
    let response = http_get_with_host(proxy_port, "/", "globex.platform.dev").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);

    stack.stop().await;
    backend.abort();
}

// ============================================================================
// Admin API Tests
// ============================================================================

#[tokio::test]
async fn test_admin_api_endpoints() {
    let proxy_port = 31070;
    let admin_port = 31071;
    let backend_port = 31072;

    let backend = start_backend(backend_port).await;
    let stack = TestStack::start(test_config(backend_port), Arc::new(static_store()), proxy_port, admin_port).await;

    let response = http_get_with_host(admin_port, "/health", "127.0.0.1").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response.ends_with("ok"), "Response: {}", response);

    let response = http_get_with_host(admin_port, "/stats", "127.0.0.1").await.unwrap();
    assert!(response.contains("401"), "Response: {}", response);

    let response = http_get_with_host(proxy_port, "/", "custom.example.com").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);

    let response = http_get_with_auth(admin_port, "/stats", "127.0.0.1", ADMIN_TOKEN).await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    let stats: serde_json::Value = serde_json::from_str(response_body(&response)).unwrap();
    assert_eq!(stats["dispatcher"]["requests"], 1);
    assert_eq!(stats["domain_cache"]["entries"], 1);
    assert_eq!(stats["pool"]["total_requests"], 1);

    let response = http_post_with_auth(admin_port, "/domains/invalidate/custom.example.com", ADMIN_TOKEN)
        .await
        .unwrap();
    assert!(response.contains("\"invalidated\":true"), "Response: {}", response);
    assert_eq!(stack.dispatcher.domains().cached_len(), 0);

    stack.stop().await;
    backend.abort();
}

// ============================================================================
// SQLite Store Tests
// ============================================================================

#[tokio::test]
async fn test_sqlite_store_dispatch() {
    let proxy_port = 31080;
    let admin_port = 31081;
    let backend_port = 31082;

    let dir = tempfile::tempdir().unwrap();
    let store = SqliteDomainStore::open(dir.path().join("domains.db")).unwrap();
    store
        .upsert_domain(&CustomDomainRecord::new("shop.example.com", "globex"))
        .unwrap();

    let backend = start_backend(backend_port).await;
    let mut config = test_config(backend_port);
    config.domains.store = DomainStoreKind::Sqlite;
    let stack = TestStack::start(config, Arc::new(store.clone()), proxy_port, admin_port).await;

    let response = http_get_with_host(proxy_port, "/cart", "shop.example.com").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);
    assert!(response_body(&response).contains("target=globex"), "Response: {}", response);

    // Deactivation takes effect once the cached answer is invalidated
    assert!(store.deactivate_domain("shop.example.com").unwrap());
    let response = http_get_with_host(proxy_port, "/cart", "shop.example.com").await.unwrap();
    assert!(response.contains("200 OK"), "Response: {}", response);

    assert!(stack.dispatcher.domains().invalidate("shop.example.com"));
    let response = http_get_with_host(proxy_port, "/cart", "shop.example.com").await.unwrap();
    assert!(response.contains("404"), "Response: {}", response);

    stack.stop().await;
    backend.abort();
}
