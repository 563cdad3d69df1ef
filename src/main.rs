use edgedispatch::admin::{AdminServer, AdminState, PKG_NAME, VERSION};
use edgedispatch::auth::JwtVerifier;
use edgedispatch::config::{Config, DomainStoreKind};
use edgedispatch::db::SqliteDomainStore;
use edgedispatch::dispatcher::Dispatcher;
use edgedispatch::domains::{DomainResolver, DomainStore, StaticDomainStore};
use edgedispatch::invoke::{HttpInvoker, TargetRegistry};
use edgedispatch::pool::{ConnectionPool, PoolConfig};
use edgedispatch::proxy::{load_tls_acceptor, DispatchServer};
use edgedispatch::ratelimit::RateLimiter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgedispatch=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("edgedispatch.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store: Arc<dyn DomainStore> = match config.domains.store {
        DomainStoreKind::Static => Arc::new(StaticDomainStore::from_config(&config.domains.records)),
        DomainStoreKind::Sqlite => {
            let path = config
                .domains
                .database
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("domains.database is required for the sqlite store"))?;
            Arc::new(SqliteDomainStore::open(path)?)
        }
    };

    let jwt_secret = config.auth.jwt_secret.clone().unwrap_or_else(|| {
        warn!("No auth.jwt_secret configured; path and query dispatch will reject every credential");
        uuid::Uuid::new_v4().to_string()
    });
    let verifier = Arc::new(JwtVerifier::from_config(&config.auth, &jwt_secret));

    let pool_config = PoolConfig::from_server(&config.server);
    info!(
        max_idle = pool_config.max_idle_per_host,
        idle_timeout_secs = pool_config.idle_timeout.as_secs(),
        "Connection pool configured"
    );
    let pool = Arc::new(ConnectionPool::new(pool_config));

    let registry = TargetRegistry::from_config(&config.invoke);
    if registry.is_empty() && config.invoke.upstream_template.is_none() {
        warn!("No invoke targets or upstream_template configured; every dispatch will be TARGET_NOT_FOUND");
    }
    let invoker = Arc::new(HttpInvoker::new(registry, Arc::clone(&pool)));

    let dispatcher = Arc::new(Dispatcher::from_config(&config, store, verifier, invoker));

    // HTTP listener (if port > 0)
    let http_port = config.server.port;
    let https_port = config.server.https_port();
    let http_handle = if http_port > 0 {
        let http_addr = bind_addr(&config.server.bind, http_port)?;
        let server = DispatchServer::new(http_addr, Arc::clone(&dispatcher), shutdown_rx.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP dispatch server error");
            }
        }))
    } else {
        None
    };

    // HTTPS listener (if TLS configured)
    let https_handle = match (&config.server.tls_cert, &config.server.tls_key) {
        (Some(cert), Some(key)) if https_port > 0 => {
            let acceptor = load_tls_acceptor(cert, key)?;
            info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
            let https_addr = bind_addr(&config.server.bind, https_port)?;
            let server = DispatchServer::new(https_addr, Arc::clone(&dispatcher), shutdown_rx.clone())
                .with_tls(acceptor);
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!(error = %e, "HTTPS dispatch server error");
                }
            }))
        }
        _ => None,
    };

    // Admin server (always HTTP, loopback only)
    let admin_addr = bind_addr("127.0.0.1", config.server.admin_port)?;
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });
    let admin_state = AdminState::new(Arc::clone(&dispatcher), admin_token).with_pool(Arc::clone(&pool));
    let admin_server = AdminServer::new(admin_addr, admin_state, shutdown_rx.clone());
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    tokio::spawn(domain_purge_loop(
        Arc::clone(dispatcher.domains()),
        config.domains.purge_interval(),
        shutdown_rx.clone(),
    ));
    tokio::spawn(rate_purge_loop(
        Arc::clone(dispatcher.limiter()),
        config.rate_limit.purge_interval(),
        shutdown_rx.clone(),
    ));

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(handle) = http_handle {
            let _ = handle.await;
        }
        if let Some(handle) = https_handle {
            let _ = handle.await;
        }
        let _ = admin_handle.await;
    })
    .await;

    info!(
        requests = dispatcher.stats().get_requests(),
        dispatched = dispatcher.stats().get_dispatched(),
        rejected = dispatcher.stats().get_rejected(),
        "Shutdown complete"
    );
    Ok(())
}

fn bind_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", host, port).parse().map_err(|e| {
        error!(bind = %host, port, error = %e, "Invalid bind address");
        anyhow::anyhow!("Invalid bind address {}:{}: {}", host, port, e)
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received SIGINT (Ctrl+C), shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    Ok(())
}

async fn domain_purge_loop(domains: Arc<DomainResolver>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let purged = domains.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = domains.cached_len(), "Purged expired domain cache entries");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn rate_purge_loop(limiter: Arc<RateLimiter>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let purged = limiter.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = limiter.tracked_keys(), "Purged expired rate windows");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting edge dispatcher");
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if config.server.port > 0 { Some(config.server.port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        admin_port = config.server.admin_port,
        tls = config.server.tls_enabled(),
        "Server configuration"
    );
    info!(
        domain = %config.platform.domain,
        dispatch_prefix = %config.platform.dispatch_prefix,
        query_param = %config.platform.query_param,
        dispatch_hosts = ?config.platform.dispatch_hosts,
        "Dispatch entry points"
    );
    info!(
        reserved = config.reserved.names.len(),
        internal_allow = ?config.reserved.internal_allow,
        "Reserved names"
    );
    info!(
        store = ?config.domains.store,
        cache_ttl_secs = config.domains.cache_ttl_secs,
        negative_ttl_secs = config.domains.negative_ttl_secs,
        lookup_timeout_ms = config.domains.lookup_timeout_ms,
        "Custom domain settings"
    );
    info!(
        enabled = config.rate_limit.enabled,
        quota = config.rate_limit.requests_per_window,
        anonymous_quota = config.rate_limit.anonymous_quota(),
        window_secs = config.rate_limit.window_secs,
        "Rate limit settings"
    );
    info!(
        request_timeout_secs = config.invoke.request_timeout_secs,
        retry_backoff_ms = config.invoke.retry_backoff_ms,
        targets = config.invoke.targets.len(),
        upstream_template = ?config.invoke.upstream_template,
        "Invocation settings"
    );
}
