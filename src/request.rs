//! Per-request data model: the inbound request and the resolved target

use chrono::{DateTime, Utc};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HOST};
use hyper::{Method, Request, Uri};
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";

/// Body type flowing through the dispatcher in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Build a body from a complete buffer
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Build an empty body
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// How a request was mapped to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchStrategy {
    /// `<id>.<platform-domain>`
    WildcardSubdomain,
    /// Customer-owned host mapped through the domain store
    CustomDomain,
    /// `<prefix>/<id>/<rest>`
    Path,
    /// `<prefix>?worker=<id>`
    Query,
}

impl DispatchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStrategy::WildcardSubdomain => "wildcard-subdomain",
            DispatchStrategy::CustomDomain => "custom-domain",
            DispatchStrategy::Path => "path",
            DispatchStrategy::Query => "query",
        }
    }

    /// Path and query dispatch are the platform's administrative entry
    /// points. Host-based forms leave authorization to the target.
    pub fn requires_credentials(&self) -> bool {
        matches!(self, DispatchStrategy::Path | DispatchStrategy::Query)
    }
}

impl fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing metadata carried over from a custom-domain record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRoute {
    pub host: String,
    pub updated_at: DateTime<Utc>,
}

/// A resolved destination. Re-derived for every request and consumed once
/// by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub identifier: String,
    pub strategy: DispatchStrategy,
    /// Path and query to send to the target
    pub forwarded_path: String,
    pub domain: Option<DomainRoute>,
}

impl DispatchTarget {
    pub fn new(identifier: impl Into<String>, strategy: DispatchStrategy, forwarded_path: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            strategy,
            forwarded_path: forwarded_path.into(),
            domain: None,
        }
    }
}

/// The inbound unit of work
pub struct DispatchRequest {
    request: Request<ProxyBody>,
    client_addr: SocketAddr,
    is_tls: bool,
    request_id: String,
}

impl DispatchRequest {
    /// Wrap an inbound request, propagating `x-request-id` or generating one
    pub fn new(request: Request<ProxyBody>, client_addr: SocketAddr) -> Self {
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty() && v.len() <= 128)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            request,
            client_addr,
            is_tls: false,
            request_id,
        }
    }

    pub fn with_tls(mut self, is_tls: bool) -> Self {
        self.is_tls = is_tls;
        self
    }

    pub fn method(&self) -> &Method {
        self.request.method()
    }

    pub fn uri(&self) -> &Uri {
        self.request.uri()
    }

    pub fn path(&self) -> &str {
        self.request.uri().path()
    }

    pub fn query(&self) -> Option<&str> {
        self.request.uri().query()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Raw host as sent by the client. HTTP/2 requests carry it in the
    /// `:authority` pseudo-header, which hyper exposes through the URI.
    pub fn raw_host(&self) -> Option<&str> {
        self.request
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.request.uri().authority().map(|a| a.as_str()))
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn into_inner(self) -> Request<ProxyBody> {
        self.request
    }
}
