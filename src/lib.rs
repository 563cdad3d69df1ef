//! Edgedispatch - the edge dispatch layer of a multi-tenant compute platform
//!
//! Every inbound HTTP request is mapped to one target application and relayed to it:
//! - Wildcard subdomains (`<id>.<platform domain>`) and verified custom domains
//!   dispatch by host, with custom domain lookups cached and coalesced
//! - Path (`/dispatch/<id>/...`) and query (`?worker=<id>`) dispatch require a
//!   bearer JWT
//! - Reserved platform names are never routable as tenant targets
//! - Fixed-window quotas per caller identity and target
//! - Transient target failures are retried once when the request is replayable
//! - Every failure is answered with a stable machine-readable error code

pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod domains;
pub mod error;
pub mod executor;
pub mod invoke;
pub mod pool;
pub mod proxy;
pub mod ratelimit;
pub mod request;
pub mod reserved;
pub mod resolver;
