//! Target invocation
//!
//! `ComputeInvoker` is the seam between the dispatcher and whatever runs
//! tenant code. `HttpInvoker` forwards to an upstream HTTP authority chosen
//! by the `TargetRegistry`.

use crate::config::InvokeConfig;
use crate::pool::{ConnectionPool, PoolError};
use crate::request::{DispatchTarget, ProxyBody};
use async_trait::async_trait;
use hyper::{Request, Response};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const TARGET_PLACEHOLDER: &str = "{target}";

#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// No compute unit exists for the identifier
    #[error("no compute unit for target '{0}'")]
    NotFound(String),

    /// No connection could be opened, so nothing was sent
    #[error("target refused connection: {0}")]
    Connect(String),

    /// The compute unit dropped the request or its connection
    #[error("target unreachable: {0}")]
    Unavailable(String),

    #[error("target timed out after {0:?}")]
    Timeout(Duration),

    #[error("invocation failed: {0}")]
    Internal(String),
}

impl InvokeError {
    /// Failures worth a single retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvokeError::Connect(_) | InvokeError::Unavailable(_) | InvokeError::Timeout(_)
        )
    }

    /// The request never left the dispatcher, so replaying it is safe for
    /// any method
    pub fn never_sent(&self) -> bool {
        matches!(self, InvokeError::Connect(_))
    }
}

/// Invocation collaborator
#[async_trait]
pub trait ComputeInvoker: Send + Sync {
    async fn invoke(
        &self,
        target: &DispatchTarget,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, InvokeError>;
}

/// Maps target identifiers to upstream authorities
#[derive(Debug, Clone, Default)]
pub struct TargetRegistry {
    targets: HashMap<String, String>,
    template: Option<String>,
}

impl TargetRegistry {
    pub fn new(targets: HashMap<String, String>, template: Option<String>) -> Self {
        let targets = targets
            .into_iter()
            .map(|(id, upstream)| (id.to_ascii_lowercase(), upstream))
            .collect();
        Self { targets, template }
    }

    pub fn from_config(config: &InvokeConfig) -> Self {
        Self::new(config.targets.clone(), config.upstream_template.clone())
    }

    /// Explicit entries win over the template
    pub fn upstream_for(&self, identifier: &str) -> Option<String> {
        if let Some(upstream) = self.targets.get(identifier) {
            return Some(upstream.clone());
        }
        self.template
            .as_ref()
            .map(|t| t.replace(TARGET_PLACEHOLDER, identifier))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty() && self.template.is_none()
    }
}

pub struct HttpInvoker {
    registry: TargetRegistry,
    pool: Arc<ConnectionPool>,
}

impl HttpInvoker {
    pub fn new(registry: TargetRegistry, pool: Arc<ConnectionPool>) -> Self {
        Self { registry, pool }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}

#[async_trait]
impl ComputeInvoker for HttpInvoker {
    async fn invoke(
        &self,
        target: &DispatchTarget,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>, InvokeError> {
        let upstream = self
            .registry
            .upstream_for(&target.identifier)
            .ok_or_else(|| InvokeError::NotFound(target.identifier.clone()))?;

        debug!(target_id = %target.identifier, upstream, "Invoking target");

        self.pool
            .send_request(request, &upstream)
            .await
            .map_err(|e| match e {
                PoolError::RequestBuild(msg) => InvokeError::Internal(msg),
                e if e.is_connect() => InvokeError::Connect(e.to_string()),
                PoolError::Client(err) => InvokeError::Unavailable(err.to_string()),
            })
    }
}
