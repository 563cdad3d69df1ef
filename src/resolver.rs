//! Host/path resolver: classifies a request into a dispatch strategy
//!
//! Precedence is fixed and first match wins:
//! 1. path dispatch (`<prefix>/<id>/<rest>`)
//! 2. query dispatch (`<prefix>?<param>=<id>`)
//! 3. custom domain (any host outside the platform domain)
//! 4. wildcard subdomain (`<id>.<platform-domain>`)

use crate::config::PlatformConfig;
use crate::error::DispatchError;
use crate::request::{DispatchRequest, DispatchStrategy, DispatchTarget};
use std::collections::HashSet;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Outcome of classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The identifier is known from the request itself
    Target(DispatchTarget),
    /// The host must be looked up in the domain store
    CustomDomain { host: String, forwarded_path: String },
}

impl Resolution {
    pub fn strategy(&self) -> DispatchStrategy {
        match self {
            Resolution::Target(target) => target.strategy,
            Resolution::CustomDomain { .. } => DispatchStrategy::CustomDomain,
        }
    }
}

/// Normalize a Host header value: strip the port and a trailing dot, lowercase,
/// and reject anything outside `[a-z0-9.-]` or with empty labels.
pub fn normalize_host(raw: &str) -> Option<String> {
    let host = raw.trim();

    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        Some(_) => return None,
        None => host,
    };
    let host = host.strip_suffix('.').unwrap_or(host);

    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only. Keeps hosts safe to log and to use
    // as store keys.
    if !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.') {
        return None;
    }

    if host.split('.').any(|label| label.is_empty()) {
        return None;
    }

    Some(host.to_ascii_lowercase())
}

/// Validate a target identifier and return its canonical (lowercase) form.
///
/// 1..=`max_len` ASCII alphanumerics or hyphens, not starting or ending
/// with a hyphen.
pub fn validate_identifier(raw: &str, max_len: usize) -> Option<String> {
    if raw.is_empty() || raw.len() > max_len {
        return None;
    }
    if !raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    if raw.starts_with('-') || raw.ends_with('-') {
        return None;
    }
    Some(raw.to_ascii_lowercase())
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

pub struct Resolver {
    platform_domain: String,
    wildcard_suffix: String,
    dispatch_prefix: String,
    query_param: String,
    dispatch_hosts: HashSet<String>,
    max_identifier_len: usize,
}

impl Resolver {
    pub fn new(config: &PlatformConfig) -> Self {
        Self {
            platform_domain: config.domain.clone(),
            wildcard_suffix: format!(".{}", config.domain),
            dispatch_prefix: config.dispatch_prefix.clone(),
            query_param: config.query_param.clone(),
            dispatch_hosts: config
                .dispatch_hosts
                .iter()
                .filter_map(|h| normalize_host(h))
                .collect(),
            max_identifier_len: config.max_identifier_len,
        }
    }

    pub fn resolve(&self, req: &DispatchRequest) -> Result<Resolution, DispatchError> {
        self.resolve_parts(req.raw_host(), req.path(), req.query())
    }

    pub fn resolve_parts(
        &self,
        raw_host: Option<&str>,
        path: &str,
        query: Option<&str>,
    ) -> Result<Resolution, DispatchError> {
        let host = raw_host.and_then(normalize_host);

        if self.dispatch_enabled_on(host.as_deref()) {
            if let Some(target) = self.match_path(path, query)? {
                return Ok(Resolution::Target(target));
            }
            if let Some(target) = self.match_query(path, query)? {
                return Ok(Resolution::Target(target));
            }
        }

        let host = host.ok_or(DispatchError::MalformedRoute("missing or invalid Host header"))?;
        let forwarded_path = with_query(path, query);

        if host == self.platform_domain {
            return Err(DispatchError::NoRoute);
        }

        match host.strip_suffix(&self.wildcard_suffix) {
            None => Ok(Resolution::CustomDomain { host, forwarded_path }),
            Some(label) => {
                let identifier = validate_identifier(label, self.max_identifier_len)
                    .ok_or(DispatchError::MalformedRoute("invalid target identifier"))?;
                Ok(Resolution::Target(DispatchTarget::new(
                    identifier,
                    DispatchStrategy::WildcardSubdomain,
                    forwarded_path,
                )))
            }
        }
    }

    fn dispatch_enabled_on(&self, host: Option<&str>) -> bool {
        if self.dispatch_hosts.is_empty() {
            return true;
        }
        host.map(|h| self.dispatch_hosts.contains(h)).unwrap_or(false)
    }

    /// `<prefix>/<id>` or `<prefix>/<id>/<rest>`
    fn match_path(&self, path: &str, query: Option<&str>) -> Result<Option<DispatchTarget>, DispatchError> {
        let rest = match path
            .strip_prefix(self.dispatch_prefix.as_str())
            .and_then(|r| r.strip_prefix('/'))
        {
            Some(rest) if !rest.is_empty() => rest,
            _ => return Ok(None),
        };

        let (segment, remainder) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        let identifier = validate_identifier(segment, self.max_identifier_len)
            .ok_or(DispatchError::MalformedRoute("invalid target identifier"))?;

        let forwarded = if remainder.is_empty() { "/" } else { remainder };

        Ok(Some(DispatchTarget::new(
            identifier,
            DispatchStrategy::Path,
            with_query(forwarded, query),
        )))
    }

    /// `<prefix>?<param>=<id>[&...]`
    fn match_query(&self, path: &str, query: Option<&str>) -> Result<Option<DispatchTarget>, DispatchError> {
        let on_endpoint = path == self.dispatch_prefix
            || path.strip_prefix(self.dispatch_prefix.as_str()) == Some("/");
        let query = match query {
            Some(q) if on_endpoint => q,
            _ => return Ok(None),
        };

        let mut values = Vec::new();
        let mut remaining = Vec::new();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let is_param = urlencoding::decode(raw_key)
                .map(|k| k == self.query_param)
                .unwrap_or(false);
            if is_param {
                values.push(raw_value);
            } else {
                remaining.push(pair);
            }
        }

        let raw_value = match values.as_slice() {
            [] => return Ok(None),
            [single] => *single,
            _ => return Err(DispatchError::MalformedRoute("repeated target parameter")),
        };

        let decoded = urlencoding::decode(raw_value)
            .map_err(|_| DispatchError::MalformedRoute("invalid target identifier"))?;
        let identifier = validate_identifier(&decoded, self.max_identifier_len)
            .ok_or(DispatchError::MalformedRoute("invalid target identifier"))?;

        let rest = remaining.join("&");
        Ok(Some(DispatchTarget::new(
            identifier,
            DispatchStrategy::Query,
            with_query("/", Some(&rest)),
        )))
    }
}
