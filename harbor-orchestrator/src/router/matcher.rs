//! Host pattern matching.

use harbor_protocol::{Config, Service};
use regex::Regex;
use std::sync::Arc;

use crate::error::RouteError;

/// Compiles a host pattern into an anchored, case-insensitive regex.
///
/// `*` stands for exactly one label: `sub.*.example.com` matches `sub.a.example.com` but
/// neither `sub.example.com` nor `sub.a.b.example.com`. Everything else is literal.
pub fn host_regex(pattern: &str) -> Result<Regex, RouteError> {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^.]+");

    Regex::new(&format!("(?i)^{}$", body)).map_err(|source| RouteError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Lowercases a `Host` header value and strips its port and any trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = if let Some(end) = host.strip_prefix('[').and_then(|h| h.find(']')) {
        &host[..end + 2]
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                name
            }
            _ => host,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Every (pattern, service) pair of a config, in service-name then host order.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    routes: Vec<Route>,
}

#[derive(Debug, Clone)]
struct Route {
    pattern: String,
    regex: Regex,
    service: Arc<Service>,
}

impl HostMatcher {
    pub fn new(config: &Config) -> Result<Self, RouteError> {
        let mut routes = Vec::new();
        for service in config.services().values() {
            for pattern in service.hosts() {
                routes.push(Route {
                    pattern: pattern.clone(),
                    regex: host_regex(pattern)?,
                    service: Arc::clone(service),
                });
            }
        }
        Ok(Self { routes })
    }

    /// The first service with a pattern matching `host`. There is no specificity ranking.
    pub fn service_for(&self, host: &str) -> Option<&Arc<Service>> {
        self.routes
            .iter()
            .find(|route| route.regex.is_match(host))
            .map(|route| &route.service)
    }

    /// Patterns without wildcards, the hosts a certificate can be requested for.
    pub fn exact_hosts(&self) -> impl Iterator<Item = &str> {
        self.routes
            .iter()
            .map(|route| route.pattern.as_str())
            .filter(|pattern| !pattern.contains('*'))
    }
}
