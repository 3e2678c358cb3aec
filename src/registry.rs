//! Service registry: the routing table built from discovered containers
//!
//! The registry maps a service id (the owning container id) to the routes and
//! TLS-eligible patterns that container declared. It is written by the
//! discovery task and read by every request and every TLS handshake.
//!
//! Writes are copy-on-write: the map is swapped under a short write lock, and
//! readers take a [`Snapshot`] (an `Arc` clone) that never changes after it
//! was taken. No lock is ever held while matching hostnames.

use crate::pattern::HostPattern;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Scheme used to reach a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(format!("unsupported scheme '{}'", other)),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One reachable address for a service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backend {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Backend {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority())
    }
}

/// A compiled hostname pattern and the backend it routes to
#[derive(Debug, Clone)]
pub struct Route {
    pub pattern: HostPattern,
    pub backend: Backend,
}

/// Routing and TLS configuration contributed by one container
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    service_id: String,
    routes: Vec<Route>,
    tls_patterns: Vec<HostPattern>,
}

impl ServiceEntry {
    /// Build an entry. Returns `None` when `mappings` is empty, since a
    /// service without a resolvable port is never registered.
    pub fn new<I, S>(
        service_id: impl Into<String>,
        mappings: HashMap<String, Backend>,
        tls_patterns: I,
    ) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if mappings.is_empty() {
            return None;
        }

        let routes = mappings
            .into_iter()
            .map(|(pattern, backend)| Route {
                pattern: HostPattern::new(pattern),
                backend,
            })
            .collect();

        let mut tls: Vec<HostPattern> = Vec::new();
        for raw in tls_patterns {
            let pattern = HostPattern::new(raw);
            if !pattern.as_str().is_empty() && !tls.contains(&pattern) {
                tls.push(pattern);
            }
        }

        Some(Self {
            service_id: service_id.into(),
            routes,
            tls_patterns: tls,
        })
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn tls_patterns(&self) -> &[HostPattern] {
        &self.tls_patterns
    }

    /// Backend declared for a pattern, looked up by its literal text
    pub fn backend_for(&self, pattern: &str) -> Option<&Backend> {
        self.routes
            .iter()
            .find(|r| r.pattern.as_str() == pattern)
            .map(|r| &r.backend)
    }

    /// Append this entry's matches for `hostname`.
    ///
    /// An exact match wins and suppresses this entry's wildcard routes;
    /// otherwise every matching wildcard route contributes its backend.
    fn resolve_into(&self, hostname: &str, out: &mut Vec<Backend>) {
        if let Some(route) = self.routes.iter().find(|r| r.pattern.matches_exact(hostname)) {
            out.push(route.backend.clone());
            return;
        }

        out.extend(
            self.routes
                .iter()
                .filter(|r| r.pattern.matches_wildcard(hostname))
                .map(|r| r.backend.clone()),
        );
    }

    fn allows_tls(&self, hostname: &str) -> bool {
        self.tls_patterns.iter().any(|p| p.matches(hostname))
    }
}

type ServiceMap = HashMap<String, Arc<ServiceEntry>>;

/// Concurrent store of all registered services
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<Arc<ServiceMap>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or fully replace the entry for `entry.service_id()`.
    /// Returns true if an existing entry was replaced.
    pub fn upsert(&self, entry: ServiceEntry) -> bool {
        let id = entry.service_id.clone();
        let routes = entry.routes.len();
        let entry = Arc::new(entry);

        let mut guard = self.services.write();
        let mut next: ServiceMap = (**guard).clone();
        let replaced = next.insert(id.clone(), entry).is_some();
        *guard = Arc::new(next);
        drop(guard);

        debug!(service_id = %id, routes, replaced, "Service registered");
        replaced
    }

    /// Remove a service; no-op if it is not registered.
    /// Returns true if something was removed.
    pub fn remove(&self, service_id: &str) -> bool {
        let mut guard = self.services.write();
        if !guard.contains_key(service_id) {
            return false;
        }
        let mut next: ServiceMap = (**guard).clone();
        next.remove(service_id);
        *guard = Arc::new(next);
        drop(guard);

        debug!(service_id, "Service removed");
        true
    }

    /// Point-in-time view of every registered service
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            services: self.services.read().clone(),
        }
    }

    /// Resolve against the current state (see [`Snapshot::resolve`])
    pub fn resolve(&self, hostname: &str) -> Vec<Backend> {
        self.snapshot().resolve(hostname)
    }

    /// Certificate policy check against the current state
    pub fn is_tls_authorized(&self, hostname: &str) -> bool {
        self.snapshot().is_tls_authorized(hostname)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn service_ids(&self) -> Vec<String> {
        self.snapshot().services.keys().cloned().collect()
    }
}

/// Immutable view of the registry at one instant
#[derive(Debug, Clone)]
pub struct Snapshot {
    services: Arc<ServiceMap>,
}

impl Snapshot {
    /// Every backend matching `hostname`, possibly from several services.
    ///
    /// A trailing `:port` on the hostname is ignored. The order across
    /// services is unspecified; an empty result means no service claims
    /// the hostname.
    pub fn resolve(&self, hostname: &str) -> Vec<Backend> {
        let hostname = strip_port(hostname);
        let mut backends = Vec::new();
        for entry in self.services.values() {
            entry.resolve_into(hostname, &mut backends);
        }
        backends
    }

    /// True iff some service lists a TLS pattern matching `hostname`
    pub fn is_tls_authorized(&self, hostname: &str) -> bool {
        let hostname = strip_port(hostname);
        self.services.values().any(|e| e.allows_tls(hostname))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Drop a `:port` suffix. Handles `[v6]:port`; bare IPv6 literals are
/// returned untouched.
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return host;
    }

    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name
        }
        _ => host,
    }
}
