//! Service discovery from container runtime state
//!
//! Turns running containers into registry entries. A container opts in by
//! declaring its public hostnames in an environment variable:
//!
//! ```text
//! DOCKGATE_HOSTS=app.example.com,https://admin.example.com:8443,*.users.example.com:3000
//! DOCKGATE_LETSENCRYPT=app.example.com,*.users.example.com
//! ```
//!
//! Each host entry is `[scheme://]hostname[:private_port]`. The private port
//! selects which published port the hostname routes to; it may be omitted
//! when the container publishes exactly one port.
//!
//! TLS patterns are lowercased, since SNI names always arrive in lowercase.
//! Host patterns are kept as written.
//!
//! The feed subscribes to the runtime's event stream, then syncs the full
//! set of running containers, then follows the stream one event at a time.
//! Subscribing first means a container that starts during the sync is seen
//! either by the sync or as an event. When the stream drops, the feed
//! reconnects with exponential backoff and does the same again, so
//! containers that started or stopped while disconnected are reconciled.

use crate::config::DockerConfig;
use crate::registry::{Backend, Registry, Scheme, ServiceEntry};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Errors reported by a [`ContainerRuntime`]
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The runtime API could not be reached at all
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    /// A single container could not be inspected
    #[error("failed to inspect container {id}: {reason}")]
    Inspect { id: String, reason: String },
    /// The event stream failed
    #[error("event stream error: {0}")]
    Stream(String),
}

/// A published port: container-private port to host address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub private_port: u16,
    pub host_ip: String,
    pub public_port: u16,
}

/// What discovery needs to know about one container
#[derive(Debug, Clone, Default)]
pub struct ContainerFacts {
    pub id: String,
    /// `KEY=value` strings, as the runtime reports them
    pub env: Vec<String>,
    pub ports: Vec<PortMapping>,
}

impl ContainerFacts {
    /// Value of an environment variable; the last definition wins
    pub fn env_var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}

/// Lifecycle transitions the feed reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerAction {
    Start,
    Stop,
    Other(String),
}

impl ContainerAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => ContainerAction::Start,
            "stop" | "die" | "destroy" => ContainerAction::Stop,
            other => ContainerAction::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    pub action: ContainerAction,
    pub container_id: String,
}

pub type EventStream = BoxStream<'static, Result<ContainerEvent, DiscoveryError>>;

/// Read-only view of a container runtime
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Ids of all running containers
    fn list_running(&self) -> impl Future<Output = Result<Vec<String>, DiscoveryError>> + Send;

    /// Environment and published ports of one container
    fn inspect(&self, id: &str) -> impl Future<Output = Result<ContainerFacts, DiscoveryError>> + Send;

    /// Container lifecycle events from the moment of this call on, even if
    /// the stream is first polled later. The stream ends or yields an error
    /// when the connection is lost.
    fn events(&self) -> EventStream;
}

/// One item of the routing declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSpec {
    pub scheme: Scheme,
    pub hostname: String,
    pub port: Option<u16>,
}

/// Parse a comma-separated routing declaration. Invalid items are logged and
/// skipped so one typo does not hide the rest.
pub fn parse_host_specs(value: &str) -> Vec<HostSpec> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match parse_host_spec(item) {
            Ok(spec) => Some(spec),
            Err(e) => {
                warn!(entry = item, error = %e, "Ignoring invalid host entry");
                None
            }
        })
        .collect()
}

fn parse_host_spec(item: &str) -> Result<HostSpec, String> {
    let (scheme, rest) = match item.split_once("://") {
        Some((scheme, rest)) => (scheme.parse::<Scheme>()?, rest),
        None => (Scheme::Http, item),
    };

    // Anything after the authority is not part of the declaration
    let authority = rest.split('/').next().unwrap_or_default();

    let (hostname, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("invalid port '{}'", port))?;
            (host, Some(port))
        }
        None => (authority, None),
    };

    if hostname.is_empty() {
        return Err("empty hostname".to_string());
    }

    Ok(HostSpec {
        scheme,
        hostname: hostname.to_string(),
        port,
    })
}

/// Parse the comma-separated TLS pattern list, lowercased
pub fn parse_patterns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// One mapping per private port. Runtimes often publish a port on both IPv4
/// and IPv6; the IPv4 binding is preferred.
pub fn distinct_ports(ports: &[PortMapping]) -> Vec<&PortMapping> {
    let mut by_port: Vec<&PortMapping> = Vec::new();
    for mapping in ports {
        match by_port.iter_mut().find(|m| m.private_port == mapping.private_port) {
            Some(existing) => {
                if existing.host_ip.contains(':') && !mapping.host_ip.contains(':') {
                    *existing = mapping;
                }
            }
            None => by_port.push(mapping),
        }
    }
    by_port
}

fn is_unspecified(ip: &str) -> bool {
    matches!(ip, "" | "0.0.0.0" | "::" | "[::]")
}

/// Build the registry entry for a container, or `None` if it contributes no
/// routable hostname.
pub fn build_entry(facts: &ContainerFacts, config: &DockerConfig) -> Option<ServiceEntry> {
    let ports = distinct_ports(&facts.ports);
    if ports.is_empty() {
        return None;
    }

    let specs = facts
        .env_var(&config.hosts_env)
        .map(parse_host_specs)
        .unwrap_or_default();

    // A single published port is the default for entries without a port
    let default_port = match ports.as_slice() {
        [only] => Some(only.private_port),
        _ => None,
    };

    let mut mappings = HashMap::new();
    for spec in specs {
        let Some(private_port) = spec.port.or(default_port) else {
            debug!(
                container_id = short_id(&facts.id),
                hostname = %spec.hostname,
                "No port given and container publishes several ports, skipping host entry"
            );
            continue;
        };

        let Some(mapping) = ports.iter().find(|m| m.private_port == private_port) else {
            debug!(
                container_id = short_id(&facts.id),
                hostname = %spec.hostname,
                private_port,
                "Port is not published, skipping host entry"
            );
            continue;
        };

        let host = if is_unspecified(&mapping.host_ip) {
            config.advertise_host.clone()
        } else {
            mapping.host_ip.trim_matches(|c| c == '[' || c == ']').to_string()
        };

        mappings.insert(
            spec.hostname,
            Backend::new(spec.scheme, host, mapping.public_port),
        );
    }

    let tls_patterns = facts
        .env_var(&config.letsencrypt_env)
        .map(parse_patterns)
        .unwrap_or_default();

    ServiceEntry::new(facts.id.clone(), mappings, tls_patterns)
}

/// Abbreviated container id for logs
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Counts from one full sync
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub registered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub removed: usize,
}

/// Exponential backoff with an upper bound
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the bound
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Keeps the registry in step with the container runtime
pub struct DiscoveryFeed<R> {
    runtime: Arc<R>,
    registry: Arc<Registry>,
    config: DockerConfig,
    backoff: Backoff,
    ready: Option<oneshot::Sender<()>>,
}

impl<R: ContainerRuntime> DiscoveryFeed<R> {
    pub fn new(runtime: Arc<R>, registry: Arc<Registry>, config: DockerConfig) -> Self {
        let backoff = Backoff::new(config.reconnect_initial(), config.reconnect_max());
        Self {
            runtime,
            registry,
            config,
            backoff,
            ready: None,
        }
    }

    /// Signal `ready` once the first sync in [`run`](Self::run) completes
    pub fn notify_ready(mut self, ready: oneshot::Sender<()>) -> Self {
        self.ready = Some(ready);
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Inspect one container and register it, or drop any stale entry if it
    /// no longer routes anything. Returns whether the container is registered.
    pub async fn register(&self, id: &str) -> Result<bool, DiscoveryError> {
        let facts = self.runtime.inspect(id).await?;

        match build_entry(&facts, &self.config) {
            Some(entry) => {
                let hostnames: Vec<String> = entry
                    .routes()
                    .iter()
                    .map(|r| format!("{} -> {}", r.pattern, r.backend))
                    .collect();
                self.registry.upsert(entry);
                info!(container_id = short_id(id), routes = ?hostnames, "Registered service");
                Ok(true)
            }
            None => {
                if self.registry.remove(id) {
                    info!(container_id = short_id(id), "Service no longer routable, removed");
                } else {
                    debug!(container_id = short_id(id), "Container has no routable hostnames");
                }
                Ok(false)
            }
        }
    }

    /// Register every running container and drop entries for containers
    /// that are gone. Only a failure to list is an error; a container that
    /// cannot be inspected is skipped.
    pub async fn sync(&self) -> Result<SyncReport, DiscoveryError> {
        let running = self.runtime.list_running().await?;
        let mut report = SyncReport::default();

        for id in &running {
            match self.register(id).await {
                Ok(true) => report.registered += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(container_id = short_id(id), error = %e, "Skipping container");
                    report.failed += 1;
                }
            }
        }

        let running: HashSet<&str> = running.iter().map(String::as_str).collect();
        for id in self.registry.service_ids() {
            if !running.contains(id.as_str()) && self.registry.remove(&id) {
                info!(container_id = short_id(&id), "Container gone, removed service");
                report.removed += 1;
            }
        }

        info!(
            registered = report.registered,
            skipped = report.skipped,
            failed = report.failed,
            removed = report.removed,
            services = self.registry.len(),
            "Container sync complete"
        );
        Ok(report)
    }

    /// Sync, retrying with backoff until it succeeds. Returns `false` if
    /// shutdown was requested first.
    pub async fn sync_with_retry(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown_rx.borrow() {
                return false;
            }
            match self.sync().await {
                Ok(_) => return true,
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Container sync failed");
                    if !sleep_or_shutdown(delay, shutdown_rx).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Apply one lifecycle event
    pub async fn handle_event(&self, event: ContainerEvent) {
        let id = event.container_id.as_str();
        match event.action {
            ContainerAction::Start => match self.register(id).await {
                Ok(_) => {}
                Err(e) => warn!(container_id = short_id(id), error = %e, "Skipping started container"),
            },
            ContainerAction::Stop => {
                if self.registry.remove(id) {
                    info!(container_id = short_id(id), "Container stopped, removed service");
                }
            }
            ContainerAction::Other(action) => {
                debug!(container_id = short_id(id), action = %action, "Ignoring container event");
            }
        }
    }

    /// Follow the event stream until shutdown. Every connection, the first
    /// included, subscribes before syncing.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let mut events = self.runtime.events();
            if !self.sync_with_retry(&mut shutdown_rx).await {
                break;
            }
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }
            debug!("Watching container events");

            loop {
                tokio::select! {
                    next = events.next() => {
                        match next {
                            Some(Ok(event)) => {
                                self.backoff.reset();
                                self.handle_event(event).await;
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Container event stream failed");
                                break;
                            }
                            None => {
                                warn!("Container event stream closed");
                                break;
                            }
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Discovery shutting down");
                            return;
                        }
                    }
                }
            }

            let delay = self.backoff.next_delay();
            info!(retry_in_ms = delay.as_millis() as u64, "Reconnecting to container events");
            if !sleep_or_shutdown(delay, &mut shutdown_rx).await {
                break;
            }
        }

        info!("Discovery shutting down");
    }
}

/// Sleep for `delay`; returns `false` if shutdown was signalled meanwhile
async fn sleep_or_shutdown(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = shutdown_rx.changed() => changed.is_ok() && !*shutdown_rx.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn mapping(private_port: u16, host_ip: &str, public_port: u16) -> PortMapping {
        PortMapping {
            private_port,
            host_ip: host_ip.to_string(),
            public_port,
        }
    }

    fn facts(id: &str, env: &[&str], ports: Vec<PortMapping>) -> ContainerFacts {
        ContainerFacts {
            id: id.to_string(),
            env: env.iter().map(|s| s.to_string()).collect(),
            ports,
        }
    }

    #[derive(Default)]
    struct StaticRuntime {
        containers: Mutex<HashMap<String, ContainerFacts>>,
        broken: Mutex<HashSet<String>>,
        unreachable: Mutex<bool>,
        /// Number of completed listings at each `events()` call
        listings: Mutex<usize>,
        subscriptions: Mutex<Vec<usize>>,
    }

    impl StaticRuntime {
        fn add(&self, facts: ContainerFacts) {
            self.containers.lock().insert(facts.id.clone(), facts);
        }

        fn stop(&self, id: &str) {
            self.containers.lock().remove(id);
        }
    }

    impl ContainerRuntime for StaticRuntime {
        async fn list_running(&self) -> Result<Vec<String>, DiscoveryError> {
            if *self.unreachable.lock() {
                return Err(DiscoveryError::Unavailable("connection refused".to_string()));
            }
            *self.listings.lock() += 1;
            Ok(self.containers.lock().keys().cloned().collect())
        }

        async fn inspect(&self, id: &str) -> Result<ContainerFacts, DiscoveryError> {
            if self.broken.lock().contains(id) {
                return Err(DiscoveryError::Inspect {
                    id: id.to_string(),
                    reason: "boom".to_string(),
                });
            }
            self.containers
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| DiscoveryError::Inspect {
                    id: id.to_string(),
                    reason: "no such container".to_string(),
                })
        }

        fn events(&self) -> EventStream {
            let listings = *self.listings.lock();
            self.subscriptions.lock().push(listings);
            futures::stream::pending().boxed()
        }
    }

    fn feed(runtime: Arc<StaticRuntime>) -> DiscoveryFeed<StaticRuntime> {
        DiscoveryFeed::new(runtime, Arc::new(Registry::new()), DockerConfig::default())
    }

    #[test]
    fn test_parse_host_specs() {
        let specs = parse_host_specs(
            " app.example.com , https://secure.example.com:8443,*.example.com:3000,, http://x.test/",
        );
        assert_eq!(
            specs,
            vec![
                HostSpec { scheme: Scheme::Http, hostname: "app.example.com".into(), port: None },
                HostSpec { scheme: Scheme::Https, hostname: "secure.example.com".into(), port: Some(8443) },
                HostSpec { scheme: Scheme::Http, hostname: "*.example.com".into(), port: Some(3000) },
                HostSpec { scheme: Scheme::Http, hostname: "x.test".into(), port: None },
            ]
        );
    }

    #[test]
    fn test_parse_host_specs_skips_invalid() {
        let specs = parse_host_specs("ftp://a.test,b.test:notaport,c.test:70000,:80,d.test");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].hostname, "d.test");
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(
            parse_patterns("a.example.com, *.b.example.com ,"),
            vec!["a.example.com", "*.b.example.com"]
        );
        assert!(parse_patterns("").is_empty());
        assert_eq!(parse_patterns("App.Example.COM"), vec!["app.example.com"]);
    }

    #[test]
    fn test_env_var_lookup() {
        let f = facts("c1", &["A=1", "B=x=y", "A=2", "NOVALUE"], vec![]);
        assert_eq!(f.env_var("A"), Some("2"));
        assert_eq!(f.env_var("B"), Some("x=y"));
        assert_eq!(f.env_var("NOVALUE"), None);
    }

    #[test]
    fn test_single_port_is_default() {
        let f = facts(
            "c1",
            &["DOCKGATE_HOSTS=app.example.com"],
            vec![mapping(8080, "10.0.0.5", 32000)],
        );
        let entry = build_entry(&f, &DockerConfig::default()).unwrap();

        assert_eq!(entry.service_id(), "c1");
        assert_eq!(
            entry.backend_for("app.example.com"),
            Some(&Backend::new(Scheme::Http, "10.0.0.5", 32000))
        );
    }

    #[test]
    fn test_unspecified_host_ip_uses_advertise_host() {
        let f = facts(
            "c1",
            &["DOCKGATE_HOSTS=app.example.com"],
            vec![mapping(8080, "0.0.0.0", 32000), mapping(8080, "::", 32000)],
        );
        let entry = build_entry(&f, &DockerConfig::default()).unwrap();

        // Dual-stack bindings of one private port count as one mapping
        assert_eq!(
            entry.backend_for("app.example.com"),
            Some(&Backend::new(Scheme::Http, "127.0.0.1", 32000))
        );
    }

    #[test]
    fn test_zero_ports_never_registered() {
        let f = facts("c1", &["DOCKGATE_HOSTS=app.example.com:80"], vec![]);
        assert!(build_entry(&f, &DockerConfig::default()).is_none());
    }

    #[test]
    fn test_no_host_declaration_not_registered() {
        let f = facts("c1", &["PATH=/bin"], vec![mapping(80, "0.0.0.0", 8000)]);
        assert!(build_entry(&f, &DockerConfig::default()).is_none());
    }

    #[test]
    fn test_multi_port_requires_explicit_port() {
        let f = facts(
            "c1",
            &["DOCKGATE_HOSTS=implicit.example.com,api.example.com:8080,https://admin.example.com:9000,missing.example.com:1234"],
            vec![
                mapping(8080, "0.0.0.0", 32001),
                mapping(9000, "0.0.0.0", 32002),
            ],
        );
        let entry = build_entry(&f, &DockerConfig::default()).unwrap();

        assert!(entry.backend_for("implicit.example.com").is_none());
        assert!(entry.backend_for("missing.example.com").is_none());
        assert_eq!(
            entry.backend_for("api.example.com"),
            Some(&Backend::new(Scheme::Http, "127.0.0.1", 32001))
        );
        assert_eq!(
            entry.backend_for("admin.example.com"),
            Some(&Backend::new(Scheme::Https, "127.0.0.1", 32002))
        );
        assert_eq!(entry.routes().len(), 2);
    }

    #[test]
    fn test_all_entries_unmatched_drops_container() {
        let f = facts(
            "c1",
            &["DOCKGATE_HOSTS=a.example.com:1,b.example.com:2"],
            vec![mapping(80, "0.0.0.0", 8000)],
        );
        assert!(build_entry(&f, &DockerConfig::default()).is_none());
    }

    #[test]
    fn test_tls_patterns_and_custom_env_names() {
        let config = DockerConfig {
            hosts_env: "VIRTUAL_HOST".to_string(),
            letsencrypt_env: "LETSENCRYPT_HOST".to_string(),
            ..DockerConfig::default()
        };
        let f = facts(
            "c1",
            &[
                "VIRTUAL_HOST=*.example.com",
                "LETSENCRYPT_HOST=a.example.com,*.b.example.com",
            ],
            vec![mapping(80, "0.0.0.0", 8000)],
        );
        let entry = build_entry(&f, &config).unwrap();

        let tls: Vec<&str> = entry.tls_patterns().iter().map(|p| p.as_str()).collect();
        assert_eq!(tls, vec!["a.example.com", "*.b.example.com"]);
        assert!(entry.backend_for("*.example.com").is_some());
    }

    #[test]
    fn test_mixed_case_tls_declaration_matches_sni_name() {
        let f = facts(
            "c1",
            &["DOCKGATE_HOSTS=App.example.com", "DOCKGATE_LETSENCRYPT=App.example.com"],
            vec![mapping(80, "0.0.0.0", 8000)],
        );
        let registry = Registry::new();
        registry.upsert(build_entry(&f, &DockerConfig::default()).unwrap());

        assert!(registry.is_tls_authorized("app.example.com"));
        // Routing stays literal
        assert_eq!(registry.resolve("App.example.com").len(), 1);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(ContainerAction::parse("start"), ContainerAction::Start);
        assert_eq!(ContainerAction::parse("stop"), ContainerAction::Stop);
        assert_eq!(ContainerAction::parse("die"), ContainerAction::Stop);
        // A kill may deliver a non-fatal signal; the following "die" stops it
        assert_eq!(
            ContainerAction::parse("kill"),
            ContainerAction::Other("kill".to_string())
        );
        assert_eq!(
            ContainerAction::parse("pause"),
            ContainerAction::Other("pause".to_string())
        );
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[tokio::test]
    async fn test_sync_registers_and_skips_broken() {
        let runtime = Arc::new(StaticRuntime::default());
        runtime.add(facts("c1", &["DOCKGATE_HOSTS=one.test"], vec![mapping(80, "0.0.0.0", 8001)]));
        runtime.add(facts("c2", &["DOCKGATE_HOSTS=two.test"], vec![mapping(80, "0.0.0.0", 8002)]));
        runtime.add(facts("c3", &[], vec![mapping(80, "0.0.0.0", 8003)]));
        runtime.broken.lock().insert("c2".to_string());

        let feed = feed(Arc::clone(&runtime));
        let report = feed.sync().await.unwrap();

        assert_eq!(report.registered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(feed.registry().resolve("one.test").len(), 1);
        assert!(feed.registry().resolve("two.test").is_empty());
    }

    #[tokio::test]
    async fn test_sync_removes_vanished_containers() {
        let runtime = Arc::new(StaticRuntime::default());
        runtime.add(facts("c1", &["DOCKGATE_HOSTS=one.test"], vec![mapping(80, "0.0.0.0", 8001)]));

        let feed = feed(Arc::clone(&runtime));
        feed.sync().await.unwrap();
        assert_eq!(feed.registry().len(), 1);

        runtime.stop("c1");
        let report = feed.sync().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(feed.registry().is_empty());
    }

    #[tokio::test]
    async fn test_sync_fails_when_unreachable() {
        let runtime = Arc::new(StaticRuntime::default());
        *runtime.unreachable.lock() = true;

        let feed = feed(runtime);
        assert!(matches!(feed.sync().await, Err(DiscoveryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_sync_with_retry_recovers() {
        let runtime = Arc::new(StaticRuntime::default());
        runtime.add(facts("c1", &["DOCKGATE_HOSTS=one.test"], vec![mapping(80, "0.0.0.0", 8001)]));
        *runtime.unreachable.lock() = true;

        let mut feed = DiscoveryFeed::new(
            Arc::clone(&runtime),
            Arc::new(Registry::new()),
            DockerConfig {
                reconnect_initial_ms: 10,
                reconnect_max_ms: 20,
                ..DockerConfig::default()
            },
        );

        let flip = {
            let runtime = Arc::clone(&runtime);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                *runtime.unreachable.lock() = false;
            })
        };

        let (_tx, mut rx) = watch::channel(false);
        assert!(feed.sync_with_retry(&mut rx).await);
        assert_eq!(feed.registry().len(), 1);
        flip.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_with_retry_stops_on_shutdown() {
        let runtime = Arc::new(StaticRuntime::default());
        *runtime.unreachable.lock() = true;
        let mut feed = feed(runtime);

        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(!feed.sync_with_retry(&mut rx).await);
    }

    #[tokio::test]
    async fn test_events_start_and_stop() {
        let runtime = Arc::new(StaticRuntime::default());
        let feed = feed(Arc::clone(&runtime));

        runtime.add(facts("c1", &["DOCKGATE_HOSTS=one.test"], vec![mapping(80, "0.0.0.0", 8001)]));
        feed.handle_event(ContainerEvent {
            action: ContainerAction::Start,
            container_id: "c1".to_string(),
        })
        .await;
        assert_eq!(feed.registry().resolve("one.test").len(), 1);

        feed.handle_event(ContainerEvent {
            action: ContainerAction::Stop,
            container_id: "c1".to_string(),
        })
        .await;
        assert!(feed.registry().resolve("one.test").is_empty());

        // Stopping an unknown container is a no-op
        feed.handle_event(ContainerEvent {
            action: ContainerAction::Stop,
            container_id: "nope".to_string(),
        })
        .await;
        assert!(feed.registry().is_empty());
    }

    #[tokio::test]
    async fn test_run_syncs_and_signals_ready() {
        let runtime = Arc::new(StaticRuntime::default());
        runtime.add(facts("c1", &["DOCKGATE_HOSTS=one.test"], vec![mapping(80, "0.0.0.0", 8001)]));
        let registry = Arc::new(Registry::new());

        let (ready_tx, ready_rx) = oneshot::channel();
        let feed = DiscoveryFeed::new(Arc::clone(&runtime), Arc::clone(&registry), DockerConfig::default())
            .notify_ready(ready_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(feed.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), ready_rx)
            .await
            .expect("ready in time")
            .expect("ready sent");
        assert_eq!(registry.resolve("one.test").len(), 1);
        assert_eq!(*runtime.subscriptions.lock(), vec![0]);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("stopped in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_ready_dropped_when_shutdown_before_sync() {
        let runtime = Arc::new(StaticRuntime::default());
        *runtime.unreachable.lock() = true;

        let (ready_tx, ready_rx) = oneshot::channel();
        let feed = feed(runtime).notify_ready(ready_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(feed.run(shutdown_rx));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(ready_rx.await.is_err());
    }

    #[tokio::test]
    async fn test_start_event_for_uninspectable_container_is_skipped() {
        let runtime = Arc::new(StaticRuntime::default());
        let feed = feed(runtime);

        feed.handle_event(ContainerEvent {
            action: ContainerAction::Start,
            container_id: "ghost".to_string(),
        })
        .await;
        assert!(feed.registry().is_empty());
    }
}
