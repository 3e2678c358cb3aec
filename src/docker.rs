//! Docker implementation of [`ContainerRuntime`]

use crate::discovery::{
    ContainerAction, ContainerEvent, ContainerFacts, ContainerRuntime, DiscoveryError,
    EventStream, PortMapping,
};
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{EventMessage, EventMessageTypeEnum, PortMap};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Lifecycle actions worth forwarding to discovery
const WATCHED_ACTIONS: &[&str] = &["start", "stop", "die", "destroy"];

/// Read-only Docker client used for discovery
#[derive(Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Create a client for the Docker daemon.
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// An unreachable daemon is not an error here; discovery retries until
    /// it answers. Only a malformed endpoint fails.
    pub async fn new(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Invalid DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("Rancher Desktop", format!("{}/.rd/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.is_empty() || path.contains("//") {
                continue; // Skip invalid paths from empty env vars
            }

            if std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                    debug!(path, name, "Socket exists but daemon not responding");
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            anyhow::anyhow!(
                "Cannot create Docker client: {}. \
                 Set DOCKER_HOST or 'docker.host' in the configuration.",
                e
            )
        })
    }

    /// Check that the daemon answers
    pub async fn ping(&self) -> Result<(), DiscoveryError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))
    }
}

impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, DiscoveryError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| DiscoveryError::Unavailable(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerFacts, DiscoveryError> {
        let info = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| DiscoveryError::Inspect {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        let env = info.config.and_then(|c| c.env).unwrap_or_default();
        let ports = info
            .network_settings
            .and_then(|n| n.ports)
            .map(|ports| port_mappings(&ports))
            .unwrap_or_default();

        Ok(ContainerFacts {
            id: info.id.unwrap_or_else(|| id.to_string()),
            env,
            ports,
        })
    }

    fn events(&self) -> EventStream {
        // The request is only sent on first poll; `since` makes the daemon
        // replay anything that happened in between
        let options = events_options(SystemTime::now());

        self.client
            .events(Some(options))
            .filter_map(|item| async move {
                match item {
                    Ok(message) => container_event(message).map(Ok),
                    Err(e) => Some(Err(DiscoveryError::Stream(e.to_string()))),
                }
            })
            .boxed()
    }
}

fn events_options(since: SystemTime) -> EventsOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert(
        "event".to_string(),
        WATCHED_ACTIONS.iter().map(|a| a.to_string()).collect(),
    );

    let since = since.duration_since(UNIX_EPOCH).unwrap_or_default();
    EventsOptions {
        since: Some(format!("{}.{:09}", since.as_secs(), since.subsec_nanos())),
        filters,
        ..Default::default()
    }
}

/// Published TCP ports from an inspect result (`"8080/tcp" -> [bindings]`)
fn port_mappings(ports: &PortMap) -> Vec<PortMapping> {
    let mut mappings = Vec::new();

    for (key, bindings) in ports {
        let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
        if proto != "tcp" {
            continue;
        }
        let Ok(private_port) = port.parse::<u16>() else {
            continue;
        };

        for binding in bindings.iter().flatten() {
            let Some(public_port) = binding
                .host_port
                .as_deref()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            mappings.push(PortMapping {
                private_port,
                host_ip: binding.host_ip.clone().unwrap_or_default(),
                public_port,
            });
        }
    }

    // HashMap order is arbitrary; keep output stable for logs and tests
    mappings.sort_by(|a, b| {
        (a.private_port, &a.host_ip).cmp(&(b.private_port, &b.host_ip))
    });
    mappings
}

fn container_event(message: EventMessage) -> Option<ContainerEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let action = message.action?;
    let container_id = message.actor.and_then(|a| a.id)?;

    Some(ContainerEvent {
        action: ContainerAction::parse(&action),
        container_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EventActor, PortBinding};

    fn binding(ip: &str, port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(ip.to_string()),
            host_port: Some(port.to_string()),
        }
    }

    #[test]
    fn test_port_mappings() {
        let mut ports: PortMap = HashMap::new();
        ports.insert(
            "8080/tcp".to_string(),
            Some(vec![binding("0.0.0.0", "32000"), binding("::", "32000")]),
        );
        ports.insert("9000/tcp".to_string(), None);
        ports.insert("53/udp".to_string(), Some(vec![binding("0.0.0.0", "5353")]));
        ports.insert("80/tcp".to_string(), Some(vec![binding("127.0.0.1", "")]));

        let mappings = port_mappings(&ports);
        assert_eq!(
            mappings,
            vec![
                PortMapping {
                    private_port: 8080,
                    host_ip: "0.0.0.0".to_string(),
                    public_port: 32000,
                },
                PortMapping {
                    private_port: 8080,
                    host_ip: "::".to_string(),
                    public_port: 32000,
                },
            ]
        );
    }

    #[test]
    fn test_container_event() {
        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::CONTAINER),
            action: Some("start".to_string()),
            actor: Some(EventActor {
                id: Some("abc123".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        assert_eq!(
            container_event(message),
            Some(ContainerEvent {
                action: ContainerAction::Start,
                container_id: "abc123".to_string(),
            })
        );
    }

    #[test]
    fn test_non_container_event_ignored() {
        let message = EventMessage {
            typ: Some(EventMessageTypeEnum::NETWORK),
            action: Some("connect".to_string()),
            actor: Some(EventActor {
                id: Some("net1".to_string()),
                attributes: None,
            }),
            ..Default::default()
        };
        assert_eq!(container_event(message), None);
    }

    #[test]
    fn test_events_options_replay_from_subscription() {
        let at = UNIX_EPOCH + std::time::Duration::new(1_700_000_000, 5_000);
        let options = events_options(at);

        assert_eq!(options.since.as_deref(), Some("1700000000.000005000"));
        assert_eq!(options.until, None);
        assert_eq!(options.filters["type"], vec!["container".to_string()]);
        assert_eq!(
            options.filters["event"],
            vec!["start", "stop", "die", "destroy"]
        );
    }

    #[test]
    fn test_invalid_host_format() {
        assert!(DockerRuntime::connect_to_host("ftp://nope").is_err());
    }
}
