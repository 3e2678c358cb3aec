use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and forwarding configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime connection and discovery settings
    #[serde(default)]
    pub docker: DockerConfig,

    /// ACME/Let's Encrypt configuration
    #[serde(default)]
    pub acme: AcmeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// HTTPS port (default: 443, set to 0 to disable)
    #[serde(default = "default_tls_port")]
    pub tls_port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum time to wait for a backend response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// Fallback certificate served when no ACME certificate exists (PEM)
    pub tls_cert: Option<String>,

    /// Private key for the fallback certificate (PEM)
    pub tls_key: Option<String>,
}

impl ServerConfig {
    pub fn has_tls_files(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    /// Get HTTP port (0 means disabled)
    pub fn http_port(&self) -> u16 {
        self.port
    }

    /// Get HTTPS port (0 means disabled)
    pub fn https_port(&self) -> u16 {
        self.tls_port
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            tls_port: default_tls_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

/// How containers are discovered and how their environment is read
#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker endpoint, `unix:///path` or `tcp://host:port`
    /// (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,

    /// Container environment variable holding the routing declaration
    #[serde(default = "default_hosts_env")]
    pub hosts_env: String,

    /// Container environment variable holding the TLS-eligible patterns
    #[serde(default = "default_letsencrypt_env")]
    pub letsencrypt_env: String,

    /// Address used for port bindings published on all interfaces
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,

    /// First delay before reconnecting to the Docker daemon, in milliseconds
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay, in milliseconds
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_ms: u64,
}

impl DockerConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            hosts_env: default_hosts_env(),
            letsencrypt_env: default_letsencrypt_env(),
            advertise_host: default_advertise_host(),
            reconnect_initial_ms: default_reconnect_initial(),
            reconnect_max_ms: default_reconnect_max(),
        }
    }
}

/// Challenge type for ACME domain validation
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
pub enum AcmeChallengeType {
    /// HTTP-01: Serves challenge response on the HTTP port at /.well-known/acme-challenge/
    #[default]
    #[serde(alias = "http01", alias = "HTTP-01")]
    #[serde(rename = "http-01")]
    Http01,
    /// TLS-ALPN-01: Serves challenge via TLS with the acme-tls/1 ALPN protocol
    #[serde(alias = "tls-alpn01", alias = "TLS-ALPN-01")]
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
}

/// ACME (Let's Encrypt) configuration for on-demand certificate provisioning.
///
/// There is no domain list: a certificate is requested for any SNI name that
/// a registered container lists in its TLS environment variable.
#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// Enable ACME certificate provisioning
    #[serde(default)]
    pub enabled: bool,

    /// Contact email for Let's Encrypt notifications (required when enabled)
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    /// Use "https://acme-staging-v02.api.letsencrypt.org/directory" for testing
    pub directory_url: Option<String>,

    /// Local directory for certificate and account cache
    #[serde(default = "default_acme_cache_dir")]
    pub cache_dir: String,

    /// Challenge type for domain validation (default: http-01)
    #[serde(default)]
    pub challenge_type: AcmeChallengeType,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: None,
            directory_url: None,
            cache_dir: default_acme_cache_dir(),
            challenge_type: AcmeChallengeType::default(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_tls_port() -> u16 {
    443
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_hosts_env() -> String {
    "DOCKGATE_HOSTS".to_string()
}

fn default_letsencrypt_env() -> String {
    "DOCKGATE_LETSENCRYPT".to_string()
}

fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

fn default_reconnect_initial() -> u64 {
    500
}

fn default_reconnect_max() -> u64 {
    30_000
}

fn default_acme_cache_dir() -> String {
    "./acme_cache".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 && self.server.tls_port == 0 {
            errors.push("server: at least one of 'port' and 'tls_port' must be non-zero".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            errors.push("server: 'tls_cert' and 'tls_key' must be set together".to_string());
        }
        if self.docker.hosts_env.trim().is_empty() {
            errors.push("docker: 'hosts_env' must not be empty".to_string());
        }
        if self.docker.letsencrypt_env.trim().is_empty() {
            errors.push("docker: 'letsencrypt_env' must not be empty".to_string());
        }
        if self.docker.reconnect_initial_ms == 0 {
            errors.push("docker: 'reconnect_initial_ms' must be greater than 0".to_string());
        }
        if self.docker.reconnect_initial_ms > self.docker.reconnect_max_ms {
            errors.push(
                "docker: 'reconnect_initial_ms' must not exceed 'reconnect_max_ms'".to_string(),
            );
        }
        if self.acme.enabled && self.acme.email.is_none() {
            errors.push("acme: 'email' is required when ACME is enabled".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
tls_port = 8443
bind = "127.0.0.1"
request_timeout_secs = 5

[docker]
host = "unix:///run/docker.sock"
hosts_env = "VIRTUAL_HOST"
letsencrypt_env = "LETSENCRYPT_HOST"
advertise_host = "10.0.0.2"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.https_port(), 8443);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.docker.host.as_deref(), Some("unix:///run/docker.sock"));
        assert_eq!(config.docker.hosts_env, "VIRTUAL_HOST");
        assert_eq!(config.docker.letsencrypt_env, "LETSENCRYPT_HOST");
        assert_eq!(config.docker.advertise_host, "10.0.0.2");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.tls_port, 443);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout_secs, 90);
        assert!(config.docker.host.is_none());
        assert_eq!(config.docker.hosts_env, "DOCKGATE_HOSTS");
        assert_eq!(config.docker.letsencrypt_env, "DOCKGATE_LETSENCRYPT");
        assert_eq!(config.docker.reconnect_initial(), Duration::from_millis(500));
        assert_eq!(config.docker.reconnect_max(), Duration::from_secs(30));
        assert!(!config.acme.enabled);
        assert_eq!(config.acme.cache_dir, "./acme_cache");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_acme_config_enabled() {
        let toml = r#"
[acme]
enabled = true
email = "admin@example.com"
cache_dir = "/var/lib/dockgate"
directory_url = "https://acme-staging-v02.api.letsencrypt.org/directory"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(config.acme.enabled);
        assert_eq!(config.acme.email, Some("admin@example.com".to_string()));
        assert_eq!(config.acme.cache_dir, "/var/lib/dockgate");
        assert_eq!(config.acme.challenge_type, AcmeChallengeType::Http01);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_acme_challenge_type_tls_alpn01() {
        let toml = r#"
[acme]
enabled = true
email = "admin@example.com"
challenge_type = "tls-alpn-01"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.acme.challenge_type, AcmeChallengeType::TlsAlpn01);
    }

    #[test]
    fn test_validate_acme_requires_email() {
        let toml = r#"
[acme]
enabled = true
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'email' is required"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[server]
port = 0
tls_port = 0
tls_cert = "cert.pem"

[docker]
hosts_env = ""
reconnect_initial_ms = 5000
reconnect_max_ms = 1000
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("at least one of 'port' and 'tls_port'"));
        assert!(err.contains("'tls_cert' and 'tls_key' must be set together"));
        assert!(err.contains("'hosts_env' must not be empty"));
        assert!(err.contains("must not exceed 'reconnect_max_ms'"));
    }

    #[test]
    fn test_validate_zero_request_timeout() {
        let toml = r#"
[server]
request_timeout_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'request_timeout_secs' must be greater than 0"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert_eq!(config.server.port, 80);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dockgate.toml");
        std::fs::write(&path, "[server]\nport = 8081\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 8081);
    }
}
