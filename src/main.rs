use dockgate::acme::{AcmeManager, CertResolver, HostPolicy, ACME_TLS_ALPN_NAME};
use dockgate::config::{AcmeChallengeType, Config};
use dockgate::discovery::DiscoveryFeed;
use dockgate::docker::DockerRuntime;
use dockgate::pool::{ConnectionPool, PoolConfig};
use dockgate::proxy::{ProxyServer, Router};
use dockgate::registry::Registry;
use dockgate::{PKG_NAME, VERSION};
use rustls::sign::CertifiedKey;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockgate=debug".parse()?),
        )
        .init();

    // instant-acme and the TLS listener may enable different providers
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("dockgate.toml"));

    let config = Config::load_or_default(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Signals are watched from the start so a stuck Docker connection can
    // still be interrupted
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(signal, "Shutting down...");
        let _ = shutdown_tx.send(true);
    });

    // Discovery: populate the registry before accepting traffic
    let registry = Arc::new(Registry::new());
    let runtime = Arc::new(DockerRuntime::new(config.docker.host.as_deref()).await?);
    if let Err(e) = runtime.ping().await {
        warn!(error = %e, "Docker daemon not reachable yet, retrying");
    }

    // The feed subscribes to events before its first sync; listeners wait
    // for that sync
    let (ready_tx, ready_rx) = oneshot::channel();
    let feed = DiscoveryFeed::new(runtime, Arc::clone(&registry), config.docker.clone())
        .notify_ready(ready_tx);
    let discovery_handle = tokio::spawn(feed.run(shutdown_rx.clone()));
    if ready_rx.await.is_err() {
        info!("Shutdown requested before startup completed");
        return Ok(());
    }

    let pool = ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    })?;
    let pool_stats = pool.stats();
    let router = Arc::new(Router::new(
        Arc::clone(&registry),
        pool,
        config.server.request_timeout(),
    ));

    // TLS: on-demand ACME certificates, the configured fallback, or both
    let fallback = if config.server.has_tls_files() {
        Some(load_fallback_cert(&config)?)
    } else {
        None
    };

    let acme_manager = if config.acme.enabled {
        info!(
            email = ?config.acme.email,
            cache_dir = %config.acme.cache_dir,
            challenge_type = ?config.acme.challenge_type,
            "ACME/Let's Encrypt on-demand certificates enabled"
        );
        let policy: Arc<dyn HostPolicy> = Arc::clone(&registry) as Arc<dyn HostPolicy>;
        Some(Arc::new(AcmeManager::new(
            config.acme.clone(),
            policy,
            fallback.clone(),
        )?))
    } else {
        None
    };

    let resolver = match (&acme_manager, fallback) {
        (Some(manager), _) => Some(manager.resolver()),
        (None, Some(fallback)) => Some(Arc::new(CertResolver::new(Some(fallback)))),
        (None, None) => None,
    };
    let tls_alpn = config.acme.enabled && config.acme.challenge_type == AcmeChallengeType::TlsAlpn01;
    let tls_acceptor = resolver
        .map(|r| build_tls_acceptor(r, tls_alpn))
        .transpose()?;

    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let http_port = config.server.http_port();
    if http_port > 0 {
        let addr = bind_addr(&config, http_port)?;
        let mut http_proxy = ProxyServer::bind(addr, Arc::clone(&router), shutdown_rx.clone()).await?;

        if let Some(manager) = &acme_manager {
            if config.acme.challenge_type == AcmeChallengeType::Http01 {
                http_proxy = http_proxy.with_acme_challenges(manager.http01_challenges());
                info!("ACME HTTP-01 challenge handler enabled on HTTP port");
            }
        }

        servers.push(tokio::spawn(async move {
            if let Err(e) = http_proxy.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }

    let https_port = config.server.https_port();
    match (https_port, tls_acceptor) {
        (0, _) => {}
        (port, Some(acceptor)) => {
            let addr = bind_addr(&config, port)?;
            let https_proxy = ProxyServer::bind(addr, Arc::clone(&router), shutdown_rx.clone())
                .await?
                .with_tls(acceptor);

            servers.push(tokio::spawn(async move {
                if let Err(e) = https_proxy.run().await {
                    error!(error = %e, "HTTPS proxy server error");
                }
            }));
        }
        (port, None) => {
            warn!(port, "TLS listener disabled: ACME is off and no certificate is configured");
        }
    }

    if servers.is_empty() {
        anyhow::bail!("No listener could be started");
    }

    let acme_task = acme_manager.map(|manager| {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.run(shutdown).await {
                error!(error = %e, "ACME manager error");
            }
        })
    });

    // Wait for shutdown signal
    let mut rx = shutdown_rx.clone();
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }

    // Give listeners and in-flight work a short drain window
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in servers {
            let _ = handle.await;
        }
        let _ = discovery_handle.await;
        if let Some(handle) = acme_task {
            let _ = handle.await;
        }
    })
    .await;

    info!(
        total_requests = pool_stats.get_total_requests(),
        failed_requests = pool_stats.get_failed_requests(),
        services = registry.len(),
        "Shutdown complete"
    );
    Ok(())
}

async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => return "SIGINT",
                    _ = sigterm.recv() => return "SIGTERM",
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}

fn bind_addr(config: &Config, port: u16) -> anyhow::Result<SocketAddr> {
    format!("{}:{}", config.server.bind, port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })
}

fn build_tls_acceptor(resolver: Arc<CertResolver>, tls_alpn: bool) -> anyhow::Result<TlsAcceptor> {
    let mut tls_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
    .with_no_client_auth()
    .with_cert_resolver(resolver);

    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    if tls_alpn {
        tls_config.alpn_protocols.push(ACME_TLS_ALPN_NAME.to_vec());
    }

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn load_fallback_cert(config: &Config) -> anyhow::Result<Arc<CertifiedKey>> {
    let (Some(cert_path), Some(key_path)) = (&config.server.tls_cert, &config.server.tls_key) else {
        anyhow::bail!("Both 'tls_cert' and 'tls_key' are required for a fallback certificate");
    };

    let cert = std::fs::read(cert_path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", cert_path, e))?;
    let key = std::fs::read(key_path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", key_path, e))?;

    let certified = dockgate::acme::load_certified_key(&cert, &key)
        .map_err(|e| anyhow::anyhow!("Invalid certificate pair {} / {}: {}", cert_path, key_path, e))?;
    info!(cert = %cert_path, key = %key_path, "Fallback TLS certificate loaded");
    Ok(certified)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    let http_port = config.server.http_port();
    let https_port = config.server.https_port();
    info!(
        bind = %config.server.bind,
        http_port = if http_port > 0 { Some(http_port) } else { None },
        https_port = if https_port > 0 { Some(https_port) } else { None },
        fallback_cert = config.server.has_tls_files(),
        acme = config.acme.enabled,
        "Server configuration"
    );
    info!(
        request_timeout_secs = config.server.request_timeout_secs,
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Request handling settings"
    );
    info!(
        docker_host = ?config.docker.host,
        hosts_env = %config.docker.hosts_env,
        letsencrypt_env = %config.docker.letsencrypt_env,
        advertise_host = %config.docker.advertise_host,
        "Discovery settings"
    );
}
