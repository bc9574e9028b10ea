use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use clap::{Parser, ValueEnum};
use futures::{stream::FuturesUnordered, StreamExt};
use rustls::crypto::{ring, CryptoProvider};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_live::config::{self, ConfigStore};
use sentinel_live::events::EventBus;
use sentinel_live::relay::WhepRelay;
use sentinel_live::state::AppState;
use sentinel_live::transcode::FfmpegTranscoder;
use sentinel_live::utils::bind_tcp_listener;
use sentinel_live::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// sentinel-live command line arguments
#[derive(Parser, Debug)]
#[command(name = "sentinel-live")]
#[command(version, about = "Live video session coordinator for IP cameras", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// HTTPS port (overrides database config)
    #[arg(long, value_name = "PORT")]
    https_port: Option<u16>,

    /// Enable HTTPS (overrides database config)
    #[arg(long)]
    enable_https: bool,

    /// Path to SSL certificate file (generates self-signed if not provided)
    #[arg(long, value_name = "FILE", requires = "ssl_key")]
    ssl_cert: Option<PathBuf>,

    /// Path to SSL private key file
    #[arg(long, value_name = "FILE", requires = "ssl_cert")]
    ssl_key: Option<PathBuf>,

    /// Data directory path (default: /etc/sentinel-live)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    // Install default crypto provider (required by rustls 0.23+)
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }

    tracing::info!("Starting sentinel-live v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    let db_path = data_dir.join("sentinel-live.db");
    let config_store = ConfigStore::new(&db_path).await?;
    let mut config = (*config_store.get()).clone();

    if config.cameras.is_empty() {
        tracing::warn!("No cameras configured; add them through POST /api/config");
    }

    // Apply CLI argument overrides to config (only if explicitly specified)
    if let Some(addr) = args.address {
        config.web.bind_address = addr.clone();
        config.web.bind_addresses = vec![addr];
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(port) = args.https_port {
        config.web.https_port = port;
    }
    if args.enable_https {
        config.web.https_enabled = true;
    }
    if let Some(cert_path) = args.ssl_cert {
        config.web.ssl_cert_path = Some(cert_path.to_string_lossy().to_string());
    }
    if let Some(key_path) = args.ssl_key {
        config.web.ssl_key_path = Some(key_path.to_string_lossy().to_string());
    }

    let bind_ips = resolve_bind_addresses(&config.web)?;
    let scheme = if config.web.https_enabled {
        "https"
    } else {
        "http"
    };
    let bind_port = if config.web.https_enabled {
        config.web.https_port
    } else {
        config.web.http_port
    };
    for ip in &bind_ips {
        let addr = SocketAddr::new(*ip, bind_port);
        tracing::info!("Server will listen on: {}://{}", scheme, addr);
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let events = Arc::new(EventBus::with_capacity(config.events.channel_capacity));
    tracing::info!(
        capacity = config.events.channel_capacity,
        "Event bus initialized"
    );

    let transcoder = Arc::new(FfmpegTranscoder::new(config.transcode.clone()));
    let relay = Arc::new(WhepRelay::new(config.relay.clone())?);
    tracing::info!(
        whep = %config.relay.whep_base_url,
        publish = %config.transcode.rtsp_publish_base,
        "Media relay configured"
    );

    let state = AppState::new(
        config_store.clone(),
        events,
        transcoder.clone(),
        relay.clone(),
        shutdown_tx.clone(),
    );
    tracing::info!(cameras = config.cameras.len(), "Stream coordinator ready");

    spawn_config_watcher(state.clone(), transcoder, relay);
    spawn_session_sweeper(state.clone());

    let app = web::create_router(state.clone());

    let listeners = bind_tcp_listeners(&bind_ips, bind_port)?;

    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    if config.web.https_enabled {
        let tls_config = if let (Some(cert_path), Some(key_path)) =
            (&config.web.ssl_cert_path, &config.web.ssl_key_path)
        {
            RustlsConfig::from_pem_file(cert_path, key_path).await?
        } else {
            let cert_dir = data_dir.join("certs");
            let cert_path = cert_dir.join("server.crt");
            let key_path = cert_dir.join("server.key");

            if !cert_path.exists() || !key_path.exists() {
                tracing::info!("Generating new self-signed TLS certificate");
                let cert = generate_self_signed_cert()?;
                tokio::fs::create_dir_all(&cert_dir).await?;
                tokio::fs::write(&cert_path, cert.cert.pem()).await?;
                tokio::fs::write(&key_path, cert.key_pair.serialize_pem()).await?;
            } else {
                tracing::info!("Using existing TLS certificate from {}", cert_dir.display());
            }

            RustlsConfig::from_pem_file(&cert_path, &key_path).await?
        };

        let mut servers = FuturesUnordered::new();
        for listener in listeners {
            let local_addr = listener.local_addr()?;
            tracing::info!("Starting HTTPS server on {}", local_addr);

            let server = axum_server::from_tcp_rustls(listener, tls_config.clone())
                .serve(app.clone().into_make_service());
            servers.push(server);
        }

        tokio::select! {
            _ = shutdown_signal => {
                cleanup(&state).await;
            }
            result = servers.next() => {
                if let Some(Err(e)) = result {
                    tracing::error!("HTTPS server error: {}", e);
                }
                cleanup(&state).await;
            }
        }
    } else {
        let mut servers = FuturesUnordered::new();
        for listener in listeners {
            let local_addr = listener.local_addr()?;
            tracing::info!("Starting HTTP server on {}", local_addr);

            let listener = tokio::net::TcpListener::from_std(listener)?;
            let server = axum::serve(listener, app.clone());
            servers.push(async move { server.await });
        }

        tokio::select! {
            _ = shutdown_signal => {
                cleanup(&state).await;
            }
            result = servers.next() => {
                if let Some(Err(e)) = result {
                    tracing::error!("HTTP server error: {}", e);
                }
                cleanup(&state).await;
            }
        }
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "sentinel_live=error,tower_http=error",
        LogLevel::Warn => "sentinel_live=warn,tower_http=warn",
        LogLevel::Info => "sentinel_live=info,tower_http=info",
        LogLevel::Verbose => "sentinel_live=debug,tower_http=info",
        LogLevel::Debug => "sentinel_live=debug,tower_http=debug",
        LogLevel::Trace => "sentinel_live=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("SENTINEL_LIVE_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/sentinel-live")
}

/// Resolve bind IPs from config, preferring bind_addresses when set.
fn resolve_bind_addresses(web: &config::WebConfig) -> anyhow::Result<Vec<IpAddr>> {
    let raw_addrs = if !web.bind_addresses.is_empty() {
        web.bind_addresses.as_slice()
    } else {
        std::slice::from_ref(&web.bind_address)
    };

    let mut seen = HashSet::new();
    let mut addrs = Vec::new();
    for addr in raw_addrs {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid bind address: {}", addr))?;
        if seen.insert(ip) {
            addrs.push(ip);
        }
    }

    Ok(addrs)
}

fn bind_tcp_listeners(addrs: &[IpAddr], port: u16) -> anyhow::Result<Vec<std::net::TcpListener>> {
    let mut listeners = Vec::new();
    for ip in addrs {
        let addr = SocketAddr::new(*ip, port);
        match bind_tcp_listener(addr) {
            Ok(listener) => listeners.push(listener),
            Err(err) => {
                tracing::warn!("Failed to bind {}: {}", addr, err);
            }
        }
    }

    if listeners.is_empty() {
        anyhow::bail!("Failed to bind any addresses on port {}", port);
    }

    Ok(listeners)
}

/// Generate a self-signed TLS certificate
fn generate_self_signed_cert() -> anyhow::Result<rcgen::CertifiedKey> {
    use rcgen::generate_simple_self_signed;

    let subject_alt_names = vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ];

    let certified_key = generate_simple_self_signed(subject_alt_names)?;
    Ok(certified_key)
}

/// Push stored configuration changes into the running components
fn spawn_config_watcher(
    state: Arc<AppState>,
    transcoder: Arc<FfmpegTranscoder>,
    relay: Arc<WhepRelay>,
) {
    let mut rx = state.config.subscribe();
    let mut shutdown_rx = state.shutdown_signal();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                change = rx.recv() => {
                    match change {
                        Ok(change) => {
                            let config = state.config.get();
                            transcoder.set_config(config.transcode.clone());
                            relay.set_config(config.relay.clone());
                            state.apply_config(&config).await;
                            tracing::info!(key = %change.key, "Configuration applied");
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Config watcher lagged by {} changes", n);
                            let config = state.config.get();
                            transcoder.set_config(config.transcode.clone());
                            relay.set_config(config.relay.clone());
                            state.apply_config(&config).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        tracing::debug!("Config watcher stopped");
    });
}

/// Periodically close sessions stuck negotiating or reconnecting
fn spawn_session_sweeper(state: Arc<AppState>) {
    let mut shutdown_rx = state.shutdown_signal();

    tokio::spawn(async move {
        loop {
            let interval = state.config.get().sessions.cleanup_interval_secs.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                    let closed = state.registry.cleanup_stale_sessions().await;
                    if closed > 0 {
                        tracing::info!("Closed {} stale viewer sessions", closed);
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Close every session and stop every upstream
async fn cleanup(state: &Arc<AppState>) {
    state.shutdown().await;
    tracing::info!("All streams stopped");
}
