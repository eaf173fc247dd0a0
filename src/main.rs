use chrono::{NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use hostgate::config::Config;
use hostgate::proxy::ProxyServer;
use hostgate::service::{install, shared_state, ProxyState};
use hostgate::token;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const EXPIRES_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Parser)]
#[command(name = "hostgate")]
#[command(about = "Reverse-proxy gateway with token auth, rate limiting and hot reload", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Proxy {
        /// Path to the configuration file
        #[arg(short, long, default_value = "./config.toml")]
        config: PathBuf,
    },
    /// Generate a signed bearer token for a client
    Token {
        /// Client name, recorded as the token audience
        #[arg(long, default_value = "client")]
        client: String,
        /// Path to the configuration file (supplies secret and issuer)
        #[arg(short, long, default_value = "./config.toml")]
        config: PathBuf,
        /// Expiry, format "yyyy-mm-dd HH:MM:SS"; defaults to one day from now
        #[arg(long)]
        expires_at: Option<String>,
    },
    /// Generate a random hex secret
    Secret {
        /// Number of random bytes before hex encoding
        #[arg(long, default_value_t = 128)]
        len: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Proxy { config } => run_proxy(config).await,
        Commands::Token {
            client,
            config,
            expires_at,
        } => {
            let expires_at = match expires_at {
                Some(value) => NaiveDateTime::parse_from_str(&value, EXPIRES_AT_FORMAT)
                    .map_err(|e| anyhow::anyhow!("invalid expiry '{}': {}", value, e))?
                    .and_utc(),
                None => Utc::now() + chrono::Duration::days(1),
            };
            let config = Config::load(&config)
                .map_err(|e| anyhow::anyhow!("cannot load config: {}", e))?;
            let token = token::generate(
                config.server.secret.as_bytes(),
                &config.server.name,
                &client,
                expires_at,
            )?;
            println!("{}", token);
            Ok(())
        }
        Commands::Secret { len } => {
            println!("{}", token::generate_secret(len));
            Ok(())
        }
    }
}

async fn run_proxy(config_path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&config_path).map_err(|e| {
        anyhow::anyhow!("cannot load config '{}': {}", config_path.display(), e)
    })?;

    init_logging(config.server.log_file.as_deref())?;
    info!(path = %config_path.display(), addr = %config.server.addr, "starting gateway");

    let addr: SocketAddr = config
        .server
        .addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", config.server.addr, e))?;

    let state = shared_state(ProxyState::from_config(&config)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let forward_timeout = (config.server.write_timeout_s > 0)
        .then(|| Duration::from_secs(config.server.write_timeout_s));

    let server = ProxyServer::new(
        addr,
        Arc::clone(&state),
        shutdown_rx,
        Duration::from_secs(config.server.shutdown_timeout_s),
        forward_timeout,
    );
    let mut server_handle = tokio::spawn(server.run());

    // Wait for shutdown (Ctrl+C, SIGTERM, SIGQUIT) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use anyhow::Context as _;
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
        let mut sigquit = signal(SignalKind::quit()).context("failed to install SIGQUIT handler")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("received SIGINT, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, shutting down");
                    break;
                }
                _ = sigquit.recv() => {
                    info!("received SIGQUIT, shutting down");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "received SIGHUP, reloading configuration");
                    match ProxyState::load(&config_path) {
                        Ok(next) => {
                            install(&state, next);
                            info!("configuration reloaded");
                        }
                        Err(e) => {
                            error!(error = %e, "reload failed, keeping previous configuration");
                        }
                    }
                }
                result = &mut server_handle => {
                    fail_on_server_exit(result);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl+C, shutting down");
            }
            result = &mut server_handle => {
                fail_on_server_exit(result);
            }
        }
    }

    let _ = shutdown_tx.send(true);

    match server_handle.await {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server error during shutdown");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "server task failed");
            std::process::exit(1);
        }
    }
}

/// The serving loop only returns before shutdown on a listener failure,
/// which is fatal
fn fail_on_server_exit(result: Result<anyhow::Result<()>, tokio::task::JoinError>) -> ! {
    match result {
        Ok(Ok(())) => error!("server stopped unexpectedly"),
        Ok(Err(e)) => error!(error = %e, "server failed"),
        Err(e) => error!(error = %e, "server task failed"),
    }
    std::process::exit(1);
}

fn init_logging(log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("hostgate=info".parse().expect("valid log directive"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| anyhow::anyhow!("cannot open log file '{}': {}", path, e))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
