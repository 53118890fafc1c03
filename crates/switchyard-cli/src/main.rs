use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_core::BrokerConfig;
use switchyard_gateway::BrokerServer;
use switchyard_orchestrator::{JsonlTaskRecorder, NoopRecorder, TaskRecorder};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "switchyard", about = "Switchyard — agent task broker")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchyard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the broker
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = BrokerConfig::load(&cli.config).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load config file '{}': {}",
            cli.config.display(),
            e
        )
    })?;

    match cli.command {
        Commands::Serve { host, port } => {
            apply_overrides(&mut config, host, port);
            config.validate()?;
            serve(config).await?;
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn apply_overrides(config: &mut BrokerConfig, host: Option<String>, port: Option<u16>) {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
}

async fn build_recorder(config: &BrokerConfig) -> anyhow::Result<Arc<dyn TaskRecorder>> {
    Ok(match &config.persistence.path {
        Some(path) => {
            let recorder = JsonlTaskRecorder::new(path.clone()).await?;
            info!(path = %path.display(), "Recording terminal tasks");
            Arc::new(recorder)
        }
        None => Arc::new(NoopRecorder),
    })
}

async fn serve(config: BrokerConfig) -> anyhow::Result<()> {
    let recorder = build_recorder(&config).await?;
    let server = BrokerServer::with_recorder(&config, recorder);
    if !config.auth.api_keys.is_empty() {
        info!(keys = config.auth.api_keys.len(), "API key auth enabled");
    }

    let supervisor = server.spawn_supervisor();
    let app = server.app();

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        addr = %addr,
        max_concurrent_tasks = config.queue.max_concurrent_tasks,
        retry_attempts = config.queue.retry_attempts,
        "Switchyard broker listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down broker");
    server.shutdown().await;
    supervisor.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["switchyard", "serve"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("switchyard.toml"));
        assert!(matches!(
            cli.command,
            Commands::Serve {
                host: None,
                port: None
            }
        ));
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "switchyard",
            "-c",
            "/etc/switchyard.toml",
            "serve",
            "--host",
            "127.0.0.1",
            "-p",
            "9000",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/switchyard.toml"));
        let Commands::Serve { host, port } = cli.command else {
            panic!("expected serve");
        };

        let mut config = BrokerConfig::default();
        apply_overrides(&mut config, host, port);
        assert_eq!(config.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_no_overrides_keeps_file_values() {
        let mut config =
            BrokerConfig::from_toml_str("[server]\nhost = \"10.0.0.1\"\nport = 7500\n").unwrap();
        apply_overrides(&mut config, None, None);
        assert_eq!(config.bind_addr(), "10.0.0.1:7500");
    }

    #[test]
    fn test_effective_config_renders_as_toml() {
        let config = BrokerConfig::default();
        let rendered = toml::to_string_pretty(&config).unwrap();
        let parsed = BrokerConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_recorder_follows_persistence_path() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::default();
        assert!(build_recorder(&config).await.is_ok());

        config.persistence.path = Some(tmp.path().join("state").join("tasks.jsonl"));
        build_recorder(&config).await.unwrap();
        assert!(tmp.path().join("state").is_dir());
    }
}
