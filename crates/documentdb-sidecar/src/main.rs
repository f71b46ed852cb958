use std::net::SocketAddr;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use documentdb_sidecar::{SidecarInjector, SidecarInjectorServer, SidecarInjectorService};

#[derive(Parser)]
#[command(name = "cnpg-i-sidecar-injector")]
#[command(about = "Document DB Gateway Sidecar Injector")]
#[command(version)]
struct Cli {
    /// Log level; RUST_LOG takes precedence when set
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the plugin over gRPC
    Plugin {
        /// Address to listen on
        #[arg(long, env = "PLUGIN_LISTEN_ADDR", default_value = "0.0.0.0:9090")]
        listen: SocketAddr,

        /// Gateway image used when the cluster does not set one
        #[arg(
            long,
            env = "DOCUMENTDB_GATEWAY_IMAGE",
            default_value = "ghcr.io/documentdb/documentdb-gateway:latest"
        )]
        gateway_image: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = cli.log_level.directive();
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(format!("documentdb={level},cnpg_i_sidecar_injector={level}"))?
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Plugin {
            listen,
            gateway_image,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(serve(listen, gateway_image))
        }
    }
}

async fn serve(addr: SocketAddr, gateway_image: String) -> anyhow::Result<()> {
    let service = SidecarInjectorService::new(SidecarInjector::new(gateway_image.clone()));
    tracing::info!(%addr, default_image = %gateway_image, "Starting sidecar injector plugin");

    tonic::transport::Server::builder()
        .add_service(SidecarInjectorServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
