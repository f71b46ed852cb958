mod commands;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use commands::version::PLUGIN_VERSION;

#[derive(Parser)]
#[command(name = "kubectl-documentdb")]
#[command(about = "kubectl plugin for DocumentDB")]
#[command(version = PLUGIN_VERSION)]
struct Cli {
    /// Path to the config file (default: ~/.documentdb/config.toml)
    #[arg(long, global = true, env = "DOCUMENTDB_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace of the DocumentDB cluster
    #[arg(short = 'n', long, global = true)]
    namespace: Option<String>,

    /// Name of the DocumentDB cluster
    #[arg(short = 'c', long, global = true)]
    cluster: Option<String>,

    /// kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote a replica to primary
    Promote {
        /// Member to promote
        #[arg(long)]
        target: String,
        /// Promote even if the target is lagging
        #[arg(long)]
        force: bool,
        /// Seconds to wait for the cluster to converge
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show cluster and member status
    Status {
        #[arg(short = 'o', long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Show events for the cluster
    Events {
        /// Keep streaming new events
        #[arg(short = 'f', long)]
        follow: bool,
        /// Only events at or after this RFC 3339 time
        #[arg(long)]
        since: Option<String>,
    },

    /// Print the version of kubectl-documentdb
    Version,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("documentdb=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };
    if let Commands::Version = command {
        return commands::version::run();
    }

    let global = commands::GlobalArgs {
        config: cli.config,
        namespace: cli.namespace,
        cluster: cli.cluster,
        context: cli.context,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let session = commands::Session::connect(&global).await?;
        match command {
            Commands::Promote {
                ref target,
                force,
                timeout,
            } => commands::promote::run(&session, target, force, timeout).await,
            Commands::Status { output } => commands::status::run(&session, output).await,
            Commands::Events { follow, ref since } => {
                commands::events::run(&session, follow, since.as_deref()).await
            }
            Commands::Version => commands::version::run(),
        }
    })
}
