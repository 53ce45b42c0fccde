mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabpilot")]
#[command(about = "Bind browser tabs to remote conversational agents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an agent manifest and summarize it
    Manifest {
        /// Agent base URL
        url: String,

        /// Remember the agent in the config file
        #[arg(long)]
        add: bool,
    },

    /// Evaluate a manifest's rules against a request, offline
    Match {
        /// Path to a manifest JSON file
        #[arg(long)]
        manifest: String,

        /// Request URL
        #[arg(long)]
        url: String,

        #[arg(long, default_value = "GET")]
        method: String,

        #[arg(long, default_value = "xmlhttprequest")]
        resource_type: String,

        /// completed or beforeRequest
        #[arg(long, default_value = "completed")]
        event: String,
    },

    /// Activate an agent on a virtual tab and chat with it from stdin
    Chat {
        /// Agent base URL
        #[arg(long)]
        agent: String,

        /// Page the tab shows; defaults to the agent URL
        #[arg(long)]
        page: Option<String>,

        /// Bearer token for agents that declare auth
        #[arg(long)]
        token: Option<String>,
    },

    /// Feed recorded request events (JSON lines) through the configured agents
    Replay {
        /// Path to a JSON-lines file of request events
        #[arg(long)]
        events: String,

        /// Extra agent base URLs, on top of the configured ones
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Keep sessions (and their polling) open until Ctrl-C
        #[arg(long)]
        keep_open: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Manifest { url, add } => {
            commands::manifest::run(&url, add).await?;
        }
        Commands::Match {
            manifest,
            url,
            method,
            resource_type,
            event,
        } => {
            commands::match_cmd::run(&manifest, &url, &method, &resource_type, &event)?;
        }
        Commands::Chat { agent, page, token } => {
            commands::chat::run(&agent, page.as_deref(), token.as_deref()).await?;
        }
        Commands::Replay {
            events,
            agents,
            keep_open,
        } => {
            commands::replay::run(&events, &agents, keep_open).await?;
        }
    }

    Ok(())
}
