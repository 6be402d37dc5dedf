//! meshtalk CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Interactive session with streaming output and tool approvals
//! - `ask`: Send one message, print the answer, exit
//! - `tools`: List the tool catalog by category
//! - `models`: List the models the configured provider offers
//! - `init`: Write a default config file

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod render;
mod runtime;

#[derive(Parser)]
#[command(
    name = "meshtalk",
    about = "meshtalk — chat with local and hosted LLMs from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read configuration from this file instead of ~/.meshtalk/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured model
    #[arg(short, long, global = true, env = "MESHTALK_MODEL")]
    model: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat
    Chat,

    /// Send a single message; tools that need approval are refused
    Ask {
        /// The message text
        #[arg(required = true, trailing_var_arg = true)]
        message: Vec<String>,
    },

    /// List available tools and their permission level
    Tools,

    /// List models offered by the configured provider
    Models,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with the transcript.
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Commands::Init { force } = cli.command {
        return commands::init::run(cli.config, force);
    }

    let mut config = runtime::load_config(cli.config.as_deref())?;
    if let Some(model) = cli.model {
        config.model = Some(model);
    }

    match cli.command {
        Commands::Chat => commands::chat::run(config).await?,
        Commands::Ask { message } => commands::ask::run(config, message.join(" ")).await?,
        Commands::Tools => commands::tools::run(&config)?,
        Commands::Models => commands::models::run(&config).await?,
        Commands::Init { .. } => {}
    }

    Ok(())
}
