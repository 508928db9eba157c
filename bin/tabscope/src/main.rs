mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tabscope")]
#[command(about = "Serves browser telemetry to AI coding assistants over MCP", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the MCP server on stdio and the extension HTTP endpoint
    Serve {
        /// Port for the extension endpoint (overrides config port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Do not start the extension HTTP endpoint
        #[arg(long)]
        no_http: bool,
    },

    /// Show whether a daemon is running and what it has captured
    Status {
        /// Port to probe (overrides config port)
        #[arg(short, long)]
        port: Option<u16>,
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

    // stdout carries MCP frames, so logs go to stderr
    let registry = tracing_subscriber::registry().with(filter);
    match cli.log_format {
        LogFormat::Text => registry.with(fmt::layer().with_writer(std::io::stderr)).init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_writer(std::io::stderr)).init(),
    }

    match cli.command {
        Commands::Serve { port, no_http } => {
            commands::serve::run(port, no_http).await?;
        }
        Commands::Status { port } => {
            commands::status::run(port).await?;
        }
    }

    Ok(())
}
