use std::io::IsTerminal;

use clap::Parser;

use vibecheck_agent::config::{AgentConfig, DEFAULT_SERVER_URL};

#[derive(Parser)]
#[command(
    name = "vibecheck-agent",
    version,
    about = "Bridge a remote web UI to a local Claude Code session"
)]
struct Cli {
    /// API key issued by the relay server
    #[arg(long, short = 'k')]
    key: String,

    /// Working directory the assistant operates in
    #[arg(long, short = 'd', default_value = ".")]
    dir: String,

    /// Relay WebSocket URL
    #[arg(long, short = 's', default_value = DEFAULT_SERVER_URL)]
    server: String,

    /// Start a fresh conversation instead of resuming the stored session
    #[arg(long)]
    new_session: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match AgentConfig::resolve(cli.key, &cli.dir, cli.server, cli.new_session) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = vibecheck_agent::run(config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
