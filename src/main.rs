use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use clap::{
    builder::{
        styling::{AnsiColor, Effects},
        Styles,
    },
    Parser, Subcommand,
};
use tracing::{error, info};

use xolo::config::Config;
use xolo::state::AppState;
use xolo::{logging, routes};

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::White.on_default() | Effects::BOLD)
        .usage(AnsiColor::White.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightBlue.on_default())
        .placeholder(AnsiColor::BrightGreen.on_default())
}

/// Root CLI for the Xolo server process. Unlike a desktop-facing tool, the
/// only thing an operator does from the shell is start the server — the
/// admin surface itself (titles, versions, releases) lives behind the HTTP
/// API (spec §1: "authentication helpers ... are out of scope").
#[derive(Parser, Debug)]
#[clap(
    version = env!("CARGO_PKG_VERSION"),
    name = env!("CARGO_PKG_NAME"),
    bin_name = env!("CARGO_PKG_NAME"),
    author = env!("CARGO_PKG_AUTHORS"),
    about = env!("CARGO_PKG_DESCRIPTION"),
    styles = styles(),
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP server and block until shutdown.
    Serve {
        /// Path to a `.env`-style config file (defaults to the data dir's own `.env`).
        #[clap(long)]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config_path: Option<std::path::PathBuf>) {
    let config = Config::load(config_path).await;
    let log_dir = config.data_dir.join("logs");
    let (log_control, _guard) = logging::init(log_dir);

    info!(bind_addr = %config.bind_addr, "starting xolo");

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, log_control);
    state.spawn_scheduler();

    let app = routes::build(Arc::clone(&state));

    let addr = match SocketAddr::from_str(&bind_addr) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid bind address");
            return;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "failed to bind listener");
            return;
        }
    };

    let shutdown_state = Arc::clone(&state);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_state.shutdown().await;
    })
    .await;

    if let Err(e) = result {
        error!(error = %e, "server exited with error");
    }
}
