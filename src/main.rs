//! tailsock: streams a followed file over a Unix domain socket
//!
//! Serves a single HTTP route on a filesystem-path socket. Every GET gets a
//! `text/plain` chunked response whose body is the live output of a follower
//! process (`tail -f` on the configured file), one chunk per line.
//!
//! Features:
//! - Stale socket cleanup at startup, socket removal at shutdown
//! - Strictly sequential connections with a backlog of one
//! - Graceful stop on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod http;
mod server;
mod tail;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        socket = %config.socket_path.display(),
        file = %config.tail_file.display(),
        program = %config.tail_program,
        backlog = config.backlog,
        "Starting tailsock server"
    );

    let mut server = Server::bind(config)?;

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("Interrupt received, shutting down");
        shutdown.shutdown();
    })?;

    server.run()?;

    info!(socket = %server.socket_path().display(), "Shutting down server");
    Ok(())
}
