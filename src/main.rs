use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use tokio::sync::watch;
use wavecore::cli::Args;
use wavecore::config::ServerConfig;
use wavecore::manager::{ClientId, Handler, SessionManager};
use wavecore::message::Message;
use wavecore::server::Server;

/// Echoes every text/binary message back to its sender and logs
/// connection lifecycle events. Good enough to exercise the core from
/// the command line; real deployments bring their own `Handler`.
struct EchoHandler;

impl Handler for EchoHandler {
    fn on_connect(&self, id: ClientId, manager: &SessionManager) {
        info!("client {id} connected");
        let _ = manager;
    }

    fn on_message(&self, id: ClientId, message: Message, manager: &SessionManager) {
        if let Err(err) = manager.send(id, message) {
            error!("failed to echo message to client {id}: {err}");
        }
    }

    fn on_disconnect(&self, id: ClientId, code: u16, reason: String, _manager: &SessionManager) {
        info!("client {id} disconnected: {code} {reason}");
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|err| {
            eprintln!("failed to load {path}: {err}");
            std::process::exit(1);
        }),
        None => ServerConfig::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }

    let server = Server::new(config, Arc::new(EchoHandler));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = server.run(shutdown_rx).await {
        error!("server exited with an error: {err}");
        std::process::exit(1);
    }

    Ok(())
}
