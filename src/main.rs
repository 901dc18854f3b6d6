use clap::{Parser, Subcommand};
use peerdrop::{
    config::Settings,
    network::{wire, PeerClient},
    service::{PeerDaemon, ServerDaemon},
    Result,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Rendezvous peer discovery and direct file push")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rendezvous server
    Serve,
    /// Register with a rendezvous server and receive incoming files
    Join {
        /// Rendezvous server address
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: String,
    },
    /// List the peers currently registered with a server
    List {
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: String,
    },
    /// Push a file to a registered peer
    Send {
        #[arg(short, long, default_value = "127.0.0.1:5000")]
        server: String,

        /// Target peer id as shown by `list`
        target: String,

        /// Local file to push
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("peerdrop={}", log_level))
        .init();

    let settings = Arc::new(Settings::load(cli.config.as_deref())?);

    match cli.command {
        Command::Serve => {
            info!("Starting peerdrop rendezvous server v{}", env!("CARGO_PKG_VERSION"));
            run_daemon(ServerDaemon::new(settings).run()).await
        }
        Command::Join { server } => {
            info!("Starting peerdrop peer v{}", env!("CARGO_PKG_VERSION"));
            run_daemon(PeerDaemon::new(settings, server).run()).await
        }
        Command::List { server } => {
            let client = PeerClient::new(settings);
            let peers = client.request_peer_list(&server).await?;
            println!("Connected peers: {}", wire::join_peer_list(&peers));
            Ok(())
        }
        Command::Send {
            server,
            target,
            file,
        } => {
            let client = PeerClient::new(settings);
            let digest = client.send_to_target(&server, &target, &file).await?;
            println!("Sent {} to {} (sha256 {})", file.display(), target, digest);
            Ok(())
        }
    }
}

async fn run_daemon(daemon: impl std::future::Future<Output = Result<()>>) -> Result<()> {
    tokio::select! {
        result = daemon => {
            if let Err(e) = result {
                error!("Daemon error: {}", e);
                return Err(e);
            }
        }
        _ = setup_shutdown_handler() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("peerdrop stopped");
    Ok(())
}

async fn setup_shutdown_handler() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate()).unwrap();
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await.unwrap();
    }
}
