use clap::Parser;
use log::{error, info};
use proxy::console::{self, Command};
use proxy::{BackendServer, ProxyConfig, ProxyContext, ProxyServer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Main-method of the proxy.
/// Parses command-line arguments, starts the proxy and serves the operator console.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Address to accept clients on
        #[clap(short, long, default_value = "0.0.0.0:19132")]
        bind: SocketAddr,
        /// Backend address, used when no server list is given
        #[clap(long, default_value = "127.0.0.1:19134")]
        backend: SocketAddr,
        /// JSON file listing named backend servers
        #[clap(short, long)]
        servers: Option<PathBuf>,
        /// Server new players join first
        #[clap(short, long, default_value = "lobby")]
        default_server: String,
        /// Name shown in the server list
        #[clap(short, long, default_value = "Test")]
        motd: String,
        #[clap(long, default_value = "25000")]
        max_players: u32,
        /// Workers handling packets from unknown endpoints (defaults to CPU count)
        #[clap(short, long)]
        workers: Option<usize>,
        /// Seed for the proxy's random number generator
        #[clap(long)]
        seed: Option<u64>,
    }

    env_logger::init();
    let args = Args::parse();

    let defaults = ProxyConfig::default();
    let servers = match &args.servers {
        Some(path) => ProxyConfig::load_servers(path)?,
        None => vec![BackendServer::new(args.default_server.clone(), args.backend)],
    };
    let config = ProxyConfig {
        bind_addr: args.bind,
        servers,
        default_server: args.default_server,
        motd: args.motd,
        max_players: args.max_players,
        workers: args.workers.unwrap_or(defaults.workers),
        ..defaults
    };

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let server = ProxyServer::bind(config, rng).await?;
    let ctx = server.context();
    let shutdown = server.shutdown_token();
    let mut proxy_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = &mut proxy_handle => {
            match result {
                Ok(Ok(())) => info!("Proxy stopped"),
                Ok(Err(e)) => error!("Proxy failed: {}", e),
                Err(e) => error!("Proxy task panicked: {}", e),
            }
            return Ok(());
        }
        _ = run_console(Arc::clone(&ctx)) => {
            info!("Console requested shutdown");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    shutdown.cancel();
    match proxy_handle.await {
        Ok(Err(e)) => error!("Proxy failed: {}", e),
        Err(e) => error!("Proxy task panicked: {}", e),
        Ok(Ok(())) => {}
    }
    Ok(())
}

/// Reads operator commands until `stop` or end of input.
async fn run_console(ctx: Arc<ProxyContext>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // stdin closed, e.g. running detached; keep serving
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                error!("Failed to read console input: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };
        match Command::parse(&line) {
            Some(Command::Stop) => return,
            Some(command) => println!("{}", console::execute(&ctx, command).await),
            None => {}
        }
    }
}
