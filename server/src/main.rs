use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};

use server::dispatch::{ShutdownToken, WorkerPool};
use server::handler::ServiceHandler;
use server::persist;
use server::sessions::SessionRegistry;
use server::store::ObjectStore;

/// Main-method of the application.
/// Parses command-line arguments, restores the store from disk, then runs
/// the accept loop until a shutdown signal arrives.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "7070")]
        port: u16,
        /// Number of worker threads in the dispatch pool
        #[clap(short, long, default_value = "4")]
        workers: usize,
        /// Bucket count for the object store
        #[clap(short, long, default_value = "1024")]
        buckets: u32,
        /// Binary file the store is loaded from and saved to
        #[clap(short, long, default_value = "coffer.db")]
        data_file: PathBuf,
        /// Account to register at startup, as name:password:privilege.
        /// May be given multiple times.
        #[clap(short, long = "account")]
        accounts: Vec<String>,
    }

    env_logger::init();
    let args = Args::parse();

    let store = Arc::new(ObjectStore::new(args.buckets)?);
    if args.data_file.exists() {
        persist::load_store(&store, &args.data_file)?;
    } else {
        info!("no data file at {}, starting empty", args.data_file.display());
    }

    let registry = Arc::new(SessionRegistry::new());
    for spec in &args.accounts {
        let (name, password, privilege) = parse_account(spec)?;
        registry.add_account(name, password, privilege)?;
    }
    if registry.is_empty() {
        warn!("no accounts registered; clients will not be able to log in");
    }

    let token = ShutdownToken::new();
    let handler = ServiceHandler::new(Arc::clone(&store), Arc::clone(&registry));
    let pool = WorkerPool::new(args.workers, handler, token.clone())?;

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address)?;
    // Non-blocking accept so the loop can notice the token between polls.
    listener.set_nonblocking(true)?;
    info!("listening on {}", address);

    {
        let token = token.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            token.trigger();
        })?;
    }

    while !token.is_triggered() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    error!("failed to configure connection from {}: {}", peer, e);
                    continue;
                }
                if let Err(e) = pool.submit(stream, peer) {
                    warn!("refused connection from {}: {}", peer, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                error!("accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }

    info!("draining dispatch pool");
    pool.shutdown();

    persist::save_store(&store, &args.data_file)?;
    info!("shutdown complete");
    Ok(())
}

/// Parses a `name:password:privilege` account specification.
fn parse_account(spec: &str) -> Result<(&str, &str, u8), Box<dyn std::error::Error>> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().filter(|s| !s.is_empty());
    let password = parts.next().filter(|s| !s.is_empty());
    let privilege = parts.next().map(str::parse::<u8>);
    match (name, password, privilege) {
        (Some(name), Some(password), Some(Ok(privilege))) => Ok((name, password, privilege)),
        _ => Err(format!("invalid account spec '{spec}', expected name:password:privilege").into()),
    }
}
