//! Shroud Server
//!
//! Tunnel endpoint that:
//! - Accepts client connections over TCP
//! - Seals every connection with a pre-shared key
//! - Multiplexes virtual channels, each carrying one request at a time
//! - Relays connect requests to their IPv4 destinations

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use shroud::{
    codec::{sealed, Role},
    config::{generate_example_config, Config, LoggingConfig, MuxConfig},
    crypto::{generate_key, key_from_base64, key_to_base64, KEY_LEN},
    deadline::{Requester, Scheduler},
    fsm::{Connect, Requests},
    pool::{Pool, PoolHandle},
    session::Session,
    transport::TcpDialer,
    tunnel::Multiplexer,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Time given to in-flight jobs once shutdown starts
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shroud Server - multiplexed, sealed tunnel endpoint
#[derive(Parser, Debug)]
#[command(name = "shroud-server")]
#[command(about = "Shroud Server - multiplexed, sealed tunnel endpoint")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new pre-shared key and exit
    #[arg(long)]
    generate_key: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    example_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Server state shared across connections
struct ServerState {
    psk: [u8; KEY_LEN],
    requests: Arc<Requests>,
    runner: PoolHandle,
    requester: Requester,
    mux: MuxConfig,
    /// Connection semaphore for limiting concurrent connections
    conn_semaphore: Semaphore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        return print_key();
    }

    if args.example_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to render example config")?;
        print!("{}", example);
        return Ok(());
    }

    // Load configuration
    let config = Config::load(&args.config).context("Failed to load configuration")?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging)?;

    if config.server.psk.is_empty() {
        return Err(anyhow!("No psk configured; create one with --generate-key"));
    }
    let psk = key_from_base64(&config.server.psk).context("Invalid psk")?;

    let requester = Scheduler::new(config.scheduler.interval(), config.scheduler.queue_depth)
        .serve()
        .context("Failed to start deadline scheduler")?;

    let pool = Pool::new(config.pool.clone(), requester.clone());
    let runner = pool.serve().context("Failed to start worker pool")?;

    let mut requests = Requests::new();
    requests.register(
        Connect::new(Arc::new(TcpDialer::new()), config.connect.clone()).with_runner(runner.clone()),
    );

    let state = Arc::new(ServerState {
        psk,
        requests: Arc::new(requests),
        runner: runner.clone(),
        requester: requester.clone(),
        mux: config.mux.clone(),
        conn_semaphore: Semaphore::new(config.server.max_connections),
    });

    // Determine listen address
    let listen_addr = args.listen.unwrap_or(config.server.listen);

    info!("Shroud Server v{}", shroud::VERSION);
    info!("Listening on {}", listen_addr);
    if !config.connect.no_local_access {
        warn!("Local destinations are reachable through this server");
    }

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    // Accept connections
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                                debug!("Connection error: {:#}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, runner.close()).await {
        Ok(closed) => closed.context("Failed to close worker pool")?,
        Err(_) => warn!("Worker pool did not drain within {:?}", SHUTDOWN_GRACE),
    }
    requester.close().ok();

    Ok(())
}

/// Initialize tracing from the CLI level and the [logging] section
fn init_logging(level: &str, logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(level).context("Invalid log level")?;

    let writer = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.pretty().init(),
    }

    Ok(())
}

/// Generate and print a new pre-shared key
fn print_key() -> Result<()> {
    let key = generate_key()?;

    println!("Add to both ends' config.toml:");
    println!();
    println!("  [server]");
    println!("  psk = \"{}\"", key_to_base64(&key));

    Ok(())
}

/// Handle a single client connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let _permit = state
        .conn_semaphore
        .acquire()
        .await
        .context("Failed to acquire connection permit")?;

    // Disable Nagle's algorithm to avoid delays on small frames
    stream.set_nodelay(true)?;

    let (decoder, encoder) = sealed(stream, &state.psk, Role::Server);
    let mux = Multiplexer::new(decoder, encoder, state.requester.clone(), &state.mux);

    let span = info_span!("session", peer = %peer_addr);
    let session = Session::new(
        mux,
        state.requests.clone(),
        Some(state.runner.clone()),
        span.clone(),
    )?;

    session.run().instrument(span).await?;
    debug!("Connection from {} closed", peer_addr);
    Ok(())
}
