//! dotwire - DOT document transfer
//!
//! Runs a stream or datagram server that stores incoming documents, or an
//! interactive client that sends them.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dotwire::config::{self, Config};
use dotwire::document::{seed_samples, DocumentStore};
use dotwire::network::{
    resolve_addr, DatagramClient, DatagramServer, DocumentTransport, ServerEvent, StreamClient,
    StreamServer,
};
use dotwire::protocol::{DEFAULT_DATAGRAM_PORT, DEFAULT_STREAM_PORT};
use dotwire::session::Session;

/// dotwire - DOT document transfer
#[derive(Parser)]
#[command(name = "dotwire")]
#[command(author = "Dotwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send DOT graph documents to a server over TCP or UDP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// Length-prefixed frames over TCP
    Stream,
    /// One message per UDP datagram
    Datagram,
}

impl Transport {
    fn default_port(self) -> u16 {
        match self {
            Transport::Stream => DEFAULT_STREAM_PORT,
            Transport::Datagram => DEFAULT_DATAGRAM_PORT,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a server that stores received documents
    Server {
        /// Transport to serve
        #[arg(short, long, value_enum, default_value_t = Transport::Stream)]
        transport: Transport,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Directory for received documents
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Directory of sample documents to seed an empty store with
        #[arg(long)]
        samples: Option<PathBuf>,
    },

    /// Run an interactive client
    Client {
        /// Transport to use
        #[arg(short, long, value_enum, default_value_t = Transport::Stream)]
        transport: Transport,

        /// Server address (host:port)
        #[arg(short, long)]
        server: Option<String>,

        /// Directory for acknowledged documents
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Acknowledgment timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server {
            transport,
            port,
            dir,
            samples,
        } => {
            run_server(config, transport, port, dir, samples).await?;
        }
        Commands::Client {
            transport,
            server,
            dir,
            timeout_ms,
        } => {
            run_client(config, transport, server, dir, timeout_ms).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Run a server until Ctrl+C
async fn run_server(
    config: Config,
    transport: Transport,
    port: Option<u16>,
    dir: Option<PathBuf>,
    samples: Option<PathBuf>,
) -> anyhow::Result<()> {
    let file_store = config.server.store(dir);
    let storage_dir = file_store.dir().to_path_buf();
    let store: Arc<dyn DocumentStore> = Arc::new(file_store);

    if let Some(samples_dir) = samples.or(config.server.samples_dir.clone()) {
        let seeded = seed_samples(store.as_ref(), &samples_dir).await?;
        if seeded > 0 {
            tracing::info!("Seeded {} sample documents from {}", seeded, samples_dir.display());
        }
    }

    let port = port.unwrap_or(match transport {
        Transport::Stream => config.server.stream_port,
        Transport::Datagram => config.server.datagram_port,
    });
    let net_config = config.server.network(port);

    tracing::info!(
        "Starting {:?} server on port {}, documents in {}",
        transport,
        port,
        storage_dir.display()
    );

    match transport {
        Transport::Stream => {
            let mut server = StreamServer::new(net_config, store);
            let event_rx = server.take_event_receiver();
            server.start().await?;
            print_events(event_rx).await;
            server.stop().await?;
        }
        Transport::Datagram => {
            let mut server = DatagramServer::new(net_config, store);
            let event_rx = server.take_event_receiver();
            server.start().await?;
            print_events(event_rx).await;
            server.stop().await?;
        }
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Print server events until Ctrl+C
async fn print_events(event_rx: Option<mpsc::Receiver<ServerEvent>>) {
    let Some(mut event_rx) = event_rx else {
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    println!("Press Ctrl+C to stop.\n");

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    ServerEvent::Started { bind_addr } => {
                        println!("Listening on {}", bind_addr);
                    }
                    ServerEvent::PeerConnected { addr } => {
                        println!("+ Client connected: {}", addr);
                    }
                    ServerEvent::PeerDisconnected { addr, reason } => {
                        println!("- Client disconnected: {} ({})", addr, reason);
                    }
                    ServerEvent::DocumentStored { addr, name, path } => {
                        println!("Got '{}' from {}, saved to {}", name, addr, path.display());
                    }
                    ServerEvent::StorageFailed { addr, name, error } => {
                        println!("Could not save '{}' from {}: {}", name, addr, error);
                    }
                    ServerEvent::Stopped => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }
}

/// Run the interactive client
async fn run_client(
    config: Config,
    transport: Transport,
    server: Option<String>,
    dir: Option<PathBuf>,
    timeout_ms: Option<u64>,
) -> anyhow::Result<()> {
    let server = server.unwrap_or_else(|| config.client.server_or(transport.default_port()));
    let server_addr = resolve_addr(&server).await?;

    let file_store = config.client.store(dir);
    let storage_dir = file_store.dir().to_path_buf();
    let store: Arc<dyn DocumentStore> = Arc::new(file_store);
    store.list().await?;

    println!("Server: {} ({:?})", server_addr, transport);
    println!("Documents will be saved to {}", storage_dir.display());
    println!("\nCommands:");
    println!("  send <file>    - Send a DOT file to the server");
    println!("  exit           - Close the connection and exit");
    println!();

    let net_config = config.client.network(server_addr.port(), timeout_ms);

    match transport {
        Transport::Stream => {
            let mut client = StreamClient::new(server_addr, net_config);
            if let Err(e) = client.connect().await {
                println!("Could not connect to {}: {} (will retry on send)", server_addr, e);
            }

            let mut session = Session::new(client, store);
            run_session(&mut session).await?;
        }
        Transport::Datagram => {
            let ack_timeout = net_config
                .ack_timeout()
                .unwrap_or_else(|| config.client.ack_timeout());
            let client = DatagramClient::bind(server_addr, ack_timeout).await?;

            let mut session = Session::new(client, store);
            run_session(&mut session).await?;
        }
    }

    tracing::info!("Client exited");
    Ok(())
}

/// Drive a session on stdin/stdout until exit or Ctrl+C
async fn run_session<T: DocumentTransport>(session: &mut Session<T>) -> anyhow::Result<()> {
    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();

    tokio::select! {
        result = session.run(input, output) => result?,
        _ = tokio::signal::ctrl_c() => println!("\nExiting..."),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["dotwire", "server", "--transport", "datagram", "-p", "9001"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from(["dotwire", "client", "-s", "localhost:8080", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Client { transport: Transport::Stream, .. }
        ));
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Transport::Stream.default_port(), 8080);
        assert_eq!(Transport::Datagram.default_port(), 8081);
    }
}
