use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use wa_connector::{
    client::{stored_qr, stored_session},
    ConnectionStatus, ConnectorConfig, ConnectorEvent, DispatchError, FileStore, MessagingClient,
    PhoneNumberResolver, TransportKind,
};

/// Operator CLI for the WhatsApp connector.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session name (namespaces every persisted key).
    #[arg(long)]
    session: Option<String>,

    /// Path of the durable store file.
    #[arg(long)]
    store: Option<String>,

    /// Transport driver: `native` or `browser`.
    #[arg(long, value_parser = parse_transport)]
    transport: Option<TransportKind>,

    /// Endpoint of the native protocol gateway.
    #[arg(long)]
    endpoint: Option<String>,

    /// Log filter, e.g. `info` or `wa_connector=debug`. `RUST_LOG` wins.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and keep the session alive, printing QR codes when pairing.
    Run,
    /// Connect, wait for the session to be ready and send one message.
    Send {
        phone: String,
        message: String,
        /// Seconds to wait for the connection to become ready.
        #[arg(long, default_value_t = 120)]
        wait: u64,
    },
    /// Print the status snapshot of the last running connector.
    Status,
    /// Print the current QR code of a running connector.
    Qr,
    /// Show the canonical form and send candidates of a phone number.
    Normalize { phone: String },
    /// Discard stored credentials; the next run starts QR pairing.
    Logout,
    /// Print the effective configuration.
    ShowConfig,
}

fn parse_transport(value: &str) -> Result<TransportKind, String> {
    match value {
        "native" => Ok(TransportKind::Native),
        "browser" => Ok(TransportKind::Browser),
        other => Err(format!("unknown transport {other:?}, expected native or browser")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Send {
            phone,
            message,
            wait,
        } => send(config, &phone, &message, Duration::from_secs(wait)).await?,
        Commands::Status => {
            let store = FileStore::open(&config.store_path)?;
            match stored_session(&store, &config)? {
                Some(session) => {
                    println!("{}", serde_json::to_string_pretty(&session)?);
                    if let Some(qr) = stored_qr(&store, &config)? {
                        println!("QR code pending until {}", qr.expires_at);
                    }
                }
                None => println!("No status recorded for session {}.", config.session_name),
            }
        }
        Commands::Qr => {
            let store = FileStore::open(&config.store_path)?;
            match stored_qr(&store, &config)? {
                Some(qr) => {
                    println!("{}", qr.terminal);
                    println!("Expires at {}", qr.expires_at);
                }
                None => println!("No QR code pending."),
            }
        }
        Commands::Normalize { phone } => {
            let resolver = PhoneNumberResolver::new(config.numbering_plan.clone());
            let candidate = resolver.build_candidates(&phone)?;
            println!("normalized: {}", candidate.normalized);
            println!("candidates: {}", candidate.candidates.join(", "));
        }
        Commands::Logout => {
            let client = MessagingClient::open(config)?;
            client.logout().await?;
            println!("Credentials cleared.");
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<ConnectorConfig, wa_connector::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => ConnectorConfig::from_file(path)?,
        None => ConnectorConfig::default(),
    };
    if let Some(session) = &cli.session {
        config = config.with_session_name(session.clone());
    }
    if let Some(store) = &cli.store {
        config = config.with_store_path(store.clone());
    }
    if let Some(transport) = cli.transport {
        config = config.with_transport(transport);
    }
    if let Some(endpoint) = &cli.endpoint {
        config = config.with_network_endpoint(endpoint.clone());
    }
    Ok(config)
}

async fn run(config: ConnectorConfig) -> Result<(), Box<dyn std::error::Error>> {
    let client = MessagingClient::open(config)?;
    let mut events = client.subscribe();
    client.initialize().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => log::warn!("missed {skipped} events"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down.");
                break;
            }
        }
    }

    client.teardown().await;
    Ok(())
}

async fn send(
    config: ConnectorConfig,
    phone: &str,
    message: &str,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let client = MessagingClient::open(config)?;
    let mut events = client.subscribe();
    client.initialize().await;

    let ready = tokio::time::timeout(wait, async {
        while client.connection_status().status != ConnectionStatus::Ready {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return,
            }
        }
    })
    .await;
    if ready.is_err() {
        log::warn!("session not ready after {wait:?}");
    }

    let result = client.send_message(phone, message).await;
    client.teardown().await;

    match result {
        Ok(delivered) => {
            println!(
                "Delivered to {} (id {}, {} attempt(s))",
                delivered.recipient, delivered.message_id, delivered.attempts
            );
            Ok(())
        }
        Err(DispatchError::NotReady { status }) => {
            eprintln!("Connection not ready ({status}). Pair the session with the run command first.");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn print_event(event: &ConnectorEvent) {
    match event {
        ConnectorEvent::QrCode(qr) => {
            println!("Scan this QR code to link the device:");
            println!("{}", qr.terminal);
        }
        ConnectorEvent::StatusChanged { to, .. } => println!("Status: {to}"),
        ConnectorEvent::ReconnectScheduled {
            attempt,
            delay,
            cooldown,
        } => {
            if *cooldown {
                println!("Too many failures, pausing for {delay:?}");
            } else {
                println!("Reconnecting in {delay:?} (attempt {attempt})");
            }
        }
        ConnectorEvent::MessageReceived(message) => {
            println!("<{}> {}", message.from, message.body)
        }
        ConnectorEvent::MessageSent(_) | ConnectorEvent::MessageFailed(_) => {}
    }
}
