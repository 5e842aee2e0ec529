use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use mqtt_explorer::config::AppConfig;
use mqtt_explorer::mqtt::{
    Client, ConnectionOptions, DisconnectReason, Event, Message, MessageLog, QoS,
};
use mqtt_explorer::persistence::{ConnectionProfile, ProfileStore, TomlProfileStore};
use mqtt_explorer::simulator::{self, SimulatorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const CONFIG_FILE: &str = ".config/mqtt-explorer/config.toml";

#[derive(Parser, Debug)]
#[command(name = "mqtt-explorer", version, about = "Watch and exercise MQTT brokers")]
struct Cli {
    /// Config file (defaults to ~/.config/mqtt-explorer/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    connection: ConnectionArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Default)]
struct ConnectionArgs {
    /// Use a saved connection profile
    #[arg(long, global = true)]
    profile: Option<String>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    client_id: Option<String>,
    #[arg(long, global = true)]
    username: Option<String>,
    #[arg(long, global = true)]
    password: Option<String>,
    /// Resume a persistent session instead of starting clean
    #[arg(long, global = true)]
    persistent: bool,
    #[arg(long, global = true)]
    keep_alive: Option<u16>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to filters and print incoming messages
    Watch {
        #[arg(required = true)]
        filters: Vec<String>,
        #[arg(long, default_value_t = 0, value_parser = parse_qos)]
        qos: u8,
        /// Messages kept in the in-memory log
        #[arg(long, default_value_t = 500)]
        log_size: usize,
        /// Print the logged topics as a tree on exit
        #[arg(long)]
        tree: bool,
    },
    /// Publish a single message
    Publish {
        topic: String,
        payload: String,
        #[arg(long, default_value_t = 0, value_parser = parse_qos)]
        qos: u8,
        #[arg(long)]
        retain: bool,
    },
    /// Publish random temperature/humidity readings
    Simulate {
        #[arg(long, default_value = simulator::DEFAULT_TOPIC)]
        topic: String,
        #[arg(long, default_value_t = simulator::DEFAULT_INTERVAL_MS)]
        interval_ms: u64,
        #[arg(long, default_value_t = 0, value_parser = parse_qos)]
        qos: u8,
        /// Stop after this many readings
        #[arg(long)]
        count: Option<u64>,
    },
    /// Manage saved connection profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand, Debug)]
enum ProfileAction {
    List,
    /// Save the effective connection options under an id
    Save {
        id: String,
        #[arg(long)]
        name: Option<String>,
        /// Filters to subscribe when watching with this profile
        #[arg(long)]
        subscribe: Vec<String>,
    },
    Delete {
        id: String,
    },
}

fn parse_qos(value: &str) -> Result<u8, String> {
    match value.parse::<u8>() {
        Ok(qos @ 0..=2) => Ok(qos),
        _ => Err(format!("QoS must be 0, 1 or 2, got '{}'", value)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = AppConfig::load(&config_path).await?;
    let store = match &config.profiles_path {
        Some(path) => TomlProfileStore::new(path.clone()),
        None => TomlProfileStore::default_location(),
    };

    let (options, profile_filters) = resolve_options(&cli.connection, &config, &store).await?;

    match cli.command {
        Command::Watch {
            filters,
            qos,
            log_size,
            tree,
        } => {
            let filters = filters.into_iter().chain(profile_filters).collect();
            let log = MessageLog::with_capacity(log_size);
            watch(&config, &store, options, filters, to_qos(qos)?, log, tree).await
        }
        Command::Publish {
            topic,
            payload,
            qos,
            retain,
        } => {
            let message = Message::new(topic, payload, to_qos(qos)?).with_retain(retain);
            publish(&config, &store, options, message).await
        }
        Command::Simulate {
            topic,
            interval_ms,
            qos,
            count,
        } => {
            let sim = SimulatorConfig {
                topic,
                interval: Duration::from_millis(interval_ms),
                qos: to_qos(qos)?,
                count,
            };
            simulate(&config, &store, options, sim).await
        }
        Command::Profiles { action } => manage_profiles(&store, options, action).await,
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

fn default_config_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_FILE);
    path
}

fn to_qos(value: u8) -> Result<QoS> {
    QoS::try_from(value).map_err(|e| eyre!("{}", e))
}

/// Profile, else config file, else the last connection; command line flags override all
async fn resolve_options(
    args: &ConnectionArgs,
    config: &AppConfig,
    store: &TomlProfileStore,
) -> Result<(ConnectionOptions, Vec<String>)> {
    let (mut options, filters) = match &args.profile {
        Some(id) => {
            let profile = store
                .profile(id)
                .await?
                .ok_or_else(|| eyre!("No profile named '{}' in {}", id, store.path().display()))?;
            info!("Using profile '{}' ({})", profile.id, profile.name);
            (profile.options, profile.subscriptions)
        }
        None => {
            let last = match config.connection {
                Some(_) => None,
                None => store.last_connection().await.unwrap_or_else(|e| {
                    warn!("Could not read last connection: {}", e);
                    None
                }),
            };
            if let Some(last) = &last {
                info!("Starting from last connection {}", last);
            }
            (config.base_connection(last), Vec::new())
        }
    };

    if let Some(host) = &args.host {
        options.host = host.clone();
    }
    if let Some(port) = args.port {
        options.port = port;
    }
    if let Some(client_id) = &args.client_id {
        options.client_id = client_id.clone();
    }
    if args.username.is_some() {
        options.username = args.username.clone();
    }
    if args.password.is_some() {
        options.password = args.password.clone();
    }
    if args.persistent {
        options.clean_session = false;
    }
    if let Some(keep_alive) = args.keep_alive {
        options.keep_alive_secs = keep_alive;
    }
    Ok((options, filters))
}

async fn connect(
    config: &AppConfig,
    store: &TomlProfileStore,
    options: ConnectionOptions,
) -> Result<(Client, mpsc::Receiver<Event>)> {
    let (client, events) = Client::tcp(config.client.clone());
    match client.connect(options.clone()).await {
        Ok(outcome) => {
            info!(
                "Connected to {} as '{}' (session present: {})",
                options, outcome.client_id, outcome.session_present
            );
            if let Err(e) = store.save_last_connection(options).await {
                warn!("Could not remember connection: {}", e);
            }
            Ok((client, events))
        }
        Err(e) => {
            // stop background reconnect attempts
            client.disconnect().await?;
            Err(eyre!("Failed to connect to {}: {}", options, e))
        }
    }
}

async fn watch(
    config: &AppConfig,
    store: &TomlProfileStore,
    options: ConnectionOptions,
    filters: Vec<String>,
    qos: QoS,
    mut log: MessageLog,
    print_tree: bool,
) -> Result<()> {
    let mut resubscribe = ResubscribeGate::new(options.clean_session);
    let (client, mut events) = connect(config, store, options).await?;
    let requested: Vec<(String, QoS)> = filters.iter().map(|f| (f.clone(), qos)).collect();

    for (filter, code) in client.subscribe_many(requested.clone(), None).await? {
        info!("Subscribed to '{}': {:?}", filter, code);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                break;
            }
            event = events.recv() => match event {
                Some(Event::Message(message)) => println!("{}", log.push(&message)),
                Some(Event::Connected { session_present }) => {
                    if resubscribe.on_connected(session_present) {
                        let client = client.clone();
                        let requested = requested.clone();
                        tokio::spawn(async move {
                            if let Err(e) = client.subscribe_many(requested, None).await {
                                error!("Resubscribe failed: {}", e);
                            }
                        });
                    }
                }
                Some(Event::Reconnecting { attempt, delay }) => {
                    info!("Reconnect attempt {} in {:?}", attempt, delay)
                }
                Some(Event::Disconnected(reason)) => {
                    warn!("Disconnected: {:?}", reason);
                    if matches!(reason, DisconnectReason::Refused(_) | DisconnectReason::ReconnectExhausted) {
                        break;
                    }
                }
                Some(Event::DeliveryAbandoned { packet_id, message }) => {
                    warn!("Delivery of {} to '{}' abandoned", packet_id, message.topic)
                }
                None => break,
            }
        }
    }

    client.disconnect().await?;
    info!("Received {} messages", client.status().messages_received);
    if print_tree {
        print!("{}", log.tree().render());
    }
    Ok(())
}

/// Decides which `Connected` events need the filters subscribed again
///
/// The first one belongs to the handshake `connect` already waited for. A persistent
/// session resubscribes on its own, so only clean sessions need the CLI to do it.
struct ResubscribeGate {
    clean_session: bool,
    seen_initial: bool,
}

impl ResubscribeGate {
    fn new(clean_session: bool) -> Self {
        Self {
            clean_session,
            seen_initial: false,
        }
    }

    fn on_connected(&mut self, session_present: bool) -> bool {
        if !self.seen_initial {
            self.seen_initial = true;
            return false;
        }
        info!("Reconnected (session present: {})", session_present);
        self.clean_session && !session_present
    }
}

async fn publish(
    config: &AppConfig,
    store: &TomlProfileStore,
    options: ConnectionOptions,
    message: Message,
) -> Result<()> {
    let (client, _events) = connect(config, store, options).await?;
    let topic = message.topic.clone();
    let qos = message.qos;
    let result = client.publish(message).await;
    client.disconnect().await?;
    match result? {
        Some(packet_id) => info!("Published to '{}' at {} (packet {})", topic, qos, packet_id),
        None => info!("Published to '{}' at {}", topic, qos),
    }
    Ok(())
}

async fn simulate(
    config: &AppConfig,
    store: &TomlProfileStore,
    options: ConnectionOptions,
    sim: SimulatorConfig,
) -> Result<()> {
    let (client, mut events) = connect(config, store, options).await?;

    let shutdown = CancellationToken::new();
    let events_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                Event::Disconnected(reason) => warn!("Disconnected: {:?}", reason),
                Event::Reconnecting { attempt, .. } => info!("Reconnect attempt {}", attempt),
                other => tracing::debug!("{:?}", other),
            }
        }
    });

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let sent = simulator::run(&client, &sim, shutdown).await?;
    client.disconnect().await?;
    events_task.abort();
    info!("Published {} readings", sent);
    Ok(())
}

async fn manage_profiles(
    store: &TomlProfileStore,
    options: ConnectionOptions,
    action: ProfileAction,
) -> Result<()> {
    match action {
        ProfileAction::List => {
            let profiles = store.profiles().await?;
            if profiles.is_empty() {
                println!("No profiles in {}", store.path().display());
            }
            for profile in profiles {
                println!("{:<16} {:<24} {}", profile.id, profile.name, profile.options);
            }
        }
        ProfileAction::Save {
            id,
            name,
            subscribe,
        } => {
            let mut profile = ConnectionProfile::new(id.clone(), name.unwrap_or(id), options);
            profile.subscriptions = subscribe;
            store.save_profile(profile).await?;
        }
        ProfileAction::Delete { id } => {
            if !store.delete_profile(&id).await? {
                return Err(eyre!("No profile named '{}'", id));
            }
        }
    }
    Ok(())
}
