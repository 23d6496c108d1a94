mod repl;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use kit_twin_core::config::{Config, LoggingConfig};
use kit_twin_core::types::{KitState, LifecyclePhase, SessionIntent, StatusEvent};
use kit_twin_runtime::{Orchestrator, OrchestratorHandle, WebSocketTransport};
use kit_twin_session::{HttpSessionClient, SessionService, extract_endpoint};

use crate::repl::ReplCommand;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "kit-twin",
    about = "Stream a remote Kit session and keep its scene, selection and status in sync",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a session from the backend and stream it
    Connect {
        /// Session backend base URL (default: service.address)
        #[arg(long)]
        address: Option<String>,

        /// Stage to load when the session starts
        #[arg(long)]
        scene: Option<String>,
    },

    /// Stream directly from a Kit server, without the session backend
    Attach {
        /// Streaming server, e.g. 127.0.0.1:49100
        #[arg(long)]
        server: String,

        /// Stage to open once Kit is responsive
        #[arg(long)]
        scene: Option<String>,
    },

    /// Backend session management
    Sessions {
        /// Session backend base URL (default: service.address)
        #[arg(long)]
        address: Option<String>,

        #[command(subcommand)]
        action: SessionAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// List live sessions
    List,
    /// Show one session and its resolved endpoint
    Info { id: String },
    /// Destroy a session
    Destroy { id: String },
    /// Destroy every listed session
    DestroyAll,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let config = Config::load(&config_path)?;

    init_logging(&config.logging.clone().unwrap_or_default(), cli.verbose);
    tracing::debug!(path = %config_path.display(), "Loaded config");

    match cli.command {
        Commands::Connect { address, scene } => {
            let address = resolve_address(address, &config)?;
            run_connect(&config, address, scene).await?;
        }
        Commands::Attach { server, scene } => {
            run_attach(&config, server, scene).await?;
        }
        Commands::Sessions { address, action } => {
            let address = resolve_address(address, &config)?;
            let client = HttpSessionClient::new(&config.service())?;
            run_sessions(&client, &address, action, &config).await?;
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("{key} is not set"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({})", config_path.display());
            }
        },
    }

    Ok(())
}

fn init_logging(logging: &LoggingConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug"
        } else {
            logging.level.as_deref().unwrap_or("info")
        };
        logging
            .filters
            .iter()
            .filter_map(|directive| directive.parse().ok())
            .fold(EnvFilter::new(level), |filter, directive| {
                filter.add_directive(directive)
            })
    });

    let writer = if logging.output == "stdout" {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn resolve_address(address: Option<String>, config: &Config) -> anyhow::Result<String> {
    address
        .filter(|a| !a.is_empty())
        .or_else(|| config.service_address())
        .ok_or_else(|| anyhow::anyhow!("no session backend address; pass --address or set service.address"))
}

async fn run_connect(config: &Config, address: String, scene: Option<String>) -> anyhow::Result<()> {
    let service = Arc::new(HttpSessionClient::new(&config.service())?);
    let transport = Arc::new(WebSocketTransport::new());
    let (handle, task) = Orchestrator::spawn(config, service, transport);

    if let Some(scene) = scene {
        handle.request_scene(scene)?;
    }
    handle.set_intent(SessionIntent::connected(address.clone()))?;
    println!("Requesting session from {address}. Type 'help' for commands.");

    interact(&handle).await?;

    handle.set_intent(SessionIntent::destroyed(address))?;
    wait_for_teardown(&handle).await;

    handle.shutdown()?;
    task.await?;
    Ok(())
}

async fn run_attach(config: &Config, server: String, scene: Option<String>) -> anyhow::Result<()> {
    let service = Arc::new(HttpSessionClient::new(&config.service())?);
    let transport = Arc::new(WebSocketTransport::new());
    let (handle, task) = Orchestrator::spawn(config, service, transport);

    handle.set_direct_server(Some(server.clone()))?;
    println!("Streaming from {server}. Type 'help' for commands.");

    if let Some(scene) = scene {
        let handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = open_when_responsive(&handle, scene).await {
                tracing::warn!(error = %e, "Could not open stage");
            }
        });
    }

    interact(&handle).await?;

    handle.set_direct_server(None)?;
    handle.shutdown()?;
    task.await?;
    Ok(())
}

async fn open_when_responsive(handle: &OrchestratorHandle, scene: String) -> anyhow::Result<()> {
    loop {
        if handle.snapshot().await?.kit_state == KitState::Responsive {
            return handle.request_scene(scene);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

/// Read commands from stdin until `quit`, end of input or Ctrl-C.
async fn interact(handle: &OrchestratorHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };

        let command = match repl::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e} (try 'help')");
                continue;
            }
        };

        match command {
            ReplCommand::Open(url) => handle.request_scene(url)?,
            ReplCommand::Select(id) => handle.toggle_selection(id)?,
            ReplCommand::Status(id, status) => {
                handle.publish_status(StatusEvent::new(id, status))?
            }
            ReplCommand::Reset => handle.reset_stage()?,
            ReplCommand::State => {
                let snapshot = handle.snapshot().await?;
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
            ReplCommand::Help => println!("{}", repl::HELP),
            ReplCommand::Quit => break,
        }
    }
    Ok(())
}

async fn wait_for_teardown(handle: &OrchestratorHandle) {
    let deadline = tokio::time::Instant::now() + TEARDOWN_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        match handle.snapshot().await {
            Ok(s) if s.phase == LifecyclePhase::Idle && s.session.is_none() => return,
            Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
            Err(_) => return,
        }
    }
    tracing::warn!("Session teardown did not finish in time; the backend may still hold it");
}

async fn run_sessions(
    client: &HttpSessionClient,
    address: &str,
    action: SessionAction,
    config: &Config,
) -> anyhow::Result<()> {
    match action {
        SessionAction::List => {
            let list = client.list_sessions(address).await?;
            if list.items.is_empty() {
                println!("No sessions.");
            }
            for item in &list.items {
                let servers: Vec<&str> = item.routes.keys().map(String::as_str).collect();
                println!("{}  {}", item.id, servers.join(", "));
            }
        }
        SessionAction::Info { id } => {
            let reply = client.session_info(address, &id).await?;
            println!("status: {}", reply.status);
            match (&reply.item, &reply.detail) {
                (Some(item), _) => {
                    let token = config.stream().access_token;
                    match extract_endpoint(item, token.as_deref()) {
                        Ok(endpoint) => println!("endpoint: {}", endpoint.describe()),
                        Err(e) => println!("endpoint: unresolved ({e})"),
                    }
                }
                (None, Some(detail)) => println!("detail: {detail}"),
                (None, None) => {}
            }
        }
        SessionAction::Destroy { id } => {
            let reply = client.destroy_session(address, &id).await?;
            println!("{id}: {}", reply.status);
        }
        SessionAction::DestroyAll => {
            let list = client.list_sessions(address).await?;
            for item in &list.items {
                match client.destroy_session(address, &item.id).await {
                    Ok(reply) => println!("{}: {}", item.id, reply.status),
                    Err(e) => println!("{}: failed ({e})", item.id),
                }
            }
        }
    }
    Ok(())
}
