//! Team Sync Indexer - team factory mirror and join request workflow
//!
//! This binary provides:
//! - Event sync from the team factory contract (backfill + live subscription)
//! - Team and member mirroring into SQLite
//! - Join request administration (create, approve, reject)
//!
//! Note: there is no HTTP API; read queries are exposed by the library.

use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use teamsync_indexer::chain::{ChainClient, RpcChainClient};
use teamsync_indexer::config::{Config, LoggingConfig};
use teamsync_indexer::listener::{EventSynchronizer, SyncEngine};
use teamsync_indexer::storage::{RequestFilter, Storage};
use teamsync_indexer::workflow::JoinRequestService;
use teamsync_indexer::{normalize_address, RequestStatus, RoleCode, TeamId};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "teamsync-indexer")]
#[command(version, about = "Team factory mirror and join request workflow", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "teamsync.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Catch up, then follow live events until the subscription drops
    Run,

    /// Mirror an explicit block range
    Backfill {
        /// First block (default: one past the stored cursor)
        #[arg(long)]
        from: Option<u64>,

        /// Last block (default: head minus confirmations)
        #[arg(long)]
        to: Option<u64>,
    },

    /// Show sync progress and mirrored state
    Status,

    /// Initialize the database
    InitDb {
        /// Database URL
        #[arg(long, default_value = "sqlite://teamsync.db")]
        database_url: String,
    },

    /// Show a team and its members as JSON
    Team {
        /// Team id
        id: TeamId,
    },

    /// Join request administration
    #[command(subcommand)]
    Request(RequestCommands),
}

#[derive(Subcommand)]
enum RequestCommands {
    /// File a join request
    Create {
        /// Applicant address
        applicant: String,
        /// Target team id
        team_id: TeamId,
        /// Display name
        name: String,
        /// Role code
        #[arg(long, default_value_t = 1)]
        role: RoleCode,
    },

    /// Approve a request (sends addMember)
    Approve {
        /// Request id
        id: i64,
    },

    /// Reject a request
    Reject {
        /// Request id
        id: i64,
    },

    /// List requests as JSON
    List {
        /// Only this team
        #[arg(long)]
        team_id: Option<TeamId>,
        /// Only this applicant
        #[arg(long)]
        applicant: Option<String>,
        /// Only this status (pending, approved, rejected)
        #[arg(long)]
        status: Option<RequestStatus>,
        /// Maximum rows
        #[arg(long)]
        limit: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable.
    let logging = Config::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.debug, &logging)?;

    info!("Team Sync Indexer starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_indexer(&cli.config).await?,
        Commands::Backfill { from, to } => backfill(&cli.config, from, to).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
        Commands::Team { id } => show_team(&cli.config, id).await?,
        Commands::Request(command) => handle_request_command(&cli.config, command).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool, logging: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("teamsync_indexer=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("teamsync_indexer={}", logging.level))
        })
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if logging.format == "json" {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .init();
    }

    Ok(())
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let storage = Storage::from_config(&config.database)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let sync_state = storage
        .initialize_sync_state(config.network.chain_id, config.sync.start_block)
        .await
        .context("Failed to initialize sync state")?;
    info!(
        "Sync state: chain_id={} last_block={}",
        sync_state.chain_id, sync_state.last_block_number
    );

    Ok(storage)
}

async fn connect_chain(config: &Config, with_ws: bool) -> Result<Arc<dyn ChainClient>> {
    let ws_url = if with_ws {
        Some(
            config
                .network
                .ws_url
                .as_deref()
                .context("network.ws_url is required for live sync")?,
        )
    } else {
        None
    };

    let client = RpcChainClient::new(
        &config.network.rpc_url,
        ws_url,
        config.contracts.team_factory,
        config.workflow.confirmations,
        config.workflow.poll_interval(),
    )
    .await
    .context("Failed to create chain client")?;

    info!("Chain client initialized");
    Ok(Arc::new(client))
}

/// Main service - backfill then follow the live subscription
async fn run_indexer(config_path: &str) -> Result<()> {
    info!("Starting indexer service with config: {}", config_path);

    let config = Config::from_file(config_path).context("Failed to load configuration")?;

    info!("Configuration loaded successfully");
    info!("  Chain ID: {}", config.network.chain_id);
    info!("  RPC URL: {}", config.network.rpc_url);
    info!("  Team factory: {}", config.contracts.team_factory);
    info!("  Database: {}", config.database.url);
    info!("  Start block: {}", config.sync.start_block);

    let storage = open_storage(&config).await?;
    let client = connect_chain(&config, true).await?;

    let synchronizer = EventSynchronizer::new(storage.clone());
    let metrics = synchronizer.metrics();
    let sync_engine = SyncEngine::new(client, synchronizer, config.sync.clone());

    let sync_handle = tokio::spawn(async move { sync_engine.run().await });

    info!("Indexer is running. Press Ctrl+C to stop.");

    let result = tokio::select! {
        result = sync_handle => {
            match result {
                Ok(Ok(())) => {
                    warn!("Sync engine exited unexpectedly");
                    Ok(())
                }
                Ok(Err(e)) => Err(e).context("Sync engine failed"),
                Err(e) => Err(anyhow::anyhow!("Sync task panicked: {}", e)),
            }
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl+C")?;
            info!("Received shutdown signal, gracefully shutting down...");
            Ok(())
        }
    };

    let snapshot = metrics.snapshot();
    info!(
        "Events applied={} duplicates={} missing={} anomalies={}",
        snapshot.applied,
        snapshot.duplicates,
        snapshot.missing,
        snapshot.anomalies()
    );

    storage.close().await;
    result
}

/// Backfill a block range
async fn backfill(config_path: &str, from: Option<u64>, to: Option<u64>) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;
    let client = connect_chain(&config, false).await?;

    let from = match from {
        Some(from) => from,
        None => storage.get_sync_state().await?.last_block_number + 1,
    };
    let to = match to {
        Some(to) => to,
        None => client
            .latest_block()
            .await?
            .saturating_sub(config.sync.confirmations),
    };

    info!("Backfilling blocks {} to {}", from, to);

    let engine = SyncEngine::new(
        client,
        EventSynchronizer::new(storage.clone()),
        config.sync.clone(),
    );
    let tally = engine.backfill(from, to).await?;

    println!(
        "Backfilled blocks {}..={}: {} applied, {} duplicate, {} dropped, {} missing",
        from, to, tally.applied, tally.duplicates, tally.dropped, tally.missing
    );

    storage.close().await;
    Ok(())
}

/// Show sync progress and mirrored state
async fn show_status(config_path: &str) -> Result<()> {
    info!("Checking indexer status");

    // Fall back to the default database only if the config file doesn't exist
    let storage = match Config::from_file(config_path) {
        Ok(config) => {
            info!("Using database from config: {}", config.database.url);
            Storage::from_config(&config.database).await
        }
        Err(e) => {
            let is_not_found = e.chain().any(|cause| {
                cause
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
            });

            if !is_not_found {
                return Err(e).context("Failed to load config file");
            }
            info!("Config file not found, using default database: sqlite://teamsync.db");
            Storage::new("sqlite://teamsync.db").await
        }
    }
    .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    let sync_state = storage.get_sync_state().await?;
    let stats = storage.stats().await?;
    let pending = storage
        .count_join_requests(&RequestFilter {
            status: Some(RequestStatus::Pending),
            ..Default::default()
        })
        .await?;

    println!("\n=== Team Sync Indexer Status ===\n");
    println!("Sync Progress:");
    println!("  Chain ID: {}", sync_state.chain_id);
    println!("  Last Block: {}", sync_state.last_block_number);
    println!(
        "  Last Updated: {}",
        chrono::DateTime::from_timestamp(sync_state.updated_at, 0)
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    );

    println!("\nDatabase Statistics:");
    println!("  Teams: {}", stats.team_count);
    println!("  Members: {}", stats.member_count);
    println!("  Join Requests: {} ({} pending)", stats.join_request_count, pending);
    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the database
async fn init_database(database_url: &str) -> Result<()> {
    info!("Initializing database: {}", database_url);

    let storage = Storage::new(database_url)
        .await
        .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    let stats = storage.stats().await?;
    info!("Database initialized successfully!");
    info!("  Teams: {}", stats.team_count);
    info!("  Members: {}", stats.member_count);
    info!("  Join requests: {}", stats.join_request_count);
    info!("  Last block: {}", stats.last_block_number);

    storage.close().await;

    Ok(())
}

/// Print a team with its members
async fn show_team(config_path: &str, team_id: TeamId) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;

    match storage.get_team_with_members(team_id).await? {
        Some(team) => println!("{}", serde_json::to_string_pretty(&team)?),
        None => println!("Team {} not found", team_id),
    }

    storage.close().await;
    Ok(())
}

async fn handle_request_command(config_path: &str, command: RequestCommands) -> Result<()> {
    let config = Config::from_file(config_path).context("Failed to load configuration")?;
    let storage = open_storage(&config).await?;
    let client = connect_chain(&config, false).await?;
    let service = JoinRequestService::new(storage.clone(), client, config.workflow.clone());

    let result = match command {
        RequestCommands::Create {
            applicant,
            team_id,
            name,
            role,
        } => {
            let request = service
                .create_join_request(&applicant, team_id, &name, role)
                .await?;
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        RequestCommands::Approve { id } => {
            let signer = load_signer(&config)?;
            let request = service.handle_request(id, true, &signer).await;
            report_decision(request)
        }
        RequestCommands::Reject { id } => report_decision(service.reject_request(id).await),
        RequestCommands::List {
            team_id,
            applicant,
            status,
            limit,
        } => {
            let applicant = applicant.as_deref().map(normalize_address).transpose()?;
            let requests = service
                .list_requests(&RequestFilter {
                    team_id,
                    applicant,
                    status,
                    limit,
                    offset: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&requests)?);
            Ok(())
        }
    };

    storage.close().await;
    result
}

fn report_decision(
    result: std::result::Result<
        teamsync_indexer::storage::JoinRequestRecord,
        teamsync_indexer::WorkflowError,
    >,
) -> Result<()> {
    match result {
        Ok(request) => {
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        Err(e) if e.is_retryable() => {
            warn!("Request left PENDING, retry later: {}", e);
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn load_signer(config: &Config) -> Result<PrivateKeySigner> {
    config
        .workflow
        .signer_private_key
        .as_deref()
        .context("workflow.signer_private_key is required to approve requests")?
        .trim_start_matches("0x")
        .parse::<PrivateKeySigner>()
        .context("Failed to parse signer private key")
}
