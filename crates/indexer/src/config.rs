//! Configuration management for the teamsync indexer.
//!
//! Configuration is loaded from a TOML file. Values may reference environment
//! variables with `${VAR_NAME}`; references inside comments are left alone.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the indexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,

    /// Contract addresses
    pub contracts: ContractsConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Sync configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Join request workflow configuration
    #[serde(default)]
    pub workflow: WorkflowConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// HTTP JSON-RPC URL (range queries, receipts, submissions)
    pub rpc_url: String,

    /// WebSocket URL for the live event subscription
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    /// Chain ID (e.g., 11155111 for Sepolia)
    pub chain_id: u64,
}

/// Contract addresses configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractsConfig {
    /// Team factory contract emitting team and member events
    pub team_factory: Address,
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://teamsync.db")
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

/// Sync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Block number to start syncing from (0 = from genesis)
    #[serde(default)]
    pub start_block: u64,

    /// Number of blocks fetched per backfill window
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,

    /// Blocks behind head that backfill stops at
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            batch_size: default_batch_size(),
            confirmations: default_confirmations(),
        }
    }
}

/// Join request workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Gas limit for the addMember transaction
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    /// Cap on max fee per gas in gwei (0 = use the node's estimate as-is)
    #[serde(default)]
    pub max_fee_per_gas_gwei: u64,

    /// Upper bound on waiting for a transaction confirmation
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Blocks on top of the inclusion block before a receipt counts as confirmed
    #[serde(default = "default_tx_confirmations")]
    pub confirmations: u64,

    /// Receipt polling interval
    #[serde(default = "default_poll_interval_millis")]
    pub poll_interval_millis: u64,

    /// How long an approval claim on a request stays valid. Must exceed
    /// `confirmation_timeout_secs`; a crashed approver blocks the request
    /// for at most this long.
    #[serde(default = "default_approval_lease_secs")]
    pub approval_lease_secs: u64,

    /// Signer used by the CLI when approving requests (hex, optional 0x prefix)
    #[serde(default, skip_serializing)]
    pub signer_private_key: Option<String>,
}

impl WorkflowConfig {
    /// Confirmation timeout as a [`Duration`].
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    /// Receipt polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            gas_limit: default_gas_limit(),
            max_fee_per_gas_gwei: 0,
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            confirmations: default_tx_confirmations(),
            poll_interval_millis: default_poll_interval_millis(),
            approval_lease_secs: default_approval_lease_secs(),
            signer_private_key: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_connections() -> u32 {
    1
}

fn default_batch_size() -> u64 {
    1000
}

fn default_confirmations() -> u64 {
    2
}

fn default_gas_limit() -> u64 {
    500_000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

fn default_tx_confirmations() -> u64 {
    1
}

fn default_poll_interval_millis() -> u64 {
    2_000
}

fn default_approval_lease_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Example
    /// ```no_run
    /// # use teamsync_indexer::config::Config;
    /// let config = Config::from_file("teamsync.toml")?;
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let expanded = expand_env_vars(&contents)?;

        let config: Config = toml::from_str(&expanded)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml).context("Failed to parse TOML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.network.rpc_url.is_empty() {
            anyhow::bail!("Network RPC URL cannot be empty");
        }
        if let Some(ws) = &self.network.ws_url {
            if !(ws.starts_with("ws://") || ws.starts_with("wss://")) {
                anyhow::bail!("Network ws_url must start with ws:// or wss:// (got '{}')", ws);
            }
        }
        if self.network.chain_id == 0 {
            anyhow::bail!("Chain ID must be non-zero");
        }

        if self.contracts.team_factory.is_zero() {
            anyhow::bail!("Contracts team_factory must be a non-zero address");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be > 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.sync.batch_size == 0 {
            anyhow::bail!("Sync batch_size must be > 0");
        }

        if self.workflow.gas_limit == 0 {
            anyhow::bail!("Workflow gas_limit must be > 0");
        }
        if self.workflow.confirmation_timeout_secs == 0 {
            anyhow::bail!("Workflow confirmation_timeout_secs must be > 0");
        }
        if self.workflow.poll_interval_millis == 0 {
            anyhow::bail!("Workflow poll_interval_millis must be > 0");
        }
        if self.workflow.approval_lease_secs <= self.workflow.confirmation_timeout_secs {
            anyhow::bail!(
                "Workflow approval_lease_secs ({}) must exceed confirmation_timeout_secs ({})",
                self.workflow.approval_lease_secs,
                self.workflow.confirmation_timeout_secs
            );
        }
        if let Some(key) = &self.workflow.signer_private_key {
            let key = key.trim_start_matches("0x");
            if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
                anyhow::bail!("Workflow signer_private_key must be 64 hex characters");
            }
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            anyhow::bail!(
                "Logging level must be one of: {} (got '{}')",
                valid_levels.join(", "),
                self.logging.level
            );
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            anyhow::bail!(
                "Logging format must be one of: {} (got '{}')",
                valid_formats.join(", "),
                self.logging.format
            );
        }

        Ok(())
    }
}

/// Expand `${VAR_NAME}` placeholders line by line.
///
/// A `#` outside a quoted string starts a comment; placeholders after it are
/// copied verbatim. Unset variables are an error.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());

    for (line_no, line) in input.split_inclusive('\n').enumerate() {
        let mut chars = line.chars().peekable();
        let mut quote: Option<char> = None;
        let mut escaped = false;
        let mut in_comment = false;

        while let Some(ch) = chars.next() {
            if in_comment {
                out.push(ch);
                continue;
            }
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }

            match (ch, quote) {
                ('\\', Some('"')) => {
                    escaped = true;
                    out.push(ch);
                }
                ('"', None) | ('\'', None) => {
                    quote = Some(ch);
                    out.push(ch);
                }
                (c, Some(q)) if c == q => {
                    quote = None;
                    out.push(ch);
                }
                ('#', None) => {
                    in_comment = true;
                    out.push(ch);
                }
                ('$', _) if chars.peek() == Some(&'{') => {
                    chars.next();
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        anyhow::bail!(
                            "Unclosed environment variable placeholder on line {}",
                            line_no + 1
                        );
                    }
                    if name.is_empty() {
                        anyhow::bail!("Empty environment variable name on line {}", line_no + 1);
                    }
                    let value = std::env::var(&name).with_context(|| {
                        format!(
                            "Environment variable '{}' is not set (referenced on line {})",
                            name,
                            line_no + 1
                        )
                    })?;
                    out.push_str(&value);
                }
                _ => out.push(ch),
            }
        }
    }

    Ok(out)
}
