//! # CLI Interface
//!
//! Defines the command-line argument structure for `walletd-node` using
//! `clap` derive. Every tunable can also come from a `WALLETD_*`
//! environment variable.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use walletd_engine::config::{
    EngineConfig, DEFAULT_REORG_WARNING_DEPTH, DEFAULT_REWARD_SPEND_MIN_BLOCKS,
    DEFAULT_TX_CACHE_CAPACITY,
};

/// walletd ledger daemon.
///
/// Keeps wallet balances consistent with the chain: unlocks expired
/// timelocks, validates aggregates against transaction history and exposes
/// Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "walletd-node",
    about = "walletd balance and reorg engine daemon",
    version,
    propagate_version = true
)]
pub struct WalletdCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon: periodic unlocks plus the metrics endpoint.
    Run(RunArgs),
    /// Unlock every expired timelock once and exit.
    Unlock(UnlockArgs),
    /// Check address aggregates against their transaction history.
    Validate(ValidateArgs),
    /// Attach addresses to a wallet.
    Register(RegisterArgs),
    /// Print store statistics as JSON.
    Status(StoreArgs),
    /// Print version information and exit.
    Version,
}

/// Options shared by every command that opens the store.
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// Directory holding the ledger database.
    #[arg(long, short = 'd', env = "WALLETD_DATA_DIR", default_value = "./walletd-data")]
    pub data_dir: PathBuf,

    /// Emit JSON log lines instead of human-readable output.
    #[arg(long, env = "WALLETD_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Engine tunables.
#[derive(Args, Debug, Clone)]
pub struct EngineArgs {
    /// Reorgs deeper than this many blocks raise an alert.
    #[arg(long, env = "WALLETD_REORG_WARNING_DEPTH", default_value_t = DEFAULT_REORG_WARNING_DEPTH)]
    pub reorg_warning_depth: u32,

    /// Blocks a block reward stays locked.
    #[arg(long, env = "WALLETD_REWARD_SPEND_MIN_BLOCKS", default_value_t = DEFAULT_REWARD_SPEND_MIN_BLOCKS)]
    pub reward_spend_min_blocks: u32,

    /// Recently accepted transactions remembered for replay detection.
    #[arg(long, env = "WALLETD_TX_CACHE_CAPACITY", default_value_t = DEFAULT_TX_CACHE_CAPACITY)]
    pub tx_cache_capacity: usize,
}

impl EngineArgs {
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig {
            reorg_warning_depth: self.reorg_warning_depth,
            reward_spend_min_blocks: self.reward_spend_min_blocks,
            tx_cache_capacity: self.tx_cache_capacity,
        }
    }
}

/// Arguments for the `run` subcommand.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    #[command(flatten)]
    pub engine: EngineArgs,

    /// Seconds between timelock unlock passes.
    #[arg(long, env = "WALLETD_UNLOCK_INTERVAL_SECS", default_value_t = 60)]
    pub unlock_interval_secs: u64,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "WALLETD_METRICS_PORT", default_value_t = 9752)]
    pub metrics_port: u16,
}

/// Arguments for the `unlock` subcommand.
#[derive(Args, Debug)]
pub struct UnlockArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Unix timestamp to unlock at. Defaults to the current time.
    #[arg(long)]
    pub now: Option<u64>,
}

/// Arguments for the `validate` subcommand.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Addresses to check.
    #[arg(required = true)]
    pub addresses: Vec<String>,
}

/// Arguments for the `register` subcommand.
#[derive(Args, Debug)]
pub struct RegisterArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Wallet the addresses belong to.
    #[arg(long, short = 'w')]
    pub wallet: String,

    /// Addresses to attach.
    #[arg(required = true)]
    pub addresses: Vec<String>,
}
