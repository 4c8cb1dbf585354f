//! Command-line configuration surface.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{MinerError, Result};

#[derive(Parser, Debug, Clone)]
#[command(name = "salvium-miner", about = "RandomX CPU miner for pool mining")]
pub struct Args {
    /// Wallet address to mine to (used as the pool login).
    #[arg(long)]
    pub wallet: String,

    /// Pool address, host:port.
    #[arg(long, default_value = "pool.supportxmr.com:3333")]
    pub pool: String,

    /// Worker/rig identifier reported to the pool.
    #[arg(long, default_value = "default")]
    pub worker: String,

    /// Pool password (most pools ignore this; some use it for fixed-diff).
    #[arg(long, default_value = "x")]
    pub password: String,

    /// Number of mining threads. Defaults to the number of logical CPUs.
    #[arg(long)]
    pub threads: Option<usize>,

    /// User-agent string sent at login.
    #[arg(long, default_value = "salvium-miner/1.0.7-r001")]
    pub user_agent: String,

    /// Use per-thread light-mode caches (256MB each) instead of one shared
    /// ~2GiB dataset. Slower per-hash, lower memory.
    #[arg(long)]
    pub light_mode: bool,

    /// Attempt to use large/huge pages for the RandomX dataset and caches.
    #[arg(long)]
    pub large_pages: bool,

    /// Path to persist the built dataset across restarts. Omit to disable
    /// persistence.
    #[arg(long)]
    pub dataset_path: Option<PathBuf>,

    /// Enable debug logging (equivalent to RUST_LOG=debug).
    #[arg(long)]
    pub debug: bool,

    /// Write logs to this file in addition to stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Args {
    pub fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wallet.trim().is_empty() {
            return Err(MinerError::ConfigInvalid("--wallet must not be empty".into()));
        }
        if !self.pool.contains(':') {
            return Err(MinerError::ConfigInvalid(
                "--pool must be host:port".into(),
            ));
        }
        if let Some(threads) = self.threads {
            if threads == 0 {
                return Err(MinerError::ConfigInvalid("--threads must be at least 1".into()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            wallet: "4Abc...".to_string(),
            pool: "pool.example.com:3333".to_string(),
            worker: "default".to_string(),
            password: "x".to_string(),
            threads: None,
            user_agent: "test/1".to_string(),
            light_mode: false,
            large_pages: false,
            dataset_path: None,
            debug: false,
            log_file: None,
        }
    }

    #[test]
    fn valid_args_pass() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn empty_wallet_is_invalid() {
        let mut args = base_args();
        args.wallet = "  ".into();
        assert!(args.validate().is_err());
    }

    #[test]
    fn pool_without_port_is_invalid() {
        let mut args = base_args();
        args.pool = "pool.example.com".into();
        assert!(args.validate().is_err());
    }

    #[test]
    fn zero_threads_is_invalid() {
        let mut args = base_args();
        args.threads = Some(0);
        assert!(args.validate().is_err());
    }
}
