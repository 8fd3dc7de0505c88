//! trikey daemon: headless watcher for funds stranded on retired keysets.
//!
//! # Usage
//!
//! ```bash
//! TRIKEY_PASSPHRASE=... trikey-daemon --config /path/to/trikey.toml
//! trikey-daemon --check      # Run one scan and exit
//! trikey-daemon --validate   # Validate config and exit
//! ```

mod config;
mod daemon;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/trikey.toml");
    let mut one_shot = false;
    let mut validate_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                match args.get(i) {
                    Some(path) => config_path = PathBuf::from(path),
                    None => anyhow::bail!("--config requires a path argument"),
                }
            }
            "--check" | "--once" => one_shot = true,
            "--validate" => validate_only = true,
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("trikey-daemon {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => anyhow::bail!("Unknown argument: {}", other),
        }
        i += 1;
    }

    let mut config = config::DaemonConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    config.apply_env_overrides();
    config
        .validate()
        .context("Configuration validation failed")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.server.log_level.as_str()),
    )
    .init();

    if validate_only {
        println!("Configuration is valid.");
        println!("  Network:        {}", config.network());
        println!("  Electrum:       {}", config.electrum_url());
        println!("  Account:        {}", config.account.account_id);
        println!("  Gap limit:      {}", config.bitcoin.gap_limit);
        println!("  Check interval: {} secs", config.server.check_interval_secs);
        println!("  Database:       {}", config.database_path().display());
        return Ok(());
    }

    let passphrase = config::store_passphrase()?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    if one_shot {
        log::info!("Running a single scan");
        rt.block_on(daemon::run_check_cycle(&config, &passphrase))?;
    } else {
        let result = rt.block_on(async {
            tokio::select! {
                result = daemon::run(config, passphrase) => result,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received shutdown signal. Exiting.");
                    Ok(())
                }
            }
        });

        if let Err(e) = result {
            log::error!("Daemon error: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_help() {
    println!(
        r#"trikey daemon: watches retired keysets for sweepable funds

USAGE:
    trikey-daemon [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/trikey.toml)
    --check, --once       Run a single scan and exit
    --validate            Validate config file and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    TRIKEY_PASSPHRASE       Keybox store passphrase (required, never read from file)
    TRIKEY_DATA_DIR         Data directory path
    TRIKEY_CHECK_INTERVAL   Scan interval in seconds
    TRIKEY_LOG_LEVEL        Log level (error/warn/info/debug/trace)
    TRIKEY_NETWORK          Bitcoin network (bitcoin/testnet/signet/regtest)
    TRIKEY_ELECTRUM_URL     Electrum server URL
    TRIKEY_ACCOUNT_ID       Account id the stored keybox must belong to
"#
    );
}
