//! Daemon configuration, read from TOML with `TRIKEY_*` environment overrides.
//!
//! Priority: environment variables > config file > defaults. The store
//! passphrase is never read from the file.

use anyhow::{Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const PASSPHRASE_VAR: &str = "TRIKEY_PASSPHRASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub bitcoin: BitcoinSection,

    pub account: AccountSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Holds the keybox database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// error, warn, info, debug or trace
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            check_interval_secs: default_check_interval(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// "bitcoin", "testnet", "signet" or "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Falls back to a public server for the network
    #[serde(default)]
    pub electrum_url: Option<String>,

    #[serde(default = "default_gap_limit")]
    pub gap_limit: u32,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            electrum_url: None,
            gap_limit: default_gap_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSection {
    pub account_id: String,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_check_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "bitcoin".to_string()
}

fn default_gap_limit() -> u32 {
    trikey_wallet::engine::DEFAULT_GAP_LIMIT
}

fn parse_network(name: &str) -> Option<Network> {
    match name {
        "bitcoin" | "mainnet" => Some(Network::Bitcoin),
        "testnet" | "testnet3" => Some(Network::Testnet),
        "signet" => Some(Network::Signet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents).context("Failed to parse TOML config")
    }

    /// Apply `TRIKEY_DATA_DIR`, `TRIKEY_CHECK_INTERVAL`, `TRIKEY_LOG_LEVEL`,
    /// `TRIKEY_NETWORK`, `TRIKEY_ELECTRUM_URL` and `TRIKEY_ACCOUNT_ID`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRIKEY_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TRIKEY_CHECK_INTERVAL") {
            match v.parse::<u64>() {
                Ok(secs) => self.server.check_interval_secs = secs,
                Err(_) => log::warn!("Ignoring invalid TRIKEY_CHECK_INTERVAL={}", v),
            }
        }
        if let Ok(v) = std::env::var("TRIKEY_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("TRIKEY_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("TRIKEY_ELECTRUM_URL") {
            self.bitcoin.electrum_url = Some(v);
        }
        if let Ok(v) = std::env::var("TRIKEY_ACCOUNT_ID") {
            self.account.account_id = v;
        }
    }

    /// Only valid after [`DaemonConfig::validate`].
    pub fn network(&self) -> Network {
        parse_network(&self.bitcoin.network).unwrap_or(Network::Bitcoin)
    }

    pub fn electrum_url(&self) -> String {
        match &self.bitcoin.electrum_url {
            Some(url) => url.clone(),
            None => trikey_electrum::default_server(self.network()).to_string(),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("trikey.db")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.account.account_id.is_empty(),
            "account.account_id must not be empty"
        );
        anyhow::ensure!(
            self.server.check_interval_secs >= 60,
            "server.check_interval_secs must be >= 60"
        );
        anyhow::ensure!(self.bitcoin.gap_limit > 0, "bitcoin.gap_limit must be > 0");
        anyhow::ensure!(
            parse_network(&self.bitcoin.network).is_some(),
            "bitcoin.network must be one of bitcoin, testnet, signet, regtest (got {:?})",
            self.bitcoin.network
        );
        Ok(())
    }
}

/// The keybox store passphrase, from the environment only.
pub fn store_passphrase() -> Result<String> {
    std::env::var(PASSPHRASE_VAR).with_context(|| format!("{} must be set", PASSPHRASE_VAR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load(toml: &str) -> DaemonConfig {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        DaemonConfig::from_file(file.path()).unwrap()
    }

    const MINIMAL: &str = r#"
[account]
account_id = "acct-123"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = load(MINIMAL);
        assert_eq!(config.account.account_id, "acct-123");
        assert_eq!(config.server.check_interval_secs, 3600);
        assert_eq!(config.bitcoin.gap_limit, 20);
        assert_eq!(config.network(), Network::Bitcoin);
        assert_eq!(
            config.electrum_url(),
            trikey_electrum::default_server(Network::Bitcoin)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config = load(
            r#"
[server]
data_dir = "/var/lib/trikey"
check_interval_secs = 600
log_level = "debug"

[bitcoin]
network = "signet"
electrum_url = "tcp://localhost:50001"
gap_limit = 50

[account]
account_id = "acct-9"
"#,
        );
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/trikey/trikey.db"));
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.network(), Network::Signet);
        assert_eq!(config.electrum_url(), "tcp://localhost:50001");
        assert_eq!(config.bitcoin.gap_limit, 50);
    }

    #[test]
    fn test_missing_account_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[server]\nlog_level = \"warn\"\n").unwrap();
        assert!(DaemonConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_validation_failures() {
        let mut config = load(MINIMAL);
        config.account.account_id.clear();
        assert!(config.validate().is_err());

        let mut config = load(MINIMAL);
        config.server.check_interval_secs = 30;
        assert!(config.validate().is_err());

        let mut config = load(MINIMAL);
        config.bitcoin.gap_limit = 0;
        assert!(config.validate().is_err());

        let mut config = load(MINIMAL);
        config.bitcoin.network = "litecoin".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = load(MINIMAL);

        std::env::set_var("TRIKEY_DATA_DIR", "/env/data");
        std::env::set_var("TRIKEY_NETWORK", "testnet");
        std::env::set_var("TRIKEY_ACCOUNT_ID", "acct-env");
        config.apply_env_overrides();
        std::env::remove_var("TRIKEY_DATA_DIR");
        std::env::remove_var("TRIKEY_NETWORK");
        std::env::remove_var("TRIKEY_ACCOUNT_ID");

        assert_eq!(config.server.data_dir, PathBuf::from("/env/data"));
        assert_eq!(config.network(), Network::Testnet);
        assert_eq!(config.account.account_id, "acct-env");
    }

    #[test]
    fn test_passphrase_not_serialized() {
        let config = load(MINIMAL);
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(!text.contains("passphrase"));
        let reparsed: DaemonConfig = toml::from_str(&text).unwrap();
        assert_eq!(reparsed.account.account_id, config.account.account_id);
    }
}
