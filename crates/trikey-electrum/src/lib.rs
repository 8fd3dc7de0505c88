//! Trikey Electrum Client
//!
//! [`ChainSource`] over the Electrum protocol, used by the descriptor engine
//! for wallet sync, transaction lookup and broadcast.
//!
//! # Security
//!
//! - Use SSL/TLS connections (ssl://) outside regtest
//! - Only public data (scripts, transactions) goes over the wire
//!
//! # Example
//!
//! ```ignore
//! use trikey_electrum::{default_server, ElectrumClient};
//! use trikey_wallet::DescriptorEngine;
//! use bitcoin::Network;
//! use std::sync::Arc;
//!
//! let client = ElectrumClient::new(default_server(Network::Testnet), Network::Testnet)?;
//! let engine = DescriptorEngine::new(Arc::new(client), Network::Testnet);
//! ```

use bitcoin::{Amount, Network, OutPoint, Script, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};
use trikey_wallet::{ChainError, ChainSource, ChainUtxo, HistoryEntry};

// Re-export the raw client for direct usage
pub use electrum_client::Client as RawClient;

/// Split Electrum failures into connectivity (retryable) and everything else.
fn classify(e: ElectrumError) -> ChainError {
    match e {
        ElectrumError::IOError(_)
        | ElectrumError::SharedIOError(_)
        | ElectrumError::AllAttemptsErrored(_) => ChainError::Connection(e.to_string()),
        other => ChainError::Protocol(other.to_string()),
    }
}

/// Electrum `height` for history: <= 0 means mempool
fn history_height(height: i32) -> Option<u32> {
    (height > 0).then_some(height as u32)
}

/// Electrum `height` for unspent outputs: 0 means unconfirmed
fn utxo_height(height: usize) -> Option<u32> {
    (height > 0).then_some(height as u32)
}

pub struct ElectrumClient {
    client: electrum_client::Client,
    network: Network,
}

impl ElectrumClient {
    /// Connect to `url` (e.g. "ssl://electrum.blockstream.info:60002").
    pub fn new(url: &str, network: Network) -> Result<Self, ChainError> {
        if !url.starts_with("ssl://") && network == Network::Bitcoin {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ElectrumError| ChainError::Connection(e.to_string()))?;
        log::info!("Connected to Electrum server {}", url);

        Ok(Self { client, network })
    }

    pub fn network(&self) -> Network {
        self.network
    }
}

impl ChainSource for ElectrumClient {
    fn tip_height(&self) -> Result<u32, ChainError> {
        let header = self.client.block_headers_subscribe().map_err(classify)?;
        Ok(header.height as u32)
    }

    fn script_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, ChainError> {
        let history = self.client.script_get_history(script).map_err(classify)?;
        Ok(history
            .into_iter()
            .map(|h| HistoryEntry {
                txid: h.tx_hash,
                height: history_height(h.height),
            })
            .collect())
    }

    fn script_utxos(&self, script: &Script) -> Result<Vec<ChainUtxo>, ChainError> {
        let unspent = self.client.script_list_unspent(script).map_err(classify)?;
        Ok(unspent
            .into_iter()
            .map(|u| ChainUtxo {
                outpoint: OutPoint {
                    txid: u.tx_hash,
                    vout: u.tx_pos as u32,
                },
                value: Amount::from_sat(u.value),
                height: utxo_height(u.height),
            })
            .collect())
    }

    fn transaction(&self, txid: &Txid) -> Result<Transaction, ChainError> {
        self.client.transaction_get(txid).map_err(|e| match classify(e) {
            ChainError::Protocol(_) => ChainError::TxNotFound(*txid),
            other => other,
        })
    }

    fn broadcast(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        self.client
            .transaction_broadcast(tx)
            .map_err(|e| match classify(e) {
                ChainError::Protocol(msg) => ChainError::BroadcastFailed(msg),
                other => other,
            })
    }
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://electrum.blockstream.info:60004",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://electrum.blockstream.info:60002",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_servers() {
        assert!(default_server(Network::Bitcoin).contains("60002"));
        assert!(default_server(Network::Testnet).contains("60004"));
        assert!(default_server(Network::Regtest).starts_with("tcp://"));
    }

    #[test]
    fn test_height_conventions() {
        assert_eq!(history_height(0), None);
        assert_eq!(history_height(-1), None);
        assert_eq!(history_height(800_000), Some(800_000));
        assert_eq!(utxo_height(0), None);
        assert_eq!(utxo_height(12), Some(12));
    }

    #[test]
    fn test_io_errors_are_connectivity() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(classify(ElectrumError::IOError(io)).is_connectivity());
    }

    // Run with: cargo test --package trikey-electrum -- --ignored

    #[test]
    #[ignore = "requires network access"]
    fn test_tip_height_testnet() {
        let client =
            ElectrumClient::new(default_server(Network::Testnet), Network::Testnet).unwrap();
        assert!(client.tip_height().unwrap() > 0);
    }

    #[test]
    #[ignore = "requires network access"]
    fn test_unknown_transaction_testnet() {
        use bitcoin::hashes::Hash;

        let client =
            ElectrumClient::new(default_server(Network::Testnet), Network::Testnet).unwrap();
        let missing = Txid::from_byte_array([0x42; 32]);
        assert!(matches!(
            client.transaction(&missing),
            Err(ChainError::TxNotFound(t)) if t == missing
        ));
    }
}
