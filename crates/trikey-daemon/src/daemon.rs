//! The daemon loop: periodically looks for funds left on inactive keysets.
//!
//! Scans are dry runs. Sweeps are built to price them but never signed or
//! broadcast; that needs the owner's hardware or app.

use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use trikey_electrum::ElectrumClient;
use trikey_keybox::{Keybox, KeyboxStore};
use trikey_recovery::{SweepGeneration, SweepGenerator};
use trikey_wallet::DescriptorEngine;

pub async fn run(config: DaemonConfig, passphrase: String) -> Result<()> {
    log::info!("trikey daemon starting");
    log::info!("  Network:    {}", config.network());
    log::info!("  Electrum:   {}", config.electrum_url());
    log::info!("  Account:    {}", config.account.account_id);
    log::info!("  Interval:   {} seconds", config.server.check_interval_secs);
    log::info!("  Data dir:   {}", config.server.data_dir.display());

    let store = Arc::new(open_store(&config, &passphrase)?);
    let interval = Duration::from_secs(config.server.check_interval_secs);

    let mut first = true;
    loop {
        if !first {
            log::debug!("Sleeping {} seconds until next scan", interval.as_secs());
            tokio::time::sleep(interval).await;
        }
        first = false;

        match check_cycle(&config, store.clone()).await {
            Ok(()) => log::info!("Scan completed."),
            Err(e) => log::error!("Scan failed: {:#}", e),
        }
    }
}

/// One scan, opening the store itself.
pub async fn run_check_cycle(config: &DaemonConfig, passphrase: &str) -> Result<()> {
    let store = Arc::new(open_store(config, passphrase)?);
    check_cycle(config, store).await
}

fn open_store(config: &DaemonConfig, passphrase: &str) -> Result<KeyboxStore> {
    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data dir: {}",
            config.server.data_dir.display()
        )
    })?;
    let path = config.database_path();
    KeyboxStore::open(&path, passphrase)
        .with_context(|| format!("Failed to open keybox store at {}", path.display()))
}

async fn check_cycle(config: &DaemonConfig, store: Arc<KeyboxStore>) -> Result<()> {
    let keybox = match store.load_keybox().context("Failed to load keybox")? {
        Some(keybox) => keybox,
        None => {
            log::warn!("No keybox stored yet; nothing to scan.");
            return Ok(());
        }
    };
    anyhow::ensure!(
        keybox.account_id() == config.account.account_id,
        "stored keybox belongs to account {}, configured account is {}",
        keybox.account_id(),
        config.account.account_id
    );
    anyhow::ensure!(
        keybox.network() == config.network(),
        "stored keybox is on {}, configured network is {}",
        keybox.network(),
        config.network()
    );

    let url = config.electrum_url();
    let client = ElectrumClient::new(&url, config.network())
        .with_context(|| format!("Failed to connect to Electrum at {}", url))?;
    let engine = Arc::new(DescriptorEngine::with_gap_limit(
        Arc::new(client),
        config.network(),
        config.bitcoin.gap_limit,
    ));

    scan(&keybox, &SweepGenerator::new(engine, store)).await?;
    Ok(())
}

/// Build (but do not send) the sweep for `keybox` and log what it would move.
pub async fn scan(keybox: &Keybox, generator: &SweepGenerator) -> Result<SweepGeneration> {
    log::info!(
        "Scanning {} inactive keyset(s) of account {}",
        keybox.inactive().len(),
        keybox.account_id()
    );

    let generation = generator
        .generate(keybox)
        .await
        .context("Sweep generation failed")?;

    match &generation {
        SweepGeneration::NoFundsFound => log::info!("No sweepable funds on inactive keysets."),
        SweepGeneration::Generated(sweep) => {
            for p in &sweep.psbts {
                log::warn!(
                    "Keyset {} holds {} sat sweepable (signer: {:?})",
                    p.source_keyset.local_id(),
                    p.psbt.output_total().to_sat(),
                    p.signing_factor
                );
            }
            log::warn!(
                "Sweep to {} would move {} sat for {} sat in fees; open the app to complete it",
                sweep.destination,
                sweep.total_transfer_amount.to_sat(),
                sweep.total_fee.to_sat()
            );
        }
    }
    Ok(generation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Network;
    use trikey_keybox::descriptor::Keychain;
    use trikey_keybox::test_utils::keybox;
    use trikey_keybox::{MemoryAppKeyStore, WatchingDescriptor};
    use trikey_wallet::test_utils::{fund, MemoryChain};

    fn generator(chain: Arc<MemoryChain>) -> SweepGenerator {
        let engine = Arc::new(DescriptorEngine::with_gap_limit(chain, Network::Testnet, 5));
        SweepGenerator::new(engine, Arc::new(MemoryAppKeyStore::new()))
    }

    #[tokio::test]
    async fn test_scan_reports_without_broadcasting() {
        let chain = Arc::new(MemoryChain::new(500));
        let kb = keybox(1, &[2]);
        let wallet = WatchingDescriptor::for_keyset(&kb.inactive()[0]).unwrap();
        fund(&chain, &wallet, Keychain::Receiving, 0, 25_000);

        let generation = scan(&kb, &generator(chain.clone())).await.unwrap();
        match generation {
            SweepGeneration::Generated(sweep) => {
                assert_eq!(sweep.psbts.len(), 1);
                assert!(sweep.needs_hardware_signing());
            }
            other => panic!("expected a sweep, got {:?}", other),
        }
        assert!(chain.broadcasts().is_empty());
    }

    #[tokio::test]
    async fn test_scan_empty_keysets() {
        let chain = Arc::new(MemoryChain::new(500));
        let generation = scan(&keybox(1, &[2, 3]), &generator(chain)).await.unwrap();
        assert_eq!(generation, SweepGeneration::NoFundsFound);
    }

    #[tokio::test]
    async fn test_scan_offline_fails() {
        let chain = Arc::new(MemoryChain::new(500));
        chain.set_offline(true);
        assert!(scan(&keybox(1, &[2]), &generator(chain)).await.is_err());
    }
}
