//! Shared fixtures for the recovery integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bitcoin::Network;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use trikey_keybox::descriptor::Keychain;
use trikey_keybox::test_utils::server_private;
use trikey_keybox::{Keybox, MemoryAppKeyStore, SpendingKeyset, WatchingDescriptor};
use trikey_recovery::f8e::LostFactor;
use trikey_recovery::{
    F8eClient, F8eError, InitiateRecoveryError, InitiateRecoveryRequest, PendingDelayNotify,
    SweepGenerator,
};
use trikey_wallet::test_utils::{fund, MemoryChain};
use trikey_wallet::{DescriptorEngine, Psbt};

/// Server stand-in that co-signs with the test server keys.
#[derive(Default)]
pub struct FakeF8e {
    pub keysets: Mutex<Vec<SpendingKeyset>>,
    pub initiate_responses: Mutex<VecDeque<Result<PendingDelayNotify, InitiateRecoveryError>>>,
    pub initiate_calls: Mutex<Vec<InitiateRecoveryRequest>>,
    pub cancel_calls: AtomicUsize,
    pub sign_calls: AtomicUsize,
    pub offline: AtomicBool,
}

impl FakeF8e {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keysets(keysets: Vec<SpendingKeyset>) -> Self {
        let f8e = Self::new();
        *f8e.keysets.lock().unwrap() = keysets;
        f8e
    }

    pub fn respond_to_initiate(&self, response: Result<PendingDelayNotify, InitiateRecoveryError>) {
        self.initiate_responses.lock().unwrap().push_back(response);
    }

    pub fn initiate_count(&self) -> usize {
        self.initiate_calls.lock().unwrap().len()
    }

    fn check_online(&self) -> Result<(), F8eError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(F8eError::Connectivity("connection refused".into()));
        }
        Ok(())
    }
}

pub fn pending() -> PendingDelayNotify {
    PendingDelayNotify {
        recovery_id: "recovery-1".into(),
        lost_factor: LostFactor::Hardware,
        delay_end_time: 1_800_000_000,
    }
}

#[async_trait]
impl F8eClient for FakeF8e {
    async fn initiate_delay_notify_recovery(
        &self,
        request: &InitiateRecoveryRequest,
    ) -> Result<PendingDelayNotify, InitiateRecoveryError> {
        self.check_online()?;
        self.initiate_calls.lock().unwrap().push(request.clone());
        self.initiate_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(pending()))
    }

    async fn cancel_delay_notify_recovery(&self, _account_id: &str) -> Result<(), F8eError> {
        self.check_online()?;
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sign_psbt(
        &self,
        _account_id: &str,
        f8e_keyset_id: &str,
        psbt: &Psbt,
    ) -> Result<Psbt, F8eError> {
        self.check_online()?;
        self.sign_calls.fetch_add(1, Ordering::SeqCst);

        let seed: u8 = f8e_keyset_id
            .strip_prefix("f8e-")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| F8eError::Rejected(format!("unknown keyset {}", f8e_keyset_id)))?;
        let signed = trikey_wallet::signer::sign_psbt(&server_private(seed), psbt.inner())
            .map_err(|e| F8eError::Rejected(e.to_string()))?;
        Ok(Psbt::new(signed))
    }

    async fn list_keysets(&self, _account_id: &str) -> Result<Vec<SpendingKeyset>, F8eError> {
        self.check_online()?;
        Ok(self.keysets.lock().unwrap().clone())
    }
}

pub struct World {
    pub chain: Arc<MemoryChain>,
    pub keys: Arc<MemoryAppKeyStore>,
    pub f8e: Arc<FakeF8e>,
    pub engine: Arc<DescriptorEngine>,
}

impl World {
    pub fn new(f8e: FakeF8e) -> Self {
        let chain = Arc::new(MemoryChain::new(800));
        let engine = Arc::new(DescriptorEngine::with_gap_limit(
            chain.clone(),
            Network::Testnet,
            5,
        ));
        Self {
            chain,
            keys: Arc::new(MemoryAppKeyStore::new()),
            f8e: Arc::new(f8e),
            engine,
        }
    }

    pub fn generator(&self) -> SweepGenerator {
        SweepGenerator::new(self.engine.clone(), self.keys.clone())
    }

    /// Confirmed receive output on `keyset`.
    pub fn fund(&self, keyset: &SpendingKeyset, sats: u64) {
        let wallet = WatchingDescriptor::for_keyset(keyset).unwrap();
        fund(&self.chain, &wallet, Keychain::Receiving, 0, sats);
    }

    pub fn active_receive_script(&self, keybox: &Keybox) -> bitcoin::ScriptBuf {
        WatchingDescriptor::for_keyset(keybox.active())
            .unwrap()
            .derive(Keychain::Receiving, 0)
            .unwrap()
            .script_pubkey()
    }
}
