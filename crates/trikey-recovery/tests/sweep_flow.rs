//! Sweeping retired keysets end to end against an in-memory chain.

mod common;

use bitcoin::Amount;
use common::{FakeF8e, World};
use std::sync::atomic::Ordering;
use trikey_keybox::test_utils::{app_keypair, hw_private, keybox, keyset};
use trikey_keybox::AppKeyStore;
use trikey_recovery::{SigningFactor, SweepSession, SweepState};
use trikey_wallet::Psbt;

fn session(world: &World, kb: trikey_keybox::Keybox) -> SweepSession {
    SweepSession::new(kb, world.generator(), world.f8e.clone())
}

#[tokio::test]
async fn test_app_signed_sweep_completes() {
    let world = World::new(FakeF8e::with_keysets(vec![keyset(1), keyset(2)]));
    world.keys.store_app_private_key(&app_keypair(2).private).unwrap();
    let kb = keybox(1, &[2]);
    world.fund(&kb.inactive()[0], 10_000);

    let mut session = session(&world, kb.clone());
    match session.start().await {
        SweepState::PsbtsGenerated { sweep } => {
            assert_eq!(sweep.psbts.len(), 1);
            assert_eq!(sweep.psbts[0].signing_factor, SigningFactor::App);
            assert!(!sweep.needs_hardware_signing());
        }
        other => panic!("expected generated psbts, got {:?}", other),
    }

    match session.start_sweep().await {
        SweepState::SweepComplete {
            total_fee,
            total_transfer_amount,
            destination,
            txids,
        } => {
            assert_eq!(*total_fee + *total_transfer_amount, Amount::from_sat(10_000));
            assert!(*total_fee > Amount::ZERO);
            assert_eq!(destination.script_pubkey(), world.active_receive_script(&kb));
            assert_eq!(txids, &world.chain.broadcasts());
        }
        other => panic!("expected completion, got {:?}", other),
    }
    assert_eq!(world.f8e.sign_calls.load(Ordering::SeqCst), 1);

    // Starting again after completion must not rebroadcast
    assert!(matches!(
        session.start_sweep().await,
        SweepState::SweepCompleteNoData
    ));
    assert_eq!(world.chain.broadcasts().len(), 1);

    world.chain.mine();
    let mut again = self::session(&world, kb);
    assert!(matches!(again.start().await, SweepState::NoFundsFound));
    assert!(matches!(again.proceed().await, SweepState::Exited));
}

#[tokio::test]
async fn test_server_only_keyset_needs_hardware() {
    // Keyset 3 was active on a phone that is gone; only the server knows it
    let world = World::new(FakeF8e::with_keysets(vec![keyset(1), keyset(3)]));
    let kb = keybox(1, &[]);
    world.fund(&keyset(3), 20_000);

    let mut session = session(&world, kb);
    assert!(matches!(
        session.start().await,
        SweepState::PsbtsGenerated { .. }
    ));
    assert_eq!(session.keybox().inactive(), &[keyset(3)]);

    let unsigned: Vec<Psbt> = match session.start_sweep().await {
        SweepState::AwaitingHardwareSignedSweeps { needs_hw_sign, .. } => {
            assert_eq!(needs_hw_sign.len(), 1);
            assert_eq!(needs_hw_sign[0].signing_factor, SigningFactor::Hardware);
            needs_hw_sign.iter().map(|p| p.psbt.clone()).collect()
        }
        other => panic!("expected hardware signing, got {:?}", other),
    };
    assert!(world.chain.broadcasts().is_empty());

    let signed = unsigned
        .iter()
        .map(|p| {
            trikey_wallet::signer::sign_psbt(&hw_private(3), p.inner())
                .map(Psbt::new)
                .unwrap()
        })
        .collect();

    match session.add_hw_signed_sweeps(signed).await {
        SweepState::SweepComplete {
            total_transfer_amount,
            txids,
            ..
        } => {
            assert!(*total_transfer_amount < Amount::from_sat(20_000));
            assert_eq!(txids.len(), 1);
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cosign_outage_then_retry() {
    let world = World::new(FakeF8e::with_keysets(vec![keyset(1), keyset(2)]));
    world.keys.store_app_private_key(&app_keypair(2).private).unwrap();
    let kb = keybox(1, &[2]);
    world.fund(&kb.inactive()[0], 50_000);

    let mut session = session(&world, kb);
    session.start().await;

    world.f8e.offline.store(true, Ordering::SeqCst);
    match session.start_sweep().await {
        SweepState::SweepFailed { error } => assert!(error.is_retryable()),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(world.chain.broadcasts().is_empty());

    // Retry regenerates instead of reusing the failed PSBTs
    world.f8e.offline.store(false, Ordering::SeqCst);
    assert!(matches!(
        session.retry().await,
        SweepState::PsbtsGenerated { .. }
    ));
    assert!(matches!(
        session.start_sweep().await,
        SweepState::SweepComplete { .. }
    ));
    assert_eq!(world.chain.broadcasts().len(), 1);
}

#[tokio::test]
async fn test_keyset_listing_outage_fails_generation() {
    let world = World::new(FakeF8e::new());
    world.f8e.offline.store(true, Ordering::SeqCst);

    let mut session = session(&world, keybox(1, &[2]));
    match session.start().await {
        SweepState::GeneratePsbtsFailed { error } => assert!(error.is_retryable()),
        other => panic!("expected generation failure, got {:?}", other),
    }
}
