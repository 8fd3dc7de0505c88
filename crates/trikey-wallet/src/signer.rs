//! ECDSA signing of P2WSH multisig inputs with an origin-tagged xpriv.
//!
//! For each input, the signer looks up the BIP-32 derivation entry whose
//! fingerprint and path prefix match its own key, derives the child key and
//! adds a SIGHASH_ALL partial signature.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint};
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use thiserror::Error;
use trikey_core::AppSpendingPrivateKey;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Input {0} has no witness UTXO")]
    MissingWitnessUtxo(usize),

    #[error("Input {0} has no witness script")]
    MissingWitnessScript(usize),

    #[error("Input {index} has no key derived from {fingerprint}")]
    NoMatchingKey {
        index: usize,
        fingerprint: Fingerprint,
    },

    #[error("Input {0}: derived key does not match the PSBT")]
    KeyMismatch(usize),

    #[error("Sighash error: {0}")]
    Sighash(String),

    #[error("Derivation error: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),
}

/// Sign every input of `psbt` with `key`. Fails without partial results if
/// any input cannot be signed.
pub fn sign_psbt(key: &AppSpendingPrivateKey, psbt: &bitcoin::Psbt) -> Result<bitcoin::Psbt, SignerError> {
    let secp = Secp256k1::new();
    let mut signed = psbt.clone();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let origin: &[ChildNumber] = key.path().as_ref();

    for (index, input) in signed.inputs.iter_mut().enumerate() {
        let utxo = input
            .witness_utxo
            .as_ref()
            .ok_or(SignerError::MissingWitnessUtxo(index))?;
        let script = input
            .witness_script
            .as_ref()
            .ok_or(SignerError::MissingWitnessScript(index))?;

        let (pubkey, child_path) = input
            .bip32_derivation
            .iter()
            .find_map(|(pk, (fingerprint, path))| {
                if *fingerprint != key.fingerprint() {
                    return None;
                }
                let full: &[ChildNumber] = path.as_ref();
                let rest = full.strip_prefix(origin)?;
                Some((*pk, DerivationPath::from(rest.to_vec())))
            })
            .ok_or(SignerError::NoMatchingKey {
                index,
                fingerprint: key.fingerprint(),
            })?;

        let child = key.xpriv().derive_priv(&secp, &child_path)?;
        if child.private_key.public_key(&secp) != pubkey {
            return Err(SignerError::KeyMismatch(index));
        }

        let sighash = cache
            .p2wsh_signature_hash(index, script, utxo.value, EcdsaSighashType::All)
            .map_err(|e| SignerError::Sighash(e.to_string()))?;
        let msg = Message::from_digest(sighash.to_byte_array());
        let sig = secp.sign_ecdsa(&msg, &child.private_key);

        input.partial_sigs.insert(
            bitcoin::PublicKey::new(pubkey),
            bitcoin::ecdsa::Signature::sighash_all(sig),
        );
    }

    Ok(signed)
}

/// Check every partial signature in `psbt` against its input's sighash.
pub fn verify_partial_sigs(psbt: &bitcoin::Psbt) -> Result<(), SignerError> {
    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(&psbt.unsigned_tx);

    for (index, input) in psbt.inputs.iter().enumerate() {
        let utxo = input
            .witness_utxo
            .as_ref()
            .ok_or(SignerError::MissingWitnessUtxo(index))?;
        let script = input
            .witness_script
            .as_ref()
            .ok_or(SignerError::MissingWitnessScript(index))?;
        let sighash = cache
            .p2wsh_signature_hash(index, script, utxo.value, EcdsaSighashType::All)
            .map_err(|e| SignerError::Sighash(e.to_string()))?;
        let msg = Message::from_digest(sighash.to_byte_array());

        for (pk, sig) in &input.partial_sigs {
            secp.verify_ecdsa(&msg, &sig.signature, &pk.inner)
                .map_err(|_| SignerError::KeyMismatch(index))?;
        }
    }
    Ok(())
}
