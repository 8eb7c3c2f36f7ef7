//! MuSig2 (BIP-327) key aggregation and partial signing.
//!
//! Bridges between `bitcoin::secp256k1` types and the musig2 crate's types
//! via byte serialization. Both use libsecp256k1 underneath.
//!
//! Cosigner sets in the protocol are 32-byte x-only keys. They are lifted to
//! even-parity points, sorted by serialization (BIP-327 KeySort) and
//! aggregated; tree signing applies a taproot tweak so the aggregate
//! verifies as the on-chain output key. A signer whose keypair has an odd-Y
//! public key signs with the negated secret so it matches the lifted point.

use bitcoin::hashes::Hash;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::{schnorr, Keypair, Message, Parity, Secp256k1, SecretKey};
use bitcoin::taproot::TapNodeHash;
use musig2::{KeyAggContext, LiftedSignature, PartialSignature};
use thiserror::Error;

pub use musig2::{AggNonce, PubNonce, SecNonce};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MusigError {
    #[error("key aggregation failed: {0}")]
    KeyAggregation(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("partial signature scalar is not in the curve order")]
    ScalarOutOfRange,
}

/// Convert an x-only key to musig2's PublicKey, lifted to even parity.
fn xonly_to_musig(key: &XOnlyPublicKey) -> Result<musig2::secp256k1::PublicKey, MusigError> {
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&key.serialize());
    musig2::secp256k1::PublicKey::from_slice(&compressed)
        .map_err(|e| MusigError::KeyAggregation(format!("pubkey conversion: {}", e)))
}

/// Convert our SecretKey to musig2's SecretKey.
fn seckey_to_musig(key: &SecretKey) -> Result<musig2::secp256k1::SecretKey, MusigError> {
    #[allow(deprecated)]
    musig2::secp256k1::SecretKey::from_slice(&key.secret_bytes())
        .map_err(|e| MusigError::Signing(format!("seckey conversion: {}", e)))
}

/// The secret key matching a keypair's even-parity (x-only) public key.
pub fn even_secret_key(keypair: &Keypair) -> SecretKey {
    let (_, parity) = keypair.x_only_public_key();
    match parity {
        Parity::Even => keypair.secret_key(),
        Parity::Odd => keypair.secret_key().negate(),
    }
}

/// Aggregate a cosigner set: sort, aggregate with KeyAgg coefficients, and
/// optionally apply a BIP-341 taproot tweak with the given merkle root.
///
/// Returns the context (needed for signing) and the aggregate x-only key.
pub fn aggregate_keys(
    keys: &[XOnlyPublicKey],
    tweak: Option<TapNodeHash>,
) -> Result<(KeyAggContext, XOnlyPublicKey), MusigError> {
    if keys.is_empty() {
        return Err(MusigError::KeyAggregation("empty cosigner set".into()));
    }

    let mut sorted = keys.to_vec();
    sorted.sort_unstable_by_key(|key| key.serialize());
    let converted = sorted
        .iter()
        .map(xonly_to_musig)
        .collect::<Result<Vec<_>, _>>()?;

    let mut ctx = KeyAggContext::new(converted)
        .map_err(|e| MusigError::KeyAggregation(format!("key aggregation: {}", e)))?;
    if let Some(merkle_root) = tweak {
        ctx = ctx
            .with_taproot_tweak(&merkle_root.to_byte_array())
            .map_err(|e| MusigError::KeyAggregation(format!("taproot tweak: {}", e)))?;
    }

    let aggregate: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();
    let (xonly, _parity) = aggregate.x_only_public_key();
    let key = XOnlyPublicKey::from_slice(&xonly.serialize())
        .map_err(|e| MusigError::KeyAggregation(format!("xonly conversion: {}", e)))?;

    Ok((ctx, key))
}

/// Generate a nonce pair bound to the signer key and the message.
///
/// The returned SecNonce MUST be used exactly once; reusing it across
/// messages reveals the secret key.
pub fn generate_nonce(
    seckey: &SecretKey,
    ctx: &KeyAggContext,
    message: &[u8; 32],
) -> Result<(SecNonce, PubNonce), MusigError> {
    let sk = seckey_to_musig(seckey)?;
    let aggregate: musig2::secp256k1::PublicKey = ctx.aggregated_pubkey();

    let mut nonce_seed = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce_seed);

    let secnonce = SecNonce::build(nonce_seed)
        .with_seckey(sk)
        .with_aggregated_pubkey(aggregate)
        .with_message(message)
        .build();
    let pubnonce = secnonce.public_nonce();
    Ok((secnonce, pubnonce))
}

/// Sum the parties' public nonces into the aggregate nonce.
pub fn aggregate_nonces(nonces: &[PubNonce]) -> AggNonce {
    AggNonce::sum(nonces)
}

/// Produce this party's partial signature. The SecNonce is consumed.
pub fn partial_sign(
    ctx: &KeyAggContext,
    seckey: &SecretKey,
    secnonce: SecNonce,
    agg_nonce: &AggNonce,
    message: &[u8; 32],
) -> Result<PartialSignature, MusigError> {
    let sk = seckey_to_musig(seckey)?;
    musig2::sign_partial(ctx, sk, secnonce, agg_nonce, message)
        .map_err(|e| MusigError::Signing(format!("partial sign: {}", e)))
}

/// Combine partial signatures into a final 64-byte schnorr signature.
///
/// Fails if any partial signature does not verify against the aggregate.
pub fn aggregate_partial_signatures(
    ctx: &KeyAggContext,
    agg_nonce: &AggNonce,
    partials: &[PartialSignature],
    message: &[u8; 32],
) -> Result<schnorr::Signature, MusigError> {
    let signature: LiftedSignature =
        musig2::aggregate_partial_signatures(ctx, agg_nonce, partials.iter().copied(), message)
            .map_err(|e| MusigError::Signing(format!("signature aggregation: {}", e)))?;
    schnorr::Signature::from_slice(&signature.serialize())
        .map_err(|e| MusigError::Signing(format!("signature conversion: {}", e)))
}

/// Verify a finalized schnorr signature against an x-only key.
pub fn verify_schnorr(key: &XOnlyPublicKey, signature: &schnorr::Signature, message: &[u8; 32]) -> bool {
    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(signature, &Message::from_digest(*message), key)
        .is_ok()
}

/// The 32-byte wire form of a partial signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialSig([u8; 32]);

impl PartialSig {
    /// Decode from wire bytes; the scalar must be below the curve order.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<PartialSig, MusigError> {
        PartialSignature::from_slice(&bytes).map_err(|_| MusigError::ScalarOutOfRange)?;
        Ok(PartialSig(bytes))
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn from_signature(signature: PartialSignature) -> PartialSig {
        PartialSig(signature.serialize())
    }

    pub fn to_signature(self) -> Result<PartialSignature, MusigError> {
        PartialSignature::from_slice(&self.0).map_err(|_| MusigError::ScalarOutOfRange)
    }
}
