//! The per-party MuSig2 tree signing session.
//!
//! The ceremony runs in two rounds across every node of a settlement tree:
//! each party generates one nonce pair per node and sends the public halves
//! to the coordinator; the coordinator hands back the aggregate nonce per
//! node; each party then produces one partial signature per node.
//!
//! A session is single-use per batch. The phases are explicit, nonce
//! generation is lazy and memoized, and secret nonces are consumed when the
//! partial signatures are produced, so a session cannot be driven into
//! nonce reuse (the MuSig2 failure mode that reveals the secret key).
//! Concurrent use of one session is not supported; give each batch its own.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::key::{TweakedPublicKey, XOnlyPublicKey};
use bitcoin::secp256k1::{schnorr, Keypair, Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache};
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Amount, ScriptBuf, TapSighashType, Transaction, TxOut, Txid};
use musig2::{AggNonce, KeyAggContext, PubNonce};
use thiserror::Error;

use crate::musig::{self, MusigError, PartialSig};
use crate::txtree::{TxTree, TxTreeNode};
use crate::validation::p2tr_output_key;

/// Public nonces per node id.
pub type TreeNonces = HashMap<Txid, PubNonce>;

/// Coordinator-aggregated nonces per node id.
pub type TreeAggNonces = HashMap<Txid, AggNonce>;

/// Partial signatures per node id.
pub type TreePartialSigs = HashMap<Txid, PartialSig>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningSessionError {
    #[error("session is not initialized")]
    SessionNotInitialized,

    #[error("no settlement tree attached to the session")]
    GraphNotInitialized,

    #[error("session is already initialized")]
    SessionAlreadyInitialized,

    #[error("aggregated nonces were already set")]
    NoncesAlreadySet,

    #[error("no secret nonce for node {0}")]
    MissingSecretNonce(Txid),

    #[error("no aggregated nonce for node {0}")]
    MissingAggregatedNonce(Txid),

    #[error("node {0} declares no cosigners")]
    MissingCosigners(Txid),

    #[error("previous output of node {0} cannot be resolved")]
    UnresolvablePrevout(Txid),

    #[error("sighash computation failed: {0}")]
    Sighash(String),

    #[error(transparent)]
    Musig(#[from] MusigError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeVerifyError {
    #[error("node {0} carries no signature")]
    UnsignedNode(Txid),

    #[error("signature of node {0} does not verify")]
    InvalidSignature(Txid),

    #[error("previous output of node {0} is not a taproot output")]
    MalformedPrevout(Txid),

    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

struct SessionCtx<'a> {
    tree: &'a TxTree,
    script_root: TapNodeHash,
    root_amount: Amount,
    sec_nonces: Option<HashMap<Txid, musig2::SecNonce>>,
    pub_nonces: Option<TreeNonces>,
    agg_nonces: Option<TreeAggNonces>,
}

enum SessionState<'a> {
    Fresh,
    Initialized(SessionCtx<'a>),
}

/// One party's side of the tree signing ceremony.
///
/// Call order per batch: [`init`](TreeSignerSession::init) →
/// [`generate_nonces`](TreeSignerSession::generate_nonces) → (coordinator
/// aggregates) → [`set_aggregated_nonces`](TreeSignerSession::set_aggregated_nonces)
/// → [`sign`](TreeSignerSession::sign), each effective exactly once.
pub struct TreeSignerSession<'a> {
    keypair: Keypair,
    state: SessionState<'a>,
}

impl<'a> TreeSignerSession<'a> {
    pub fn new(keypair: Keypair) -> TreeSignerSession<'a> {
        TreeSignerSession { keypair, state: SessionState::Fresh }
    }

    /// The x-only public key this party signs with.
    pub fn public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    /// Attach the tree to sign, the taproot tweak shared by all node keys,
    /// and the amount of the shared output the root spends.
    pub fn init(
        &mut self,
        tree: &'a TxTree,
        script_root: TapNodeHash,
        root_shared_amount: Amount,
    ) -> Result<(), SigningSessionError> {
        match self.state {
            SessionState::Fresh => {
                self.state = SessionState::Initialized(SessionCtx {
                    tree,
                    script_root,
                    root_amount: root_shared_amount,
                    sec_nonces: None,
                    pub_nonces: None,
                    agg_nonces: None,
                });
                Ok(())
            }
            SessionState::Initialized(_) => Err(SigningSessionError::SessionAlreadyInitialized),
        }
    }

    /// Generate (once) and return the public nonces, one per tree node.
    pub fn generate_nonces(&mut self) -> Result<TreeNonces, SigningSessionError> {
        let ctx = match &mut self.state {
            SessionState::Initialized(ctx) => ctx,
            SessionState::Fresh => return Err(SigningSessionError::GraphNotInitialized),
        };

        if ctx.pub_nonces.is_none() {
            let seckey = musig::even_secret_key(&self.keypair);
            let mut sec_nonces = HashMap::with_capacity(ctx.tree.nb_nodes());
            let mut pub_nonces = HashMap::with_capacity(ctx.tree.nb_nodes());
            for node in ctx.tree.iter() {
                let (key_ctx, sighash) =
                    node_signing_context(ctx.tree, node, ctx.script_root, ctx.root_amount)?;
                let (sec, public) = musig::generate_nonce(&seckey, &key_ctx, &sighash)?;
                sec_nonces.insert(node.txid(), sec);
                pub_nonces.insert(node.txid(), public);
            }
            ctx.sec_nonces = Some(sec_nonces);
            ctx.pub_nonces = Some(pub_nonces);
        }

        Ok(ctx.pub_nonces.clone().expect("generated above"))
    }

    /// Accept the coordinator-aggregated nonces, one per node. Allowed once.
    pub fn set_aggregated_nonces(
        &mut self,
        nonces: TreeAggNonces,
    ) -> Result<(), SigningSessionError> {
        let ctx = match &mut self.state {
            SessionState::Initialized(ctx) => ctx,
            SessionState::Fresh => return Err(SigningSessionError::SessionNotInitialized),
        };
        if ctx.agg_nonces.is_some() {
            return Err(SigningSessionError::NoncesAlreadySet);
        }
        ctx.agg_nonces = Some(nonces);
        Ok(())
    }

    /// Produce one partial signature per node, consuming the secret nonces.
    pub fn sign(&mut self) -> Result<TreePartialSigs, SigningSessionError> {
        let ctx = match &mut self.state {
            SessionState::Initialized(ctx) => ctx,
            SessionState::Fresh => return Err(SigningSessionError::SessionNotInitialized),
        };

        let seckey = musig::even_secret_key(&self.keypair);
        let mut signatures = HashMap::with_capacity(ctx.tree.nb_nodes());
        for node in ctx.tree.iter() {
            let txid = node.txid();
            let agg_nonce = ctx
                .agg_nonces
                .as_ref()
                .and_then(|nonces| nonces.get(&txid))
                .ok_or(SigningSessionError::MissingAggregatedNonce(txid))?
                .clone();
            let sec_nonce = ctx
                .sec_nonces
                .as_mut()
                .and_then(|nonces| nonces.remove(&txid))
                .ok_or(SigningSessionError::MissingSecretNonce(txid))?;

            let (key_ctx, sighash) =
                node_signing_context(ctx.tree, node, ctx.script_root, ctx.root_amount)?;
            let partial = musig::partial_sign(&key_ctx, &seckey, sec_nonce, &agg_nonce, &sighash)?;
            signatures.insert(txid, PartialSig::from_signature(partial));
        }

        log::debug!("produced partial signatures for {} tree nodes", signatures.len());
        Ok(signatures)
    }
}

/// The key-spend sighash of a node together with the MuSig2 context of its
/// cosigner set.
///
/// The root spends the batch's shared output, reconstructed from its own
/// aggregate key and the shared amount; every other node reads the parent
/// output it spends.
fn node_signing_context(
    tree: &TxTree,
    node: &TxTreeNode,
    script_root: TapNodeHash,
    root_amount: Amount,
) -> Result<(KeyAggContext, [u8; 32]), SigningSessionError> {
    let txid = node.txid();
    let cosigners = node
        .psbt
        .inputs
        .first()
        .map(vtxokit_psbt::cosigner_keys)
        .transpose()
        .map_err(|_| SigningSessionError::MissingCosigners(txid))?
        .unwrap_or_default();
    if cosigners.is_empty() {
        return Err(SigningSessionError::MissingCosigners(txid));
    }
    let (key_ctx, aggregate) = musig::aggregate_keys(&cosigners, Some(script_root))?;

    let prevout = resolve_prevout(tree, node, root_amount, aggregate)
        .ok_or(SigningSessionError::UnresolvablePrevout(txid))?;
    let sighash = key_spend_sighash(node.transaction(), &prevout)
        .map_err(SigningSessionError::Sighash)?;
    Ok((key_ctx, sighash))
}

/// The output a node spends: the parent's output at the matching index, or
/// the shared output for the root.
fn resolve_prevout(
    tree: &TxTree,
    node: &TxTreeNode,
    root_amount: Amount,
    root_aggregate: XOnlyPublicKey,
) -> Option<TxOut> {
    match tree.parent(node) {
        Some((parent, vout)) => parent.transaction().output.get(vout as usize).cloned(),
        None => Some(TxOut {
            value: root_amount,
            script_pubkey: ScriptBuf::new_p2tr_tweaked(
                TweakedPublicKey::dangerous_assume_tweaked(root_aggregate),
            ),
        }),
    }
}

/// BIP-341 key-spend sighash (`SIGHASH_DEFAULT`) of a single-input node tx.
fn key_spend_sighash(tx: &Transaction, prevout: &TxOut) -> Result<[u8; 32], String> {
    let mut cache = SighashCache::new(tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(0, &Prevouts::All(&[prevout]), TapSighashType::Default)
        .map_err(|e| e.to_string())?;
    Ok(sighash.to_byte_array())
}

/// The finalized schnorr signature attached to a node, if any.
fn node_signature(node: &TxTreeNode) -> Option<schnorr::Signature> {
    let input = node.psbt.inputs.first()?;
    if let Some(signature) = input.tap_key_sig {
        return Some(signature.signature);
    }
    let witness = input.final_script_witness.as_ref()?;
    let first = witness.nth(0)?;
    bitcoin::taproot::Signature::from_slice(first)
        .ok()
        .map(|s| s.signature)
}

/// Audit a fully signed tree.
///
/// Recomputes every node's previous output and sighash and verifies the
/// attached signature against the taproot key in that output's script; the
/// root's previous output is `(shared_output_amount, OP_1 <final_agg_key>)`.
/// Pure; usable by any participant, signer or not.
pub fn verify_finalized_tree(
    final_agg_key: XOnlyPublicKey,
    shared_output_amount: Amount,
    tree: &TxTree,
) -> Result<(), TreeVerifyError> {
    let secp = Secp256k1::verification_only();
    for node in tree.iter() {
        let txid = node.txid();
        let prevout = match tree.parent(node) {
            Some((parent, vout)) => parent
                .transaction()
                .output
                .get(vout as usize)
                .cloned()
                .ok_or(TreeVerifyError::MalformedPrevout(txid))?,
            None => TxOut {
                value: shared_output_amount,
                script_pubkey: ScriptBuf::new_p2tr_tweaked(
                    TweakedPublicKey::dangerous_assume_tweaked(final_agg_key),
                ),
            },
        };
        let key = p2tr_output_key(&prevout.script_pubkey)
            .ok_or(TreeVerifyError::MalformedPrevout(txid))?;

        let signature = node_signature(node).ok_or(TreeVerifyError::UnsignedNode(txid))?;
        let sighash =
            key_spend_sighash(node.transaction(), &prevout).map_err(TreeVerifyError::Sighash)?;

        secp.verify_schnorr(&signature, &Message::from_digest(sighash), &key)
            .map_err(|_| TreeVerifyError::InvalidSignature(txid))?;
    }
    Ok(())
}

/// Coordinator-side combine: merge every party's partial signatures into
/// one finalized schnorr signature per node.
///
/// Each map in `partials` holds one party's signature for every node.
pub fn aggregate_tree_signatures(
    tree: &TxTree,
    script_root: TapNodeHash,
    root_shared_amount: Amount,
    agg_nonces: &TreeAggNonces,
    partials: &[TreePartialSigs],
) -> Result<HashMap<Txid, schnorr::Signature>, SigningSessionError> {
    let mut finalized = HashMap::with_capacity(tree.nb_nodes());
    for node in tree.iter() {
        let txid = node.txid();
        let agg_nonce = agg_nonces
            .get(&txid)
            .ok_or(SigningSessionError::MissingAggregatedNonce(txid))?;
        let node_partials = partials
            .iter()
            .map(|party| {
                party
                    .get(&txid)
                    .ok_or(SigningSessionError::MissingSecretNonce(txid))
                    .and_then(|sig| sig.to_signature().map_err(SigningSessionError::from))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (key_ctx, sighash) =
            node_signing_context(tree, node, script_root, root_shared_amount)?;
        let signature =
            musig::aggregate_partial_signatures(&key_ctx, agg_nonce, &node_partials, &sighash)?;
        finalized.insert(txid, signature);
    }
    Ok(finalized)
}
