//! Cross-checks between a settlement tree and the commitment transaction
//! that anchors it.
//!
//! Beyond the tree's own structural invariants, a client must verify that
//! the tree actually spends the batch output it claims to, that the batch
//! amount is fully accounted for, and that every edge is cryptographically
//! bound to its declared cosigner set: the MuSig2 aggregate of a child's
//! cosigners, tweaked by the sweep script root, must be the taproot key in
//! the parent output the child spends. A coordinator that swaps signers
//! after tree construction cannot produce a tree that passes this check.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::taproot::TapNodeHash;
use bitcoin::{Amount, OutPoint, Script, Transaction, Txid};
use thiserror::Error;

use crate::musig::{self, MusigError};
use crate::txtree::{decode_psbt_blob, TreeError, TxTree};

/// The output of the commitment transaction that funds forfeit connectors.
/// Output 0 funds the settlement tree.
pub const CONNECTOR_OUTPUT_INDEX: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("commitment transaction has no funded output at the batch index")]
    InvalidCommitmentOutputs,

    #[error("settlement tree is empty")]
    EmptyTree,

    #[error("tree root does not spend the commitment batch output")]
    WrongCommitmentReference,

    #[error("root outputs sum to {actual} but the batch output holds {expected}")]
    AmountMismatch { expected: Amount, actual: Amount },

    #[error("settlement tree has no leaves")]
    NoLeaves,

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error("node {0} declares no cosigners")]
    MissingCosigners(Txid),

    #[error("cosigner set of node {0} does not aggregate to its parent output key")]
    CosignerBindingMismatch(Txid),

    #[error("parent output spent by node {0} is not a taproot output")]
    MalformedParentOutput(Txid),

    #[error("connector root does not have exactly one input")]
    WrongInputCount,

    #[error("connector root does not spend the settlement connector output")]
    WrongSettlementReference,

    #[error("settlement transaction is not decodable")]
    InvalidSettlementTransaction,

    #[error(transparent)]
    Musig(#[from] MusigError),
}

/// The x-only key inside an `OP_1 <key>` output script.
pub(crate) fn p2tr_output_key(script: &Script) -> Option<XOnlyPublicKey> {
    if !script.is_p2tr() {
        return None;
    }
    XOnlyPublicKey::from_slice(&script.as_bytes()[2..34]).ok()
}

/// Validate a settlement tree against its commitment transaction.
///
/// Checks, in order: the batch output exists and is funded, the root spends
/// it, the root's outputs account for its full amount, the tree has leaves,
/// the tree's own invariants hold, and every edge's cosigner set aggregates
/// (sorted, tweaked by `sweep_script_root`) to the taproot key in the parent
/// output it spends.
pub fn validate_settlement_tree(
    tree: &TxTree,
    commitment_tx: &Transaction,
    batch_output_index: usize,
    sweep_script_root: TapNodeHash,
) -> Result<(), GraphValidationError> {
    let batch_output = commitment_tx
        .output
        .get(batch_output_index)
        .ok_or(GraphValidationError::InvalidCommitmentOutputs)?;
    if batch_output.value == Amount::ZERO {
        return Err(GraphValidationError::InvalidCommitmentOutputs);
    }

    if tree.nb_nodes() == 0 {
        return Err(GraphValidationError::EmptyTree);
    }

    let root_tx = tree.root().transaction();
    let expected = OutPoint::new(commitment_tx.compute_txid(), batch_output_index as u32);
    let spends_batch = root_tx
        .input
        .first()
        .is_some_and(|input| input.previous_output == expected);
    if root_tx.input.len() != 1 || !spends_batch {
        return Err(GraphValidationError::WrongCommitmentReference);
    }

    let root_sum: Amount = root_tx.output.iter().map(|o| o.value).sum();
    if root_sum != batch_output.value {
        return Err(GraphValidationError::AmountMismatch {
            expected: batch_output.value,
            actual: root_sum,
        });
    }

    if tree.leaves().next().is_none() {
        return Err(GraphValidationError::NoLeaves);
    }

    tree.validate()?;

    for node in tree.iter() {
        for (vout, child) in tree.children(node) {
            let cosigners = child
                .psbt
                .inputs
                .first()
                .map(vtxokit_psbt::cosigner_keys)
                .transpose()
                .map_err(|_| GraphValidationError::MissingCosigners(child.txid()))?
                .unwrap_or_default();
            if cosigners.is_empty() {
                return Err(GraphValidationError::MissingCosigners(child.txid()));
            }

            let (_, aggregate) = musig::aggregate_keys(&cosigners, Some(sweep_script_root))?;

            let parent_script = &node.transaction().output[vout as usize].script_pubkey;
            let bound = p2tr_output_key(parent_script)
                .ok_or(GraphValidationError::MalformedParentOutput(node.txid()))?;
            if bound != aggregate {
                return Err(GraphValidationError::CosignerBindingMismatch(child.txid()));
            }
        }
    }

    log::debug!(
        "settlement tree validated against commitment output {}: {} nodes, {} leaves",
        batch_output_index,
        tree.nb_nodes(),
        tree.leaves().count(),
    );
    Ok(())
}

/// Validate the one-level connector graph used for forfeit connectors.
///
/// The connector root must have exactly one input, and it must spend the
/// settlement transaction's connector output.
pub fn validate_connector_graph(
    settlement_tx_b64: &str,
    connectors: &TxTree,
) -> Result<(), GraphValidationError> {
    let settlement = decode_psbt_blob(settlement_tx_b64)
        .map_err(|_| GraphValidationError::InvalidSettlementTransaction)?;

    let root_tx = connectors.root().transaction();
    if root_tx.input.len() != 1 {
        return Err(GraphValidationError::WrongInputCount);
    }

    let expected = OutPoint::new(
        settlement.unsigned_tx.compute_txid(),
        CONNECTOR_OUTPUT_INDEX,
    );
    if root_tx.input[0].previous_output != expected {
        return Err(GraphValidationError::WrongSettlementReference);
    }
    Ok(())
}
