//! vtxokit-tree
//!
//! Settlement transaction trees and the collaborative signing protocol that
//! authorizes them.
//!
//! A batch settlement produces a rooted tree of transactions that splits one
//! on-chain output into many vtxos. The coordinator streams the tree as an
//! unordered flat list; [`TxTree`] rebuilds the rooted structure from it and
//! checks the structural and value-conservation invariants every honest tree
//! upholds.
//!
//! [`validation`] cross-checks a tree against the commitment transaction
//! that anchors it, including the cryptographic binding of each node's
//! cosigner set to its parent's output script via MuSig2 key aggregation —
//! the property that stops a coordinator from swapping signers after the
//! tree is fixed.
//!
//! [`signing::TreeSignerSession`] drives one party's side of the two-round
//! MuSig2 ceremony across every node, and
//! [`signing::verify_finalized_tree`] lets anyone audit the finished tree.
//!
//! Everything here is synchronous and treats coordinator-supplied data as
//! untrusted until validated.

pub mod musig;
pub mod signing;
pub mod txtree;
pub mod validation;

pub use musig::{MusigError, PartialSig};
pub use signing::{
    verify_finalized_tree, SigningSessionError, TreeSignerSession, TreeVerifyError,
};
pub use txtree::{anchor_output, FlatTreeNode, TreeError, TxTree, TxTreeNode, WireTreeNode};
pub use validation::{
    validate_connector_graph, validate_settlement_tree, GraphValidationError,
    CONNECTOR_OUTPUT_INDEX,
};
