//! The settlement transaction tree.
//!
//! Nodes are PSBT-carried transactions so that the custom per-input fields
//! (cosigner sets, condition witnesses, expiry) travel with them. The tree
//! owns its nodes in an arena indexed by position; edges are stored as
//! output-index → arena-index maps plus parent back-links, so an in-place
//! transaction update never rebuilds links.
//!
//! Reconstruction and traversal are iterative with explicit stacks; a
//! malicious coordinator cannot blow the call stack with a deep tree or
//! wedge us with a cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use base64::Engine;
use bitcoin::{Amount, Psbt, ScriptBuf, Transaction, TxOut, Txid};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("empty node list")]
    EmptyInput,

    #[error("duplicate node {0}")]
    DuplicateNodeId(Txid),

    #[error("no node qualifies as the tree root")]
    NoRootFound,

    #[error("more than one node qualifies as the tree root")]
    MultipleRootsFound,

    #[error("child reference {0} points to no node in the list")]
    DanglingChildReference(Txid),

    #[error("{reachable} of {expected} nodes reachable from the root")]
    NodeCountMismatch { expected: usize, reachable: usize },

    #[error("tree has no root")]
    MissingRoot,

    #[error("node {0} does not have exactly one input")]
    WrongInputCount(Txid),

    #[error("node {0} has more children than spendable outputs")]
    TooManyChildren(Txid),

    #[error("child {0} does not spend its parent's output")]
    ChildParentLinkMismatch(Txid),

    #[error("outputs of child {0} do not sum to the parent output it spends")]
    ValueConservationViolation(Txid),

    #[error("no node with id {0}")]
    NodeNotFound(Txid),

    #[error("node record does not carry a decodable transaction")]
    InvalidTransaction,

    #[error("node record carries an invalid id")]
    InvalidNodeId,

    #[error("declared id {declared} does not match computed txid {computed}")]
    DeclaredTxidMismatch { declared: Txid, computed: Txid },
}

/// One record of the coordinator's tree stream, as decoded JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTreeNode {
    /// Hex transaction id, as declared by the coordinator.
    pub txid: String,
    /// The node transaction as a base64 or hex PSBT.
    pub tx: String,
    /// Output index → child txid (hex).
    #[serde(default)]
    pub children: BTreeMap<u32, String>,
}

/// A decoded tree-stream record, ready for reconstruction.
#[derive(Debug, Clone)]
pub struct FlatTreeNode {
    pub psbt: Psbt,
    pub children: BTreeMap<u32, Txid>,
}

impl FlatTreeNode {
    pub fn new(psbt: Psbt, children: BTreeMap<u32, Txid>) -> FlatTreeNode {
        FlatTreeNode { psbt, children }
    }

    pub fn txid(&self) -> Txid {
        self.psbt.unsigned_tx.compute_txid()
    }

    /// Decode a wire record, verifying the declared id against the
    /// transaction it carries.
    pub fn from_wire(node: &WireTreeNode) -> Result<FlatTreeNode, TreeError> {
        let psbt = decode_psbt_blob(&node.tx)?;

        let declared = Txid::from_str(&node.txid).map_err(|_| TreeError::InvalidNodeId)?;
        let computed = psbt.unsigned_tx.compute_txid();
        if declared != computed {
            return Err(TreeError::DeclaredTxidMismatch { declared, computed });
        }

        let mut children = BTreeMap::new();
        for (vout, child) in &node.children {
            let child = Txid::from_str(child).map_err(|_| TreeError::InvalidNodeId)?;
            children.insert(*vout, child);
        }
        Ok(FlatTreeNode { psbt, children })
    }
}

/// Decode a PSBT from a base64 or hex blob.
///
/// A hex blob of the right length is also valid base64, so each decoding is
/// only accepted if the bytes parse as a PSBT.
pub fn decode_psbt_blob(blob: &str) -> Result<Psbt, TreeError> {
    if let Ok(raw) = base64::engine::general_purpose::STANDARD.decode(blob) {
        if let Ok(psbt) = Psbt::deserialize(&raw) {
            return Ok(psbt);
        }
    }
    if let Ok(raw) = hex::decode(blob) {
        if let Ok(psbt) = Psbt::deserialize(&raw) {
            return Ok(psbt);
        }
    }
    Err(TreeError::InvalidTransaction)
}

/// A node of a [`TxTree`].
#[derive(Debug, Clone)]
pub struct TxTreeNode {
    pub psbt: Psbt,
    txid: Txid,
    children: BTreeMap<u32, usize>,
    parent: Option<(usize, u32)>,
}

impl TxTreeNode {
    /// The node id: the txid of the carried (unsigned) transaction.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn transaction(&self) -> &Transaction {
        &self.psbt.unsigned_tx
    }

    pub fn nb_children(&self) -> usize {
        self.children.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A rooted tree of settlement transactions.
#[derive(Debug, Clone)]
pub struct TxTree {
    nodes: Vec<TxTreeNode>,
    root: usize,
}

impl TxTree {
    /// Rebuild the rooted tree from an unordered flat node list.
    ///
    /// The root is the unique node whose id appears in no other node's
    /// children; every child reference must resolve, and every node must be
    /// reachable from the root.
    pub fn reconstruct(flat: Vec<FlatTreeNode>) -> Result<TxTree, TreeError> {
        if flat.is_empty() {
            return Err(TreeError::EmptyInput);
        }

        let mut nodes = Vec::with_capacity(flat.len());
        let mut index: HashMap<Txid, usize> = HashMap::with_capacity(flat.len());
        let mut raw_children = Vec::with_capacity(flat.len());
        for (i, record) in flat.into_iter().enumerate() {
            let txid = record.psbt.unsigned_tx.compute_txid();
            if index.insert(txid, i).is_some() {
                return Err(TreeError::DuplicateNodeId(txid));
            }
            raw_children.push(record.children);
            nodes.push(TxTreeNode {
                psbt: record.psbt,
                txid,
                children: BTreeMap::new(),
                parent: None,
            });
        }

        // The root is the one id no children map refers to.
        let referenced: HashSet<Txid> =
            raw_children.iter().flat_map(|c| c.values().copied()).collect();
        let mut candidates = nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !referenced.contains(&node.txid));
        let root = match (candidates.next(), candidates.next()) {
            (None, _) => return Err(TreeError::NoRootFound),
            (Some((i, _)), None) => i,
            (Some(_), Some(_)) => return Err(TreeError::MultipleRootsFound),
        };

        // Resolve child references through the index.
        for (i, children) in raw_children.into_iter().enumerate() {
            for (vout, child_txid) in children {
                let child = *index
                    .get(&child_txid)
                    .ok_or(TreeError::DanglingChildReference(child_txid))?;
                nodes[i].children.insert(vout, child);
                nodes[child].parent = Some((i, vout));
            }
        }

        // Everything in the list must hang off the root.
        let mut visited = vec![false; nodes.len()];
        let mut stack = vec![root];
        let mut reachable = 0usize;
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            reachable += 1;
            stack.extend(nodes[i].children.values().copied());
        }
        if reachable != nodes.len() {
            return Err(TreeError::NodeCountMismatch { expected: nodes.len(), reachable });
        }

        log::debug!("reconstructed settlement tree with {} nodes", nodes.len());
        Ok(TxTree { nodes, root })
    }

    pub fn root(&self) -> &TxTreeNode {
        &self.nodes[self.root]
    }

    pub fn nb_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Pre-order traversal: a node before its children, children in
    /// ascending output-index order.
    pub fn iter(&self) -> TxTreeIter<'_> {
        TxTreeIter { tree: self, stack: vec![self.root] }
    }

    /// The nodes with no children, in traversal order.
    pub fn leaves(&self) -> impl Iterator<Item = &TxTreeNode> + '_ {
        self.iter().filter(|node| node.is_leaf())
    }

    /// A node's children, in ascending output-index order.
    pub fn children<'a>(
        &'a self,
        node: &'a TxTreeNode,
    ) -> impl Iterator<Item = (u32, &'a TxTreeNode)> + 'a {
        node.children
            .iter()
            .map(move |(vout, idx)| (*vout, &self.nodes[*idx]))
    }

    /// A node's parent and the output index it spends, if it is not the root.
    pub fn parent(&self, node: &TxTreeNode) -> Option<(&TxTreeNode, u32)> {
        node.parent.map(|(idx, vout)| (&self.nodes[idx], vout))
    }

    /// Pre-order search by node id.
    pub fn find(&self, txid: Txid) -> Option<&TxTreeNode> {
        self.iter().find(|node| node.txid == txid)
    }

    /// Locate a node by id and mutate its transaction in place.
    ///
    /// The cached id of the slot is refreshed afterwards; attaching witness
    /// data never changes it, but the cache must not be trusted across an
    /// arbitrary mutation.
    pub fn update<F>(&mut self, txid: Txid, mutate: F) -> Result<(), TreeError>
    where
        F: FnOnce(&mut Psbt),
    {
        let mut stack = vec![self.root];
        while let Some(i) = stack.pop() {
            if self.nodes[i].txid == txid {
                mutate(&mut self.nodes[i].psbt);
                self.nodes[i].txid = self.nodes[i].psbt.unsigned_tx.compute_txid();
                return Ok(());
            }
            for idx in self.nodes[i].children.values().rev() {
                stack.push(*idx);
            }
        }
        Err(TreeError::NodeNotFound(txid))
    }

    /// Check the structural and value-conservation invariants.
    ///
    /// Every node spends exactly one output, keeps one output free for the
    /// anchor, is spent by each of its children at the declared index, and
    /// passes each child exactly the value of the output it spends.
    pub fn validate(&self) -> Result<(), TreeError> {
        if self.nodes.is_empty() {
            return Err(TreeError::MissingRoot);
        }
        for node in self.iter() {
            let tx = node.transaction();
            if tx.input.len() != 1 {
                return Err(TreeError::WrongInputCount(node.txid));
            }
            if node.children.len() > tx.output.len().saturating_sub(1) {
                return Err(TreeError::TooManyChildren(node.txid));
            }
            for (vout, child) in self.children(node) {
                let child_tx = child.transaction();
                let matches_edge = child_tx.input.first().is_some_and(|input| {
                    input.previous_output.txid == node.txid
                        && input.previous_output.vout == vout
                });
                if !matches_edge {
                    return Err(TreeError::ChildParentLinkMismatch(child.txid));
                }

                let parent_output = tx
                    .output
                    .get(vout as usize)
                    .ok_or(TreeError::ChildParentLinkMismatch(child.txid))?;
                let child_sum: Amount = child_tx.output.iter().map(|o| o.value).sum();
                if child_sum != parent_output.value {
                    return Err(TreeError::ValueConservationViolation(child.txid));
                }
            }
        }
        Ok(())
    }
}

pub struct TxTreeIter<'a> {
    tree: &'a TxTree,
    stack: Vec<usize>,
}

impl<'a> Iterator for TxTreeIter<'a> {
    type Item = &'a TxTreeNode;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.stack.pop()?;
        let node = &self.tree.nodes[i];
        // Reverse push so the smallest output index pops first.
        for idx in node.children.values().rev() {
            self.stack.push(*idx);
        }
        Some(node)
    }
}

/// The zero-value pay-to-anchor output reserved on every node for
/// child-pays-for-parent fee bumping.
pub fn anchor_output() -> TxOut {
    TxOut {
        value: Amount::ZERO,
        script_pubkey: ScriptBuf::from_bytes(vec![0x51, 0x02, 0x4e, 0x73]),
    }
}
