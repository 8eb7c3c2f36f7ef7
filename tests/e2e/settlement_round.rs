//! A full settlement round over a two-leaf tree.
//!
//! The batch output (3000 sat) splits into two vtxos of 1000 and 2000 sat.
//! The tree author is the only client cosigner; every node key is the
//! MuSig2 aggregate of the cosigner set tweaked by the server's sweep
//! script root. The round is reconstructed from wire records, validated
//! structurally and against the commitment transaction, signed in a full
//! two-round ceremony, and audited with the finalized-tree verifier.

use std::collections::BTreeMap;

use base64::Engine;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::key::TweakedPublicKey;
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::taproot::{LeafVersion, TapLeafHash, TapNodeHash};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Psbt, ScriptBuf, Sequence, TapSighashType, Transaction, TxIn, TxOut, Txid,
    Witness, XOnlyPublicKey,
};

use vtxokit_script::{CsvMultisigParams, DefaultVtxoScript, RelativeTimelock};
use vtxokit_tree::{
    anchor_output, musig, signing, validate_connector_graph, validate_settlement_tree,
    verify_finalized_tree, FlatTreeNode, TreeSignerSession, TxTree, WireTreeNode,
    CONNECTOR_OUTPUT_INDEX,
};

fn test_keypair(seed_byte: u8) -> Keypair {
    let secp = Secp256k1::new();
    let mut bytes = [0u8; 32];
    bytes[31] = seed_byte;
    bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&bytes).unwrap();
    Keypair::from_secret_key(&secp, &sk)
}

fn p2tr_script(key: XOnlyPublicKey) -> ScriptBuf {
    ScriptBuf::new_p2tr_tweaked(TweakedPublicKey::dangerous_assume_tweaked(key))
}

fn unsigned_tx(prev: OutPoint, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version(3),
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: prev,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ZERO,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

fn cosigned_node(prev: OutPoint, outputs: Vec<TxOut>, cosigners: &[XOnlyPublicKey]) -> Psbt {
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(prev, outputs)).unwrap();
    vtxokit_psbt::set_cosigner_keys(&mut psbt.inputs[0], cosigners);
    psbt
}

/// The merkle root of the server's sweep leaf, used to tweak every node key.
fn sweep_script_root(server: XOnlyPublicKey) -> TapNodeHash {
    let sweep_script = CsvMultisigParams::new(RelativeTimelock::blocks(4320), vec![server])
        .to_script()
        .unwrap();
    TapNodeHash::from(TapLeafHash::from_script(
        &sweep_script,
        LeafVersion::TapScript,
    ))
}

struct Round {
    commitment: Psbt,
    tree: TxTree,
    sweep_root: TapNodeHash,
    node_aggregate: XOnlyPublicKey,
    user: Keypair,
}

/// Build the round: commitment (3000 batch + 600 connectors) -> root ->
/// leaves of 1000 and 2000 sat, delivered as shuffled wire records.
fn build_round() -> Round {
    let user = test_keypair(2);
    let server = test_keypair(7);
    let user_key = user.x_only_public_key().0;
    let server_key = server.x_only_public_key().0;

    let sweep_root = sweep_script_root(server_key);
    let cosigners = vec![user_key];
    let (_, node_aggregate) = musig::aggregate_keys(&cosigners, Some(sweep_root)).unwrap();

    let vtxo_a = DefaultVtxoScript::new(user_key, server_key, RelativeTimelock::blocks(144))
        .unwrap();
    let vtxo_b = DefaultVtxoScript::new(user_key, server_key, RelativeTimelock::blocks(288))
        .unwrap();

    let commitment = Psbt::from_unsigned_tx(unsigned_tx(
        OutPoint { txid: Txid::from_byte_array([0x0d; 32]), vout: 1 },
        vec![
            TxOut {
                value: Amount::from_sat(3000),
                script_pubkey: p2tr_script(node_aggregate),
            },
            TxOut {
                value: Amount::from_sat(600),
                script_pubkey: p2tr_script(server_key),
            },
        ],
    ))
    .unwrap();

    let root = cosigned_node(
        OutPoint { txid: commitment.unsigned_tx.compute_txid(), vout: 0 },
        vec![
            TxOut {
                value: Amount::from_sat(1000),
                script_pubkey: p2tr_script(node_aggregate),
            },
            TxOut {
                value: Amount::from_sat(2000),
                script_pubkey: p2tr_script(node_aggregate),
            },
            anchor_output(),
        ],
        &cosigners,
    );
    let root_txid = root.unsigned_tx.compute_txid();

    let leaf_a = cosigned_node(
        OutPoint { txid: root_txid, vout: 0 },
        vec![
            TxOut { value: Amount::from_sat(1000), script_pubkey: vtxo_a.pk_script() },
            anchor_output(),
        ],
        &cosigners,
    );
    let leaf_b = cosigned_node(
        OutPoint { txid: root_txid, vout: 1 },
        vec![
            TxOut { value: Amount::from_sat(2000), script_pubkey: vtxo_b.pk_script() },
            anchor_output(),
        ],
        &cosigners,
    );

    let mut root_children = BTreeMap::new();
    root_children.insert(0u32, leaf_a.unsigned_tx.compute_txid().to_string());
    root_children.insert(1u32, leaf_b.unsigned_tx.compute_txid().to_string());

    // The coordinator streams records in no particular order.
    let wire: Vec<WireTreeNode> = vec![
        (leaf_b, BTreeMap::new()),
        (root, root_children),
        (leaf_a, BTreeMap::new()),
    ]
    .into_iter()
    .map(|(psbt, children)| WireTreeNode {
        txid: psbt.unsigned_tx.compute_txid().to_string(),
        tx: base64::engine::general_purpose::STANDARD.encode(psbt.serialize()),
        children,
    })
    .collect();

    // Through JSON, as delivered by the tree streaming endpoint.
    let json = serde_json::to_string(&wire).unwrap();
    let parsed: Vec<WireTreeNode> = serde_json::from_str(&json).unwrap();
    let flat = parsed
        .iter()
        .map(|record| FlatTreeNode::from_wire(record).unwrap())
        .collect::<Vec<_>>();

    let tree = TxTree::reconstruct(flat).unwrap();
    Round { commitment, tree, sweep_root, node_aggregate, user }
}

#[test]
fn settlement_round_end_to_end() {
    let round = build_round();
    let shared = Amount::from_sat(3000);

    // Structure and value conservation.
    assert_eq!(round.tree.nb_nodes(), 3);
    assert_eq!(round.tree.leaves().count(), 2);
    round.tree.validate().unwrap();

    // The tree is anchored to the commitment and cosigner-bound.
    validate_settlement_tree(
        &round.tree,
        &round.commitment.unsigned_tx,
        0,
        round.sweep_root,
    )
    .unwrap();

    // Two-round signing ceremony, single client cosigner.
    let mut session = TreeSignerSession::new(round.user);
    session.init(&round.tree, round.sweep_root, shared).unwrap();
    let nonces = session.generate_nonces().unwrap();
    assert_eq!(nonces.len(), 3);

    let aggregated: signing::TreeAggNonces = nonces
        .iter()
        .map(|(txid, public)| (*txid, musig::aggregate_nonces(&[public.clone()])))
        .collect();
    session.set_aggregated_nonces(aggregated.clone()).unwrap();

    let partials = session.sign().unwrap();
    assert_eq!(partials.len(), 3);

    let finalized = signing::aggregate_tree_signatures(
        &round.tree,
        round.sweep_root,
        shared,
        &aggregated,
        &[partials],
    )
    .unwrap();
    assert_eq!(finalized.len(), 3);

    drop(session);
    let mut tree = round.tree;
    for (txid, signature) in finalized {
        tree.update(txid, |psbt| {
            psbt.inputs[0].tap_key_sig = Some(bitcoin::taproot::Signature {
                signature,
                sighash_type: TapSighashType::Default,
            });
        })
        .unwrap();
    }

    // Any participant can audit the finished tree.
    verify_finalized_tree(round.node_aggregate, shared, &tree).unwrap();

    // Both leaf outputs pay into taproot vtxo scripts.
    for leaf in tree.leaves() {
        assert!(leaf.transaction().output[0].script_pubkey.is_p2tr());
    }
}

#[test]
fn tampered_leaf_amount_fails_validation() {
    let round = build_round();

    let leaf_txid = round
        .tree
        .leaves()
        .find(|leaf| leaf.transaction().output[0].value == Amount::from_sat(2000))
        .unwrap()
        .txid();

    let mut tree = round.tree;
    tree.update(leaf_txid, |psbt| {
        psbt.unsigned_tx.output[0].value = Amount::from_sat(1999);
    })
    .unwrap();

    assert!(matches!(
        tree.validate(),
        Err(vtxokit_tree::TreeError::ValueConservationViolation(_))
    ));
}

#[test]
fn connector_graph_round() {
    let round = build_round();
    let settlement_b64 =
        base64::engine::general_purpose::STANDARD.encode(round.commitment.serialize());

    let connector_root = Psbt::from_unsigned_tx(unsigned_tx(
        OutPoint {
            txid: round.commitment.unsigned_tx.compute_txid(),
            vout: CONNECTOR_OUTPUT_INDEX,
        },
        vec![
            TxOut {
                value: Amount::from_sat(600),
                script_pubkey: p2tr_script(round.node_aggregate),
            },
        ],
    ))
    .unwrap();
    let connectors =
        TxTree::reconstruct(vec![FlatTreeNode::new(connector_root, BTreeMap::new())]).unwrap();

    validate_connector_graph(&settlement_b64, &connectors).unwrap();
}
