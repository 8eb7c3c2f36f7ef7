//! Taproot vtxo output scripts.
//!
//! A [`VtxoScript`] is an ordered list of leaf scripts committed into a
//! taproot output under a fixed, provably unspendable internal key, so the
//! output can only ever be spent through one of its leaves.
//!
//! The leaf list travels over the wire in a flat binary form: a compact-size
//! leaf count, then per leaf `[depth][leaf version][compact-size len][script]`.
//! The depth byte is always written as 1; the wire format describes the set
//! of leaves, not the shape of the commitment tree.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use bitcoin::{Script, ScriptBuf};
use thiserror::Error;

use crate::tapscript::Tapscript;

/// The BIP-341 "nothing up my sleeve" point. No one knows a discrete log for
/// it, so key-path spending is impossible for outputs built on it.
pub const UNSPENDABLE_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a,
    0x5e, 0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80,
    0x3a, 0xc0,
];

/// The unspendable internal key shared by every vtxo output.
pub fn unspendable_internal_key() -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&UNSPENDABLE_KEY).expect("constant key is valid")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VtxoScriptError {
    #[error("a vtxo script needs at least one leaf")]
    EmptyLeafSet,

    #[error("taproot tree construction did not yield a proof for every leaf")]
    TreeConstructionFailed,

    #[error("no leaf with the given script")]
    LeafNotFound,

    #[error("truncated leaf list encoding")]
    TruncatedEncoding,

    #[error("trailing bytes after leaf list")]
    TrailingBytes,

    #[error("unsupported leaf version {0:#04x}")]
    UnsupportedLeafVersion(u8),
}

/// Everything needed to spend one leaf: the leaf script plus its control
/// block (leaf version, internal key and merkle path).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TapLeafProof {
    pub script: ScriptBuf,
    pub control_block: ControlBlock,
}

impl TapLeafProof {
    pub fn leaf_version(&self) -> LeafVersion {
        self.control_block.leaf_version
    }

    pub fn internal_key(&self) -> XOnlyPublicKey {
        self.control_block.internal_key
    }
}

/// An ordered leaf set committed into a taproot output.
///
/// Immutable once built; the tweaked output key is a pure function of the
/// leaf set.
#[derive(Debug, Clone)]
pub struct VtxoScript {
    scripts: Vec<ScriptBuf>,
    spend_info: TaprootSpendInfo,
}

impl PartialEq for VtxoScript {
    fn eq(&self, other: &Self) -> bool {
        self.scripts == other.scripts
    }
}

impl Eq for VtxoScript {}

impl VtxoScript {
    /// Build the taproot commitment for an ordered list of leaf scripts.
    pub fn new(scripts: Vec<ScriptBuf>) -> Result<VtxoScript, VtxoScriptError> {
        if scripts.is_empty() {
            return Err(VtxoScriptError::EmptyLeafSet);
        }

        let secp = Secp256k1::verification_only();
        let weighted = scripts.iter().map(|s| (1u32, s.clone()));
        let spend_info = TaprootBuilder::with_huffman_tree(weighted)
            .map_err(|_| VtxoScriptError::TreeConstructionFailed)?
            .finalize(&secp, unspendable_internal_key())
            .map_err(|_| VtxoScriptError::TreeConstructionFailed)?;

        // Every input leaf must have come out the other side with a proof.
        for script in &scripts {
            if spend_info
                .control_block(&(script.clone(), LeafVersion::TapScript))
                .is_none()
            {
                return Err(VtxoScriptError::TreeConstructionFailed);
            }
        }

        Ok(VtxoScript { scripts, spend_info })
    }

    /// The leaf scripts, in their original order.
    pub fn leaf_scripts(&self) -> &[ScriptBuf] {
        &self.scripts
    }

    /// The tweaked taproot output key.
    pub fn output_key(&self) -> XOnlyPublicKey {
        self.spend_info.output_key().to_x_only_public_key()
    }

    /// The output script: `OP_1 <tweaked output key>`.
    pub fn pk_script(&self) -> ScriptBuf {
        ScriptBuf::new_p2tr_tweaked(self.spend_info.output_key())
    }

    pub fn spend_info(&self) -> &TaprootSpendInfo {
        &self.spend_info
    }

    /// The spend proof for the leaf with the given script.
    pub fn leaf_proof(&self, script: &Script) -> Result<TapLeafProof, VtxoScriptError> {
        if !self.scripts.iter().any(|s| s.as_script() == script) {
            return Err(VtxoScriptError::LeafNotFound);
        }
        let control_block = self
            .spend_info
            .control_block(&(script.to_owned(), LeafVersion::TapScript))
            .ok_or(VtxoScriptError::LeafNotFound)?;
        Ok(TapLeafProof { script: script.to_owned(), control_block })
    }

    /// The leaves a holder can take without the server: those that decode as
    /// CSV or condition-CSV multisigs. Leaves matching neither template are
    /// skipped.
    pub fn exit_paths(&self) -> impl Iterator<Item = (&ScriptBuf, Tapscript)> + '_ {
        self.scripts.iter().filter_map(|script| {
            match Tapscript::decode_any(script) {
                Ok(decoded @ Tapscript::CsvMultisig(_))
                | Ok(decoded @ Tapscript::ConditionCsvMultisig(_)) => Some((script, decoded)),
                _ => None,
            }
        })
    }

    /// Serialize the leaf list to the flat wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_compact_size(&mut buf, self.scripts.len() as u64);
        for script in &self.scripts {
            buf.push(1); // flat wire format: every leaf at depth 1
            buf.push(LeafVersion::TapScript.to_consensus());
            write_compact_size(&mut buf, script.len() as u64);
            buf.extend_from_slice(script.as_bytes());
        }
        buf
    }

    /// Decode a leaf list from the flat wire form and rebuild the taproot
    /// commitment.
    pub fn deserialize(bytes: &[u8]) -> Result<VtxoScript, VtxoScriptError> {
        let mut data = bytes;
        let count = read_compact_size(&mut data)?;
        let mut scripts = Vec::with_capacity(count.min(256) as usize);
        for _ in 0..count {
            let _depth = take(&mut data, 1)?[0];
            let version = take(&mut data, 1)?[0];
            if version != LeafVersion::TapScript.to_consensus() {
                return Err(VtxoScriptError::UnsupportedLeafVersion(version));
            }
            let len = read_compact_size(&mut data)? as usize;
            let script = take(&mut data, len)?;
            scripts.push(ScriptBuf::from_bytes(script.to_vec()));
        }
        if !data.is_empty() {
            return Err(VtxoScriptError::TrailingBytes);
        }
        VtxoScript::new(scripts)
    }
}

// --- Compact-size wire primitives ---

fn write_compact_size(buf: &mut Vec<u8>, n: u64) {
    match n {
        0..=0xfc => buf.push(n as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn read_compact_size(data: &mut &[u8]) -> Result<u64, VtxoScriptError> {
    let marker = take(data, 1)?[0];
    Ok(match marker {
        0xfd => u16::from_le_bytes(take(data, 2)?.try_into().expect("length checked")) as u64,
        0xfe => u32::from_le_bytes(take(data, 4)?.try_into().expect("length checked")) as u64,
        0xff => u64::from_le_bytes(take(data, 8)?.try_into().expect("length checked")),
        n => n as u64,
    })
}

fn take<'a>(data: &mut &'a [u8], n: usize) -> Result<&'a [u8], VtxoScriptError> {
    if data.len() < n {
        return Err(VtxoScriptError::TruncatedEncoding);
    }
    let (head, tail) = data.split_at(n);
    *data = tail;
    Ok(head)
}
