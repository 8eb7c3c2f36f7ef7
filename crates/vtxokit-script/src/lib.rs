//! vtxokit-script
//!
//! Taproot script machinery for batch-settled virtual coins (vtxos).
//!
//! A vtxo is an off-chain coin backed by a taproot output whose script tree
//! is assembled from a small, closed family of leaf templates:
//!
//! - `Multisig` — n-of-n key checks (CHECKSIGVERIFY chain or CHECKSIGADD tally)
//! - `CsvMultisig` — relative timelock (CHECKSEQUENCEVERIFY) in front of a multisig
//! - `CltvMultisig` — absolute timelock (CHECKLOCKTIMEVERIFY) in front of a multisig
//! - `ConditionMultisig` — an arbitrary condition script, VERIFY, then a multisig
//! - `ConditionCsvMultisig` — condition, VERIFY, then a CSV multisig
//!
//! Every template has a canonical byte encoding: decoding re-encodes the
//! parsed parameters and rejects any script that is not byte-for-byte the
//! canonical form. This is what keeps leaf scripts non-malleable on the wire.
//!
//! [`VtxoScript`] assembles an ordered list of leaves into a taproot output
//! (fixed unspendable internal key), hands out per-leaf spend proofs, and
//! (de)serializes the leaf list for transport.
//!
//! [`vhtlc::Vhtlc`] and [`default_vtxo::DefaultVtxoScript`] are the two
//! standard consumers: a virtual hash-time-locked contract and the plain
//! forfeit + unilateral-exit script a wallet uses for ordinary vtxos.

pub mod default_vtxo;
pub mod script;
pub mod tapscript;
pub mod vhtlc;

pub use default_vtxo::{DefaultVtxoError, DefaultVtxoScript};
pub use script::{TapLeafProof, VtxoScript, VtxoScriptError};
pub use tapscript::{
    CltvMultisigParams, ConditionCsvMultisigParams, ConditionMultisigParams, CsvMultisigParams,
    MultisigMode, MultisigParams, RelativeTimelock, Tapscript, TapscriptError, TimelockUnit,
};
pub use vhtlc::{Vhtlc, VhtlcError, VhtlcOptions};
