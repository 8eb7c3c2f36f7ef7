//! Virtual hash-time-locked contracts.
//!
//! A VHTLC is a vtxo script with claim and refund paths gated by a hash
//! preimage and timelocks:
//!
//! - claim: receiver + server, with the preimage
//! - refund: sender + receiver + server, any time
//! - refund without receiver: sender + server, after an absolute locktime
//! - unilateral claim: receiver alone, preimage plus a relative delay
//! - unilateral refund: sender + receiver, after a relative delay
//! - unilateral refund without receiver: sender alone, after a relative delay
//!
//! Relative delays ride in the 512-second-granular nSequence field, so every
//! seconds delay must be at least 512 and a multiple of 512. The codec
//! rejects unaligned values; the floor is enforced here.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{OP_EQUAL, OP_SHA256};
use bitcoin::script::Builder;
use bitcoin::ScriptBuf;
use thiserror::Error;

use crate::script::{VtxoScript, VtxoScriptError};
use crate::tapscript::{
    CltvMultisigParams, ConditionCsvMultisigParams, ConditionMultisigParams, CsvMultisigParams,
    MultisigMode, MultisigParams, RelativeTimelock, TapscriptError, TimelockUnit,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VhtlcError {
    #[error("invalid timelock: {0}")]
    InvalidTimelock(&'static str),

    #[error("refund locktime must be nonzero")]
    ZeroRefundLocktime,

    #[error(transparent)]
    Tapscript(#[from] TapscriptError),

    #[error(transparent)]
    Script(#[from] VtxoScriptError),
}

/// The parameters that pin down one VHTLC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhtlcOptions {
    pub sender: XOnlyPublicKey,
    pub receiver: XOnlyPublicKey,
    pub server: XOnlyPublicKey,
    /// SHA-256 of the payment preimage.
    pub preimage_hash: sha256::Hash,
    /// Absolute locktime gating the refund-without-receiver path.
    pub refund_locktime: u64,
    pub unilateral_claim_delay: RelativeTimelock,
    pub unilateral_refund_delay: RelativeTimelock,
    pub unilateral_refund_without_receiver_delay: RelativeTimelock,
}

/// A built VHTLC: the six leaves and their taproot commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vhtlc {
    options: VhtlcOptions,
    claim: ScriptBuf,
    refund: ScriptBuf,
    refund_without_receiver: ScriptBuf,
    unilateral_claim: ScriptBuf,
    unilateral_refund: ScriptBuf,
    unilateral_refund_without_receiver: ScriptBuf,
    script: VtxoScript,
}

impl Vhtlc {
    pub fn new(options: VhtlcOptions) -> Result<Vhtlc, VhtlcError> {
        validate_delay(&options.unilateral_claim_delay)?;
        validate_delay(&options.unilateral_refund_delay)?;
        validate_delay(&options.unilateral_refund_without_receiver_delay)?;
        if options.refund_locktime == 0 {
            return Err(VhtlcError::ZeroRefundLocktime);
        }

        let condition = preimage_condition(&options.preimage_hash);

        let claim = ConditionMultisigParams::new(
            condition.clone(),
            vec![options.receiver, options.server],
        )
        .to_script()?;

        let refund = MultisigParams::new(
            vec![options.sender, options.receiver, options.server],
            MultisigMode::CheckSig,
        )
        .to_script()?;

        let refund_without_receiver = CltvMultisigParams::new(
            options.refund_locktime,
            vec![options.sender, options.server],
        )
        .to_script()?;

        let unilateral_claim = ConditionCsvMultisigParams::new(
            condition,
            options.unilateral_claim_delay,
            vec![options.receiver],
        )
        .to_script()?;

        let unilateral_refund = CsvMultisigParams::new(
            options.unilateral_refund_delay,
            vec![options.sender, options.receiver],
        )
        .to_script()?;

        let unilateral_refund_without_receiver = CsvMultisigParams::new(
            options.unilateral_refund_without_receiver_delay,
            vec![options.sender],
        )
        .to_script()?;

        let script = VtxoScript::new(vec![
            claim.clone(),
            refund.clone(),
            refund_without_receiver.clone(),
            unilateral_claim.clone(),
            unilateral_refund.clone(),
            unilateral_refund_without_receiver.clone(),
        ])?;

        Ok(Vhtlc {
            options,
            claim,
            refund,
            refund_without_receiver,
            unilateral_claim,
            unilateral_refund,
            unilateral_refund_without_receiver,
            script,
        })
    }

    pub fn options(&self) -> &VhtlcOptions {
        &self.options
    }

    pub fn script(&self) -> &VtxoScript {
        &self.script
    }

    pub fn pk_script(&self) -> ScriptBuf {
        self.script.pk_script()
    }

    pub fn claim_script(&self) -> &ScriptBuf {
        &self.claim
    }

    pub fn refund_script(&self) -> &ScriptBuf {
        &self.refund
    }

    pub fn refund_without_receiver_script(&self) -> &ScriptBuf {
        &self.refund_without_receiver
    }

    pub fn unilateral_claim_script(&self) -> &ScriptBuf {
        &self.unilateral_claim
    }

    pub fn unilateral_refund_script(&self) -> &ScriptBuf {
        &self.unilateral_refund
    }

    pub fn unilateral_refund_without_receiver_script(&self) -> &ScriptBuf {
        &self.unilateral_refund_without_receiver
    }
}

/// `OP_SHA256 <hash> OP_EQUAL` — the preimage condition used by the claim
/// paths.
fn preimage_condition(hash: &sha256::Hash) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hash.to_byte_array())
        .push_opcode(OP_EQUAL)
        .into_script()
}

fn validate_delay(delay: &RelativeTimelock) -> Result<(), VhtlcError> {
    match delay.unit {
        TimelockUnit::Seconds => {
            if delay.value < 512 {
                return Err(VhtlcError::InvalidTimelock("seconds delay below 512"));
            }
            if delay.value % 512 != 0 {
                return Err(VhtlcError::InvalidTimelock(
                    "seconds delay is not a multiple of 512",
                ));
            }
        }
        TimelockUnit::Blocks => {
            if delay.value == 0 {
                return Err(VhtlcError::InvalidTimelock("zero block delay"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tapscript::Tapscript;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_key(seed_byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[31] = seed_byte;
        bytes[0] = 0x01;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        sk.public_key(&secp).x_only_public_key().0
    }

    fn options() -> VhtlcOptions {
        VhtlcOptions {
            sender: test_key(1),
            receiver: test_key(2),
            server: test_key(3),
            preimage_hash: sha256::Hash::hash(b"preimage"),
            refund_locktime: 850_000,
            unilateral_claim_delay: RelativeTimelock::seconds(512),
            unilateral_refund_delay: RelativeTimelock::blocks(144),
            unilateral_refund_without_receiver_delay: RelativeTimelock::seconds(1024),
        }
    }

    #[test]
    fn builds_six_leaves() {
        let vhtlc = Vhtlc::new(options()).unwrap();
        assert_eq!(vhtlc.script().leaf_scripts().len(), 6);
        assert!(vhtlc.pk_script().is_p2tr());
    }

    #[test]
    fn leaves_decode_to_expected_templates() {
        let vhtlc = Vhtlc::new(options()).unwrap();
        assert!(matches!(
            Tapscript::decode_any(vhtlc.claim_script()).unwrap(),
            Tapscript::ConditionMultisig(_)
        ));
        assert!(matches!(
            Tapscript::decode_any(vhtlc.refund_script()).unwrap(),
            Tapscript::Multisig(_)
        ));
        assert!(matches!(
            Tapscript::decode_any(vhtlc.refund_without_receiver_script()).unwrap(),
            Tapscript::CltvMultisig(_)
        ));
        assert!(matches!(
            Tapscript::decode_any(vhtlc.unilateral_claim_script()).unwrap(),
            Tapscript::ConditionCsvMultisig(_)
        ));
        assert!(matches!(
            Tapscript::decode_any(vhtlc.unilateral_refund_script()).unwrap(),
            Tapscript::CsvMultisig(_)
        ));
    }

    #[test]
    fn exit_paths_are_the_unilateral_leaves() {
        let vhtlc = Vhtlc::new(options()).unwrap();
        // unilateral claim (condition CSV) + two unilateral refunds (CSV)
        assert_eq!(vhtlc.script().exit_paths().count(), 3);
    }

    #[test]
    fn rejects_short_seconds_delay() {
        let mut opts = options();
        opts.unilateral_claim_delay = RelativeTimelock::seconds(300);
        assert!(matches!(
            Vhtlc::new(opts),
            Err(VhtlcError::InvalidTimelock(_))
        ));
    }

    #[test]
    fn rejects_unaligned_seconds_delay() {
        let mut opts = options();
        opts.unilateral_refund_delay = RelativeTimelock::seconds(700);
        assert!(matches!(
            Vhtlc::new(opts),
            Err(VhtlcError::InvalidTimelock(_))
        ));
    }

    #[test]
    fn rejects_zero_refund_locktime() {
        let mut opts = options();
        opts.refund_locktime = 0;
        assert_eq!(Vhtlc::new(opts), Err(VhtlcError::ZeroRefundLocktime));
    }

    #[test]
    fn deterministic_output_key() {
        let a = Vhtlc::new(options()).unwrap();
        let b = Vhtlc::new(options()).unwrap();
        assert_eq!(a.script().output_key(), b.script().output_key());
    }
}
