//! vtxokit-psbt
//!
//! Custom per-input PSBT key/value fields used by settlement trees.
//!
//! Protocol data that has no standard PSBT slot rides in each input's
//! `unknown` map. Every field shares one key-type byte and is distinguished
//! by a string key prefix; fields that may repeat per input (one cosigner
//! key per party) append a one-byte index suffix to the prefix:
//!
//! | field       | key                      | value                          |
//! |-------------|--------------------------|--------------------------------|
//! | cosigner    | `"cosigner" ++ [index]`  | 32-byte x-only public key      |
//! | condition   | `"condition"`            | consensus-serialized witness   |
//! | expiry      | `"expiry"`               | 4-byte LE consensus locktime   |

use bitcoin::absolute::LockTime;
use bitcoin::consensus;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt::{raw, Input};
use bitcoin::Witness;
use thiserror::Error;

/// The key-type byte shared by all custom fields.
pub const FIELD_KEY_TYPE: u8 = 0xff;

/// Key prefix for per-party cosigner public keys.
pub const COSIGNER_KEY_PREFIX: &[u8] = b"cosigner";

/// Key for the witness satisfying a condition script.
pub const CONDITION_WITNESS_KEY: &[u8] = b"condition";

/// Key for the tree expiry locktime.
pub const TREE_EXPIRY_KEY: &[u8] = b"expiry";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PsbtFieldError {
    #[error("cosigner field does not hold a 32-byte x-only key")]
    InvalidCosignerKey,

    #[error("condition witness field does not hold a consensus witness")]
    InvalidConditionWitness,

    #[error("expiry field does not hold a 4-byte locktime")]
    InvalidExpiry,
}

fn field_key(key: Vec<u8>) -> raw::Key {
    raw::Key { type_value: FIELD_KEY_TYPE, key }
}

fn cosigner_field_key(index: u8) -> raw::Key {
    let mut key = COSIGNER_KEY_PREFIX.to_vec();
    key.push(index);
    field_key(key)
}

/// Record the cosigner set on an input, one field per party.
pub fn set_cosigner_keys(input: &mut Input, keys: &[XOnlyPublicKey]) {
    for (index, key) in keys.iter().enumerate() {
        input
            .unknown
            .insert(cosigner_field_key(index as u8), key.serialize().to_vec());
    }
}

/// Read the cosigner set from an input, ordered by index suffix.
///
/// An input without cosigner fields reads as an empty set.
pub fn cosigner_keys(input: &Input) -> Result<Vec<XOnlyPublicKey>, PsbtFieldError> {
    let mut found = Vec::new();
    for (key, value) in &input.unknown {
        if key.type_value != FIELD_KEY_TYPE {
            continue;
        }
        if let Some(suffix) = key.key.strip_prefix(COSIGNER_KEY_PREFIX) {
            if suffix.len() != 1 {
                continue;
            }
            let pubkey = XOnlyPublicKey::from_slice(value)
                .map_err(|_| PsbtFieldError::InvalidCosignerKey)?;
            found.push((suffix[0], pubkey));
        }
    }
    found.sort_by_key(|(index, _)| *index);
    Ok(found.into_iter().map(|(_, key)| key).collect())
}

/// Attach the witness satisfying an input's condition script.
pub fn set_condition_witness(input: &mut Input, witness: &Witness) {
    input.unknown.insert(
        field_key(CONDITION_WITNESS_KEY.to_vec()),
        consensus::serialize(witness),
    );
}

/// Read the condition witness, if present.
pub fn condition_witness(input: &Input) -> Result<Option<Witness>, PsbtFieldError> {
    match input.unknown.get(&field_key(CONDITION_WITNESS_KEY.to_vec())) {
        None => Ok(None),
        Some(value) => consensus::deserialize(value)
            .map(Some)
            .map_err(|_| PsbtFieldError::InvalidConditionWitness),
    }
}

/// Record the settlement tree's expiry locktime on an input.
pub fn set_tree_expiry(input: &mut Input, expiry: LockTime) {
    input.unknown.insert(
        field_key(TREE_EXPIRY_KEY.to_vec()),
        expiry.to_consensus_u32().to_le_bytes().to_vec(),
    );
}

/// Read the tree expiry locktime, if present.
pub fn tree_expiry(input: &Input) -> Result<Option<LockTime>, PsbtFieldError> {
    match input.unknown.get(&field_key(TREE_EXPIRY_KEY.to_vec())) {
        None => Ok(None),
        Some(value) => {
            let bytes: [u8; 4] = value
                .as_slice()
                .try_into()
                .map_err(|_| PsbtFieldError::InvalidExpiry)?;
            Ok(Some(LockTime::from_consensus(u32::from_le_bytes(bytes))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn test_key(seed_byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[31] = seed_byte;
        bytes[0] = 0x01;
        let sk = SecretKey::from_slice(&bytes).unwrap();
        sk.public_key(&secp).x_only_public_key().0
    }

    #[test]
    fn cosigner_keys_roundtrip_in_order() {
        let keys = vec![test_key(3), test_key(1), test_key(2)];
        let mut input = Input::default();
        set_cosigner_keys(&mut input, &keys);

        // One field per party.
        assert_eq!(input.unknown.len(), 3);
        assert_eq!(cosigner_keys(&input).unwrap(), keys);
    }

    #[test]
    fn missing_cosigner_fields_read_empty() {
        let input = Input::default();
        assert!(cosigner_keys(&input).unwrap().is_empty());
    }

    #[test]
    fn malformed_cosigner_key_rejected() {
        let mut input = Input::default();
        input
            .unknown
            .insert(cosigner_field_key(0), vec![0u8; 31]);
        assert_eq!(
            cosigner_keys(&input),
            Err(PsbtFieldError::InvalidCosignerKey)
        );
    }

    #[test]
    fn foreign_fields_are_ignored() {
        let mut input = Input::default();
        input.unknown.insert(
            raw::Key { type_value: 0xde, key: b"cosigner\x00".to_vec() },
            test_key(1).serialize().to_vec(),
        );
        assert!(cosigner_keys(&input).unwrap().is_empty());
    }

    #[test]
    fn condition_witness_roundtrip() {
        let mut witness = Witness::new();
        witness.push([0xab; 32]);
        witness.push([0x01]);

        let mut input = Input::default();
        assert_eq!(condition_witness(&input), Ok(None));
        set_condition_witness(&mut input, &witness);
        assert_eq!(condition_witness(&input).unwrap(), Some(witness));
    }

    #[test]
    fn malformed_condition_witness_rejected() {
        let mut input = Input::default();
        input.unknown.insert(
            field_key(CONDITION_WITNESS_KEY.to_vec()),
            vec![0xff, 0xff, 0xff],
        );
        assert_eq!(
            condition_witness(&input),
            Err(PsbtFieldError::InvalidConditionWitness)
        );
    }

    #[test]
    fn tree_expiry_roundtrip() {
        let mut input = Input::default();
        assert_eq!(tree_expiry(&input), Ok(None));

        let expiry = LockTime::from_consensus(870_000);
        set_tree_expiry(&mut input, expiry);
        assert_eq!(tree_expiry(&input).unwrap(), Some(expiry));
    }

    #[test]
    fn malformed_expiry_rejected() {
        let mut input = Input::default();
        input
            .unknown
            .insert(field_key(TREE_EXPIRY_KEY.to_vec()), vec![0x01, 0x02]);
        assert_eq!(tree_expiry(&input), Err(PsbtFieldError::InvalidExpiry));
    }
}
