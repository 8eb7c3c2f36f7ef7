#![no_main]

use libfuzzer_sys::fuzz_target;
use vtxokit_script::VtxoScript;

fuzz_target!(|data: &[u8]| {
    if let Ok(script) = VtxoScript::deserialize(data) {
        // A successful decode must re-serialize to something that decodes
        // to the same leaf set (the wire depth byte is normalized to 1).
        let bytes = script.serialize();
        let again = VtxoScript::deserialize(&bytes).expect("reserialization must decode");
        assert_eq!(again.leaf_scripts(), script.leaf_scripts());
    }
});
