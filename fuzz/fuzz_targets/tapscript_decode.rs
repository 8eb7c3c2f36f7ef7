#![no_main]

use libfuzzer_sys::fuzz_target;
use vtxokit_script::Tapscript;

fuzz_target!(|data: &[u8]| {
    let script = bitcoin::Script::from_bytes(data);
    if let Ok(decoded) = Tapscript::decode_any(script) {
        // Anything that decodes must re-encode to the exact input bytes.
        let reencoded = decoded.to_script().unwrap();
        assert_eq!(reencoded.as_bytes(), data);
    }
});
