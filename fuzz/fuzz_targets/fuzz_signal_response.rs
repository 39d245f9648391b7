#![no_main]

use libfuzzer_sys::fuzz_target;

use roomwire_client::protocol::{decode_response, decode_response_json};

fuzz_target!(|data: &[u8]| {
    // The binary wire path.
    let _ = decode_response(data);

    // The JSON fallback path, for inputs that happen to be valid UTF-8.
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = decode_response_json(text);
    }
});
