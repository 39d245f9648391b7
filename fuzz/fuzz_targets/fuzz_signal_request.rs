#![no_main]

use libfuzzer_sys::fuzz_target;

use roomwire_client::protocol::{decode_data_packet, decode_request};

fuzz_target!(|data: &[u8]| {
    // Requests come back to us in server-side tooling and tests.
    let _ = decode_request(data);

    // Data channel payloads are attacker-controlled in open rooms.
    let _ = decode_data_packet(data);
});
