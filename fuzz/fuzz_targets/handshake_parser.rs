#![no_main]

use libfuzzer_sys::fuzz_target;
use wavecore::handshake::{parse_request, respond};

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((request, _consumed))) = parse_request(data) {
        let _ = respond(&request, |_offered| None);
    }
});
