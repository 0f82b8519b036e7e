#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use wavecore::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let decoder = Decoder::new(1 << 20);
    let mut buf = BytesMut::from(data);
    while !buf.is_empty() {
        match decoder.decode_frame(&mut buf) {
            Ok(wavecore::codec::Decoded::Frame(_)) => continue,
            _ => break,
        }
    }
});
