#![no_main]
use libfuzzer_sys::fuzz_target;
use ppmd_stream::decompress::ppm::Ppmd7Encoder;
use ppmd_stream::{IncrementalDecoder, Ppmd7Decoder, ThreadedPpmd7Decoder};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 || data.len() > 4096 {
        return;
    }

    let chunk = usize::from(data[0] % 32) + 1;
    let plain = &data[1..];
    let Ok(packed) = Ppmd7Encoder::compress(plain, 6, 1 << 16, true) else {
        return;
    };

    let mut direct = Ppmd7Decoder::new(6, 1 << 16).expect("open direct");
    let mut bridged = ThreadedPpmd7Decoder::new(6, 1 << 16).expect("open bridge");
    let mut out = Vec::new();
    for piece in packed.chunks(chunk) {
        let a = direct.feed(piece, None).expect("direct decode");
        let b = bridged.feed(piece, None).expect("bridge decode");
        assert_eq!(a, b);
        assert_eq!(direct.eof(), bridged.eof());
        assert_eq!(direct.needs_input(), bridged.needs_input());
        out.extend(a);
    }
    assert!(direct.eof());
    assert_eq!(out, plain);
});
