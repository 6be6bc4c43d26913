#![no_main]
use libfuzzer_sys::fuzz_target;
use ppmd_stream::{IncrementalDecoder, Ppmd7Decoder};

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }

    // First bytes pick the model, the chunk size and the per-call quota
    let order = u32::from(data[0] % 63) + 2;
    let chunk = usize::from(data[1]) + 1;
    let quota = usize::from(data[2]) * 16;
    let compressed = &data[4..];

    let Ok(mut decoder) = Ppmd7Decoder::new(order, 1 << 16) else {
        return;
    };
    let mut produced = 0usize;
    for piece in compressed.chunks(chunk) {
        match decoder.feed(piece, Some(quota)) {
            Ok(out) => {
                assert!(out.len() <= quota);
                produced += out.len();
            }
            Err(e) => {
                assert!(decoder.eof() || !e.is_fatal());
                return;
            }
        }
        if decoder.eof() || produced > 1 << 20 {
            return;
        }
    }
    let _ = decoder.flush(quota);
});
