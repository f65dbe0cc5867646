#![no_main]

use libfuzzer_sys::fuzz_target;
use session_wire::utils::compression::{compress_block, compress_if_smaller, decompress_block_into};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    // Whatever compresses must decompress to the same bytes
    let compressed = compress_block(data);
    let mut out = vec![0u8; data.len()];
    let written = decompress_block_into(&compressed, &mut out).unwrap_or(usize::MAX);
    assert_eq!(written, data.len());
    assert_eq!(&out[..], data);

    if let Some(smaller) = compress_if_smaller(data, 128) {
        assert!(smaller.len() < data.len());
    }

    // Malformed blocks fail cleanly, even into a short output
    let mut scratch = vec![0u8; 4096];
    let _ = decompress_block_into(data, &mut scratch);
    let _ = decompress_block_into(data, &mut []);
});
