#![no_main]

use libfuzzer_sys::fuzz_target;
use session_wire::core::frame::{FrameDecoder, FrameEncoder};

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames: no panics, no unbounded allocation
    let mut decoder = FrameDecoder::new(1024 * 1024);
    let _ = decoder.decode(data);

    // Any payload survives the codec
    if let Ok(frame) = FrameEncoder::default().encode(data) {
        let mut decoder = FrameDecoder::default();
        let decoded = decoder.decode(&frame).map(<[u8]>::to_vec);
        assert_eq!(decoded.ok().as_deref(), Some(data));
    }
});
