#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use session_wire::core::ByteBuffer;
use session_wire::protocol::message::SessionMessage;

fuzz_target!(|data: &[u8]| {
    // Session messages straight off the wire
    if let Ok(message) = SessionMessage::decode(Bytes::copy_from_slice(data)) {
        if let Ok(buffer) = message.to_buffer() {
            let _ = SessionMessage::decode(buffer.to_bytes());
        }
    }

    // Mixed reads from the same input must never panic
    let mut reader = ByteBuffer::reader_from_slice(data);
    let _ = reader.read_string();
    let _ = reader.read_array::<u16>();
    let _ = reader.read_blob();
    let _ = reader.read::<uuid::Uuid>();
});
