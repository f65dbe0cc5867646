#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Edge-case tests for the codec, buffers and session messages.
//! Boundary sizes, malformed input and misuse must fail cleanly.

use bytes::Bytes;
use session_wire::core::byte_buffer::MAX_BUFFER_SIZE;
use session_wire::core::frame::{FrameDecoder, FrameEncoder, FRAME_HEADER_SIZE};
use session_wire::core::ByteBuffer;
use session_wire::error::{ErrorKind, ProtocolError};
use session_wire::protocol::dispatcher::{Delivery, Dispatcher};
use session_wire::protocol::message::SessionMessage;
use session_wire::utils::compression::compress_block;
use uuid::Uuid;

// ============================================================================
// FRAME EDGE CASES
// ============================================================================

#[test]
fn test_frame_empty_payload() {
    let frame = FrameEncoder::default().encode(&[]).unwrap();
    assert_eq!(&frame[..], &[0, 0, 0, 0, 0]);

    let mut decoder = FrameDecoder::default();
    assert!(decoder.decode(&frame).unwrap().is_empty());
}

#[test]
fn test_frame_empty_input_rejected() {
    let mut decoder = FrameDecoder::default();
    assert!(matches!(decoder.decode(&[]), Err(ProtocolError::InvalidHeader)));
}

#[test]
fn test_frame_truncated_header_rejected() {
    let mut decoder = FrameDecoder::default();
    for len in 1..FRAME_HEADER_SIZE {
        let frame = vec![0u8; len];
        assert!(
            matches!(decoder.decode(&frame), Err(ProtocolError::InvalidHeader)),
            "header of {len} bytes"
        );
    }
}

#[test]
fn test_frame_unknown_flag_passes_through() {
    let frame = [0x7F, 1, 2, 3];
    let mut decoder = FrameDecoder::default();
    assert_eq!(decoder.decode(&frame).unwrap(), &frame[..]);
}

#[test]
fn test_frame_length_mismatch_rejected() {
    // Claims 10 bytes, carries 3
    let frame = [0, 10, 0, 0, 0, 1, 2, 3];
    let mut decoder = FrameDecoder::default();
    assert!(matches!(
        decoder.decode(&frame),
        Err(ProtocolError::SizeMismatch {
            expected: 10,
            actual: 3
        })
    ));
}

#[test]
fn test_compressed_frame_claiming_too_much_rejected_before_allocation() {
    let block = compress_block(&[1u8; 256]);
    let mut frame = vec![1u8];
    frame.extend_from_slice(&(64u32 * 1024 * 1024).to_le_bytes());
    frame.extend_from_slice(&block);

    let mut decoder = FrameDecoder::new(1024 * 1024);
    assert!(matches!(
        decoder.decode(&frame),
        Err(ProtocolError::OversizedPacket(_))
    ));
    assert_eq!(decoder.scratch_capacity(), 0);
}

#[test]
fn test_compressed_frame_with_wrong_length_rejected() {
    let block = compress_block(&[5u8; 300]);
    let mut frame = vec![1u8];
    frame.extend_from_slice(&400u32.to_le_bytes());
    frame.extend_from_slice(&block);

    let mut decoder = FrameDecoder::default();
    let err = decoder.decode(&frame).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Encoding);
}

#[test]
fn test_oversized_payload_refused_by_encoder() {
    let encoder = FrameEncoder::new(true, 128, 1024);
    assert!(matches!(
        encoder.encode(&[0u8; 1025]),
        Err(ProtocolError::OversizedPacket(1025))
    ));
    assert!(encoder.encode(&[0u8; 1024]).is_ok());
}

#[test]
fn test_decoder_reuses_scratch_across_frames() {
    let encoder = FrameEncoder::default();
    let big = encoder.encode(&vec![3u8; 64 * 1024]).unwrap();
    let small = encoder.encode(&vec![4u8; 1024]).unwrap();

    let mut decoder = FrameDecoder::default();
    assert_eq!(decoder.decode(&big).unwrap().len(), 64 * 1024);
    let capacity = decoder.scratch_capacity();
    assert_eq!(decoder.decode(&small).unwrap(), &vec![4u8; 1024][..]);
    assert_eq!(decoder.scratch_capacity(), capacity);
}

// ============================================================================
// BYTE BUFFER EDGE CASES
// ============================================================================

#[test]
fn test_negative_array_length_rejected() {
    let mut reader = ByteBuffer::reader_from_slice(&(-5i32).to_le_bytes());
    assert!(matches!(
        reader.read_array::<u32>(),
        Err(ProtocolError::InvalidLength(-5))
    ));
    assert_eq!(reader.position(), 0);
}

#[test]
fn test_huge_array_length_rejected_without_allocation() {
    let mut bytes = i32::MAX.to_le_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 16]);
    let mut reader = ByteBuffer::reader_from_slice(&bytes);
    assert!(matches!(
        reader.read_array::<u64>(),
        Err(ProtocolError::BufferOverrun { .. })
    ));
    assert_eq!(reader.position(), 0);
}

#[test]
fn test_null_and_empty_strings_differ() {
    let mut writer = ByteBuffer::create(16);
    writer.write_str(None).unwrap();
    writer.write_str(Some("")).unwrap();
    assert_eq!(writer.len(), 8);

    let mut reader = ByteBuffer::reader(writer.to_bytes());
    assert_eq!(reader.read_string().unwrap(), None);
    assert_eq!(reader.read_string().unwrap(), Some(String::new()));
}

#[test]
fn test_invalid_utf8_rejected() {
    let mut writer = ByteBuffer::create(16);
    writer.write_blob(&[0xFF, 0xFE, 0xFD]).unwrap();
    let mut reader = ByteBuffer::reader(writer.to_bytes());
    assert!(matches!(reader.read_string(), Err(ProtocolError::InvalidUtf8)));
    assert_eq!(reader.position(), 0);
}

#[test]
fn test_read_past_end() {
    let mut reader = ByteBuffer::reader_from_slice(&[1, 2, 3]);
    assert!(reader.try_read::<u32>().is_none());
    assert_eq!(reader.read::<u16>().unwrap(), 0x0201);
    assert!(matches!(
        reader.read::<u16>(),
        Err(ProtocolError::BufferOverrun {
            requested: 2,
            available: 1
        })
    ));
}

#[test]
fn test_disposed_buffer_fails() {
    let mut buffer = ByteBuffer::create(8);
    buffer.write(1u32).unwrap();
    buffer.dispose();
    buffer.dispose();
    assert!(buffer.is_disposed());
    assert!(matches!(buffer.write(1u8), Err(ProtocolError::BufferDisposed)));
    assert!(matches!(buffer.read::<u8>(), Err(ProtocolError::BufferDisposed)));
}

#[test]
fn test_reader_is_read_only() {
    let mut reader = ByteBuffer::reader(Bytes::from_static(b"abc"));
    assert!(matches!(reader.write(1u8), Err(ProtocolError::ReadOnlyBuffer)));
}

#[test]
fn test_buffer_growth_capped() {
    let mut writer = ByteBuffer::create(0);
    writer.set_position(0).unwrap();
    let err = writer.write_raw(&vec![0u8; MAX_BUFFER_SIZE + 1]).unwrap_err();
    assert!(matches!(err, ProtocolError::BufferTooLarge(_)));
    assert_eq!(writer.len(), 0);
}

#[test]
fn test_sub_buffer_is_zero_copy_for_readers() {
    let data = Bytes::from_static(b"headerBODY");
    let mut reader = ByteBuffer::reader(data.clone());
    reader.read_raw(6).unwrap();
    let mut body = reader.read_sub_buffer(4).unwrap();
    assert_eq!(body.read_raw(4).unwrap(), b"BODY");
    assert_eq!(reader.remaining(), 0);
    assert!(reader.read_sub_buffer(1).is_err());
}

// ============================================================================
// SESSION MESSAGE EDGE CASES
// ============================================================================

#[test]
fn test_unknown_message_kind() {
    assert!(matches!(
        SessionMessage::decode(Bytes::from_static(&[200])),
        Err(ProtocolError::UnknownMessageKind(200))
    ));
}

#[test]
fn test_truncated_message_body() {
    let message = SessionMessage::PeerJoined {
        peer: Uuid::new_v4(),
    };
    let bytes = message.to_buffer().unwrap().to_bytes();
    let truncated = bytes.slice(..bytes.len() - 1);
    assert!(matches!(
        SessionMessage::decode(truncated),
        Err(ProtocolError::BufferOverrun { .. })
    ));
}

#[test]
fn test_empty_message_rejected() {
    assert!(SessionMessage::decode(Bytes::new()).is_err());
}

// ============================================================================
// DISPATCHER EDGE CASES
// ============================================================================

#[test]
fn test_dispatch_without_handler() {
    let dispatcher = Dispatcher::new();
    let delivery = Delivery {
        sender: None,
        source: None,
        tag: 99,
        payload: Bytes::new(),
        relayed: false,
    };
    let err = dispatcher.dispatch(&delivery).unwrap_err();
    assert!(err.to_string().contains("99"));
}

#[test]
fn test_dispatcher_clones_share_handlers() {
    let dispatcher = Dispatcher::new();
    let clone = dispatcher.clone();
    clone.register(3, |_| Ok(())).unwrap();
    assert!(dispatcher.is_registered(3));
}
