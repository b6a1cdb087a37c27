//! Frame encoding, decoding and corruption handling

mod common;

use common::*;

#[test]
fn frame_roundtrip() {
    let frame = Frame::command(DEV_A, 3, 0x1101, hex_to_bytes("0102030405"));
    let encoded = frame.encode().unwrap();
    assert_eq!(encoded.len(), FRAME_HEADER_SIZE + 5);

    let decoded = Frame::decode(&encoded).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn empty_payload_roundtrip() {
    let frame = Frame::report(DEV_B, 0, 0x0000, Bytes::new());
    let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
    assert_eq!(decoded, frame);
}

#[test]
fn wire_field_placement() {
    let frame = Frame::report(0x0102_0304_0506_0708, 1, 0x1101, hex_to_bytes("aa"));
    let encoded = frame.encode().unwrap();

    // device id, little endian, after the two crc bytes
    assert_eq!(
        &encoded[2..10],
        &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
    );
    assert_eq!(encoded[10], 0x00); // report: no command flag
    assert_eq!(encoded[11], 1); // payload length
    assert_eq!(encoded[12], 1); // service index
    assert_eq!(&encoded[13..15], &[0x01, 0x11]); // command, little endian
    assert_eq!(encoded[15], 0xaa);
}

#[test]
fn command_flag_is_encoded() {
    let frame = Frame::command(DEV_A, 2, 0x0080, Bytes::new());
    let encoded = frame.encode().unwrap();
    assert_eq!(encoded[10] & FRAME_FLAG_COMMAND, FRAME_FLAG_COMMAND);

    let decoded = Frame::decode(&encoded).unwrap();
    assert!(decoded.is_command());
    assert!(!decoded.is_report());
}

#[test]
fn every_byte_flip_is_caught() {
    let frame = Frame::command(DEV_A, 3, 0x1101, hex_to_bytes("a1b2c3"));
    let encoded = frame.encode().unwrap();

    for i in 0..encoded.len() {
        let mut corrupted = encoded.to_vec();
        corrupted[i] ^= 0x40;
        assert!(
            Frame::decode(&corrupted).is_err(),
            "flip at byte {i} went unnoticed"
        );
    }
}

#[test]
fn rejects_truncated_buffers() {
    let err = Frame::decode(&[0u8; 10]).unwrap_err();
    assert!(matches!(
        err,
        JdError::FrameTooShort {
            expected: 15,
            actual: 10
        }
    ));
}

#[test]
fn rejects_declared_length_mismatch() {
    let mut raw = [0u8; 15];
    raw[11] = 5; // claims five payload bytes that are not there
    let err = Frame::decode(&raw).unwrap_err();
    assert!(matches!(
        err,
        JdError::FrameLengthMismatch {
            declared: 5,
            actual: 0
        }
    ));
}

#[test]
fn rejects_oversized_payloads() {
    let payload = Bytes::from(vec![0u8; MAX_SERVICE_SIZE + 1]);
    let frame = Frame::command(DEV_A, 1, 0x0080, payload);
    assert!(matches!(
        frame.encode().unwrap_err(),
        JdError::PayloadTooLarge { .. }
    ));

    let mut raw = vec![0u8; 15 + 240];
    raw[11] = 240;
    assert!(matches!(
        Frame::decode(&raw).unwrap_err(),
        JdError::PayloadTooLarge { .. }
    ));
}

#[test]
fn max_payload_is_accepted() {
    let frame = Frame::command(DEV_A, 1, 0x0080, Bytes::from(vec![0x55; MAX_SERVICE_SIZE]));
    let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
    assert_eq!(decoded.payload.len(), MAX_SERVICE_SIZE);
}

#[test]
fn multicast_carries_class_in_device_id() {
    let frame = Frame::multicast(SRV_BUTTON, 0x0080, Bytes::new());
    assert!(frame.is_multicast());
    assert_eq!(frame.multicast_class(), Some(SRV_BUTTON));

    let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
    assert_eq!(decoded.multicast_class(), Some(SRV_BUTTON));

    let unicast = Frame::command(DEV_A, 1, 0x0080, Bytes::new());
    assert_eq!(unicast.multicast_class(), None);
}

#[test]
fn announce_predicate() {
    assert!(announce_frame(DEV_A, 1, &[SRV_BUTTON]).is_announce());
    assert!(!Frame::report(DEV_A, 1, 0x0000, Bytes::new()).is_announce());
    assert!(!Frame::command(DEV_A, 0, 0x0000, Bytes::new()).is_announce());
}

#[test]
fn zero_copy_decode_from_bytes() {
    let frame = Frame::command(DEV_A, 3, 0x1101, hex_to_bytes("0102030405"));
    let encoded = frame.encode().unwrap();
    let decoded = Frame::try_from(encoded).unwrap();
    assert_eq!(decoded, frame);
}
