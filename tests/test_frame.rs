mod common;
use common::*;
use rct_bridge::prelude::*;
use rct_bridge::rct::frame::{self, Command, FrameReader, Request, Response, Unescaper};

use bytes::BytesMut;

fn hex(s: &str) -> Vec<u8> {
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
        .collect()
}

#[test]
fn read_request_bytes() {
    common_setup();

    let request = Request::read(ObjectId::new(0x959930BF));
    assert_eq!(request.bytes(), hex("2b0104959930bf0d65"));
}

#[test]
fn crc_matches_known_frames() {
    assert_eq!(frame::crc(&hex("0104959930bf")), 0x0d65);
    assert_eq!(frame::crc(&hex("0506959930bf2a00")), 0xccfc);
    // odd length, padded with a zero byte
    assert_eq!(frame::crc(&hex("0505deadbeef01")), 0xc394);
    assert_eq!(frame::crc(&hex("0505deadbeef0100")), 0xc394);
}

#[test]
fn crc_detects_single_bit_flips() {
    let body = hex("0506959930bf2a00");
    let good = frame::crc(&body);

    for i in 0..body.len() {
        for bit in 0..8 {
            let mut flipped = body.clone();
            flipped[i] ^= 1 << bit;
            assert_ne!(frame::crc(&flipped), good, "byte {} bit {}", i, bit);
        }
    }
}

#[test]
fn frame_lengths() {
    assert_eq!(frame::frame_length(&hex("2b0506959930bf")), 11);
    assert_eq!(frame::frame_length(&hex("2b0504333333")), 9);
    assert_eq!(frame::frame_length(&hex("2b060006959930bf")), 12);
    assert_eq!(frame::frame_length(&hex("2b03010000")), 6 + 256);
    assert!(Command::is_long(0x03));
    assert!(Command::is_long(0x06));
    assert!(!Command::is_long(0x05));
}

#[test]
fn parses_short_and_long_responses() {
    let short = Response::parse(&hex("2b0506959930bf2a00ccfc")).unwrap();
    assert_eq!(short.command, 0x05);
    assert_eq!(short.length, 6);
    assert_eq!(short.id, ObjectId::new(0x959930BF));
    assert_eq!(short.data, vec![0x2a, 0x00]);
    assert!(short.crc_ok);
    assert_eq!(short.info_text(), "5 2 959930BF");

    let long = Response::parse(&hex("2b060006959930bf2a0019f8")).unwrap();
    assert_eq!(long.command, 0x06);
    assert_eq!(long.id, ObjectId::new(0x959930BF));
    assert_eq!(long.data, vec![0x2a, 0x00]);
    assert!(long.crc_ok);

    let empty = Response::parse(&hex("2b050433333333b921")).unwrap();
    assert!(empty.data.is_empty());
    assert!(empty.crc_ok);
}

#[test]
fn parse_rejects_truncated_frames() {
    assert!(Response::parse(&hex("2b0506")).is_err());
    // header claims an id but only two bytes follow
    assert!(Response::parse(&hex("2b05029599aaaa")).is_err());
}

#[test]
fn object_id_from_str() {
    assert_eq!(ObjectId::from_str("0x959930BF").unwrap(), ObjectId::new(0x959930BF));
    assert_eq!(ObjectId::from_str("959930bf").unwrap(), ObjectId::new(0x959930BF));
    assert_eq!(ObjectId::new(0x0CB5D21B).to_string(), "0CB5D21B");
    assert!(ObjectId::from_str("").is_err());
    assert!(ObjectId::from_str("xyz").is_err());
    assert!(ObjectId::from_str("123456789").is_err());
}

#[test]
fn reader_reassembles_split_frames() {
    common_setup();

    let wire = Factory::response(0x959930BF, &[0x2a, 0x00]);
    let mut reader = FrameReader::new(true);

    let mut responses = Vec::new();
    for byte in &wire {
        responses.extend(reader.push(&[*byte]).unwrap());
    }

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x2a, 0x00]);
    assert!(responses[0].crc_ok);
    assert_eq!(reader.buffered(), 0);
}

#[test]
fn reader_returns_frames_in_order() {
    let mut wire = Factory::response(0x959930BF, &[0x2a, 0x00]);
    wire.extend(Factory::response(0x11111111, &[0xff, 0x9c]));
    wire.extend(Factory::long_response(0x7924ABD9, b"RCT-7.0\0"));

    let responses = FrameReader::new(true).push(&wire).unwrap();
    let ids: Vec<ObjectId> = responses.iter().map(|r| r.id).collect();
    assert_eq!(
        ids,
        vec![
            ObjectId::new(0x959930BF),
            ObjectId::new(0x11111111),
            ObjectId::new(0x7924ABD9)
        ]
    );
    assert!(responses.iter().all(|r| r.crc_ok));
}

#[test]
fn escaped_start_byte_in_payload() {
    let wire = hex("2b0506959930bf2d2b00ffcd");
    assert_eq!(Factory::escape(&hex("2b0506959930bf2b00ffcd")), wire);

    let responses = FrameReader::new(true).push(&wire).unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x2b, 0x00]);
    assert!(responses[0].crc_ok);
}

#[test]
fn escaped_escape_byte_in_payload() {
    let wire = Factory::escape(&hex("2b0506959930bf2d00556b"));
    assert_eq!(wire, hex("2b0506959930bf2d2d00556b"));

    let responses = FrameReader::new(true).push(&wire).unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x2d, 0x00]);
    assert!(responses[0].crc_ok);
}

#[test]
fn escape_split_across_chunks_with_lookahead() {
    let mut reader = FrameReader::new(true);

    assert!(reader.push(&hex("2b0506959930bf2d")).unwrap().is_empty());
    let responses = reader.push(&hex("2b00ffcd")).unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].data, vec![0x2b, 0x00]);
    assert!(responses[0].crc_ok);
}

#[test]
fn escape_split_across_chunks_without_lookahead() {
    common_setup();

    let mut reader = FrameReader::new(false);

    assert!(reader.push(&hex("2b0506959930bf2d")).unwrap().is_empty());
    let responses = reader.push(&hex("2b00ffcd")).unwrap();

    // the escape byte stayed in the buffer, so the frame is misaligned
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].crc_ok);
}

#[test]
fn unescaper_holds_trailing_escape_byte() {
    let mut unescaper = Unescaper::new(true);
    let mut out = BytesMut::new();

    unescaper.unescape(&hex("01022d"), &mut out);
    assert_eq!(&out[..], &hex("0102")[..]);

    // not followed by a start or escape byte: the held byte is data
    unescaper.unescape(&hex("03"), &mut out);
    assert_eq!(&out[..], &hex("01022d03")[..]);
}

#[test]
fn escaped_byte_is_never_an_escape() {
    let mut unescaper = Unescaper::new(true);
    let mut out = BytesMut::new();

    // 2d 2d at the end of a chunk is a complete escape, nothing is held
    unescaper.unescape(&hex("012d2d"), &mut out);
    assert_eq!(&out[..], &hex("012d")[..]);

    unescaper.unescape(&hex("2b05"), &mut out);
    assert_eq!(&out[..], &hex("012d2b05")[..]);

    // escaped escape followed by an escaped start byte
    let mut out = BytesMut::new();
    Unescaper::new(false).unescape(&hex("2d2d2d2b"), &mut out);
    assert_eq!(&out[..], &hex("2d2b")[..]);
}

// 338 as UINT16 gives a frame whose CRC ends in the escape byte
fn frame_ending_in_escape() -> Vec<u8> {
    let frame = Factory::response(0x959930BF, &338u16.to_le_bytes());
    assert_eq!(frame[frame.len() - 1], 0x2d);
    frame
}

#[test]
fn escaped_crc_byte_ends_final_chunk() {
    let wire = Factory::escape(&frame_ending_in_escape());
    assert_eq!(wire, hex("2b0506959930bf52015d2d2d"));

    for lookahead in [true, false] {
        let responses = FrameReader::new(lookahead).push(&wire).unwrap();
        assert_eq!(responses.len(), 1, "lookahead {}", lookahead);
        assert_eq!(responses[0].data, vec![0x52, 0x01]);
        assert!(responses[0].crc_ok);
    }
}

#[test]
fn escaped_crc_byte_followed_by_next_frame() {
    let first = Factory::escape(&frame_ending_in_escape());
    let second = Factory::response(0x11111111, &[0xff, 0x9c]);

    for lookahead in [true, false] {
        let mut reader = FrameReader::new(lookahead);
        let mut responses = reader.push(&first).unwrap();
        responses.extend(reader.push(&second).unwrap());

        let ids: Vec<(ObjectId, bool)> = responses.iter().map(|r| (r.id, r.crc_ok)).collect();
        assert_eq!(
            ids,
            vec![
                (ObjectId::new(0x959930BF), true),
                (ObjectId::new(0x11111111), true)
            ],
            "lookahead {}",
            lookahead
        );
    }
}

#[test]
fn escape_byte_before_next_start_byte() {
    let frame = Factory::response(0x959930BF, &[0x2a, 0x00]);
    let mut wire = frame.clone();
    wire.push(0x2d);
    wire.extend(&frame);

    let responses = FrameReader::new(true).push(&wire).unwrap();
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0], responses[1]);
    assert!(responses.iter().all(|r| r.crc_ok && r.data == vec![0x2a, 0x00]));

    // split right after the injected escape byte
    let (first, second) = wire.split_at(frame.len() + 1);
    let mut reader = FrameReader::new(true);
    let mut split = reader.push(first).unwrap();
    split.extend(reader.push(second).unwrap());
    assert_eq!(split, responses);
    assert_eq!(reader.buffered(), 0);
}

#[test]
fn crc_failure_halts_chunk() {
    common_setup();

    let mut bad = Factory::response(0x959930BF, &[0x2a, 0x00]);
    let last = bad.len() - 1;
    bad[last] ^= 0xff;
    let good = Factory::response(0x11111111, &[0xff, 0x9c]);

    let mut wire = bad;
    wire.extend(&good);

    let mut reader = FrameReader::new(true);
    let responses = reader.push(&wire).unwrap();
    assert_eq!(responses.len(), 1);
    assert!(!responses[0].crc_ok);
    assert_eq!(reader.buffered(), good.len());

    // the next chunk picks up where this one stopped
    let responses = reader.push(&[]).unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, ObjectId::new(0x11111111));
    assert!(responses[0].crc_ok);
}

#[test]
fn skips_noise_before_start_byte() {
    let mut wire = hex("0000ff01");
    wire.extend(Factory::response(0x959930BF, &[0x2a, 0x00]));

    let mut reader = FrameReader::new(true);
    let responses = reader.push(&wire).unwrap();

    assert_eq!(responses.len(), 1);
    // zero padding is not counted
    assert_eq!(reader.take_skipped(), 2);
    assert_eq!(reader.take_skipped(), 0);
}

#[test]
fn unknown_id_still_parses() {
    let responses = FrameReader::new(true)
        .push(&hex("2b0505deadbeef01c394"))
        .unwrap();

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, ObjectId::new(0xDEADBEEF));
    assert_eq!(responses[0].data, vec![0x01]);
    assert!(responses[0].crc_ok);
}

#[test]
fn oversized_buffer_is_an_error() {
    let mut wire = hex("2b06ffff");
    wire.extend(vec![0u8; 140 * 1024]);

    assert!(FrameReader::new(true).push(&wire).is_err());
}
