use encoding_rs::{GBK, WINDOWS_1252};
use nlchat_core::link::{FrameCodec, FramingMode, LinkBuffer};
use pretty_assertions::assert_eq;
use std::time::Duration;

fn packages(start: &str, end: &str) -> FrameCodec {
    let mode = FramingMode::package(start, end, Duration::from_millis(250)).unwrap();
    FrameCodec::with_fallback_encoding(mode, WINDOWS_1252)
}

#[test]
fn test_line_mode_byte_at_a_time() {
    let codec = FrameCodec::with_fallback_encoding(FramingMode::Line, WINDOWS_1252);
    let mut buffer = LinkBuffer::with_capacity(1024);

    let mut packets = Vec::new();
    for byte in b"AT+OK\r\nREADY\n" {
        buffer.append(&[*byte]);
        packets.extend(codec.decode(&mut buffer));
    }
    assert_eq!(packets, vec![b"AT+OK".to_vec(), b"READY".to_vec()]);
    assert!(buffer.is_empty());
}

#[test]
fn test_line_mode_mixed_encodings() {
    let codec = FrameCodec::with_fallback_encoding(FramingMode::Line, GBK);
    let mut buffer = LinkBuffer::with_capacity(1024);

    // "温度" in GBK, then a UTF-8 line
    buffer.append(&[0xCE, 0xC2, 0xB6, 0xC8, b'\n']);
    buffer.append("湿度\n".as_bytes());
    let packets = codec.decode(&mut buffer);
    assert_eq!(
        packets,
        vec!["温度".as_bytes().to_vec(), "湿度".as_bytes().to_vec()]
    );
}

#[test]
fn test_package_mode_skips_noise_before_start() {
    let codec = packages("$", "*");
    let mut buffer = LinkBuffer::with_capacity(1024);
    buffer.append(b"noise$GPGGA,1*junk$GPRMC,2*");

    let packets = codec.decode(&mut buffer);
    assert_eq!(packets, vec![b"GPGGA,1".to_vec(), b"GPRMC,2".to_vec()]);
    assert!(buffer.is_empty());
}

#[test]
fn test_package_mode_binary_payload() {
    let codec = packages("\u{2}", "\u{3}");
    let mut buffer = LinkBuffer::with_capacity(1024);
    buffer.append(&[0x02, 0x00, 0xFF, 0x0A, 0x0D, 0x03]);

    assert_eq!(codec.decode(&mut buffer), vec![vec![0x00, 0xFF, 0x0A, 0x0D]]);
}

#[test]
fn test_overflow_then_decode_keeps_newest_lines() {
    let codec = FrameCodec::with_fallback_encoding(FramingMode::Line, WINDOWS_1252);
    let mut buffer = LinkBuffer::with_capacity(16);

    // No newline yet: the oldest bytes are discarded on overflow
    buffer.append(b"0123456789ABCDEF");
    buffer.append(b"x\n");
    assert!(buffer.len() <= 16);

    let packets = codec.decode(&mut buffer);
    assert_eq!(packets, vec![b"ABCDEFx".to_vec()]);
}

#[test]
fn test_awaiting_more_only_in_package_mode() {
    let mut buffer = LinkBuffer::with_capacity(64);
    buffer.append(b"<partial");

    assert!(packages("<", ">").awaiting_more(&buffer));
    let line = FrameCodec::with_fallback_encoding(FramingMode::Line, WINDOWS_1252);
    assert!(!line.awaiting_more(&buffer));
}
