//! Packet framing
//!
//! Splits the receive buffer into packets and frames outgoing payloads.
//!
//! Line mode:
//! - Packets end at `\n`; trailing whitespace and `\r` are trimmed
//! - Blank lines are dropped
//! - Non-UTF-8 lines are re-encoded from the host's 8-bit encoding
//!
//! Package mode:
//! - `start` (optional) + payload + `end`
//! - Payload bytes pass through unmodified, empty payloads are dropped

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use super::{FramingMode, LinkBuffer, SerialConfig};

/// Environment variables consulted for the locale charset, in POSIX precedence
const LOCALE_VARS: [&str; 3] = ["LC_ALL", "LC_CTYPE", "LANG"];

/// Encoding used to salvage received lines that are not valid UTF-8.
///
/// On Windows this is the active ANSI code page (936 gives GBK). Elsewhere
/// it is taken from the charset suffix of the host locale (`zh_CN.GBK` gives
/// GBK). UTF-8 locales and hosts without a locale fall back to windows-1252,
/// which maps every byte to a character.
pub fn locale_fallback_encoding() -> &'static Encoding {
    #[cfg(windows)]
    {
        // SAFETY: GetACP has no arguments and no preconditions
        let code_page = unsafe { windows_sys::Win32::Globalization::GetACP() };
        if let Some(encoding) = code_page_encoding(code_page) {
            return encoding;
        }
    }

    for var in LOCALE_VARS {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => {
                return locale_charset(&value).unwrap_or(WINDOWS_1252);
            }
            _ => continue,
        }
    }
    WINDOWS_1252
}

fn locale_charset(locale: &str) -> Option<&'static Encoding> {
    let charset = locale.split('.').nth(1)?.split('@').next()?;
    single_byte_fallback(Encoding::for_label(charset.as_bytes())?)
}

/// Encoding for a Windows code page number
#[cfg_attr(not(windows), allow(dead_code))]
fn code_page_encoding(code_page: u32) -> Option<&'static Encoding> {
    let code_page = u16::try_from(code_page).ok()?;
    single_byte_fallback(codepage::to_encoding(code_page)?)
}

/// UTF-8 is what already failed, and the rest must keep ASCII framing bytes intact
fn single_byte_fallback(encoding: &'static Encoding) -> Option<&'static Encoding> {
    if encoding == UTF_8 || !encoding.is_ascii_compatible() {
        return None;
    }
    Some(encoding)
}

/// Decoder/encoder for the active framing mode
#[derive(Debug, Clone)]
pub struct FrameCodec {
    mode: FramingMode,
    fallback: &'static Encoding,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FramingMode::Line)
    }
}

impl FrameCodec {
    /// Codec using the host locale for non-UTF-8 lines
    pub fn new(mode: FramingMode) -> Self {
        Self::with_fallback_encoding(mode, locale_fallback_encoding())
    }

    /// Codec with an explicit fallback encoding
    pub fn with_fallback_encoding(mode: FramingMode, fallback: &'static Encoding) -> Self {
        Self { mode, fallback }
    }

    /// Codec for a (validated) configuration
    pub fn from_config(config: &SerialConfig) -> Self {
        let fallback = config
            .fallback_encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or_else(locale_fallback_encoding);
        Self::with_fallback_encoding(config.framing.clone(), fallback)
    }

    /// Active framing mode
    pub fn mode(&self) -> &FramingMode {
        &self.mode
    }

    /// Fallback text encoding
    pub fn fallback_encoding(&self) -> &'static Encoding {
        self.fallback
    }

    /// Extract every complete packet, leaving partial data buffered
    pub fn decode(&self, buffer: &mut LinkBuffer) -> Vec<Vec<u8>> {
        match &self.mode {
            FramingMode::Line => self.decode_lines(buffer),
            FramingMode::Package { start, end, .. } => {
                decode_packages(buffer, start.as_bytes(), end.as_bytes())
            }
        }
    }

    /// Frame an outgoing payload
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        match &self.mode {
            FramingMode::Line => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.extend_from_slice(payload);
                if !out.ends_with(b"\n") {
                    out.push(b'\n');
                }
                out
            }
            FramingMode::Package { start, end, .. } => {
                let mut out = Vec::with_capacity(start.len() + payload.len() + end.len());
                out.extend_from_slice(start.as_bytes());
                out.extend_from_slice(payload);
                out.extend_from_slice(end.as_bytes());
                out
            }
        }
    }

    /// Whether an incomplete package is sitting in the buffer
    pub fn awaiting_more(&self, buffer: &LinkBuffer) -> bool {
        self.mode.is_package() && !buffer.is_empty()
    }

    fn decode_lines(&self, buffer: &mut LinkBuffer) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        while let Some(pos) = buffer.find(b"\n", 0) {
            let mut line = buffer.consume_prefix(pos + 1);
            let trimmed = line[..pos]
                .iter()
                .rposition(|b| !is_trim_byte(*b))
                .map_or(0, |last| last + 1);
            line.truncate(trimmed);

            if line.is_empty() {
                continue;
            }
            packets.push(self.normalize_text(line));
        }
        packets
    }

    fn normalize_text(&self, line: Vec<u8>) -> Vec<u8> {
        if std::str::from_utf8(&line).is_ok() {
            return line;
        }
        let (text, _) = self.fallback.decode_without_bom_handling(&line);
        tracing::debug!(
            encoding = self.fallback.name(),
            len = line.len(),
            "line is not valid UTF-8, re-encoded from fallback encoding"
        );
        text.into_owned().into_bytes()
    }
}

fn is_trim_byte(b: u8) -> bool {
    b.is_ascii_whitespace() || b == 0x0b
}

fn decode_packages(buffer: &mut LinkBuffer, start: &[u8], end: &[u8]) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    if end.is_empty() {
        return packets;
    }
    loop {
        let payload_start = if start.is_empty() {
            0
        } else {
            match buffer.find(start, 0) {
                Some(pos) => pos + start.len(),
                None => break,
            }
        };

        let Some(end_pos) = buffer.find(end, payload_start) else {
            break;
        };

        let mut frame = buffer.consume_prefix(end_pos + end.len());
        frame.truncate(end_pos);
        let payload = frame.split_off(payload_start);
        if !payload.is_empty() {
            packets.push(payload);
        }
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::GBK;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn line_codec() -> FrameCodec {
        FrameCodec::with_fallback_encoding(FramingMode::Line, WINDOWS_1252)
    }

    fn package_codec(start: &str, end: &str) -> FrameCodec {
        let mode = FramingMode::package(start, end, Duration::from_millis(100)).unwrap();
        FrameCodec::with_fallback_encoding(mode, WINDOWS_1252)
    }

    fn feed(codec: &FrameCodec, buffer: &mut LinkBuffer, bytes: &[u8]) -> Vec<Vec<u8>> {
        buffer.append(bytes);
        codec.decode(buffer)
    }

    #[test]
    fn test_line_round_trip() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        let wire = codec.encode(b"hello");
        assert_eq!(wire, b"hello\n".to_vec());
        assert_eq!(feed(&codec, &mut buffer, &wire), vec![b"hello".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_empty_lines_dropped() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        assert!(feed(&codec, &mut buffer, b"\n\n").is_empty());
        assert!(feed(&codec, &mut buffer, b" \r\n\t\n").is_empty());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_line_is_held() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        assert!(feed(&codec, &mut buffer, b"abc").is_empty());
        assert_eq!(buffer.len(), 3);
        assert_eq!(
            feed(&codec, &mut buffer, b"def\n"),
            vec![b"abcdef".to_vec()]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_crlf_and_trailing_space_trimmed() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"one\r\ntwo  \r\n  three\n");
        assert_eq!(
            packets,
            vec![b"one".to_vec(), b"two".to_vec(), b"  three".to_vec()]
        );
    }

    #[test]
    fn test_invalid_utf8_reencoded() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"caf\xe9\n");
        assert_eq!(packets, vec!["café".as_bytes().to_vec()]);
    }

    #[test]
    fn test_gbk_fallback() {
        let codec = FrameCodec::with_fallback_encoding(FramingMode::Line, GBK);
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"\xc4\xe3\xba\xc3\n");
        assert_eq!(packets, vec!["你好".as_bytes().to_vec()]);
    }

    #[test]
    fn test_valid_utf8_untouched() {
        let codec = FrameCodec::with_fallback_encoding(FramingMode::Line, GBK);
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, "星闪\n".as_bytes());
        assert_eq!(packets, vec!["星闪".as_bytes().to_vec()]);
    }

    #[test]
    fn test_line_encode_keeps_existing_newline() {
        let codec = line_codec();
        assert_eq!(codec.encode(b"ping\n"), b"ping\n".to_vec());
        assert_eq!(codec.encode(b""), b"\n".to_vec());
    }

    #[test]
    fn test_package_extraction() {
        let codec = package_codec("<", ">");
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"<abc><de>");
        assert_eq!(packets, vec![b"abc".to_vec(), b"de".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_package_without_start_marker() {
        let codec = package_codec("", "\r\n");
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"AT\r\nOK\r\npart");
        assert_eq!(packets, vec![b"AT".to_vec(), b"OK".to_vec()]);
        assert_eq!(buffer.as_slice(), b"part");
    }

    #[test]
    fn test_package_split_across_reads() {
        let codec = package_codec("$$", "##");
        let mut buffer = LinkBuffer::with_capacity(1024);
        assert!(feed(&codec, &mut buffer, b"noise$$pay").is_empty());
        assert!(codec.awaiting_more(&buffer));
        assert_eq!(
            feed(&codec, &mut buffer, b"load#").len(),
            0
        );
        assert_eq!(
            feed(&codec, &mut buffer, b"#"),
            vec![b"payload".to_vec()]
        );
        assert!(buffer.is_empty());
        assert!(!codec.awaiting_more(&buffer));
    }

    #[test]
    fn test_package_missing_start_waits() {
        let codec = package_codec("<", ">");
        let mut buffer = LinkBuffer::with_capacity(1024);
        assert!(feed(&codec, &mut buffer, b"abc>").is_empty());
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_package_empty_payload_dropped() {
        let codec = package_codec("<", ">");
        let mut buffer = LinkBuffer::with_capacity(1024);
        assert_eq!(
            feed(&codec, &mut buffer, b"<><x>"),
            vec![b"x".to_vec()]
        );
    }

    #[test]
    fn test_package_bytes_pass_through() {
        let codec = package_codec("<", ">");
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"<\xff\x00 \r\n>");
        assert_eq!(packets, vec![b"\xff\x00 \r\n".to_vec()]);
    }

    #[test]
    fn test_package_encode_always_wraps() {
        let codec = package_codec("<", ">");
        assert_eq!(codec.encode(b"a>b"), b"<a>b>".to_vec());
        let codec = package_codec("", "\n");
        assert_eq!(codec.encode(b"x\n"), b"x\n\n".to_vec());
    }

    #[test]
    fn test_locale_charset() {
        assert_eq!(locale_charset("zh_CN.GBK"), Some(GBK));
        assert_eq!(locale_charset("de_DE.ISO-8859-1@euro").map(|e| e.name()), Some("windows-1252"));
        assert_eq!(locale_charset("en_US.UTF-8"), None);
        assert_eq!(locale_charset("C"), None);
    }

    #[test]
    fn test_code_page_encoding() {
        assert_eq!(code_page_encoding(936), Some(GBK));
        assert_eq!(code_page_encoding(1252), Some(WINDOWS_1252));
        assert_eq!(code_page_encoding(932).map(|e| e.name()), Some("Shift_JIS"));
        assert_eq!(code_page_encoding(65001), None);
        assert_eq!(code_page_encoding(1200), None);
        assert_eq!(code_page_encoding(70_000), None);
    }

    #[test]
    fn test_indentation_survives_trim() {
        let codec = line_codec();
        let mut buffer = LinkBuffer::with_capacity(1024);
        let packets = feed(&codec, &mut buffer, b"\t key = 1 \r\n");
        assert_eq!(packets, vec![b"\t key = 1".to_vec()]);
    }

    #[test]
    fn test_from_config_uses_label() {
        let config = SerialConfig {
            fallback_encoding: Some("gbk".to_string()),
            ..SerialConfig::default()
        };
        let codec = FrameCodec::from_config(&config);
        assert_eq!(codec.fallback_encoding(), GBK);
        assert_eq!(codec.mode(), &FramingMode::Line);
    }
}
