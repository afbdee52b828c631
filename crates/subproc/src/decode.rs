//! Byte/text conversion at the process boundary.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("unknown encoding: {0}")]
    Unknown(String),
    #[error("'{encoding}' codec can't encode character {ch:?} in position {position}")]
    Unrepresentable {
        encoding: String,
        ch: char,
        position: usize,
    },
}

/// Encode stdin text. Supports ascii, utf-8 and latin-1 under their usual aliases.
pub fn encode_input(text: &str, encoding: &str) -> Result<Vec<u8>, EncodingError> {
    let limit = match encoding.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "utf-8" | "utf8" => return Ok(text.as_bytes().to_vec()),
        "ascii" | "us-ascii" => 0x7f,
        "latin-1" | "latin1" | "iso-8859-1" | "iso8859-1" => 0xff,
        _ => return Err(EncodingError::Unknown(encoding.to_string())),
    };

    text.chars()
        .enumerate()
        .map(|(position, ch)| {
            u8::try_from(u32::from(ch))
                .ok()
                .filter(|byte| u32::from(*byte) <= limit)
                .ok_or_else(|| EncodingError::Unrepresentable {
                    encoding: encoding.to_string(),
                    ch,
                    position,
                })
        })
        .collect()
}

/// Best-effort decode of captured output. Never fails.
///
/// Strict UTF-8 first (BOM stripped), then UTF-16 when a BOM says so,
/// otherwise lossy UTF-8.
pub fn decode_output(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(b"\xef\xbb\xbf") {
        return String::from_utf8_lossy(rest).into_owned();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    if let Some(rest) = bytes.strip_prefix(b"\xff\xfe") {
        return decode_utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(b"\xfe\xff") {
        return decode_utf16(rest, u16::from_be_bytes);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn decode_utf16(bytes: &[u8], unit: fn([u8; 2]) -> u16) -> String {
    let units = bytes.chunks_exact(2).map(|pair| unit([pair[0], pair[1]]));
    char::decode_utf16(units)
        .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}
