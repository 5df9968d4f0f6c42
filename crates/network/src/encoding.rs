//! Text decoding for response bodies.
//!
//! The charset comes from `Content-Type` when present. JSON bodies without a
//! charset are sniffed from their first four bytes: a BOM, or the position of
//! null bytes, which tells UTF-16 and UTF-32 apart along with byte order.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Utf8Sig,
    Utf16,
    Utf16Le,
    Utf16Be,
    Utf32,
    Utf32Le,
    Utf32Be,
    Latin1,
}

impl TextEncoding {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf8Sig => "utf-8-sig",
            Self::Utf16 => "utf-16",
            Self::Utf16Le => "utf-16-le",
            Self::Utf16Be => "utf-16-be",
            Self::Utf32 => "utf-32",
            Self::Utf32Le => "utf-32-le",
            Self::Utf32Be => "utf-32-be",
            Self::Latin1 => "iso-8859-1",
        }
    }

    /// Map a charset label to an encoding. Unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().trim_matches('"').to_ascii_lowercase();
        let encoding = match label.as_str() {
            "utf-8" | "utf8" => Self::Utf8,
            "utf-8-sig" => Self::Utf8Sig,
            "utf-16" | "utf16" => Self::Utf16,
            "utf-16le" | "utf-16-le" => Self::Utf16Le,
            "utf-16be" | "utf-16-be" => Self::Utf16Be,
            "utf-32" | "utf32" => Self::Utf32,
            "utf-32le" | "utf-32-le" => Self::Utf32Le,
            "utf-32be" | "utf-32-be" => Self::Utf32Be,
            "iso-8859-1" | "latin1" | "latin-1" | "us-ascii" | "ascii" => Self::Latin1,
            _ => return None,
        };
        Some(encoding)
    }

    /// Decode `bytes`, stripping a leading byte-order mark where the
    /// encoding allows one. Returns `None` for invalid input.
    pub fn decode(&self, bytes: &[u8]) -> Option<String> {
        match self {
            Self::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_owned),
            Self::Utf8Sig => {
                let bytes = bytes.strip_prefix(UTF8_BOM.as_slice()).unwrap_or(bytes);
                std::str::from_utf8(bytes).ok().map(str::to_owned)
            }
            Self::Utf16 => {
                if let Some(rest) = bytes.strip_prefix(UTF16_LE_BOM.as_slice()) {
                    decode_utf16(rest, u16::from_le_bytes)
                } else if let Some(rest) = bytes.strip_prefix(UTF16_BE_BOM.as_slice()) {
                    decode_utf16(rest, u16::from_be_bytes)
                } else {
                    decode_utf16(bytes, u16::from_be_bytes)
                }
            }
            Self::Utf16Le => decode_utf16(bytes, u16::from_le_bytes),
            Self::Utf16Be => decode_utf16(bytes, u16::from_be_bytes),
            Self::Utf32 => {
                if let Some(rest) = bytes.strip_prefix(UTF32_LE_BOM.as_slice()) {
                    decode_utf32(rest, u32::from_le_bytes)
                } else if let Some(rest) = bytes.strip_prefix(UTF32_BE_BOM.as_slice()) {
                    decode_utf32(rest, u32::from_be_bytes)
                } else {
                    decode_utf32(bytes, u32::from_be_bytes)
                }
            }
            Self::Utf32Le => decode_utf32(bytes, u32::from_le_bytes),
            Self::Utf32Be => decode_utf32(bytes, u32::from_be_bytes),
            Self::Latin1 => Some(bytes.iter().map(|&b| b as char).collect()),
        }
    }
}

impl std::fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: [u8; 2] = [0xFF, 0xFE];
const UTF16_BE_BOM: [u8; 2] = [0xFE, 0xFF];
const UTF32_LE_BOM: [u8; 4] = [0xFF, 0xFE, 0x00, 0x00];
const UTF32_BE_BOM: [u8; 4] = [0x00, 0x00, 0xFE, 0xFF];

fn decode_utf16(bytes: &[u8], word: fn([u8; 2]) -> u16) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| word([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units).ok()
}

fn decode_utf32(bytes: &[u8], word: fn([u8; 4]) -> u32) -> Option<String> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    bytes
        .chunks_exact(4)
        .map(|quad| char::from_u32(word([quad[0], quad[1], quad[2], quad[3]])))
        .collect()
}

/// Guess the Unicode encoding of a JSON document from its first four bytes.
///
/// JSON always starts with two ASCII characters, so the null-byte pattern in
/// the first four bytes identifies the encoding.
pub fn guess_json_utf(data: &[u8]) -> Option<TextEncoding> {
    let sample: Vec<u8> = data.iter().take(4).copied().collect();

    if sample.starts_with(&UTF32_LE_BOM) || sample.starts_with(&UTF32_BE_BOM) {
        return Some(TextEncoding::Utf32);
    }
    if sample.starts_with(&UTF8_BOM) {
        return Some(TextEncoding::Utf8Sig);
    }
    if sample.starts_with(&UTF16_LE_BOM) || sample.starts_with(&UTF16_BE_BOM) {
        return Some(TextEncoding::Utf16);
    }

    let nulls = sample.iter().filter(|&&b| b == 0).count();
    match nulls {
        0 => Some(TextEncoding::Utf8),
        2 => {
            if sample.len() == 4 && sample[0] == 0 && sample[2] == 0 {
                Some(TextEncoding::Utf16Be)
            } else if sample.len() == 4 && sample[1] == 0 && sample[3] == 0 {
                Some(TextEncoding::Utf16Le)
            } else {
                None
            }
        }
        3 => {
            if sample.len() == 4 && sample[..3] == [0, 0, 0] {
                Some(TextEncoding::Utf32Be)
            } else if sample.len() == 4 && sample[1..] == [0, 0, 0] {
                Some(TextEncoding::Utf32Le)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The `charset` parameter of a `Content-Type` value, if any.
pub fn charset_from_content_type(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"'))
    })
}

/// Pick the encoding for a body: the declared charset when it is known,
/// otherwise the JSON heuristics, otherwise UTF-8.
pub fn detect(content_type: Option<&str>, body: &[u8]) -> TextEncoding {
    content_type
        .and_then(charset_from_content_type)
        .and_then(TextEncoding::from_label)
        .or_else(|| guess_json_utf(body))
        .unwrap_or(TextEncoding::Utf8)
}
