//! Text normalization and split-file reassembly.
//!
//! Every fetched object goes through [`decode`] and [`normalize_line_endings`]
//! before parts are stitched together by [`reassemble`].

use encoding_rs::WINDOWS_1252;

use starload_shared::{Result, StarloadError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Text produced by [`decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// Byte offset of the first invalid UTF-8 sequence when the whole input
    /// was read as Windows-1252 instead. Any valid multi-byte UTF-8 elsewhere
    /// in the input is garbled in that case.
    pub fallback_at: Option<usize>,
}

/// Decode raw bytes into text.
///
/// Strips a UTF-8 byte-order mark. Bytes that are not valid UTF-8 are read as
/// Windows-1252, the usual encoding of spreadsheet-exported CSVs.
pub fn decode(bytes: &[u8]) -> Decoded {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => Decoded {
            text: text.to_string(),
            fallback_at: None,
        },
        Err(e) => {
            let (text, _had_errors) = WINDOWS_1252.decode_without_bom_handling(bytes);
            Decoded {
                text: text.into_owned(),
                fallback_at: Some(e.valid_up_to()),
            }
        }
    }
}

/// Convert CRLF and lone CR to LF, drop trailing blank lines, and end with
/// exactly one LF. Empty input stays empty.
pub fn normalize_line_endings(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");
    let trimmed = unified.trim_end_matches('\n');
    if trimmed.is_empty() {
        return String::new();
    }
    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push_str(trimmed);
    out.push('\n');
    out
}

/// Concatenate normalized parts into one file with a single header line.
///
/// The first part supplies the header. A later part whose first line equals
/// that header has it dropped; a part starting with anything else is taken
/// as header-less and kept whole.
pub fn reassemble(name: &str, parts: &[String]) -> Result<String> {
    let first = parts
        .first()
        .ok_or_else(|| StarloadError::extraction(format!("{name}: no parts to reassemble")))?;
    let header = first
        .lines()
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| StarloadError::extraction(format!("{name}: first part has no header")))?;

    let mut out = String::with_capacity(parts.iter().map(String::len).sum());
    out.push_str(first);

    for part in &parts[1..] {
        let body = match part.split_once('\n') {
            Some((line, rest)) if line == header => rest,
            None if part == header => "",
            _ => part.as_str(),
        };
        out.push_str(body);
    }

    Ok(out)
}

/// Count data records (header excluded) in normalized CSV text.
///
/// Uses a CSV reader rather than line counting so quoted fields with
/// embedded newlines count once.
pub fn count_data_rows(name: &str, text: &str) -> Result<u64> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let mut rows = 0u64;
    for record in reader.records() {
        record.map_err(|e| StarloadError::extraction(format!("{name}: unreadable CSV: {e}")))?;
        rows += 1;
    }
    Ok(rows)
}
