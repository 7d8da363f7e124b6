//! Delimited-file parser with encoding and delimiter auto-detection.
//!
//! Turns raw bytes into header-keyed string rows. No typing happens here; every
//! cell is kept exactly as read so Bronze stays a faithful copy of the source.

use std::collections::BTreeMap;

use crate::error::{ParseError, ParseResult};

/// A decoded file with detection metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    /// Column headers, trimmed, in file order
    pub headers: Vec<String>,
    /// Data rows keyed by header
    pub rows: Vec<BTreeMap<String, String>>,
    /// Detected or used encoding
    pub encoding: String,
    /// Detected or used delimiter
    pub delimiter: char,
}

/// Detect the encoding of raw bytes using chardet
pub fn detect_encoding(bytes: &[u8]) -> String {
    if std::str::from_utf8(bytes).is_ok() {
        return "utf-8".to_string();
    }

    let charset = chardet::detect(bytes).0;
    match charset.to_lowercase().as_str() {
        "ascii" | "utf-8" | "utf8" => "utf-8".to_string(),
        "iso-8859-1" | "latin-1" | "latin1" => "iso-8859-1".to_string(),
        "iso-8859-15" | "latin-9" => "iso-8859-15".to_string(),
        "windows-1252" | "cp1252" => "windows-1252".to_string(),
        // chardet is unsure on short inputs; Windows-1252 is a superset of Latin-1 for text.
        _ => "windows-1252".to_string(),
    }
}

/// Decode bytes to string using the specified encoding
pub fn decode_content(bytes: &[u8], encoding: &str) -> ParseResult<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
    match encoding.to_lowercase().as_str() {
        "utf-8" | "utf8" | "ascii" => String::from_utf8(bytes.to_vec())
            .map_err(|e| ParseError::Encoding(e.to_string())),
        // Every Latin-1 byte is the code point of the same value.
        "iso-8859-1" | "latin-1" | "latin1" => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
        "iso-8859-15" | "latin-9" => Ok(encoding_rs::ISO_8859_15.decode(bytes).0.into_owned()),
        "windows-1252" | "cp1252" => Ok(encoding_rs::WINDOWS_1252.decode(bytes).0.into_owned()),
        other => Err(ParseError::Encoding(format!("unsupported encoding '{}'", other))),
    }
}

/// Detect the delimiter by counting occurrences in the first line
pub fn detect_delimiter(content: &str) -> char {
    let first_line = content.lines().next().unwrap_or("");

    let separators = [';', ',', '\t', '|'];
    let mut best_sep = ',';
    let mut best_count = 0;

    for &sep in &separators {
        let count = first_line.matches(sep).count();
        if count > best_count {
            best_count = count;
            best_sep = sep;
        }
    }

    best_sep
}

/// Parse decoded text with an explicit delimiter.
///
/// Blank lines are skipped. Short rows are padded with empty cells; cells past
/// the last header are ignored.
pub fn parse_str(content: &str, delimiter: char, encoding: impl Into<String>) -> ParseResult<ParsedFile> {
    if content.trim().is_empty() {
        return Err(ParseError::EmptyFile);
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .flexible(true)
        .has_headers(true)
        .from_reader(content.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ParseError::Malformed {
            line: 1,
            message: e.to_string(),
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ParseError::NoHeaders);
    }

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result.map_err(|e| ParseError::Malformed {
            line: e.position().map(|p| p.line() as usize).unwrap_or(0),
            message: e.to_string(),
        })?;

        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }

        let row = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string()))
            .collect();
        rows.push(row);
    }

    Ok(ParsedFile {
        headers,
        rows,
        encoding: encoding.into(),
        delimiter,
    })
}

/// Parse raw bytes with auto-detection of encoding and delimiter.
pub fn parse_bytes_auto(bytes: &[u8]) -> ParseResult<ParsedFile> {
    if bytes.is_empty() {
        return Err(ParseError::EmptyFile);
    }
    let encoding = detect_encoding(bytes);
    let content = decode_content(bytes, &encoding)?;
    let delimiter = detect_delimiter(&content);
    parse_str(&content, delimiter, encoding)
}
