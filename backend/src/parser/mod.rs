//! Streaming CSV parser for member uploads.
//!
//! Reads the header line, then yields one [`RawRow`] per data line. The
//! stream is forward-only: an upload is read once and never rewound.
//!
//! Ragged lines are repaired rather than rejected: missing trailing values
//! are padded with `""`, extra values are dropped, and the row carries a
//! structural warning.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use crate::error::{ParseError, ParseResult};
use crate::models::RawRow;

/// Read buffer size; also bounds how much of the header line is sniffed.
const BUFFER_SIZE: usize = 64 * 1024;

/// The sniffed prefix replayed ahead of the rest of the input.
type Source<R> = io::Chain<Cursor<Vec<u8>>, R>;

/// Read until the first line is complete or [`BUFFER_SIZE`] bytes are held.
/// Pipes and decoders return short reads; one read may not cover the BOM.
fn sniff<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut prefix = Vec::new();
    let mut buf = [0u8; 4096];
    while prefix.len() < BUFFER_SIZE {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        prefix.extend_from_slice(&buf[..n]);
        if buf[..n].contains(&b'\n') {
            break;
        }
    }
    Ok(prefix)
}

/// Detect the delimiter by counting occurrences in the first line.
///
/// Comma wins ties, including the no-delimiter case.
pub fn detect_delimiter(content: &str) -> char {
    let first_line = content.lines().next().unwrap_or("");

    let separators = [',', ';', '\t', '|'];
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

/// Normalize a header cell: `" Work Email "` becomes `work_email`.
pub fn normalize_header(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '-' { '_' } else { c })
        .collect()
}

/// Opens uploads as [`RowStream`]s.
#[derive(Debug, Clone, Default)]
pub struct CsvParser {
    delimiter: Option<char>,
}

impl CsvParser {
    /// A parser that auto-detects the delimiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// A parser with a fixed delimiter.
    pub fn with_delimiter(delimiter: char) -> Self {
        Self {
            delimiter: Some(delimiter),
        }
    }

    /// Open a file on disk.
    pub fn open_path(&self, path: impl AsRef<Path>) -> ParseResult<RowStream<File>> {
        let file = File::open(path.as_ref())?;
        self.open(file)
    }

    /// Read the header from `reader` and return a stream over the data lines.
    ///
    /// Fails when the input is empty, has a non-UTF-8 byte order mark, or
    /// the header has no column names.
    pub fn open<R: Read>(&self, mut reader: R) -> ParseResult<RowStream<R>> {
        let mut sniffed = sniff(&mut reader)?;
        if sniffed.is_empty() {
            return Err(ParseError::EmptyHeader);
        }

        let mut bom_len = 0;
        if let Some((encoding, len)) = encoding_rs::Encoding::for_bom(&sniffed) {
            if encoding != encoding_rs::UTF_8 {
                return Err(ParseError::Encoding {
                    line: 1,
                    message: format!("{} byte order mark, expected UTF-8", encoding.name()),
                });
            }
            bom_len = len;
        }

        let delimiter = match self.delimiter {
            Some(d) => d,
            None => {
                let first_line = sniffed[bom_len..]
                    .split(|&b| b == b'\n')
                    .next()
                    .unwrap_or_default();
                detect_delimiter(&String::from_utf8_lossy(first_line))
            }
        };
        sniffed.drain(..bom_len);

        let delimiter_byte = u8::try_from(delimiter).map_err(|_| ParseError::Malformed {
            line: 1,
            message: format!("delimiter '{delimiter}' is not a single byte"),
        })?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(delimiter_byte)
            .buffer_capacity(BUFFER_SIZE)
            .from_reader(Cursor::new(sniffed).chain(reader));

        let mut header = csv::StringRecord::new();
        if !reader.read_record(&mut header)? {
            return Err(ParseError::EmptyHeader);
        }
        let headers: Vec<String> = header.iter().map(normalize_header).collect();
        if headers.iter().all(String::is_empty) {
            return Err(ParseError::EmptyHeader);
        }

        tracing::debug!(
            columns = headers.len(),
            delimiter = %delimiter.escape_default(),
            "parsed CSV header"
        );

        Ok(RowStream {
            reader,
            headers: Arc::new(headers),
            delimiter,
            record: csv::StringRecord::new(),
            finished: false,
        })
    }
}

/// Lazy iterator over the data lines of one upload.
///
/// Yields `Err` at most once; after an error or the end of input it only
/// returns `None`.
pub struct RowStream<R: Read> {
    reader: csv::Reader<Source<R>>,
    headers: Arc<Vec<String>>,
    delimiter: char,
    record: csv::StringRecord,
    finished: bool,
}

impl<R: Read> RowStream<R> {
    /// Normalized header names.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }

    fn to_row(&self) -> RawRow {
        let line = self
            .record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or_default();
        let expected = self.headers.len();
        let found = self.record.len();

        let mut values: Vec<String> = self
            .record
            .iter()
            .take(expected)
            .map(str::to_string)
            .collect();
        values.resize(expected, String::new());

        let row = RawRow::new(line, Arc::clone(&self.headers), values);
        if found < expected {
            row.with_warning(format!(
                "Row has {found} values, expected {expected}; missing values left empty"
            ))
        } else if found > expected {
            row.with_warning(format!(
                "Row has {found} values, expected {expected}; extra values ignored"
            ))
        } else {
            row
        }
    }
}

impl<R: Read> Iterator for RowStream<R> {
    type Item = ParseResult<RawRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.reader.read_record(&mut self.record) {
                Ok(false) => {
                    self.finished = true;
                    return None;
                }
                Ok(true) => {
                    if self.record.iter().all(|v| v.trim().is_empty()) {
                        continue;
                    }
                    return Some(Ok(self.to_row()));
                }
                Err(err) => {
                    self.finished = true;
                    return Some(Err(err.into()));
                }
            }
        }
    }
}
