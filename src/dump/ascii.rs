//! ASCII dump format
//!
//! ```text
//! # hashdbm dump file
//! #:version=1.0
//! #:file=users.db
//! #:mode=0644
//! #:format=standard
//! # End of header
//! #:len=5
//! YWxpY2U=
//! #:len=3
//! MzQ=
//! ...
//! #:count=2
//! # End of data
//! ```
//!
//! Every key and value is preceded by its length and written as base64 in
//! lines of at most 76 characters.

use std::io::{BufRead, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{Corruption, DbmError, IoOp, Result};
use crate::storage::Format;

use super::DumpHeader;

/// Longest base64 line
pub const LINE_WIDTH: usize = 76;

const END_OF_HEADER: &str = "# End of header";
const END_OF_DATA: &str = "# End of data";

/// Writes an ASCII dump
pub struct AsciiWriter<W: Write> {
    out: W,
    count: u64,
}

impl<W: Write> AsciiWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out, count: 0 }
    }

    pub fn write_header(&mut self, header: &DumpHeader) -> Result<()> {
        let out = &mut self.out;
        let mut lines = vec![
            "# hashdbm dump file".to_string(),
            format!("#:version={}", header.version),
        ];
        if let Some(file) = &header.file {
            lines.push(format!("#:file={}", file));
        }
        if let Some(mode) = header.mode {
            lines.push(format!("#:mode={:04o}", mode));
        }
        if let Some(format) = header.format {
            lines.push(format!("#:format={}", format_name(format)));
        }
        lines.push(END_OF_HEADER.to_string());

        for line in lines {
            writeln!(out, "{}", line).map_err(DbmError::io(IoOp::Write))?;
        }
        Ok(())
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_datum(key)?;
        self.write_datum(value)?;
        self.count += 1;
        Ok(())
    }

    fn write_datum(&mut self, data: &[u8]) -> Result<()> {
        writeln!(self.out, "#:len={}", data.len()).map_err(DbmError::io(IoOp::Write))?;
        let encoded = STANDARD.encode(data);
        for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
            self.out.write_all(chunk).map_err(DbmError::io(IoOp::Write))?;
            self.out.write_all(b"\n").map_err(DbmError::io(IoOp::Write))?;
        }
        Ok(())
    }

    /// Write the trailer and hand back the output
    pub fn finish(mut self) -> Result<(W, u64)> {
        writeln!(self.out, "#:count={}", self.count).map_err(DbmError::io(IoOp::Write))?;
        writeln!(self.out, "{}", END_OF_DATA).map_err(DbmError::io(IoOp::Write))?;
        Ok((self.out, self.count))
    }
}

/// Reads an ASCII dump
pub struct AsciiReader<R: BufRead> {
    input: R,
    line: usize,
    count: u64,
    done: bool,
}

impl<R: BufRead> AsciiReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            count: 0,
            done: false,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> DbmError {
        Corruption::MalformedData {
            line: self.line,
            reason: reason.into(),
        }
        .into()
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .input
            .read_line(&mut line)
            .map_err(DbmError::io(IoOp::Read))?;
        if n == 0 {
            return Ok(None);
        }
        self.line += 1;
        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    /// Parse everything up to `# End of header`
    pub fn read_header(&mut self) -> Result<DumpHeader> {
        let mut header = DumpHeader {
            version: String::new(),
            file: None,
            mode: None,
            format: None,
        };

        loop {
            let line = self
                .read_line()?
                .ok_or_else(|| self.malformed("unexpected end of file in header"))?;
            if line == END_OF_HEADER {
                break;
            }

            if let Some(field) = line.strip_prefix("#:") {
                let (name, value) = field
                    .split_once('=')
                    .ok_or_else(|| self.malformed("header field without value"))?;
                match name {
                    "version" => header.version = value.to_string(),
                    "file" => header.file = Some(value.to_string()),
                    "mode" => {
                        let mode = u32::from_str_radix(value, 8)
                            .map_err(|_| self.malformed("bad file mode"))?;
                        header.mode = Some(mode);
                    }
                    "format" => {
                        let format = parse_format(value)
                            .ok_or_else(|| self.malformed("unknown database format"))?;
                        header.format = Some(format);
                    }
                    // Fields from newer writers
                    _ => {}
                }
            } else if !line.starts_with('#') {
                return Err(self.malformed("expected header line"));
            }
        }

        if header.version.is_empty() {
            return Err(self.malformed("missing version"));
        }
        Ok(header)
    }

    /// Next key/value pair, or `None` after a trailer whose count matches
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.done {
            return Ok(None);
        }

        let line = self
            .read_line()?
            .ok_or_else(|| self.malformed("missing record count"))?;

        if let Some(count) = line.strip_prefix("#:count=") {
            let expected: u64 = count
                .parse()
                .map_err(|_| self.malformed("bad record count"))?;
            if expected != self.count {
                return Err(self.malformed(format!(
                    "record count {} does not match {} records read",
                    expected, self.count
                )));
            }
            self.done = true;
            return Ok(None);
        }

        let key = self.read_datum(&line)?;
        let value_line = self
            .read_line()?
            .ok_or_else(|| self.malformed("missing value"))?;
        let value = self.read_datum(&value_line)?;
        self.count += 1;
        Ok(Some((key, value)))
    }

    fn read_datum(&mut self, len_line: &str) -> Result<Vec<u8>> {
        let len: u32 = len_line
            .strip_prefix("#:len=")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| self.malformed("expected #:len line with a 32-bit length"))?;
        let len = len as usize;

        // Grows with the lines actually read, never from the declared length
        let needed = len.div_ceil(3) * 4;
        let mut text = String::new();
        while text.len() < needed {
            let line = self
                .read_line()?
                .ok_or_else(|| self.malformed("truncated data"))?;
            if line.starts_with('#') || line.len() > LINE_WIDTH {
                return Err(self.malformed("bad data line"));
            }
            text.push_str(line.trim());
        }

        let data = STANDARD
            .decode(text.as_bytes())
            .map_err(|e| self.malformed(format!("bad base64: {}", e)))?;
        if data.len() != len {
            return Err(self.malformed(format!(
                "decoded {} bytes, expected {}",
                data.len(),
                len
            )));
        }
        Ok(data)
    }
}

fn format_name(format: Format) -> &'static str {
    match format {
        Format::Standard => "standard",
        Format::Numsync => "numsync",
    }
}

fn parse_format(name: &str) -> Option<Format> {
    match name {
        "standard" => Some(Format::Standard),
        "numsync" => Some(Format::Numsync),
        _ => None,
    }
}
