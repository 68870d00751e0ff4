//! Binary dump format
//!
//! A signature line followed by records of
//! `[u32 BE key len][key][u32 BE value len][value]` up to end of file.

use std::io::{self, Read, Write};

use bytes::BufMut;

use crate::error::{Corruption, DbmError, IoOp, Result};

/// First line of every binary dump
pub const SIGNATURE: &[u8] = b"!hashdbm binary dump 1\n";

/// Writes a binary dump
pub struct BinaryWriter<W: Write> {
    out: W,
    count: u64,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(mut out: W) -> Result<Self> {
        out.write_all(SIGNATURE).map_err(DbmError::io(IoOp::Write))?;
        Ok(Self { out, count: 0 })
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut buf = Vec::with_capacity(8 + key.len() + value.len());
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);
        self.out.write_all(&buf).map_err(DbmError::io(IoOp::Write))?;
        self.count += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<(W, u64)> {
        Ok((self.out, self.count))
    }
}

/// Reads a binary dump
///
/// Positions in errors are record numbers (the signature is record 0).
pub struct BinaryReader<R: Read> {
    input: R,
    record: usize,
}

impl<R: Read> BinaryReader<R> {
    /// Check the signature
    pub fn new(mut input: R) -> Result<Self> {
        let mut signature = vec![0u8; SIGNATURE.len()];
        match input.read_exact(&mut signature) {
            Ok(()) if signature == SIGNATURE => Ok(Self { input, record: 0 }),
            Ok(()) => Err(malformed(0, "bad signature")),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                Err(malformed(0, "truncated signature"))
            }
            Err(e) => Err(DbmError::io(IoOp::Read)(e)),
        }
    }

    /// Next key/value pair, or `None` at a clean end of file
    pub fn next_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.record += 1;
        let Some(key_len) = self.read_len(true)? else {
            return Ok(None);
        };
        let key = self.read_data(key_len)?;
        let value_len = self
            .read_len(false)?
            .ok_or_else(|| malformed(self.record, "missing value"))?;
        let value = self.read_data(value_len)?;
        Ok(Some((key, value)))
    }

    /// A big-endian length; end of file is clean only before a record
    fn read_len(&mut self, record_start: bool) -> Result<Option<u32>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match self.input.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(DbmError::io(IoOp::Read)(e)),
            }
        }

        match filled {
            0 if record_start => Ok(None),
            4 => Ok(Some(u32::from_be_bytes(buf))),
            _ => Err(malformed(self.record, "truncated length")),
        }
    }

    fn read_data(&mut self, len: u32) -> Result<Vec<u8>> {
        // Grows as data arrives, so a damaged length cannot force a huge allocation
        let mut data = Vec::new();
        (&mut self.input)
            .take(len as u64)
            .read_to_end(&mut data)
            .map_err(DbmError::io(IoOp::Read))?;
        if data.len() != len as usize {
            return Err(malformed(self.record, "truncated data"));
        }
        Ok(data)
    }
}

fn malformed(record: usize, reason: &str) -> DbmError {
    Corruption::MalformedData {
        line: record,
        reason: reason.to_string(),
    }
    .into()
}
