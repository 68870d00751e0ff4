//! Dump Module
//!
//! Bulk export and import of all records.
//!
//! ## Formats
//! - ASCII: self-describing text (`#:` header lines, base64 data), starts with `#`
//! - Binary: length-prefixed records after a signature line, starts with `!`
//!
//! The format of an input is detected from its first byte.

pub mod ascii;
pub mod binary;

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::config::{DumpConfig, DumpFormat};
use crate::error::{Corruption, DbmError, IoOp, Result};
use crate::storage::Format;
use crate::table::{Cursor, HashTable};

pub use ascii::{AsciiReader, AsciiWriter};
pub use binary::{BinaryReader, BinaryWriter};

/// Version written to `#:version`
pub const DUMP_VERSION: &str = "1.0";

/// Metadata carried by an ASCII dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    pub version: String,
    /// Database file name, without directories
    pub file: Option<String>,
    /// Permission bits of the database file
    pub mode: Option<u32>,
    pub format: Option<Format>,
}

impl DumpHeader {
    /// Describe the database behind `table`
    pub fn describe(table: &HashTable) -> Result<Self> {
        let path = table.file().path();
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            let metadata = table.file().file().metadata().map_err(DbmError::io(IoOp::Stat))?;
            Some(metadata.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;

        Ok(Self {
            version: DUMP_VERSION.to_string(),
            file,
            mode,
            format: Some(table.format()),
        })
    }
}

/// Write every record of `table` to `out`; returns the record count
pub fn dump_to<W: Write>(table: &HashTable, out: W, format: DumpFormat) -> Result<u64> {
    let mut cursor = Cursor::start();

    let (mut out, count) = match format {
        DumpFormat::Ascii => {
            let mut writer = AsciiWriter::new(out);
            writer.write_header(&DumpHeader::describe(table)?)?;
            while let Some((key, value, next)) = table.next_record(cursor)? {
                writer.write_record(&key, &value)?;
                cursor = next;
            }
            writer.finish()?
        }
        DumpFormat::Binary => {
            let mut writer = BinaryWriter::new(out)?;
            while let Some((key, value, next)) = table.next_record(cursor)? {
                writer.write_record(&key, &value)?;
                cursor = next;
            }
            writer.finish()?
        }
    };

    out.flush().map_err(DbmError::io(IoOp::Write))?;
    Ok(count)
}

/// Dump `table` to the file named by `config`
pub fn dump(table: &HashTable, config: &DumpConfig) -> Result<u64> {
    let mut options = OpenOptions::new();
    options.write(true);
    if config.overwrite {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(config.file_mode);
    }

    let file = options.open(&config.path).map_err(DbmError::io(IoOp::Open))?;
    let mut out = BufWriter::new(file);
    let count = dump_to(table, &mut out, config.format)?;
    let file = out
        .into_inner()
        .map_err(|e| DbmError::io(IoOp::Write)(e.into_error()))?;
    file.sync_all().map_err(DbmError::io(IoOp::Sync))?;

    tracing::info!(
        "Dumped {} records to {} ({:?})",
        count,
        config.path.display(),
        config.format
    );
    Ok(count)
}

/// Store every record read from `input`; returns the record count
///
/// With `replace` unset an existing key stops the load with
/// `CannotReplace`; records stored before it stay in the database.
pub fn load_from<R: BufRead>(table: &mut HashTable, mut input: R, replace: bool) -> Result<u64> {
    let first = input
        .fill_buf()
        .map_err(DbmError::io(IoOp::Read))?
        .first()
        .copied();

    let mut count = 0u64;
    match first {
        Some(b'#') => {
            let mut reader = AsciiReader::new(input);
            reader.read_header()?;
            while let Some((key, value)) = reader.next_record()? {
                table.store(&key, &value, replace)?;
                count += 1;
            }
        }
        Some(b'!') => {
            let mut reader = BinaryReader::new(input)?;
            while let Some((key, value)) = reader.next_record()? {
                table.store(&key, &value, replace)?;
                count += 1;
            }
        }
        _ => {
            return Err(Corruption::MalformedData {
                line: 1,
                reason: "not a dump file".to_string(),
            }
            .into())
        }
    }
    Ok(count)
}

/// Load the dump file at `path` into `table`
pub fn load(table: &mut HashTable, path: &Path, replace: bool) -> Result<u64> {
    let file = File::open(path).map_err(DbmError::io(IoOp::Open))?;
    let count = load_from(table, BufReader::new(file), replace)?;
    tracing::info!("Loaded {} records from {}", count, path.display());
    Ok(count)
}

/// Header of the ASCII dump at `path`
///
/// Binary dumps carry no metadata and are rejected with `Usage`.
pub fn read_header(path: &Path) -> Result<DumpHeader> {
    let file = File::open(path).map_err(DbmError::io(IoOp::Open))?;
    let mut input = BufReader::new(file);
    let first = input
        .fill_buf()
        .map_err(DbmError::io(IoOp::Read))?
        .first()
        .copied();
    if first == Some(b'!') {
        return Err(DbmError::Usage(
            "a binary dump does not describe a database".to_string(),
        ));
    }
    AsciiReader::new(input).read_header()
}
