//! ROMFS partition codec.
//!
//! Some firmware sections carry a ROMFS partition: a flat archive of
//! named files. The layout is a 4-byte magic, a u32 file count, a
//! fixed-capacity directory of fixed-size entries zero-padded to the
//! dialect's header size, then each file's payload followed by zero
//! padding to the next 2048-byte boundary. A file whose natural end is
//! already aligned still gets a full 2048 bytes of padding; all sample
//! images depend on it, so the rule is a format invariant.
//!
//! The two dialects differ only in the directory capacity and the
//! filename field width; everything else is identical. There is no
//! autodetection: the dialect is chosen at build time (cargo feature)
//! or per invocation.

use crate::{crc32, get_u32_le, name_from_bytes, name_to_bytes, put_u32_le, ROMFS_MAGIC};

/// Alignment unit for ROMFS file payloads.
pub const ROMFS_BLOCK: u32 = 2048;

/// Offset of the first directory entry (after magic and file count).
pub const ROMFS_ENTRY_BASE: usize = 8;

/// Upper bound on plausible file counts; a larger value means the magic
/// was a false hit inside ordinary data.
pub const ROMFS_MAX_FILES: u32 = 0xFFFF;

// ---------------------------------------------------------------------------
// Dialect
// ---------------------------------------------------------------------------

/// ROMFS parameterization: SJ8-class vs SJ10-class cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomfsDialect {
    /// SJ8 Pro / Firefly X Lite: 6144-byte partition header, 64-byte
    /// filename field.
    Sj8Pro,
    /// SJ10 Pro: 139264-byte partition header, 256-byte filename field.
    Sj10Pro,
}

impl RomfsDialect {
    /// Size of the partition header (magic + count + directory +
    /// padding), a multiple of 2048.
    pub const fn header_size(self) -> usize {
        match self {
            RomfsDialect::Sj8Pro => 2048 * 3,
            RomfsDialect::Sj10Pro => 2048 * 68,
        }
    }

    /// Width of the filename field in a directory entry.
    pub const fn name_len(self) -> usize {
        match self {
            RomfsDialect::Sj8Pro => 64,
            RomfsDialect::Sj10Pro => 256,
        }
    }

    /// Size of one directory entry: filename field + length + offset +
    /// CRC32.
    pub const fn entry_size(self) -> usize {
        self.name_len() + 12
    }

    /// Look up by name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sj8pro" => Some(RomfsDialect::Sj8Pro),
            "sj10pro" => Some(RomfsDialect::Sj10Pro),
            _ => None,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            RomfsDialect::Sj8Pro => "sj8pro",
            RomfsDialect::Sj10Pro => "sj10pro",
        }
    }
}

impl Default for RomfsDialect {
    fn default() -> Self {
        if cfg!(feature = "sj10pro") {
            RomfsDialect::Sj10Pro
        } else {
            RomfsDialect::Sj8Pro
        }
    }
}

// ---------------------------------------------------------------------------
// Directory entries
// ---------------------------------------------------------------------------

/// One file recorded in a ROMFS directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomfsFile {
    /// Filename (UTF-8, NUL-padded on disk).
    pub name: String,
    /// Payload length in bytes.
    pub length: u32,
    /// Payload offset relative to the start of the partition.
    pub offset: u32,
    /// CRC32 of the payload.
    pub crc32: u32,
}

/// Tail padding after a file payload: zeros up to the next 2048-byte
/// boundary, a full block when the payload is already aligned. Always
/// in `1..=2048`.
pub fn tail_padding(length: u32) -> u32 {
    ROMFS_BLOCK - (length % ROMFS_BLOCK)
}

// ---------------------------------------------------------------------------
// Parse
// ---------------------------------------------------------------------------

/// Try to parse a ROMFS partition starting at `partition_offset` in
/// `data`.
///
/// Returns `None` when the bytes are not a ROMFS: wrong magic, a file
/// count over [`ROMFS_MAX_FILES`], a directory that overruns the
/// partition header, or an entry whose extent runs outside `data`. The
/// magic is only four bytes, so false hits inside ordinary data are
/// expected and must be rejected here rather than crash the scan.
pub fn parse(data: &[u8], partition_offset: usize, dialect: RomfsDialect) -> Option<Vec<RomfsFile>> {
    let p = partition_offset;
    if p + ROMFS_ENTRY_BASE > data.len() {
        return None;
    }
    if get_u32_le(data, p) != ROMFS_MAGIC {
        return None;
    }
    let count = get_u32_le(data, p + 4);
    if count > ROMFS_MAX_FILES {
        return None;
    }

    let entry_size = dialect.entry_size();
    if ROMFS_ENTRY_BASE + count as usize * entry_size > dialect.header_size() {
        return None;
    }

    let mut files = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let base = p + ROMFS_ENTRY_BASE + i * entry_size;
        if base + entry_size > data.len() {
            return None;
        }
        let name = name_from_bytes(&data[base..base + dialect.name_len()]);
        let length = get_u32_le(data, base + dialect.name_len());
        let offset = get_u32_le(data, base + dialect.name_len() + 4);
        let crc32 = get_u32_le(data, base + dialect.name_len() + 8);

        let start = p as u64 + offset as u64;
        if start + length as u64 > data.len() as u64 {
            return None;
        }
        files.push(RomfsFile {
            name,
            length,
            offset,
            crc32,
        });
    }
    Some(files)
}

/// The payload bytes of one parsed file.
pub fn file_payload<'a>(
    data: &'a [u8],
    partition_offset: usize,
    file: &RomfsFile,
) -> &'a [u8] {
    let start = partition_offset + file.offset as usize;
    &data[start..start + file.length as usize]
}

// ---------------------------------------------------------------------------
// Build
// ---------------------------------------------------------------------------

/// Serialize a ROMFS partition from `(name, payload)` pairs, in order.
///
/// The first file sits at the end of the partition header; each next
/// file follows the previous one's payload and tail padding. Filenames
/// longer than the dialect's field are truncated.
pub fn build(files: &[(String, Vec<u8>)], dialect: RomfsDialect) -> Vec<u8> {
    let header_size = dialect.header_size();
    let mut partition = vec![0u8; header_size];
    put_u32_le(&mut partition, 0, ROMFS_MAGIC);
    put_u32_le(&mut partition, 4, files.len() as u32);

    let mut offset = header_size as u32;
    for (i, (name, payload)) in files.iter().enumerate() {
        let base = ROMFS_ENTRY_BASE + i * dialect.entry_size();
        partition[base..base + dialect.name_len()]
            .copy_from_slice(&name_to_bytes(name, dialect.name_len()));
        let length = payload.len() as u32;
        put_u32_le(&mut partition, base + dialect.name_len(), length);
        put_u32_le(&mut partition, base + dialect.name_len() + 4, offset);
        put_u32_le(&mut partition, base + dialect.name_len() + 8, crc32(payload));
        offset += length + tail_padding(length);
    }

    for (_, payload) in files {
        partition.extend_from_slice(payload);
        partition.resize(partition.len() + tail_padding(payload.len() as u32) as usize, 0);
    }
    partition
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
