//! # h22pack
//!
//! A Rust library for unpacking and repacking Ambarella H22 firmware
//! images as shipped on consumer action cameras (SJCAM SJ8 Pro,
//! SJ10 Pro, Firefly X Lite).
//!
//! An H22 firmware image is a structured container:
//!
//! - a 560-byte file header carrying the firmware name, a global magic,
//!   a CRC32 over the body, and a 16-entry section directory;
//! - a sequence of typed sections, each with a 256-byte header and a
//!   payload of declared length;
//! - inside some sections, a ROMFS partition: a flat archive of named
//!   files with per-file CRC32s and 2048-byte tail padding.
//!
//! Integrity is layered: an MD5 of the whole file (stored in a sibling
//! `.ch` file), a CRC32 over the body, a running CRC32 chained across
//! sections in the directory, a CRC32 per section payload, and a CRC32
//! per ROMFS file. Unpacking verifies every layer and extracts the
//! sections and ROMFS files to a directory; repacking rebuilds a
//! byte-identical image from that directory, recomputing every checksum
//! and length field.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use h22pack::romfs::RomfsDialect;
//!
//! let dialect = RomfsDialect::default();
//! h22pack::unpack::unpack(
//!     Path::new("firmware.bin"),
//!     Some(Path::new("firmware.ch")),
//!     Path::new("extracted"),
//!     dialect,
//! ).unwrap();
//! // ... edit files under extracted/ ...
//! h22pack::repack::repack(
//!     Path::new("extracted"),
//!     Path::new("patched.bin"),
//!     Path::new("patched.ch"),
//!     dialect,
//! ).unwrap();
//! ```

pub mod repack;
pub mod romfs;
pub mod unpack;

use std::fmt;
use std::io;

use crc32fast::Hasher;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number of the firmware file header (bytes `E6 DF 32 87`).
pub const FW_MAGIC: u32 = 0x8732_DFE6;

/// Magic number found at offset 24 of every section header
/// (bytes `90 EB 24 A3`).
pub const SECTION_MAGIC: u32 = 0xA324_EB90;

/// Magic number at the start of a ROMFS partition (bytes `8A 32 FC 66`).
pub const ROMFS_MAGIC: u32 = 0x66FC_328A;

/// Size of the firmware file header in bytes.
pub const FILE_HEADER_SIZE: usize = 560;

/// Length of the firmware name field at the start of the file header.
pub const FW_NAME_LEN: usize = 32;

/// Offset of the body CRC32 inside the file header.
pub const BODY_CRC_OFFSET: usize = 36;

/// Offset of the section directory inside the file header.
pub const SECTION_DIR_OFFSET: usize = 48;

/// Capacity of the section directory.
pub const SECTION_DIR_ENTRIES: usize = 16;

/// Size of a section header in bytes.
pub const SECTION_HEADER_SIZE: usize = 256;

/// Offset of [`SECTION_MAGIC`] inside a section header.
pub const SECTION_MAGIC_OFFSET: usize = 24;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FwError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("input not found: {0}")]
    InputMissing(String),

    #[error("refusing to overwrite existing {0}")]
    OutputExists(String),

    #[error("bad {kind} magic at offset 0x{offset:08X}")]
    BadMagic { kind: &'static str, offset: u64 },

    #[error("{what} too small ({size} bytes, need at least {min})")]
    TooSmall {
        what: &'static str,
        size: usize,
        min: usize,
    },

    #[error("missing data for section at 0x{0:08X} (no _sect.bin or .dir)")]
    MissingSectionData(u64),

    #[error("too many sections ({0}), the directory holds at most 16")]
    TooManySections(usize),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, FwError>;

// ---------------------------------------------------------------------------
// Byte helpers
// ---------------------------------------------------------------------------

/// Read a little-endian u16 from a byte slice at the given offset.
pub fn get_u16_le(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(data[off..off + 2].try_into().unwrap())
}

/// Read a little-endian u32 from a byte slice at the given offset.
pub fn get_u32_le(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(data[off..off + 4].try_into().unwrap())
}

/// Write a little-endian u32 into a byte slice at the given offset.
pub fn put_u32_le(data: &mut [u8], off: usize, val: u32) {
    data[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Decode a fixed-width, NUL-padded text field.
pub fn name_from_bytes(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Encode text into a fixed-width, NUL-padded field. Names longer than
/// the field are silently truncated.
pub fn name_to_bytes(name: &str, field: usize) -> Vec<u8> {
    let mut buf = vec![0u8; field];
    let bytes = name.as_bytes();
    let copy_len = bytes.len().min(field);
    buf[..copy_len].copy_from_slice(&bytes[..copy_len]);
    buf
}

// ---------------------------------------------------------------------------
// CRC-32 / MD5 helpers
// ---------------------------------------------------------------------------

/// Compute CRC-32 of a byte slice (zlib polynomial, CRC of empty input
/// is 0).
pub fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Compute CRC-32 resuming from `seed`, the CRC of the preceding bytes.
///
/// This is the chained form used by the section directory:
/// `crc32_seeded(crc32(a), b) == crc32(a ++ b)`.
pub fn crc32_seeded(seed: u32, data: &[u8]) -> u32 {
    let mut h = Hasher::new_with_initial(seed);
    h.update(data);
    h.finalize()
}

/// MD5 of a byte slice as 32 lowercase hex digits.
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

// ---------------------------------------------------------------------------
// Checksum (.ch) file codec
// ---------------------------------------------------------------------------

/// Encode an MD5 hex digest as the 16-byte `.ch` file contents.
///
/// Each 8-hex-digit slice of the digest, read left to right, is parsed
/// as a u32 and written little-endian.
pub fn checksum_file_bytes(digest: &str) -> Result<[u8; 16]> {
    if digest.len() != 32 || !digest.is_ascii() {
        return Err(FwError::Other(format!("malformed MD5 digest: {digest:?}")));
    }
    let mut out = [0u8; 16];
    for i in 0..4 {
        let word = u32::from_str_radix(&digest[i * 8..i * 8 + 8], 16)
            .map_err(|_| FwError::Other(format!("malformed MD5 digest: {digest:?}")))?;
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
    }
    Ok(out)
}

/// Decode a 16-byte `.ch` file back into the MD5 hex digest it encodes.
pub fn checksum_file_digest(bytes: &[u8; 16]) -> String {
    let mut s = String::with_capacity(32);
    for i in 0..4 {
        let word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
        s.push_str(&format!("{word:08x}"));
    }
    s
}

// ---------------------------------------------------------------------------
// Version byte order
// ---------------------------------------------------------------------------

/// Byte order of the two 16-bit fields in the section-header version
/// word. Cameras in the wild store it big-endian; the `version-le`
/// build feature flips the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOrder {
    Big,
    Little,
}

impl Default for VersionOrder {
    fn default() -> Self {
        if cfg!(feature = "version-le") {
            VersionOrder::Little
        } else {
            VersionOrder::Big
        }
    }
}

// ---------------------------------------------------------------------------
// Firmware file header
// ---------------------------------------------------------------------------

/// One entry of the section directory: the byte length of a section
/// (header included) and the negated running CRC32 up to and including
/// that section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionDirEntry {
    pub length: u32,
    pub running_crc32_negated: u32,
}

impl SectionDirEntry {
    /// The running CRC32 this entry encodes (`stored ^ 0xFFFFFFFF`).
    pub fn running_crc32(&self) -> u32 {
        self.running_crc32_negated ^ 0xFFFF_FFFF
    }
}

/// The parsed 560-byte firmware file header.
///
/// Only the fields the tool interprets are extracted; everything else
/// in the header (including the unidentified region at offset 0xB0) is
/// opaque and must be carried verbatim by a repack.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// Firmware name (32-byte NUL-padded field at offset 0).
    pub name: String,
    /// Magic at offset 32; [`FW_MAGIC`] on a well-formed image.
    pub magic: u32,
    /// CRC32 over the body, bytes `[560, EOF)`, stored at offset 36.
    pub body_crc32: u32,
    /// Section directory, terminated by the first zero-length entry.
    pub directory: Vec<SectionDirEntry>,
}

impl FileHeader {
    /// Parse the file header from the start of an image.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(FwError::TooSmall {
                what: "firmware image",
                size: data.len(),
                min: FILE_HEADER_SIZE,
            });
        }

        let mut directory = Vec::new();
        for i in 0..SECTION_DIR_ENTRIES {
            let base = SECTION_DIR_OFFSET + i * 8;
            let length = get_u32_le(data, base);
            if length == 0 {
                break;
            }
            directory.push(SectionDirEntry {
                length,
                running_crc32_negated: get_u32_le(data, base + 4),
            });
        }

        Ok(Self {
            name: name_from_bytes(&data[..FW_NAME_LEN]),
            magic: get_u32_le(data, FW_NAME_LEN),
            body_crc32: get_u32_le(data, BODY_CRC_OFFSET),
            directory,
        })
    }

    /// File offsets of the section headers the directory describes:
    /// section 0 starts right after the file header, each next section
    /// right after the previous one's declared length.
    pub fn section_offsets(&self) -> Vec<u64> {
        let mut offsets = Vec::with_capacity(self.directory.len());
        let mut off = FILE_HEADER_SIZE as u64;
        for entry in &self.directory {
            offsets.push(off);
            off += entry.length as u64;
        }
        offsets
    }
}

// ---------------------------------------------------------------------------
// Section header
// ---------------------------------------------------------------------------

/// The parsed 256-byte section header.
///
/// `memory` and `flag` are opaque to this tool and round-trip
/// byte-for-byte (a repack reuses the extracted header bytes and only
/// patches `crc32` and `length`).
#[derive(Debug, Clone)]
pub struct SectionHeader {
    /// CRC32 of the payload (not including this header).
    pub crc32: u32,
    /// Raw version word at offset 4; decode with [`Self::version_pair`].
    pub version: [u8; 4],
    /// Build date: day of month.
    pub day: u8,
    /// Build date: month.
    pub month: u8,
    /// Build date: year.
    pub year: u16,
    /// Payload length in bytes.
    pub length: u32,
    /// Memory address hint (opaque).
    pub memory: u32,
    /// Flags (opaque).
    pub flag: u32,
    /// Magic at offset 24; [`SECTION_MAGIC`] on a well-formed section.
    pub magic: u32,
}

impl SectionHeader {
    /// Parse a section header from a byte slice (must be >= 256 bytes).
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SECTION_HEADER_SIZE {
            return Err(FwError::TooSmall {
                what: "section header",
                size: data.len(),
                min: SECTION_HEADER_SIZE,
            });
        }
        Ok(Self {
            crc32: get_u32_le(data, 0),
            version: data[4..8].try_into().unwrap(),
            day: data[8],
            month: data[9],
            year: get_u16_le(data, 10),
            length: get_u32_le(data, 12),
            memory: get_u32_le(data, 16),
            flag: get_u32_le(data, 20),
            magic: get_u32_le(data, SECTION_MAGIC_OFFSET),
        })
    }

    /// Decode the version word as `(major, minor)`.
    pub fn version_pair(&self, order: VersionOrder) -> (u16, u16) {
        let v = self.version;
        match order {
            VersionOrder::Big => (
                u16::from_be_bytes([v[0], v[1]]),
                u16::from_be_bytes([v[2], v[3]]),
            ),
            VersionOrder::Little => (
                u16::from_le_bytes([v[0], v[1]]),
                u16::from_le_bytes([v[2], v[3]]),
            ),
        }
    }

    /// Build date as `YYYY-MM-DD`, or the raw numbers if the stored
    /// values do not form a calendar date.
    pub fn date_display(&self) -> String {
        match chrono::NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)
        {
            Some(d) => d.format("%Y-%m-%d").to_string(),
            None => format!("{}-{}-{}", self.year, self.month, self.day),
        }
    }
}

impl fmt::Display for SectionHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (major, minor) = self.version_pair(VersionOrder::default());
        write!(
            f,
            "v{}.{} {} len={} mem=0x{:08X} flag=0x{:08X}",
            major,
            minor,
            self.date_display(),
            self.length,
            self.memory,
            self.flag
        )
    }
}

/// Patch the two fields a repack is allowed to touch in a section
/// header: the payload CRC32 at offset 0 and the payload length at
/// offset 12. All other bytes stay as extracted.
pub fn patch_section_header(header: &mut [u8], payload_crc32: u32, payload_len: u32) {
    put_u32_le(header, 0, payload_crc32);
    put_u32_le(header, 12, payload_len);
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
