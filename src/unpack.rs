//! Unpack: verify a firmware image and extract it to a directory.
//!
//! Unpacking is lenient and diagnostic. Every checksum layer is
//! verified and reported, but a mismatch never aborts; the tool
//! extracts what it can. Section discovery is driven by a scan for the
//! section magic; the directory in the file header is advisory (a magic
//! hit whose header offset is not in the directory is reported and
//! skipped rather than extracted as a section).
//!
//! The output directory layout is the contract the repacker consumes:
//!
//! - `00000000_header.bin` — the 560-byte file header, verbatim
//! - `<H>_head.bin` — each 256-byte section header at file offset `H`
//! - `<P>_sect.bin` — the payload of a non-ROMFS section at offset `P`
//! - `<P>.dir` + `<P>_files/` — the file listing and contents of a
//!   ROMFS section (no `_sect.bin` is written for those)
//!
//! Offsets are rendered as exactly 8 uppercase hex digits so that a
//! lexicographic sort of the directory reproduces byte order.

use std::fs;
use std::path::Path;

use crate::romfs::{self, RomfsDialect};
use crate::{
    checksum_file_bytes, crc32, crc32_seeded, md5_hex, FileHeader, FwError, Result, SectionHeader,
    VersionOrder, FILE_HEADER_SIZE, FW_MAGIC, ROMFS_MAGIC, SECTION_HEADER_SIZE, SECTION_MAGIC,
    SECTION_MAGIC_OFFSET,
};

/// What the verification layers found. Extraction results live on disk;
/// this is the diagnostic residue.
#[derive(Debug, Default)]
pub struct UnpackSummary {
    /// `.ch` comparison result; `None` when no checksum file was read.
    pub md5_ok: Option<bool>,
    /// Body CRC32 at header offset 36 matched the computed value.
    pub body_crc_ok: bool,
    /// Sections extracted.
    pub sections: usize,
    /// ROMFS partitions extracted.
    pub romfs_partitions: usize,
    /// CRC mismatches across all layers (body, chain, section, ROMFS
    /// file).
    pub crc_failures: usize,
}

/// Find every occurrence of a 4-byte magic in `data`.
pub fn scan_magic(data: &[u8], magic: u32) -> Vec<usize> {
    let needle = magic.to_le_bytes();
    if data.len() < 4 {
        return Vec::new();
    }
    data.windows(4)
        .enumerate()
        .filter(|(_, w)| *w == needle)
        .map(|(i, _)| i)
        .collect()
}

/// Unpack `fw_path` into `dest`, which must not pre-exist.
///
/// `ch_path` names the sibling `.ch` checksum file; a missing file is a
/// warning, a mismatch is reported but not fatal.
pub fn unpack(
    fw_path: &Path,
    ch_path: Option<&Path>,
    dest: &Path,
    dialect: RomfsDialect,
) -> Result<UnpackSummary> {
    if !fw_path.is_file() {
        return Err(FwError::InputMissing(fw_path.display().to_string()));
    }
    if dest.exists() {
        return Err(FwError::OutputExists(dest.display().to_string()));
    }

    let data = fs::read(fw_path)?;
    let mut summary = UnpackSummary::default();

    let digest = md5_hex(&data);
    println!("MD5: {digest}");
    summary.md5_ok = match ch_path {
        Some(ch) if ch.is_file() => {
            let stored = fs::read(ch)?;
            let ok = stored == checksum_file_bytes(&digest)?;
            println!("Checksum file: {}", if ok { "OK" } else { "FAIL" });
            Some(ok)
        }
        Some(ch) => {
            eprintln!(
                "warning: checksum file {} not found, skipping MD5 check",
                ch.display()
            );
            None
        }
        None => None,
    };

    let header = FileHeader::from_bytes(&data)?;
    if header.magic != FW_MAGIC {
        eprintln!(
            "warning: unexpected file header magic 0x{:08X}",
            header.magic
        );
    }
    println!("Firmware name: {}", header.name);

    let body_crc = crc32(&data[FILE_HEADER_SIZE..]);
    summary.body_crc_ok = body_crc == header.body_crc32;
    if !summary.body_crc_ok {
        summary.crc_failures += 1;
    }
    println!(
        "Body CRC32: stored {:08X}, computed {body_crc:08X} ({})",
        header.body_crc32,
        if summary.body_crc_ok { "OK" } else { "FAIL" }
    );

    // Running CRC chain across the sections the directory declares.
    let offsets = header.section_offsets();
    let mut chain_ok = vec![false; header.directory.len()];
    let mut running = 0u32;
    let mut off = FILE_HEADER_SIZE as u64;
    for (i, entry) in header.directory.iter().enumerate() {
        let start = (off as usize).min(data.len());
        let end = ((off + entry.length as u64) as usize).min(data.len());
        running = crc32_seeded(running, &data[start..end]);
        chain_ok[i] = running == entry.running_crc32();
        if !chain_ok[i] {
            summary.crc_failures += 1;
        }
        off += entry.length as u64;
    }

    fs::create_dir_all(dest)?;
    fs::write(dest.join("00000000_header.bin"), &data[..FILE_HEADER_SIZE])?;

    println!();
    for m in scan_magic(&data, SECTION_MAGIC) {
        if m < SECTION_MAGIC_OFFSET {
            continue;
        }
        let h = m - SECTION_MAGIC_OFFSET;
        let Some(index) = offsets.iter().position(|&o| o == h as u64) else {
            eprintln!("warning: section magic at 0x{m:08X} matches no directory entry, ignoring");
            continue;
        };
        if h + SECTION_HEADER_SIZE > data.len() {
            eprintln!("warning: section header at 0x{h:08X} is truncated, skipping");
            continue;
        }
        let head_bytes = &data[h..h + SECTION_HEADER_SIZE];
        let section = SectionHeader::from_bytes(head_bytes)?;

        let p = h + SECTION_HEADER_SIZE;
        let declared_end = p + section.length as usize;
        let end = declared_end.min(data.len());
        if end < declared_end {
            eprintln!(
                "warning: section at 0x{h:08X} declares {} payload bytes but the file ends early",
                section.length
            );
        }
        let payload = &data[p..end];
        let payload_ok = end == declared_end && crc32(payload) == section.crc32;
        if !payload_ok {
            summary.crc_failures += 1;
        }

        let (major, minor) = section.version_pair(VersionOrder::default());
        println!(
            "section {index} @ 0x{h:08X}: v{major}.{minor}, {}, {} bytes, CRC {}, chain {}",
            section.date_display(),
            section.length,
            if payload_ok { "OK" } else { "FAIL" },
            if chain_ok[index] { "OK" } else { "FAIL" }
        );

        fs::write(dest.join(format!("{h:08X}_head.bin")), head_bytes)?;
        if romfs::parse(&data, p, dialect).is_none() {
            fs::write(dest.join(format!("{p:08X}_sect.bin")), payload)?;
        }
        summary.sections += 1;
    }

    for r in scan_magic(&data, ROMFS_MAGIC) {
        let Some(files) = romfs::parse(&data, r, dialect) else {
            continue;
        };
        println!();
        println!("ROMFS partition at 0x{r:08X}: {} files", files.len());
        let files_dir = dest.join(format!("{r:08X}_files"));
        fs::create_dir_all(&files_dir)?;
        let mut listing = String::new();
        for (i, file) in files.iter().enumerate() {
            if file.name.is_empty() {
                eprintln!("warning: nameless file entry {i} at 0x{r:08X}, skipping");
                continue;
            }
            let payload = romfs::file_payload(&data, r, file);
            let ok = crc32(payload) == file.crc32;
            if !ok {
                summary.crc_failures += 1;
            }
            println!(
                "  ({}/{}) {} - {} bytes @ 0x{:08X}, CRC {}",
                i + 1,
                files.len(),
                file.name,
                file.length,
                file.offset,
                if ok { "OK" } else { "FAIL" }
            );
            let out_path = files_dir.join(&file.name);
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(out_path, payload)?;
            listing.push_str(&file.name);
            listing.push('\n');
        }
        fs::write(dest.join(format!("{r:08X}.dir")), listing)?;
        summary.romfs_partitions += 1;
    }

    Ok(summary)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
