//! Repack: rebuild a flashable image from an extracted directory.
//!
//! Repacking is strict. It trusts the directory layout the unpacker
//! produced (there is no magic re-scan) and aborts on anything missing
//! or malformed. The stored 560-byte header is emitted
//! verbatim; the only bytes ever rewritten are the section directory
//! entries, the body CRC32, and the CRC32/length pair in each section
//! header. Everything the tool does not understand (the unidentified
//! header region at 0xB0, section `memory` and `flag` fields) therefore
//! rides along untouched.
//!
//! Emission order is the lexicographic sort of the source directory:
//! the 8-uppercase-hex-digit offset prefixes make name order equal byte
//! order, with `00000000_header.bin` first.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::romfs::{self, RomfsDialect};
use crate::{
    checksum_file_bytes, crc32, crc32_seeded, get_u32_le, md5_hex, patch_section_header,
    put_u32_le, FwError, Result, BODY_CRC_OFFSET, FILE_HEADER_SIZE, SECTION_DIR_ENTRIES,
    SECTION_DIR_OFFSET, SECTION_HEADER_SIZE, SECTION_MAGIC, SECTION_MAGIC_OFFSET,
};

/// Rebuild `out_bin` and `out_ch` from the extracted layout in
/// `src_dir`. Both outputs must not pre-exist.
pub fn repack(src_dir: &Path, out_bin: &Path, out_ch: &Path, dialect: RomfsDialect) -> Result<()> {
    if !src_dir.is_dir() {
        return Err(FwError::InputMissing(src_dir.display().to_string()));
    }
    if out_bin.exists() {
        return Err(FwError::OutputExists(out_bin.display().to_string()));
    }
    if out_ch.exists() {
        return Err(FwError::OutputExists(out_ch.display().to_string()));
    }

    let header_path = src_dir.join("00000000_header.bin");
    if !header_path.is_file() {
        return Err(FwError::InputMissing(header_path.display().to_string()));
    }
    let header = fs::read(&header_path)?;
    if header.len() != FILE_HEADER_SIZE {
        return Err(FwError::Other(format!(
            "{} must be exactly {FILE_HEADER_SIZE} bytes, found {}",
            header_path.display(),
            header.len()
        )));
    }

    let mut names: Vec<String> = fs::read_dir(src_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut out = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(out_bin)?;
    out.write_all(&header)?;

    let mut running = 0u32;
    let mut sections = 0usize;
    for name in &names {
        let Some(offset_hex) = name.strip_suffix("_head.bin") else {
            continue;
        };
        let h_off = u32::from_str_radix(offset_hex, 16)
            .map_err(|_| FwError::Other(format!("unparseable section file name: {name}")))?;
        if sections == SECTION_DIR_ENTRIES {
            return Err(FwError::TooManySections(sections + 1));
        }

        let mut head = fs::read(src_dir.join(name))?;
        if head.len() != SECTION_HEADER_SIZE {
            return Err(FwError::Other(format!(
                "{name} must be exactly {SECTION_HEADER_SIZE} bytes, found {}",
                head.len()
            )));
        }
        if get_u32_le(&head, SECTION_MAGIC_OFFSET) != SECTION_MAGIC {
            return Err(FwError::BadMagic {
                kind: "section",
                offset: h_off as u64 + SECTION_MAGIC_OFFSET as u64,
            });
        }

        let payload_hex = format!("{:08X}", h_off as u64 + SECTION_HEADER_SIZE as u64);
        let dir_path = src_dir.join(format!("{payload_hex}.dir"));
        let sect_path = src_dir.join(format!("{payload_hex}_sect.bin"));

        let section_len;
        if dir_path.is_file() {
            // ROMFS section: rebuild the partition from the listing,
            // in listing order
            let listing = fs::read_to_string(&dir_path)?;
            let files_dir = src_dir.join(format!("{payload_hex}_files"));
            let mut files = Vec::new();
            for file_name in listing.lines().filter(|l| !l.is_empty()) {
                let payload = fs::read(files_dir.join(file_name))?;
                files.push((file_name.to_string(), payload));
            }
            let payload = romfs::build(&files, dialect);
            patch_section_header(&mut head, crc32(&payload), payload.len() as u32);

            let mut section = head;
            section.extend_from_slice(&payload);
            out.write_all(&section)?;
            running = crc32_seeded(running, &section);
            section_len = section.len() as u32;
            println!(
                "section {sections} @ 0x{h_off:08X}: ROMFS, {} files, {section_len} bytes",
                files.len()
            );
        } else if sect_path.is_file() {
            let payload = fs::read(&sect_path)?;
            patch_section_header(&mut head, crc32(&payload), payload.len() as u32);

            // the chain is fed in two steps here; the directory entry
            // records the value after the payload step
            out.write_all(&head)?;
            running = crc32_seeded(running, &head);
            out.write_all(&payload)?;
            running = crc32_seeded(running, &payload);
            section_len = (head.len() + payload.len()) as u32;
            println!("section {sections} @ 0x{h_off:08X}: {section_len} bytes");
        } else {
            return Err(FwError::MissingSectionData(h_off as u64));
        }

        let mut entry = [0u8; 8];
        put_u32_le(&mut entry, 0, section_len);
        put_u32_le(&mut entry, 4, running ^ 0xFFFF_FFFF);
        out.seek(SeekFrom::Start((SECTION_DIR_OFFSET + sections * 8) as u64))?;
        out.write_all(&entry)?;
        out.seek(SeekFrom::End(0))?;
        sections += 1;
    }

    // body CRC32, then the checksum file over the finished image
    out.seek(SeekFrom::Start(0))?;
    let mut image = Vec::new();
    out.read_to_end(&mut image)?;
    let body_crc = crc32(&image[FILE_HEADER_SIZE..]);
    out.seek(SeekFrom::Start(BODY_CRC_OFFSET as u64))?;
    out.write_all(&body_crc.to_le_bytes())?;
    put_u32_le(&mut image, BODY_CRC_OFFSET, body_crc);

    let digest = md5_hex(&image);
    let mut ch = OpenOptions::new().write(true).create_new(true).open(out_ch)?;
    ch.write_all(&checksum_file_bytes(&digest)?)?;
    println!("{sections} sections, {} bytes, MD5 {digest}", image.len());
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{build_image, scratch_path};
    use crate::unpack::unpack;
    use crate::FileHeader;

    /// Write an image plus its checksum file, unpack it, and return the
    /// paths (bin, ch, extraction dir).
    fn unpack_fixture(
        tag: &str,
        image: &[u8],
    ) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
        let bin = scratch_path(&format!("{tag}-bin"));
        fs::write(&bin, image).unwrap();
        let ch = scratch_path(&format!("{tag}-ch"));
        fs::write(&ch, checksum_file_bytes(&md5_hex(image)).unwrap()).unwrap();
        let dest = scratch_path(&format!("{tag}-ext"));
        unpack(&bin, Some(&ch), &dest, RomfsDialect::Sj8Pro).unwrap();
        (bin, ch, dest)
    }

    #[test]
    fn roundtrip_opaque_sections() {
        let image = build_image(&[vec![0x5Au8; 1024], vec![0xC3u8; 2048]]);

        // directory invariants of the fixture itself
        let header = FileHeader::from_bytes(&image).unwrap();
        assert_eq!(header.directory[0].length, 1280);
        assert_eq!(header.directory[1].length, 2304);
        assert_eq!(
            header.directory[1].running_crc32(),
            crc32(&image[FILE_HEADER_SIZE..])
        );

        let (_, _, dest) = unpack_fixture("rt-opaque", &image);
        let out_bin = scratch_path("rt-opaque-out-bin");
        let out_ch = scratch_path("rt-opaque-out-ch");
        repack(&dest, &out_bin, &out_ch, RomfsDialect::Sj8Pro).unwrap();

        assert_eq!(fs::read(&out_bin).unwrap(), image);
        assert_eq!(
            fs::read(&out_ch).unwrap(),
            checksum_file_bytes(&md5_hex(&image)).unwrap().to_vec()
        );
    }

    #[test]
    fn roundtrip_romfs_sections() {
        let files = vec![
            ("kernel.bin".to_string(), vec![0x11u8; 2048]), // aligned, pads a full block
            ("logo.rgb".to_string(), vec![0x22u8; 100]),
        ];
        let payloads = vec![
            romfs::build(&files, RomfsDialect::Sj8Pro),
            romfs::build(&[], RomfsDialect::Sj8Pro), // empty partition
            vec![0x33u8; 513],                       // opaque
        ];
        let image = build_image(&payloads);

        let (_, _, dest) = unpack_fixture("rt-romfs", &image);
        let out_bin = scratch_path("rt-romfs-out-bin");
        let out_ch = scratch_path("rt-romfs-out-ch");
        repack(&dest, &out_bin, &out_ch, RomfsDialect::Sj8Pro).unwrap();

        assert_eq!(fs::read(&out_bin).unwrap(), image);
    }

    #[test]
    fn repack_after_edit_recomputes_checksums() {
        let files = vec![("config.txt".to_string(), b"bitrate=60\n".to_vec())];
        let image = build_image(&[
            romfs::build(&files, RomfsDialect::Sj8Pro),
            vec![0x44u8; 777],
        ]);
        let (_, _, dest) = unpack_fixture("edit", &image);

        // grow the ROMFS file and rewrite the opaque payload
        fs::write(
            dest.join("00000330_files/config.txt"),
            b"bitrate=100\nfps=120\n",
        )
        .unwrap();
        let opaque: Vec<String> = fs::read_dir(&dest)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with("_sect.bin"))
            .collect();
        assert_eq!(opaque.len(), 1);
        fs::write(dest.join(&opaque[0]), vec![0x55u8; 900]).unwrap();

        let out_bin = scratch_path("edit-out-bin");
        let out_ch = scratch_path("edit-out-ch");
        repack(&dest, &out_bin, &out_ch, RomfsDialect::Sj8Pro).unwrap();
        let rebuilt = fs::read(&out_bin).unwrap();
        assert_ne!(rebuilt, image);

        // every checksum layer of the rebuilt image holds
        let header = FileHeader::from_bytes(&rebuilt).unwrap();
        assert_eq!(header.body_crc32, crc32(&rebuilt[FILE_HEADER_SIZE..]));
        let mut running = 0u32;
        let mut off = FILE_HEADER_SIZE;
        for entry in &header.directory {
            let section = &rebuilt[off..off + entry.length as usize];
            running = crc32_seeded(running, section);
            assert_eq!(entry.running_crc32(), running);
            assert_eq!(
                get_u32_le(section, 0),
                crc32(&section[SECTION_HEADER_SIZE..])
            );
            off += entry.length as usize;
        }
        assert_eq!(off, rebuilt.len());

        let parsed = romfs::parse(&rebuilt, FILE_HEADER_SIZE + SECTION_HEADER_SIZE, RomfsDialect::Sj8Pro)
            .unwrap();
        assert_eq!(parsed[0].length as usize, b"bitrate=100\nfps=120\n".len());

        // the checksum file tracks the new image
        assert_eq!(
            fs::read(&out_ch).unwrap(),
            checksum_file_bytes(&md5_hex(&rebuilt)).unwrap().to_vec()
        );
    }

    #[test]
    fn missing_section_data_is_fatal() {
        let image = build_image(&[vec![1u8; 32]]);
        let (_, _, dest) = unpack_fixture("missing", &image);
        fs::remove_file(dest.join("00000330_sect.bin")).unwrap();

        let out_bin = scratch_path("missing-out-bin");
        let out_ch = scratch_path("missing-out-ch");
        let err = repack(&dest, &out_bin, &out_ch, RomfsDialect::Sj8Pro).unwrap_err();
        assert!(matches!(err, FwError::MissingSectionData(0x230)));
    }

    #[test]
    fn refuses_existing_outputs() {
        let image = build_image(&[vec![1u8; 32]]);
        let (bin, ch, dest) = unpack_fixture("overwrite", &image);

        // the original .bin and .ch already exist
        let err = repack(&dest, &bin, &scratch_path("overwrite-ch2"), RomfsDialect::Sj8Pro)
            .unwrap_err();
        assert!(matches!(err, FwError::OutputExists(_)));
        let err = repack(&dest, &scratch_path("overwrite-bin2"), &ch, RomfsDialect::Sj8Pro)
            .unwrap_err();
        assert!(matches!(err, FwError::OutputExists(_)));
    }

    #[test]
    fn corrupt_section_header_magic_is_fatal() {
        let image = build_image(&[vec![1u8; 32]]);
        let (_, _, dest) = unpack_fixture("badmagic", &image);
        let mut head = fs::read(dest.join("00000230_head.bin")).unwrap();
        put_u32_le(&mut head, SECTION_MAGIC_OFFSET, 0);
        fs::write(dest.join("00000230_head.bin"), head).unwrap();

        let err = repack(
            &dest,
            &scratch_path("badmagic-out-bin"),
            &scratch_path("badmagic-out-ch"),
            RomfsDialect::Sj8Pro,
        )
        .unwrap_err();
        assert!(matches!(err, FwError::BadMagic { kind: "section", .. }));
    }

    #[test]
    fn more_than_sixteen_sections_is_fatal() {
        let dest = scratch_path("toomany");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("00000000_header.bin"), vec![0u8; FILE_HEADER_SIZE]).unwrap();
        let mut off = FILE_HEADER_SIZE as u32;
        for _ in 0..17 {
            let mut head = vec![0u8; SECTION_HEADER_SIZE];
            put_u32_le(&mut head, SECTION_MAGIC_OFFSET, SECTION_MAGIC);
            fs::write(dest.join(format!("{off:08X}_head.bin")), head).unwrap();
            fs::write(
                dest.join(format!("{:08X}_sect.bin", off + SECTION_HEADER_SIZE as u32)),
                [0xABu8; 8],
            )
            .unwrap();
            off += SECTION_HEADER_SIZE as u32 + 8;
        }

        let err = repack(
            &dest,
            &scratch_path("toomany-out-bin"),
            &scratch_path("toomany-out-ch"),
            RomfsDialect::Sj8Pro,
        )
        .unwrap_err();
        assert!(matches!(err, FwError::TooManySections(17)));
    }
}
