use std::path::PathBuf;
use std::process;

use clap::Parser;
use h22pack::romfs::RomfsDialect;
use h22pack::unpack::unpack;

/// Verify and extract an Ambarella H22 firmware image: checks the MD5
/// against the .ch file and every CRC32 layer, then writes the file
/// header, each section, and the contents of every ROMFS partition into
/// the destination directory.
#[derive(Parser, Debug)]
#[command(
    name = "h22unpack",
    version,
    about = "Verify and extract an Ambarella H22 firmware image"
)]
struct Cli {
    /// Input firmware image (.bin)
    firmware: PathBuf,

    /// Checksum file (.ch); a missing file is only a warning
    checksum: PathBuf,

    /// Destination directory; must not exist
    dest_dir: PathBuf,

    /// ROMFS dialect: sj8pro (SJ8 Pro / Firefly X Lite) or sj10pro
    #[arg(short = 't', long = "romfs-type")]
    romfs_type: Option<String>,
}

fn main() {
    // argument errors exit with code 1, like every other failure
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                    process::exit(0)
                }
                _ => process::exit(1),
            }
        }
    };

    let dialect = match cli.romfs_type.as_deref() {
        Some(name) => match RomfsDialect::from_name(name) {
            Some(d) => d,
            None => {
                eprintln!("h22unpack: unknown ROMFS type '{name}' (expected sj8pro or sj10pro)");
                process::exit(1);
            }
        },
        None => RomfsDialect::default(),
    };

    match unpack(&cli.firmware, Some(&cli.checksum), &cli.dest_dir, dialect) {
        Ok(summary) => {
            println!();
            println!(
                "{} sections, {} ROMFS partitions, {} CRC failure(s)",
                summary.sections, summary.romfs_partitions, summary.crc_failures
            );
        }
        Err(e) => {
            eprintln!("h22unpack: {e}");
            process::exit(1);
        }
    }
}
