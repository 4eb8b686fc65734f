use std::path::PathBuf;
use std::process;

use clap::Parser;
use h22pack::repack::repack;
use h22pack::romfs::RomfsDialect;

/// Rebuild an Ambarella H22 firmware image from a directory produced by
/// h22unpack (possibly edited), recomputing every checksum and length
/// field.
#[derive(Parser, Debug)]
#[command(
    name = "h22pack",
    version,
    about = "Rebuild an Ambarella H22 firmware image from an extracted directory"
)]
struct Cli {
    /// Source directory produced by h22unpack
    source_dir: PathBuf,

    /// Output firmware image (.bin); must not exist
    output_bin: PathBuf,

    /// Output checksum file (.ch); must not exist
    output_ch: PathBuf,

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
                eprintln!("h22pack: unknown ROMFS type '{name}' (expected sj8pro or sj10pro)");
                process::exit(1);
            }
        },
        None => RomfsDialect::default(),
    };

    if let Err(e) = repack(&cli.source_dir, &cli.output_bin, &cli.output_ch, dialect) {
        eprintln!("h22pack: {e}");
        process::exit(1);
    }
}
