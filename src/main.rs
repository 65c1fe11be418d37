//! Thin CLI over the `beak` library, in the shape of
//! `cmd_build::BuildArgs`/`run()`: a `clap::Parser` struct per subcommand,
//! `anyhow::Context`-wrapped calls into the library, no progress UI or
//! saved configuration (non-goals, spec §9).

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::ambient_authority;
use cap_std_ext::cap_std::fs_utf8::Dir;
use clap::{Parser, Subcommand};

use beak::{backup, BackupOptions};

#[derive(Parser)]
#[command(name = "beak", about = "Deduplication-friendly backup engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a source tree and build its virtual archive set and index.
    Backup(BackupArgs),
    /// List the entries recorded in an index.
    Ls(LsArgs),
    /// Restore entries from an index into a destination directory.
    Restore(RestoreArgs),
}

#[derive(Parser)]
struct BackupArgs {
    /// Path to the source tree to back up.
    #[arg(long, env = "BEAK_SOURCE", hide_env_values = true)]
    source: Utf8PathBuf,

    /// Target per-archive size in bytes (spec §4.6 default 10 MiB).
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    target_archive_size: u64,

    /// Allow files whose mtime is ahead of the scan start time.
    #[arg(long)]
    relax_time_checks: bool,

    /// Write the top-level collection dir's index to this path.
    #[arg(short, long, value_name = "PATH")]
    output: Option<Utf8PathBuf>,
}

#[derive(Parser)]
struct LsArgs {
    /// Gzip-compressed index file to read.
    index: Utf8PathBuf,
}

#[derive(Parser)]
struct RestoreArgs {
    /// Gzip-compressed index file to restore from.
    index: Utf8PathBuf,
    /// Destination directory (must already exist).
    destination: Utf8PathBuf,
    /// Overwrite destination files even if they look up to date.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Backup(args) => run_backup(&args),
        Command::Ls(args) => run_ls(&args),
        Command::Restore(args) => run_restore(&args),
    }
}

fn run_backup(args: &BackupArgs) -> Result<()> {
    let mut opts = BackupOptions::default();
    opts.partition.target_size = args.target_archive_size;
    opts.scan.relax_time_checks = args.relax_time_checks;
    opts.index.config_line = std::env::args().collect::<Vec<_>>().join(" ");

    let source_root = Dir::open_ambient_dir(&args.source, ambient_authority())
        .with_context(|| format!("opening {}", args.source))?;
    let result = backup(&source_root, &opts).context("backup run failed")?;
    tracing::info!(
        archives = result.snapshot.archives.len(),
        collections = result.indexes.len(),
        hard_links_saved = result.hard_link_stats.canonicalized,
        bytes_saved = result.hard_link_stats.savings_bytes,
        "backup complete"
    );

    if let Some(path) = &args.output {
        if let Some((_, bytes)) = result.indexes.first() {
            std::fs::write(path, bytes).with_context(|| format!("writing index to {path}"))?;
        }
    }
    Ok(())
}

fn run_ls(args: &LsArgs) -> Result<()> {
    let gz = std::fs::read(&args.index).with_context(|| format!("reading {}", args.index))?;
    let mut decoder = flate2::read::GzDecoder::new(&gz[..]);
    let mut text = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut text).context("decompressing index")?;
    let parsed = beak::index::reader::parse(&text).context("parsing index")?;
    for entry in &parsed.entries {
        println!("{} {:>10} {}", entry.permissions, entry.size_or_rdev, entry.tar_path);
    }
    Ok(())
}

fn run_restore(args: &RestoreArgs) -> Result<()> {
    let gz = std::fs::read(&args.index).with_context(|| format!("reading {}", args.index))?;
    let mut decoder = flate2::read::GzDecoder::new(&gz[..]);
    let mut text = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut text).context("decompressing index")?;
    let parsed = beak::index::reader::parse(&text).context("parsing index")?;

    let dot = Utf8PathBuf::from(".");
    let index_dir = args.index.parent().unwrap_or(&dot).to_owned();
    let archive_root = Dir::open_ambient_dir(&index_dir, ambient_authority())
        .with_context(|| format!("opening {index_dir}"))?;
    let dest = Dir::open_ambient_dir(&args.destination, ambient_authority())
        .with_context(|| format!("opening {}", args.destination))?;

    let opts = beak::restore::RestoreOptions { force: args.force };
    let stats = beak::restore::restore(&dest, &parsed, &opts, |archive_name, offset, len| {
        use std::io::{Read as _, Seek as _, SeekFrom};
        let mut file = archive_root.open(archive_name).map_err(beak::error::Error::Io)?;
        file.seek(SeekFrom::Start(offset)).map_err(beak::error::Error::Io)?;
        let mut buf = vec![0u8; len];
        let n = file.read(&mut buf).map_err(beak::error::Error::Io)?;
        buf.truncate(n);
        Ok(buf)
    })?;

    tracing::info!(
        files = stats.files_written,
        skipped = stats.files_skipped,
        symlinks = stats.symlinks_written,
        hard_links = stats.hard_links_written,
        dirs = stats.dirs_touched,
        "restore complete"
    );
    Ok(())
}
