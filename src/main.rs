//! packfs CLI - list, extract and read files from legacy game archives.
//!
//! Archives are opened through a [`FileSystem`], so auxiliary files (Bag
//! indexes, cabinet volumes, mix databases) are found next to the archive
//! or in any extra `--mount`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use glob::{MatchOptions, Pattern};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use packfs::{hash_filename, FileSystem, FileSystemConfig, PackageHandle, PackageHashType};

/// Explicit name the inspected archive is mounted under.
const ARCHIVE_ALIAS: &str = "archive";

/// packfs - legacy game archive tool
#[derive(Parser)]
#[command(name = "packfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Directory relative mount paths resolve against
    #[arg(long, env = "PACKFS_BASE_DIR", default_value = ".", global = true)]
    base_dir: PathBuf,

    /// Directory `^` mount paths resolve against
    #[arg(long, env = "PACKFS_SUPPORT_DIR", global = true)]
    support_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the contents of an archive
    List {
        /// Archive file or directory
        archive: String,

        /// Filter pattern (glob-style, case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,

        /// Extra packages to mount first, as [ALIAS=]PATH
        #[arg(short, long = "mount")]
        mounts: Vec<String>,
    },

    /// Extract files from an archive
    Extract {
        /// Archive file or directory
        archive: String,

        /// Output directory
        #[arg(short, long, env = "PACKFS_OUTPUT")]
        output: PathBuf,

        /// Filter pattern (glob-style, case-insensitive)
        #[arg(short, long)]
        filter: Option<String>,

        /// Extra packages to mount first, as [ALIAS=]PATH
        #[arg(short, long = "mount")]
        mounts: Vec<String>,
    },

    /// Write a file from the mounted packages to stdout
    Cat {
        /// File name, optionally `alias|path`
        name: String,

        /// Packages to mount in order, as [ALIAS=]PATH
        #[arg(short, long = "mount", required = true)]
        mounts: Vec<String>,
    },

    /// Print both mix filename hashes
    Hash {
        /// Filenames to hash
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = FileSystemConfig::new(&cli.base_dir);
    if let Some(support_dir) = &cli.support_dir {
        config = config.with_support_dir(support_dir);
    }

    match cli.command {
        Commands::List {
            archive,
            filter,
            mounts,
        } => {
            let mut fs = mount_all(config, &mounts)?;
            cmd_list(&mut fs, &archive, filter.as_deref())?;
        }
        Commands::Extract {
            archive,
            output,
            filter,
            mounts,
        } => {
            let mut fs = mount_all(config, &mounts)?;
            cmd_extract(&mut fs, &archive, &output, filter.as_deref())?;
        }
        Commands::Cat { name, mounts } => {
            let fs = mount_all(config, &mounts)?;
            cmd_cat(&fs, &name)?;
        }
        Commands::Hash { names } => cmd_hash(&names),
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(io::stderr)
        .init();
}

/// Build a filesystem with every `[ALIAS=]PATH` argument mounted in order.
fn mount_all(config: FileSystemConfig, mounts: &[String]) -> Result<FileSystem> {
    let mut fs = FileSystem::new(config);
    for arg in mounts {
        let (alias, path) = match arg.split_once('=') {
            Some((alias, path)) if !alias.is_empty() => (Some(alias), path),
            _ => (None, arg.as_str()),
        };
        fs.mount(path, alias)
            .with_context(|| format!("Failed to mount {arg}"))?;
    }
    Ok(fs)
}

/// Mount the archive under [`ARCHIVE_ALIAS`].
///
/// A file is opened from inside its parent directory so that files it
/// depends on are resolved next to it.
fn mount_archive(fs: &mut FileSystem, archive: &str) -> Result<PackageHandle> {
    let path = std::path::absolute(fs.config().resolve_path(archive))?;
    let name = if path.is_file() {
        let parent = path.parent().unwrap_or(Path::new("."));
        fs.mount(&parent.to_string_lossy(), None)
            .with_context(|| format!("Failed to mount {}", parent.display()))?;
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.to_string())
    } else {
        archive.to_string()
    };

    fs.mount(&name, Some(ARCHIVE_ALIAS))
        .with_context(|| format!("Failed to open archive {archive}"))?
        .with_context(|| format!("Archive {archive} was not mounted"))
}

fn filter_pattern(filter: Option<&str>) -> Result<Option<Pattern>> {
    filter
        .map(|p| Pattern::new(p).with_context(|| format!("Invalid filter pattern {p}")))
        .transpose()
}

fn matching_contents(package: &PackageHandle, filter: Option<&str>) -> Result<Vec<String>> {
    let pattern = filter_pattern(filter)?;
    let options = MatchOptions {
        case_sensitive: false,
        ..MatchOptions::default()
    };

    let mut names: Vec<String> = package
        .contents()
        .into_iter()
        .filter(|name| pattern.as_ref().map_or(true, |p| p.matches_with(name, options)))
        .collect();
    names.sort();
    Ok(names)
}

fn cmd_list(fs: &mut FileSystem, archive: &str, filter: Option<&str>) -> Result<()> {
    let package = mount_archive(fs, archive)?;
    let names = matching_contents(&package, filter)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for name in &names {
        writeln!(out, "{name}")?;
    }

    eprintln!("{} of {} entries", names.len(), package.contents().len());
    Ok(())
}

fn cmd_extract(
    fs: &mut FileSystem,
    archive: &str,
    output: &Path,
    filter: Option<&str>,
) -> Result<()> {
    let start = Instant::now();
    let package = mount_archive(fs, archive)?;
    let names = matching_contents(&package, filter)?;
    eprintln!("Extracting {} entries from {}...", names.len(), package.name());

    let pb = ProgressBar::new(names.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );

    fs::create_dir_all(output)?;

    let mut skipped = 0usize;
    for name in &names {
        pb.inc(1);
        let Some(mut stream) = package.get_stream(name)? else {
            // Directory entries and unreadable names.
            skipped += 1;
            continue;
        };

        let output_path = output.join(name.replace('\\', "/"));
        if !output_path.starts_with(output) || name.split(['/', '\\']).any(|p| p == "..") {
            bail!("Refusing to extract {name} outside {}", output.display());
        }
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&output_path)
            .with_context(|| format!("Failed to create {}", output_path.display()))?;
        io::copy(&mut stream, &mut file).with_context(|| format!("Failed to extract {name}"))?;
    }

    pb.finish_with_message("Done");
    if skipped > 0 {
        tracing::info!(skipped, "entries without data were skipped");
    }
    eprintln!("Extraction completed in {:?}", start.elapsed());
    Ok(())
}

fn cmd_cat(fs: &FileSystem, name: &str) -> Result<()> {
    let mut stream = fs.open(name).with_context(|| format!("Failed to open {name}"))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    io::copy(&mut stream, &mut out)?;
    out.flush()?;
    Ok(())
}

fn cmd_hash(names: &[String]) {
    for name in names {
        println!(
            "{:08X} {:08X} {}",
            hash_filename(name, PackageHashType::Classic),
            hash_filename(name, PackageHashType::Crc32),
            name
        );
    }
}
