use clap::{Parser, Subcommand};
use datarchive::codec::DEFAULT_COMPRESSION_LEVEL;
use datarchive::{
    ArchiveReader, ArchiveWriter, CompressionMethod, Flags, TableEntry, WriteSummary, WriterOptions,
    DEFAULT_CHUNK_SIZE,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "datarchive", about = "The .dat archive container CLI")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct StoreArgs {
    /// Compression method: zlib (default) or none
    #[arg(short = 'm', long, default_value = "zlib")]
    method: String,
    /// zlib compression level, 0-9
    #[arg(short, long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    level: u32,
    /// Streaming chunk size in KiB
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE / 1024)]
    chunk_size: usize,
    /// Prefix prepended to every entry name (e.g. "assets/")
    #[arg(long, default_value = "")]
    name_prefix: String,
    /// Set the reserved encrypted flag on every entry
    #[arg(long)]
    flag_encrypted: bool,
    #[arg(required = true, num_args = 1..)]
    input: Vec<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Pack one or more files into a new archive
    Pack {
        #[arg(short, long)]
        output: PathBuf,
        /// Replace the output if it exists
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Add files to an existing archive without moving stored data
    Append {
        archive: PathBuf,
        #[command(flatten)]
        store: StoreArgs,
    },
    /// List archive contents
    List {
        input: PathBuf,
        /// Print the table as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract entries (all by default)
    Extract {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Skip CRC validation
        #[arg(long)]
        no_verify: bool,
        names: Vec<String>,
    },
    /// Write one entry to stdout
    Cat {
        input: PathBuf,
        name: String,
    },
    /// Show archive metadata
    Info {
        input: PathBuf,
    },
    /// Check every entry's stored bytes against its CRC
    Verify {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { output, force, store } => {
            let writer = build_writer(&store)?;
            let summary = writer.write_archive(&output, force)?;
            report(&summary);
            println!("Created: {}", output.display());
        }

        // ── Append ───────────────────────────────────────────────────────────
        Commands::Append { archive, store } => {
            let writer = build_writer(&store)?;
            let summary = writer.append_archive(&archive)?;
            report(&summary);
            println!("Updated: {}", archive.display());
        }

        // ── List ─────────────────────────────────────────────────────────────
        Commands::List { input, json } => {
            let reader = ArchiveReader::open_path(&input)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reader.get_table())?);
                return Ok(());
            }
            println!("Archive: {}", input.display());
            println!("{:<32} {:>12} {:>12} {:>6} {:>8}", "Name", "Size", "Stored", "Method", "CRC32");
            for e in reader.entries() {
                println!(
                    "{:<32} {:>12} {:>12} {:>6} {:08x}",
                    e.name,
                    e.original_size,
                    e.size_in_archive(),
                    e.compression_method,
                    e.crc32
                );
            }
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, no_verify, names } => {
            let mut reader = ArchiveReader::open_path(&input)?;
            reader.set_validate_crc(!no_verify);
            let names: Vec<String> = if names.is_empty() {
                reader.list_files().into_iter().map(str::to_owned).collect()
            } else {
                names
            };
            for name in &names {
                let data = reader.get_file(name)?;
                let dest = safe_join(&output_dir, name)?;
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&dest, &data)?;
                println!("  extracted  {}", dest.display());
            }
        }

        // ── Cat ──────────────────────────────────────────────────────────────
        Commands::Cat { input, name } => {
            let mut reader = ArchiveReader::open_path(&input)?;
            let data = reader.get_file(&name)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let reader = ArchiveReader::open_path(&input)?;
            let (original, stored) = reader
                .entries()
                .fold((0u64, 0u64), |(o, s), e| (o + e.original_size, s + e.size_in_archive()));
            let len = std::fs::metadata(&input)?.len();
            let version = reader.header().map(|h| h.version).unwrap_or_default();

            println!("── .dat Archive ─────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Format version {}", version);
            println!("  Table offset   {} B", reader.get_table_offset());
            println!("  Table size     {} B", len - reader.get_table_offset());
            println!("  Files          {}", reader.size());
            println!("  Original       {} B", original);
            println!("  Stored         {} B", stored);
            println!("  Encrypted flag {}", reader.entries().filter(|e| e.flags.encrypted()).count());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let mut reader = ArchiveReader::open_path(&input)?;
            let mut failed = 0usize;
            for (name, result) in reader.verify_all() {
                match result {
                    Ok(()) => println!("  ok      {name}"),
                    Err(e) => {
                        failed += 1;
                        println!("  FAILED  {name}: {e}");
                    }
                }
            }
            if failed > 0 {
                return Err(format!("{failed} entr{} failed verification", if failed == 1 { "y" } else { "ies" }).into());
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_writer(store: &StoreArgs) -> Result<ArchiveWriter, Box<dyn std::error::Error>> {
    let method = CompressionMethod::from_name(&store.method)
        .ok_or_else(|| format!("Unknown compression method '{}'", store.method))?;
    let mut writer = ArchiveWriter::with_options(WriterOptions {
        chunk_size: store.chunk_size.max(1) * 1024,
        level:      store.level,
    });
    let flags = Flags::default().with_encrypted(store.flag_encrypted);

    for path in &store.input {
        let file_name = path
            .file_name()
            .ok_or_else(|| format!("{} has no file name", path.display()))?
            .to_string_lossy();
        let entry = TableEntry::new(format!("{}{}", store.name_prefix, file_name), method, flags);
        if let Err(e) = writer.queue_file(path, entry) {
            warn!("Not queued: {e}");
        }
    }
    Ok(writer)
}

fn report(summary: &WriteSummary) {
    for e in &summary.written {
        println!("  packed   {} ({} -> {} B)", e.name, e.original_size, e.size_in_archive());
    }
    for s in &summary.skipped {
        println!("  skipped  {} ({:?})", s.path.display(), s.reason);
    }
}

/// Join an entry name onto `root`, refusing names that escape it.
fn safe_join(root: &Path, name: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let rel = Path::new(name);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
        return Err(format!("Refusing to extract {name:?} outside {}", root.display()).into());
    }
    Ok(root.join(rel))
}
