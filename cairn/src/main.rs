mod output;

use anyhow::{Context, Result};
use cairn_core::{Algorithm, Cache, Integrity, VerifyOpts, WriteOpts};
use clap::{Parser, Subcommand};
use output::{
    ClearOutput, EntryInfo, InfoOutput, LastVerifiedOutput, LsOutput, OutputWriter, PutOutput,
    RmContentOutput, RmOutput, VerifyOutput,
};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Cairn - A content-addressable key/value cache
#[derive(Parser)]
#[command(name = "cairn")]
#[command(about = "Disk-backed, content-addressable key/value cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Cache root directory (defaults to CAIRN_ROOT env var or ./cairn-cache)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// Output results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store data under a key
    Put {
        /// Key to store under
        key: String,

        /// File to read (reads stdin if omitted)
        file: Option<PathBuf>,

        /// Hash algorithm (sha512, sha384, sha256, blake3)
        #[arg(long)]
        algo: Option<String>,

        /// Expected integrity of the data
        #[arg(long)]
        integrity: Option<String>,

        /// Expected size of the data in bytes
        #[arg(long)]
        size: Option<u64>,

        /// JSON metadata to attach to the entry
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Write the data stored under a key to stdout
    Get {
        /// Key to read
        key: String,
    },

    /// Write content to stdout by integrity
    Cat {
        /// Integrity string of the content
        integrity: String,
    },

    /// Show the entry for a key
    Info {
        /// Key to look up
        key: String,
    },

    /// List all entries
    Ls {
        /// Show integrity, size and time
        #[arg(short, long)]
        long: bool,
    },

    /// Remove the entry for a key
    Rm {
        /// Key to remove
        key: String,

        /// Delete the whole index bucket instead of writing a tombstone
        /// (other keys sharing the bucket are lost too)
        #[arg(long)]
        fully: bool,
    },

    /// Remove content by integrity
    RmContent {
        /// Integrity string of the content
        integrity: String,
    },

    /// Remove every entry and all content
    Clear,

    /// Verify content, reclaim garbage and rebuild the index
    Verify {
        /// Report what would change without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Milliseconds to wait for a concurrent verify to finish
        #[arg(long, default_value_t = 0)]
        wait_ms: u64,
    },

    /// Show when verify last completed
    LastVerified,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let output = OutputWriter::new(cli.json);

    // Determine cache root: CLI arg > CAIRN_ROOT env var > ./cairn-cache default
    let root = cli
        .root
        .or_else(|| std::env::var("CAIRN_ROOT").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./cairn-cache"));
    tracing::debug!(root = %root.display(), "using cache root");
    let cache = Cache::new(&root);

    let result = match cli.command {
        Commands::Put {
            key,
            file,
            algo,
            integrity,
            size,
            metadata,
        } => cmd_put(&cache, &output, &key, file.as_deref(), algo, integrity, size, metadata),
        Commands::Get { key } => cmd_get(&cache, &output, &key),
        Commands::Cat { integrity } => cmd_cat(&cache, &output, &integrity),
        Commands::Info { key } => cmd_info(&cache, &output, &key),
        Commands::Ls { long } => cmd_ls(&cache, &output, long),
        Commands::Rm { key, fully } => cmd_rm(&cache, &output, &key, fully),
        Commands::RmContent { integrity } => cmd_rm_content(&cache, &output, &integrity),
        Commands::Clear => cmd_clear(&cache, &output),
        Commands::Verify { dry_run, wait_ms } => cmd_verify(&cache, &output, dry_run, wait_ms),
        Commands::LastVerified => cmd_last_verified(&cache, &output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<cairn_core::Error>()
                .map(cairn_core::Error::code);
            // Misses exit with 2 so scripts can tell them from failures.
            let result_code = if code == Some("ENOENT") { 2 } else { 1 };
            output.write_error(&err, result_code, code);
            ExitCode::from(result_code)
        }
    }
}

fn parse_integrity(s: &str) -> Result<Integrity> {
    s.parse()
        .with_context(|| format!("Invalid integrity: {}", s))
}

#[allow(clippy::too_many_arguments)]
fn cmd_put(
    cache: &Cache,
    output: &OutputWriter,
    key: &str,
    file: Option<&Path>,
    algo: Option<String>,
    integrity: Option<String>,
    size: Option<u64>,
    metadata: Option<String>,
) -> Result<()> {
    let mut opts = WriteOpts::new();
    if let Some(algo) = algo {
        let algorithm: Algorithm = algo
            .parse()
            .with_context(|| format!("Unsupported algorithm: {}", algo))?;
        opts = opts.algorithm(algorithm);
    }
    if let Some(integrity) = integrity {
        opts = opts.integrity(parse_integrity(&integrity)?);
    }
    if let Some(size) = size {
        opts = opts.size(size);
    }
    if let Some(metadata) = metadata {
        let value: serde_json::Value =
            serde_json::from_str(&metadata).context("Metadata must be valid JSON")?;
        opts = opts.metadata(value);
    }

    let written = match file {
        Some(path) => {
            let reader = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            cache.put_reader(key, reader, opts)
        }
        None => cache.put_reader(key, io::stdin().lock(), opts),
    }
    .with_context(|| format!("Failed to store key: {}", key))?;

    let data = PutOutput {
        success: true,
        result_code: 0,
        key: key.to_string(),
        integrity: written.integrity.to_string(),
        size: written.size,
    };
    output.write(&data, || format!("{} {}\n", written.integrity, key))
}

fn cmd_get(cache: &Cache, output: &OutputWriter, key: &str) -> Result<()> {
    let data = cache
        .get(key)
        .with_context(|| format!("Failed to read key: {}", key))?;
    output.write_raw(&data.data)
}

fn cmd_cat(cache: &Cache, output: &OutputWriter, integrity: &str) -> Result<()> {
    let sri = parse_integrity(integrity)?;
    let data = cache
        .get_by_digest(&sri)
        .with_context(|| format!("Failed to read content: {}", sri))?;
    output.write_raw(&data)
}

fn cmd_info(cache: &Cache, output: &OutputWriter, key: &str) -> Result<()> {
    let entry = cache
        .get_info(key)
        .with_context(|| format!("Failed to look up key: {}", key))?
        .ok_or_else(|| cairn_core::Error::entry_not_found(key))?;
    let info = EntryInfo::from(entry);

    let text = format!(
        "key:       {}\nintegrity: {}\nsize:      {}\ntime:      {}\npath:      {}\nmetadata:  {}\n",
        info.key, info.integrity, info.size, info.time_human, info.path, info.metadata
    );
    let data = InfoOutput {
        success: true,
        result_code: 0,
        entry: info,
    };
    output.write(&data, || text)
}

fn cmd_ls(cache: &Cache, output: &OutputWriter, long: bool) -> Result<()> {
    let entries: Vec<EntryInfo> = cache
        .ls()
        .with_context(|| format!("Failed to list {}", cache.root().display()))?
        .into_values()
        .map(EntryInfo::from)
        .collect();

    let data = LsOutput {
        success: true,
        result_code: 0,
        entries,
    };
    output.write(&data, || {
        data.entries
            .iter()
            .map(|e| {
                if long {
                    format!("{} {:>10} {} {}\n", e.integrity, e.size, e.time_human, e.key)
                } else {
                    format!("{}\n", e.key)
                }
            })
            .collect()
    })
}

fn cmd_rm(cache: &Cache, output: &OutputWriter, key: &str, fully: bool) -> Result<()> {
    let removed = if fully {
        cache.remove_entry_fully(key)
    } else {
        cache.remove_entry(key)
    };
    removed.with_context(|| format!("Failed to remove key: {}", key))?;

    let data = RmOutput {
        success: true,
        result_code: 0,
        key: key.to_string(),
        fully,
    };
    output.write(&data, || format!("Removed {}\n", key))
}

fn cmd_rm_content(cache: &Cache, output: &OutputWriter, integrity: &str) -> Result<()> {
    let sri = parse_integrity(integrity)?;
    let removed = cache
        .remove_content(&sri)
        .with_context(|| format!("Failed to remove content: {}", sri))?;

    let data = RmContentOutput {
        success: true,
        result_code: 0,
        integrity: sri.to_string(),
        removed,
    };
    output.write(&data, || {
        if removed {
            format!("Removed {}\n", sri)
        } else {
            format!("No content for {}\n", sri)
        }
    })
}

fn cmd_clear(cache: &Cache, output: &OutputWriter) -> Result<()> {
    cache
        .remove_all()
        .with_context(|| format!("Failed to clear {}", cache.root().display()))?;

    let data = ClearOutput {
        success: true,
        result_code: 0,
        root: cache.root().display().to_string(),
    };
    output.write(&data, || format!("Cleared {}\n", cache.root().display()))
}

fn cmd_verify(cache: &Cache, output: &OutputWriter, dry_run: bool, wait_ms: u64) -> Result<()> {
    let opts = VerifyOpts {
        dry_run,
        lock_timeout: Duration::from_millis(wait_ms),
        ..VerifyOpts::default()
    };
    let stats = cache
        .verify(opts)
        .with_context(|| format!("Failed to verify {}", cache.root().display()))?;

    let text = format!(
        "{}Verified {} content files ({} bytes kept)\n\
         Reclaimed {} files ({} bytes), {} corrupt\n\
         Index: {} entries kept, {} rejected, {} missing content\n\
         Took {} ms\n",
        if dry_run { "[dry run] " } else { "" },
        stats.verified_content,
        stats.kept_size,
        stats.reclaimed_count,
        stats.reclaimed_size,
        stats.bad_content_count,
        stats.total_entries,
        stats.rejected_entries,
        stats.missing_content,
        stats.run_time.total,
    );
    let data = VerifyOutput {
        success: true,
        result_code: 0,
        dry_run,
        stats,
    };
    output.write(&data, || text)
}

fn cmd_last_verified(cache: &Cache, output: &OutputWriter) -> Result<()> {
    let last_verified = cache
        .last_verified()
        .with_context(|| format!("Failed to read {}", cache.root().display()))?;

    let data = LastVerifiedOutput {
        success: true,
        result_code: 0,
        last_verified,
    };
    output.write(&data, || match last_verified {
        Some(when) => format!("{}\n", when.to_rfc3339()),
        None => "never\n".to_string(),
    })
}
