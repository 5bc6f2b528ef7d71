//! Maintenance tool for a remote-file cache directory:
//! `cached_httpfs [--cache-dir DIR] <stat|put|cat> <key> ...`
//!
//! `put` stands in for a remote fetcher by populating an entry from a local
//! file, which makes the tool handy for seeding caches and for exercising
//! cross-process coordination. Configuration falls back to the `HTTPFS_*`
//! environment variables parsed by [`CacheEnvCfg`]. Logs go to stderr and are
//! filtered by `RUST_LOG`.

use camino::Utf8PathBuf;
use cached_httpfs::{CacheEnvCfg, CachedFileHandle, FileCacheRegistry};
use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use std::fs::File;
use std::io::{self, Read, Write};
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Exit status used by `cat` when the key is not cached.
const EXIT_MISSING: u8 = 2;

/// Exit status used by `put --abandon`.
const EXIT_ABANDONED: i32 = 3;

/// Inspect and seed a remote-file cache directory.
#[derive(Parser, Debug)]
#[command(name = "cached_httpfs", version, about, long_about = None)]
struct Cli {
    /// Cache directory; defaults to `HTTPFS_CACHE_DIR` or the XDG cache home.
    #[arg(long, global = true)]
    cache_dir: Option<Utf8PathBuf>,

    /// Increase verbosity (-v info, -vv debug) when `RUST_LOG` is unset.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Report whether a key is cached, without creating it.
    Stat {
        /// Cache key.
        key: String,
    },
    /// Populate a key from a local file unless it is already cached.
    Put(PutArgs),
    /// Write a cached key to stdout.
    Cat {
        /// Cache key.
        key: String,
    },
}

#[derive(Args, Debug)]
struct PutArgs {
    /// Cache key.
    key: String,
    /// File whose contents become the cached bytes.
    source: Utf8PathBuf,
    /// Bytes copied per write.
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,
    /// Grow the entry while copying instead of allocating the full size up front.
    #[arg(long)]
    stream: bool,
    /// Milliseconds to wait after writing and before finalizing.
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,
    /// Exit without finalizing, as if the process had crashed.
    #[arg(long, conflicts_with = "discard")]
    abandon: bool,
    /// Drop the entry without finalizing and keep running.
    #[arg(long)]
    discard: bool,
    /// Milliseconds to stay alive after `--discard`.
    #[arg(long, default_value_t = 0, requires = "discard")]
    linger_ms: u64,
}

/// How a `put` ended.
enum PutOutcome {
    Stored(u64),
    Discarded(u64),
}

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = CacheEnvCfg::load()?.to_config();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }
    let registry = FileCacheRegistry::new();
    let mut stdout = io::stdout().lock();

    match cli.command {
        Command::Stat { key } => match registry.get_entry(&config.cache_dir, &key, false)? {
            Some(handle) => writeln!(stdout, "initialized {}", handle.size())?,
            None => writeln!(stdout, "missing")?,
        },
        Command::Put(args) => {
            let handle = registry
                .get_entry(&config.cache_dir, &args.key, true)?
                .ok_or_else(|| color_eyre::eyre::eyre!("cache entry could not be created"))?;
            if handle.is_populating() {
                match populate(handle, &args)? {
                    PutOutcome::Stored(size) => writeln!(stdout, "stored {size}")?,
                    PutOutcome::Discarded(written) => {
                        writeln!(stdout, "discarded {written}")?;
                        stdout.flush()?;
                        thread::sleep(Duration::from_millis(args.linger_ms));
                    }
                }
            } else {
                writeln!(stdout, "exists {}", handle.size())?;
            }
        }
        Command::Cat { key } => {
            let Some(handle) = registry.get_entry(&config.cache_dir, &key, false)? else {
                return Ok(ExitCode::from(EXIT_MISSING));
            };
            stdout.write_all(&handle.read_to_vec()?)?;
        }
    }
    stdout.flush()?;
    Ok(ExitCode::SUCCESS)
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "cached_httpfs=warn",
        1 => "cached_httpfs=info",
        _ => "cached_httpfs=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .without_time()
        .init();
}

/// Copies `args.source` into the entry and finalizes it unless asked to give
/// up first.
fn populate(mut handle: CachedFileHandle, args: &PutArgs) -> Result<PutOutcome> {
    let mut source =
        File::open(&args.source).with_context(|| format!("open {}", args.source))?;
    let chunk_size = args.chunk_size.max(1);

    if !args.stream {
        let len = source
            .metadata()
            .with_context(|| format!("stat {}", args.source))?
            .len();
        handle.allocate(len)?;
    }

    let mut buf = vec![0_u8; chunk_size];
    let mut written = 0_u64;
    loop {
        let read = source
            .read(&mut buf)
            .with_context(|| format!("read {}", args.source))?;
        let Some(chunk) = buf.get(..read).filter(|chunk| !chunk.is_empty()) else {
            break;
        };
        let end = written + chunk.len() as u64;
        if end > handle.capacity() {
            let grown = end.max(handle.capacity().saturating_mul(2));
            handle.grow_file(grown, written)?;
        }
        handle.write(chunk, written)?;
        written = end;
    }

    if args.hold_ms > 0 {
        thread::sleep(Duration::from_millis(args.hold_ms));
    }
    if args.abandon {
        info!(key = %args.key, written, "exiting without finalize");
        std::process::exit(EXIT_ABANDONED);
    }
    if args.discard {
        info!(key = %args.key, written, "discarding entry without finalize");
        drop(handle);
        return Ok(PutOutcome::Discarded(written));
    }

    handle.finalize(written)?;
    Ok(PutOutcome::Stored(written))
}
