use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parallel_seekable::{ChecksumPolicy, Config, ParallelReader};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Input gzip or bzip2 file
    input: PathBuf,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Decode threads (0 = all cores)
    #[arg(short = 'j', long, default_value_t = 0)]
    jobs: usize,

    /// Compressed bytes per chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Decompressed offset to start at
    #[arg(long, default_value_t = 0)]
    offset: u64,

    /// Number of decompressed bytes to write (defaults to everything)
    #[arg(long)]
    count: Option<u64>,

    /// Write the seek index gathered while decoding to this file
    #[arg(long)]
    export_index: Option<PathBuf>,

    /// Load a previously exported seek index before decoding
    #[arg(long)]
    import_index: Option<PathBuf>,

    /// Skip CRC verification
    #[arg(long)]
    no_verify: bool,

    /// Do not draw a progress bar
    #[arg(short, long)]
    quiet: bool,
}

fn progress_bar(total: Option<u64>, quiet: bool) -> Result<ProgressBar> {
    if quiet {
        return Ok(ProgressBar::hidden());
    }
    let pb = match total {
        Some(total) => {
            let pb = ProgressBar::new(total);
            pb.set_style(ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            )?);
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            pb.set_style(ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] {bytes} ({bytes_per_sec})",
            )?);
            pb
        }
    };
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
    Ok(pb)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = Config::default().with_parallelism(args.jobs);
    if let Some(chunk_size) = args.chunk_size {
        config = config.with_chunk_size(chunk_size);
    }
    if args.no_verify {
        config = config.with_checksum(ChecksumPolicy::Disabled);
    }

    let mut reader = ParallelReader::open(&args.input, config)
        .with_context(|| format!("Failed to open {}", args.input.display()))?;
    info!(format = %reader.format(), input = %args.input.display(), "opened input");

    if let Some(path) = &args.import_index {
        let file = File::open(path).context("Failed to open index file")?;
        reader
            .import_index(std::io::BufReader::new(file))
            .with_context(|| format!("Failed to import index {}", path.display()))?;
    }

    reader
        .seek(std::io::SeekFrom::Start(args.offset))
        .context("Failed to seek")?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).context("Failed to create output file")?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    let total = match (args.count, reader.size()?) {
        (Some(count), _) => Some(count),
        (None, Some(size)) => Some(size.saturating_sub(args.offset)),
        (None, None) => None,
    };
    let pb = progress_bar(total, args.quiet)?;

    let mut remaining = args.count.unwrap_or(u64::MAX);
    let mut buffer = vec![0u8; 1 << 20];
    while remaining > 0 {
        let want = buffer.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = reader.read(&mut buffer[..want]).context("Decompression failed")?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n]).context("Failed to write output")?;
        remaining -= n as u64;
        pb.inc(n as u64);
    }
    out.flush()?;
    pb.finish_and_clear();

    if let Some(path) = &args.export_index {
        let file = File::create(path).context("Failed to create index file")?;
        reader
            .export_index(BufWriter::new(file))
            .with_context(|| format!("Failed to export index {}", path.display()))?;
    }

    Ok(())
}
