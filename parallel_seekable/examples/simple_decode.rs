use anyhow::{Context, Result};
use parallel_seekable::{Config, ParallelReader};
use std::env;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <input.gz|input.bz2> [offset] [output]", args[0]);
        return Ok(());
    }

    let input_path = &args[1];
    let mut reader = ParallelReader::open(input_path, Config::default())
        .with_context(|| format!("failed to open {input_path}"))?;
    if let Some(offset) = args.get(2) {
        let offset: u64 = offset.parse().context("offset must be a number")?;
        Seek::seek(&mut reader, SeekFrom::Start(offset))?;
    }

    let mut out: Box<dyn Write> = match args.get(3) {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    };

    let mut buffer = [0u8; 8192];
    loop {
        let n = Read::read(&mut reader, &mut buffer)?;
        if n == 0 {
            break;
        }
        out.write_all(&buffer[..n])?;
    }

    Ok(())
}
