#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_seekable::{Config, ParallelReader};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() || data.len() > 1_000_000 {
        return;
    }

    let config = Config::default()
        .with_parallelism(2)
        .with_chunk_size(1024)
        .with_max_decompressed_chunk(1 << 20);
    let Ok(mut reader) = ParallelReader::from_bytes(data.to_vec(), config) else {
        return;
    };

    // Bound the output so that decompression bombs do not exhaust memory.
    const MAX_OUTPUT: usize = 32 * 1024 * 1024;
    let mut total = 0;
    let mut buf = vec![0u8; 64 * 1024];
    while total < MAX_OUTPUT {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => total += n,
        }
    }
});
