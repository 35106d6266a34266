mod common;

use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;

use common::*;
use parallel_seekable::fetcher::ChunkFetcher;
use parallel_seekable::source::SharedSource;
use parallel_seekable::{Config, Error, Format, ParallelReader, ReaderState};

#[test]
fn test_interleaved_seeks_never_hang() {
    let data = random_bytes(8 * 1024 * 1024, 300);
    let compressed = gzip(&data, 1);
    let config = Config::default()
        .with_parallelism(8)
        .with_chunk_size(256 * 1024);
    let mut reader = ParallelReader::from_bytes(compressed, config).unwrap();

    let mut buf = [0u8; 64];
    for i in 0..100 {
        let offset = if i % 2 == 0 { 0 } else { 1000 };
        reader.seek(SeekFrom::Start(offset)).unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &data[offset as usize..offset as usize + 64]);
    }
}

#[test]
fn test_chunk_size_off_by_one_gives_same_output() {
    let text = pseudo_text(1_200_000, 301);
    let compressed = gzip(&text, 6);
    for size in [8 * 1024, 20 * 1024, 33 * 1024] {
        let a = decode_all(&compressed, Config::default().with_parallelism(4).with_chunk_size(size));
        let b = decode_all(&compressed, Config::default().with_parallelism(4).with_chunk_size(size + 1));
        assert!(a == text, "chunk size {size}");
        assert!(b == text, "chunk size {}", size + 1);
    }
}

#[test]
fn test_cache_stays_within_budget() {
    let text = pseudo_text(1_000_000, 302);
    let compressed = gzip(&text, 6);
    let budget = 150 * 1024;
    let source = Arc::new(SharedSource::from_bytes(compressed));
    let config = small_chunks(4).with_cache_budget(budget);
    let fetcher = ChunkFetcher::new(source, Format::Gzip, &config, None).unwrap();

    let offsets = [0u64, 900_000, 10, 500_000, 999_999, 250_000, 0];
    for &offset in &offsets {
        let (i, start) = fetcher.locate(offset).unwrap().unwrap();
        let chunk = fetcher.chunk(i).unwrap().unwrap();
        let rel = (offset - start) as usize;
        assert_eq!(chunk.data[rel], text[offset as usize]);
        assert!(fetcher.cache().used_bytes().unwrap() <= budget);
    }
}

#[test]
fn test_shared_fetcher_across_threads() {
    let text = Arc::new(pseudo_text(800_000, 303));
    let source = Arc::new(SharedSource::from_bytes(gzip(&text, 6)));
    let fetcher = Arc::new(ChunkFetcher::new(source, Format::Gzip, &small_chunks(4), None).unwrap());

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let fetcher = fetcher.clone();
            let text = text.clone();
            thread::spawn(move || {
                for k in 0..20u64 {
                    let offset = (t * 190_000 + k * 9_973) % text.len() as u64;
                    let (i, start) = fetcher.locate(offset).unwrap().unwrap();
                    let chunk = fetcher.chunk(i).unwrap().unwrap();
                    assert_eq!(chunk.data[(offset - start) as usize], text[offset as usize]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_close_cancels_outstanding_work() {
    let text = pseudo_text(2_000_000, 304);
    let mut reader = ParallelReader::from_bytes(gzip(&text, 6), small_chunks(8)).unwrap();
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf).unwrap();
    reader.close();
    assert_eq!(reader.state(), ReaderState::Closed);
    assert!(matches!(reader.read(&mut buf), Err(Error::Closed)));
    assert!(matches!(reader.seek(SeekFrom::Start(0)), Err(Error::Closed)));
}

#[test]
fn test_independent_readers_in_parallel() {
    let text = Arc::new(pseudo_text(500_000, 305));
    let compressed = Arc::new(bzip2(&text, 1));
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let text = text.clone();
            let compressed = compressed.clone();
            thread::spawn(move || {
                let out = decode_all(&compressed, small_chunks(2));
                assert!(out[..] == text[..]);
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_misaligned_speculative_chunks_are_discarded() {
    let (compressed, text) = gzip_with_decoy_headers(200);
    let mut reader = ParallelReader::from_bytes(compressed, small_chunks(4)).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert!(out == text);

    let stats = reader.stats().unwrap();
    assert!(stats.speculative_discarded > 0, "{stats:?}");
}

#[test]
fn test_bgzf_speculation_is_exact() {
    let text = pseudo_text(1_000_000, 302);
    let compressed = bgzf(&text, 20_000);
    let mut reader = ParallelReader::from_bytes(compressed, small_chunks(4)).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert!(out == text);

    let stats = reader.stats().unwrap();
    assert_eq!(stats.speculative_discarded, 0, "{stats:?}");
    assert!(stats.speculative_reused > 0, "{stats:?}");

    reader.seek(SeekFrom::Start(512_345)).unwrap();
    let mut buf = [0u8; 100];
    reader.read_exact(&mut buf).unwrap();
    assert_eq!(&buf[..], &text[512_345..512_445]);
}

/// Refuses reads from the worker pool, so only inline decodes succeed.
struct WorkerReadsFail(Cursor<Vec<u8>>);

impl Read for WorkerReadsFail {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let on_worker = thread::current()
            .name()
            .is_some_and(|name| name.starts_with("chunk-decoder"));
        if on_worker {
            return Err(io::Error::new(io::ErrorKind::Other, "read refused on worker"));
        }
        self.0.read(buf)
    }
}

impl Seek for WorkerReadsFail {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

#[test]
fn test_speculative_io_errors_fall_back_to_inline() {
    let text = pseudo_text(600_000, 303);
    let source = WorkerReadsFail(Cursor::new(gzip(&text, 6)));
    let mut reader = ParallelReader::from_source(source, small_chunks(4)).unwrap();
    let mut out = Vec::new();
    reader.read_to_end(&mut out).unwrap();
    assert!(out == text);

    let stats = reader.stats().unwrap();
    assert!(stats.speculative_failed > 0, "{stats:?}");
    assert_eq!(stats.speculative_reused, 0, "{stats:?}");
}
