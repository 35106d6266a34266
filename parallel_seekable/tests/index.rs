mod common;

use std::io::{Read, SeekFrom};

use common::*;
use parallel_seekable::{Config, Error, ParallelReader, SeekIndex};

fn read_at(reader: &mut ParallelReader, offset: u64, len: usize) -> Vec<u8> {
    reader.seek(SeekFrom::Start(offset)).unwrap();
    let mut buf = vec![0u8; len];
    let n = reader.read(&mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn test_export_import_round_trip() {
    let text = pseudo_text(900_000, 100);
    let compressed = gzip(&text, 6);

    let mut original = ParallelReader::from_bytes(compressed.clone(), small_chunks(4)).unwrap();
    assert_eq!(original.decompressed_size().unwrap(), text.len() as u64);
    let mut exported = Vec::new();
    original.export_index(&mut exported).unwrap();

    let mut fresh = ParallelReader::from_bytes(compressed, small_chunks(4)).unwrap();
    fresh.import_index(&exported[..]).unwrap();
    // The end of the stream is known without decoding anything.
    assert_eq!(fresh.size().unwrap(), Some(text.len() as u64));

    for offset in [850_000u64, 3, 444_444, 0, 899_999] {
        let expected = read_at(&mut original, offset, 4096);
        assert_eq!(read_at(&mut fresh, offset, 4096), expected);
        assert!(expected[..] == text[offset as usize..offset as usize + expected.len()]);
    }
}

#[test]
fn test_partial_index_continues_decoding() {
    let text = pseudo_text(600_000, 101);
    let compressed = bzip2(&text, 1);

    let mut partial = ParallelReader::from_bytes(compressed.clone(), small_chunks(2)).unwrap();
    read_at(&mut partial, 200_000, 10);
    let mut exported = Vec::new();
    partial.export_index(&mut exported).unwrap();
    let index = SeekIndex::import(
        &exported[..],
        parallel_seekable::Format::Bzip2,
        32,
    )
    .unwrap();
    assert!(!index.is_complete());

    let mut fresh = ParallelReader::from_bytes(compressed, small_chunks(2)).unwrap();
    fresh.import_index(&exported[..]).unwrap();
    let mut out = Vec::new();
    fresh.read_to_end(&mut out).unwrap();
    assert_eq!(out, text);
}

#[test]
fn test_index_from_other_chunk_size() {
    let text = pseudo_text(800_000, 102);
    let compressed = gzip(&text, 6);

    let mut coarse = ParallelReader::from_bytes(
        compressed.clone(),
        Config::default().with_parallelism(2).with_chunk_size(64 * 1024),
    )
    .unwrap();
    coarse.decompressed_size().unwrap();
    let mut exported = Vec::new();
    coarse.export_index(&mut exported).unwrap();

    let mut fine = ParallelReader::from_bytes(compressed, small_chunks(2)).unwrap();
    fine.import_index(&exported[..]).unwrap();
    for offset in [700_000u64, 12, 400_000] {
        let got = read_at(&mut fine, offset, 1000);
        assert!(got[..] == text[offset as usize..offset as usize + 1000]);
    }
}

#[test]
fn test_import_rejects_other_format() {
    let text = pseudo_text(100_000, 103);
    let mut gz = ParallelReader::from_bytes(gzip(&text, 6), Config::default()).unwrap();
    gz.decompressed_size().unwrap();
    let mut exported = Vec::new();
    gz.export_index(&mut exported).unwrap();

    let mut bz = ParallelReader::from_bytes(bzip2(&text, 1), Config::default()).unwrap();
    assert!(matches!(
        bz.import_index(&exported[..]),
        Err(Error::CorruptIndex(_))
    ));
    // A failed import leaves the reader usable.
    let mut out = Vec::new();
    bz.read_to_end(&mut out).unwrap();
    assert_eq!(out, text);
}

#[test]
fn test_import_rejects_corrupt_index() {
    let text = pseudo_text(300_000, 104);
    let compressed = gzip(&text, 6);
    let mut reader = ParallelReader::from_bytes(compressed.clone(), small_chunks(2)).unwrap();
    reader.decompressed_size().unwrap();
    let mut exported = Vec::new();
    reader.export_index(&mut exported).unwrap();

    let mut fresh = ParallelReader::from_bytes(compressed.clone(), small_chunks(2)).unwrap();
    assert!(matches!(
        fresh.import_index(&exported[..exported.len() / 2]),
        Err(Error::CorruptIndex(_))
    ));
    assert!(matches!(
        fresh.import_index(&b"PSKX"[..]),
        Err(Error::CorruptIndex(_))
    ));

    // An index of a different stream passes the header checks but is caught
    // when a chunk fails to end at its recorded checkpoint.
    let other = pseudo_text(300_000, 105);
    let mut other_reader = ParallelReader::from_bytes(gzip(&other, 6), small_chunks(2)).unwrap();
    other_reader.decompressed_size().unwrap();
    let mut other_index = Vec::new();
    other_reader.export_index(&mut other_index).unwrap();
    if fresh.import_index(&other_index[..]).is_ok() {
        let mut out = Vec::new();
        let result = fresh.read_to_end(&mut out);
        assert!(result.is_err() || out != text);
    }
}

/// Rebuilds `exported` with checkpoint `k`'s decompressed offset moved by `delta`.
fn shift_checkpoint(exported: &[u8], k: usize, delta: u64) -> Vec<u8> {
    // flate2 writes a bare 10-byte header, so the first block starts at bit 80.
    let index = SeekIndex::import(exported, parallel_seekable::Format::Gzip, 80).unwrap();
    let end = index.end().unwrap();
    let mut shifted = SeekIndex::new(index.format());
    for (i, point) in index.points().iter().enumerate() {
        let mut point = point.clone();
        if i == k {
            point.decompressed_byte_offset += delta;
        }
        shifted.append(point).unwrap();
    }
    shifted
        .mark_complete(end.compressed_bit_offset, end.decompressed_size)
        .unwrap();
    let mut out = Vec::new();
    shifted.export(&mut out).unwrap();
    out
}

#[test]
fn test_shifted_checkpoint_is_reported() {
    let text = pseudo_text(900_000, 106);
    let compressed = gzip(&text, 6);
    let mut reader = ParallelReader::from_bytes(compressed.clone(), small_chunks(2)).unwrap();
    reader.decompressed_size().unwrap();
    let mut exported = Vec::new();
    reader.export_index(&mut exported).unwrap();

    let index = SeekIndex::import(&exported[..], parallel_seekable::Format::Gzip, 80).unwrap();
    assert!(index.len() > 4);
    // A checkpoint past the first window, so its window length is unchanged.
    let k = index.len() / 2;
    let original = index.get(k).unwrap().decompressed_byte_offset;
    assert!(original > 32 * 1024);

    for delta in [1u64, 5] {
        let tampered = shift_checkpoint(&exported, k, delta);
        // Reads on either side of the shifted checkpoint replay a chunk whose
        // length disagrees with the index.
        for offset in [original - 4, original + delta + 100] {
            let mut fresh =
                ParallelReader::from_bytes(compressed.clone(), small_chunks(2)).unwrap();
            fresh.import_index(&tampered[..]).unwrap();
            fresh.seek(SeekFrom::Start(offset)).unwrap();
            let mut buf = [0u8; 64];
            let result = fresh.read(&mut buf);
            assert!(
                matches!(result, Err(Error::CorruptIndex(_))),
                "delta {delta}, offset {offset}: {result:?}"
            );
        }
    }
}
