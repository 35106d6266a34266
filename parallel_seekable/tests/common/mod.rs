#![allow(dead_code)]

use std::io::{Read, Write};

use bzip2::write::BzEncoder;
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::{Compression, Crc};
use parallel_seekable::{Config, ParallelReader};

/// Text-like data with repeats, so DEFLATE emits plenty of back-references.
pub fn pseudo_text(len: usize, seed: u64) -> Vec<u8> {
    let words: [&[u8]; 8] = [
        b"lorem ", b"ipsum ", b"dolor\n", b"sit ", b"amet, ", b"consectetur ", b"adipiscing ", b"elit. ",
    ];
    let mut state = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.extend_from_slice(words[(state >> 61) as usize]);
        if (state >> 33) & 0x1F == 0 {
            out.extend_from_slice(format!("{} ", state % 100_000).as_bytes());
        }
    }
    out.truncate(len);
    out
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

pub fn gzip(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
    encoder.write_all(data).expect("gzip encode");
    encoder.finish().expect("gzip finish")
}

pub fn bzip2(data: &[u8], level: u32) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::new(level));
    encoder.write_all(data).expect("bzip2 encode");
    encoder.finish().expect("bzip2 finish")
}

/// BGZF file: members of `member_len` input bytes, each announcing its size
/// in a `BC` extra subfield, followed by the empty end-of-file member.
pub fn bgzf(data: &[u8], member_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for piece in data.chunks(member_len).chain([&[][..]]) {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(6));
        encoder.write_all(piece).expect("deflate encode");
        let body = encoder.finish().expect("deflate finish");
        let mut crc = Crc::new();
        crc.update(piece);

        let bsize = (18 + body.len() + 8 - 1) as u16;
        out.extend_from_slice(&[0x1f, 0x8b, 8, 4, 0, 0, 0, 0, 0, 0xff, 6, 0, b'B', b'C', 2, 0]);
        out.extend_from_slice(&bsize.to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.sum().to_le_bytes());
        out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
    }
    out
}

/// Gzip made of stored blocks whose payloads end in a fake stored-block
/// header (LEN 40000) right before the next real header. A search from
/// anywhere in a block lands on the fake header first. Returns the file and
/// its plaintext.
pub fn gzip_with_decoy_headers(blocks: usize) -> (Vec<u8>, Vec<u8>) {
    const DECOY: [u8; 5] = [0x00, 0x40, 0x9c, 0xbf, 0x63];
    let len: u16 = 4095;
    let mut payload = vec![0xffu8; len as usize - DECOY.len()];
    payload.extend_from_slice(&DECOY);

    let mut file = vec![0x1f, 0x8b, 8, 0, 0, 0, 0, 0, 0, 0xff];
    let mut text = Vec::new();
    for _ in 0..blocks {
        file.push(0x00);
        file.extend_from_slice(&len.to_le_bytes());
        file.extend_from_slice(&(!len).to_le_bytes());
        file.extend_from_slice(&payload);
        text.extend_from_slice(&payload);
    }
    let tail = b"end of stored blocks\n";
    file.push(0x01);
    file.extend_from_slice(&(tail.len() as u16).to_le_bytes());
    file.extend_from_slice(&(!(tail.len() as u16)).to_le_bytes());
    file.extend_from_slice(tail);
    text.extend_from_slice(tail);

    let mut crc = Crc::new();
    crc.update(&text);
    file.extend_from_slice(&crc.sum().to_le_bytes());
    file.extend_from_slice(&(text.len() as u32).to_le_bytes());
    (file, text)
}

pub fn small_chunks(parallelism: usize) -> Config {
    Config::default()
        .with_parallelism(parallelism)
        .with_chunk_size(16 * 1024)
}

pub fn decode_all(compressed: &[u8], config: Config) -> Vec<u8> {
    let mut reader = ParallelReader::from_bytes(compressed.to_vec(), config).expect("open");
    let mut out = Vec::new();
    reader.read_to_end(&mut out).expect("decode");
    out
}
