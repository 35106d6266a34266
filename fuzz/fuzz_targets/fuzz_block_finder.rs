#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use parallel_seekable::block_finder::for_format;
use parallel_seekable::chunk::DecodeContext;
use parallel_seekable::source::SharedSource;
use parallel_seekable::{Config, Format};
use std::sync::Arc;

#[derive(Arbitrary, Debug)]
struct Input {
    bzip2: bool,
    lo: u16,
    len: u16,
    data: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let format = if input.bzip2 { Format::Bzip2 } else { Format::Gzip };
    let len = input.data.len() as u64;
    let Ok(ctx) = DecodeContext::new(
        Arc::new(SharedSource::from_bytes(input.data)),
        format,
        &Config::default(),
    ) else {
        return;
    };

    let lo = (input.lo as u64).min(len);
    let hi = (lo + input.len as u64).min(len);
    let Ok(finder) = for_format(&ctx, lo, hi) else {
        return;
    };
    for candidate in finder.flatten() {
        assert!(candidate >= lo * 8 && candidate < hi * 8);
    }
});
