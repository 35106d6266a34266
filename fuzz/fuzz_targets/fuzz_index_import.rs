#![no_main]

use libfuzzer_sys::fuzz_target;
use parallel_seekable::{Format, SeekIndex};

fuzz_target!(|data: &[u8]| {
    for format in [Format::Gzip, Format::Bzip2] {
        if let Ok(index) = SeekIndex::import(data, format, 0) {
            // Anything accepted must survive a round trip unchanged.
            let bytes = index.to_bytes();
            let again = SeekIndex::import(&bytes[..], format, 0).expect("re-import");
            assert_eq!(again.points(), index.points());
            assert_eq!(again.end(), index.end());
        }
    }
});
