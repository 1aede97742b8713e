#![no_main]

use libfuzzer_sys::fuzz_target;
use shiplog::formats::EntryHeader;

fuzz_target!(|data: &[u8]| {
    let mut cursor = std::io::Cursor::new(data);
    let _ = EntryHeader::read(&mut cursor, true);
    let mut cursor = std::io::Cursor::new(data);
    let _ = EntryHeader::read(&mut cursor, false);
});
