#![no_main]

use libfuzzer_sys::fuzz_target;
use shiplog::traces::decode_entry;

fuzz_target!(|data: &[u8]| {
    let _ = decode_entry(data);
});
