#![no_main]

use libfuzzer_sys::fuzz_target;
use shiplog::{Config, ShipLog};

// Opening a log over arbitrary bytes must never panic, and a second open of
// whatever the first one repaired must agree with it.
fuzz_target!(|data: &[u8]| {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("f.log"), data).unwrap();

    let first = ShipLog::new("f", &Config::new(tmp.path()));
    let Ok(first) = first else { return };
    let range = first.begin_end_block_nums();
    drop(first);

    let second = ShipLog::new("f", &Config::new(tmp.path())).unwrap();
    assert_eq!(second.begin_end_block_nums(), range);
});
