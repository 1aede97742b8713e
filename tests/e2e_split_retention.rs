//! E2E test: segment rotation ("striding"), retention, and archival.

use shiplog::formats::BlockId;
use shiplog::{Config, ShipLog, ShipLogError};

fn id(block_num: u32) -> BlockId {
    BlockId::for_block(block_num, 0xd4)
}

fn payload(block_num: u32) -> Vec<u8> {
    format!("block-{block_num}").into_bytes()
}

fn store_range(log: &ShipLog, blocks: std::ops::RangeInclusive<u32>) {
    for n in blocks {
        let prev = if n == 1 { BlockId::default() } else { id(n - 1) };
        log.store_entry(id(n), prev, payload(n)).unwrap();
    }
}

#[test]
fn split_and_retention_trim_oldest() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::new(tmp.path());
    config.stride = Some(10);
    config.max_retained_files = 2;

    let mut log = ShipLog::new("t", &config).unwrap();
    store_range(&log, 1..=35);
    log.stop();

    // Splits produced [1-10], [11-20], [21-30]; retention dropped [1-10].
    assert!(!tmp.path().join("t-00000001-00000010.log").exists());
    assert!(tmp.path().join("t-00000011-00000020.log").exists());
    assert!(tmp.path().join("t-00000011-00000020.index").exists());
    assert!(tmp.path().join("t-00000021-00000030.log").exists());

    assert_eq!(log.begin_end_block_nums(), (11, 36));
    assert_eq!(log.read_entry(11).unwrap().0, payload(11));
    assert_eq!(log.read_entry(25).unwrap().0, payload(25));
    assert_eq!(log.read_entry(31).unwrap().0, payload(31));
    assert_eq!(log.read_entry(35).unwrap().0, payload(35));
    assert_eq!(log.get_block_id(20).unwrap(), Some(id(20)));
    assert!(matches!(
        log.read_entry(5),
        Err(ShipLogError::OutOfRange {
            block_num: 5,
            begin: 11,
            end: 36
        })
    ));
}

#[test]
fn retired_segments_move_to_the_archive() {
    let tmp = tempfile::tempdir().unwrap();
    let archive = tmp.path().join("archive");
    let mut config = Config::new(tmp.path().join("live"));
    config.stride = Some(5);
    config.max_retained_files = 1;
    config.archive_dir = Some(archive.clone());

    let mut log = ShipLog::new("t", &config).unwrap();
    store_range(&log, 1..=12);
    log.stop();

    assert!(archive.join("t-00000001-00000005.log").exists());
    assert!(archive.join("t-00000001-00000005.index").exists());
    assert!(tmp.path().join("live/t-00000006-00000010.log").exists());
    assert_eq!(log.begin_end_block_nums(), (6, 13));
}

#[test]
fn retained_dir_separate_from_log_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let retained = tmp.path().join("retained");
    let mut config = Config::new(tmp.path().join("live"));
    config.retained_dir = Some(retained.clone());
    config.stride = Some(4);

    let mut log = ShipLog::new("t", &config).unwrap();
    store_range(&log, 1..=10);
    log.stop();

    assert!(retained.join("t-00000001-00000004.log").exists());
    assert!(retained.join("t-00000005-00000008.log").exists());
    assert_eq!(log.read_entry(2).unwrap().0, payload(2));
    assert_eq!(log.begin_end_block_nums(), (1, 11));
}

#[test]
fn reopen_spans_catalog_and_active() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = Config::new(tmp.path());
    config.stride = Some(10);
    {
        let mut log = ShipLog::new("t", &config).unwrap();
        store_range(&log, 1..=25);
        log.stop();
    }

    let mut log = ShipLog::new("t", &config).unwrap();
    assert_eq!(log.begin_end_block_nums(), (1, 26));
    assert_eq!(log.read_entry(3).unwrap().0, payload(3));
    assert_eq!(log.read_entry(25).unwrap().0, payload(25));

    // Appending continues across the reopen, including the next split.
    store_range(&log, 26..=31);
    log.stop();
    assert!(tmp.path().join("t-00000021-00000030.log").exists());
    assert_eq!(log.begin_end_block_nums(), (1, 32));
}

#[test]
fn lowered_stride_refuses_to_open() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let mut log = ShipLog::new("t", &Config::new(tmp.path())).unwrap();
        store_range(&log, 1..=20);
        log.stop();
    }

    // 20 blocks already sit in the active segment; stride 8 cannot apply.
    let mut config = Config::new(tmp.path());
    config.stride = Some(8);
    assert!(matches!(
        ShipLog::new("t", &config),
        Err(ShipLogError::InvalidConfig(_))
    ));
}
