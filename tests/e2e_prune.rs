//! E2E test: retroactive transaction pruning preserves offsets.
//!
//! Pruning rewrites an entry's payload bytes in place; the entry's size, its
//! neighbors, and the index must come out byte-identical.

use shiplog::formats::{BlockId, TransactionId};
use shiplog::traces::{
    decode_entry, TraceLog, TransactionReceipt, TransactionStatus, TransactionTrace,
};
use shiplog::{BlockInfo, Config};

fn block(block_num: u32) -> BlockInfo {
    BlockInfo {
        id: BlockId::for_block(block_num, 0x21),
        prev_id: if block_num == 1 {
            BlockId::default()
        } else {
            BlockId::for_block(block_num - 1, 0x21)
        },
    }
}

fn txn_id(block_num: u32, slot: u8) -> TransactionId {
    TransactionId::from_seed(block_num as u8 * 10 + slot)
}

fn trace(block_num: u32, slot: u8) -> TransactionTrace {
    TransactionTrace {
        id: txn_id(block_num, slot),
        block_num,
        receipt: Some(TransactionReceipt {
            status: TransactionStatus::Executed,
            cpu_usage_us: 150 * u32::from(slot),
            net_usage_words: 20,
        }),
        elapsed_us: 1000 + u64::from(slot),
        error_message: None,
    }
}

fn build_traces_log(dir: &std::path::Path) -> TraceLog {
    let mut log = TraceLog::new(&Config::new(dir)).unwrap();
    for n in 1..=5u32 {
        log.block_start(n);
        for slot in 0..3u8 {
            log.add_transaction(trace(n, slot), Some(format!("packed-{n}-{slot}").into_bytes()));
        }
        log.store(&block(n)).unwrap();
    }
    log.stop();
    log
}

#[test]
fn prune_updates_ids_in_place_and_preserves_neighbors() {
    let tmp = tempfile::tempdir().unwrap();
    let log = build_traces_log(tmp.path());

    let entry3_before = log.get_log_entry(3).unwrap().unwrap();
    let entry4_before = log.get_log_entry(4).unwrap().unwrap();
    let log_size_before = std::fs::metadata(tmp.path().join("trace_history.log"))
        .unwrap()
        .len();

    // t1 lives in block 3; t7 does not exist anywhere.
    let t1 = txn_id(3, 1);
    let t7 = TransactionId::from_seed(0xee);
    let mut ids = vec![t1, t7];
    log.prune_transactions(3, &mut ids).unwrap();

    // The residue holds only the id that was not found.
    assert_eq!(ids, vec![t7]);

    // Entry 3 kept its size; the file kept its size; entry 4 is untouched.
    let entry3_after = log.get_log_entry(3).unwrap().unwrap();
    assert_eq!(entry3_after.len(), entry3_before.len());
    assert_ne!(entry3_after, entry3_before);
    assert_eq!(log.get_log_entry(4).unwrap().unwrap(), entry4_before);
    assert_eq!(
        std::fs::metadata(tmp.path().join("trace_history.log"))
            .unwrap()
            .len(),
        log_size_before
    );

    // The pruned record is a tombstone; its siblings still decode.
    let records = decode_entry(&entry3_after).unwrap();
    assert_eq!(records.len(), 3);
    assert!(!records[0].pruned);
    assert!(records[1].pruned);
    assert!(records[1].record.is_none());
    assert_eq!(records[1].id, t1);
    assert_eq!(
        records[2].record.as_ref().unwrap().packed.as_deref(),
        Some(&b"packed-3-2"[..])
    );
}

#[test]
fn pruned_entries_survive_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let log = build_traces_log(tmp.path());
        let mut ids = vec![txn_id(2, 0)];
        log.prune_transactions(2, &mut ids).unwrap();
        assert!(ids.is_empty());
    }

    let log = TraceLog::new(&Config::new(tmp.path())).unwrap();
    assert_eq!(log.begin_end_block_nums(), (1, 6));
    let records = decode_entry(&log.get_log_entry(2).unwrap().unwrap()).unwrap();
    assert!(records[0].pruned);
    assert!(!records[1].pruned);
    // Unpruned blocks fully decode.
    let records = decode_entry(&log.get_log_entry(5).unwrap().unwrap()).unwrap();
    assert_eq!(records[0].record.as_ref().unwrap().trace, trace(5, 0));
}

#[test]
fn prune_out_of_range_block_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let log = build_traces_log(tmp.path());

    let mut ids = vec![txn_id(1, 0)];
    assert!(log.prune_transactions(99, &mut ids).is_err());
    assert_eq!(ids, vec![txn_id(1, 0)]);
}
