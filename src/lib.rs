//! `shiplog`: durable, append-only, per-block state history logs.
//!
//! Scope:
//! - on-disk container format and entry codec (`formats`)
//! - positional log views (`view`) and the sidecar index (`index`)
//! - crash recovery and index rebuild (`recover`)
//! - catalog of retained segments with retention/archival (`catalog`)
//! - single-consumer asynchronous write pipeline (`writer`)
//! - the coordinator façade (`log`)
//! - payload specializations: transaction traces with per-transaction
//!   pruning (`traces`) and chain-state deltas (`chainstate`)
//!
//! Non-goals: multi-writer concurrency on one log, transactional atomicity
//! across entries, seeking by anything other than block number.
//!
//! ## Contract (what you can rely on)
//!
//! - **Self-describing container**: every entry carries its header up front
//!   and its own start offset behind its payload, so the file supports both
//!   forward and reverse traversal without the index. The index is derived
//!   state and is rebuilt from the log whenever it is missing or stale.
//! - **Crash consistency**: a torn tail (partial final write) is repaired at
//!   open by truncating back to the last entry boundary; interior corruption
//!   errors loudly. Re-opening a repaired log is a no-op.
//! - **Single writer, many readers**: all mutations funnel through one
//!   dedicated thread; writes commit strictly in submission order. A read
//!   after `store_entry` returns is guaranteed to observe the entry only once
//!   `begin_end_block_nums` reports it.
//! - **Stable offsets**: in-place payload rewrites (pruning) never change an
//!   entry's byte length, so offsets and the index stay valid forever.

pub mod catalog;
pub mod chainstate;
pub mod compression;
pub mod error;
pub mod formats;
pub mod index;
pub mod log;
pub mod recover;
pub mod traces;
pub mod view;
pub mod writer;

pub use chainstate::ChainStateLog;
pub use compression::CompressionType;
pub use error::{ShipLogError, ShipLogResult};
pub use formats::{BlockId, EntryHeader, TransactionId};
pub use log::{BlockInfo, Config, ShipLog};
pub use traces::{TraceLog, TransactionTrace};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traces::{TransactionReceipt, TransactionStatus};

    #[test]
    fn traces_log_store_prune_read() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = TraceLog::new(&Config::new(tmp.path())).unwrap();

        log.block_start(1);
        log.add_transaction(
            TransactionTrace {
                id: TransactionId::from_seed(0xa1),
                block_num: 1,
                receipt: Some(TransactionReceipt {
                    status: TransactionStatus::Executed,
                    cpu_usage_us: 100,
                    net_usage_words: 12,
                }),
                elapsed_us: 800,
                error_message: None,
            },
            Some(b"packed".to_vec()),
        );
        log.store(&BlockInfo {
            id: BlockId::for_block(1, 1),
            prev_id: BlockId::default(),
        })
        .unwrap();
        log.stop();

        let payload = log.get_log_entry(1).unwrap().unwrap();
        let before = payload.len();

        let mut ids = vec![TransactionId::from_seed(0xa1)];
        log.prune_transactions(1, &mut ids).unwrap();
        assert!(ids.is_empty());

        let pruned = log.get_log_entry(1).unwrap().unwrap();
        assert_eq!(pruned.len(), before);
        let records = traces::decode_entry(&pruned).unwrap();
        assert!(records[0].pruned);
    }
}
