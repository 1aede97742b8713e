//! Transaction traces log.
//!
//! Accumulates `(trace, packed transaction)` pairs per in-flight block,
//! serializes and compresses them at block commit, and supports retroactive
//! per-transaction pruning of already-written entries.
//!
//! ## Payload framing (must not change without a format bump)
//!
//! ```text
//! [codec: u8]                      -- compression tag, see `compression`
//! repeat:
//!   [record_len: u32 LE]           -- length of flag + id + body
//!   [pruned: u8]                   -- 0 live, 1 pruned
//!   [txn_id: 32 bytes]
//!   [body: record_len - 33 bytes]  -- codec-compressed postcard record
//! ```
//!
//! Record headers stay uncompressed and bodies are compressed one by one, so
//! a transaction can be erased in place: its body bytes are zeroed and the
//! flag flipped, leaving every offset in the file untouched.

use crate::compression::{compress, decompress, CompressionType};
use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::TransactionId;
use crate::log::{BlockInfo, Config, ShipLog};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// File stem of the traces log.
const LOG_NAME: &str = "trace_history";

/// Fixed bytes of a record before its body: pruned flag + transaction id.
const RECORD_HEADER: usize = 1 + 32;

/// Outcome of a transaction inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Executed successfully.
    Executed,
    /// Objectively failed, error handler executed.
    SoftFail,
    /// Objectively failed, error handler also failed.
    HardFail,
    /// Scheduled for a later block.
    Delayed,
    /// Expired without executing.
    Expired,
}

/// Receipt recorded for a transaction included in a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    /// Execution status.
    pub status: TransactionStatus,
    /// Billed CPU, microseconds.
    pub cpu_usage_us: u32,
    /// Billed net usage, 8-byte words.
    pub net_usage_words: u32,
}

/// Execution trace of one transaction. Construction happens outside this
/// crate; the log stores what it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTrace {
    /// Transaction identity.
    pub id: TransactionId,
    /// Block the transaction executed in.
    pub block_num: u32,
    /// Receipt, present iff the transaction is included in the block.
    pub receipt: Option<TransactionReceipt>,
    /// Wall-clock execution time, microseconds.
    pub elapsed_us: u64,
    /// Error description for failed transactions.
    pub error_message: Option<String>,
}

/// One serialized record body: the trace plus, for included transactions,
/// the packed transaction payload when it was available at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// The transaction trace.
    pub trace: TransactionTrace,
    /// Packed transaction bytes, or `None` for the id-only placeholder.
    pub packed: Option<Vec<u8>>,
}

/// One decoded record as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntryRecord {
    /// Transaction identity from the record header.
    pub id: TransactionId,
    /// Whether the record body has been pruned.
    pub pruned: bool,
    /// The record body; `None` when pruned.
    pub record: Option<TraceRecord>,
}

/// The transaction traces log.
pub struct TraceLog {
    log: ShipLog,
    /// Codec applied to record bodies of newly stored entries.
    pub compression: CompressionType,
    trace_caches: BTreeMap<u32, Vec<(TransactionTrace, Option<Vec<u8>>)>>,
}

impl TraceLog {
    /// Open (creating or recovering) the traces log under `config`.
    pub fn new(config: &Config) -> ShipLogResult<Self> {
        Ok(Self {
            log: ShipLog::new(LOG_NAME, config)?,
            compression: CompressionType::Zlib,
            trace_caches: BTreeMap::new(),
        })
    }

    /// Whether a traces log already exists under `log_dir`.
    pub fn exists(log_dir: &Path) -> bool {
        log_dir.join(format!("{LOG_NAME}.log")).exists()
    }

    /// Half-open `[begin, end)` range of stored blocks.
    pub fn begin_end_block_nums(&self) -> (u32, u32) {
        self.log.begin_end_block_nums()
    }

    /// Cache a trace (and optionally its packed transaction) for the block it
    /// executed in. Consumed by [`TraceLog::store`].
    pub fn add_transaction(&mut self, trace: TransactionTrace, packed: Option<Vec<u8>>) {
        self.trace_caches
            .entry(trace.block_num)
            .or_default()
            .push((trace, packed));
    }

    /// Drop any traces cached for `block_num`; called when the block starts
    /// (or restarts after a fork).
    pub fn block_start(&mut self, block_num: u32) {
        self.trace_caches.remove(&block_num);
    }

    /// Serialize, compress and submit the traces cached for `block`.
    ///
    /// The block's cache bucket is consumed; buckets for lower blocks are
    /// dropped as stale.
    pub fn store(&mut self, block: &BlockInfo) -> ShipLogResult<()> {
        let block_num = block.block_num();
        let entries = self.trace_caches.remove(&block_num).unwrap_or_default();
        self.trace_caches.retain(|cached, _| *cached > block_num);
        let payload = encode_payload(self.compression, &entries)?;
        self.log.store_entry(block.id, block.prev_id, payload)
    }

    /// Raw on-disk payload bytes for block `block_num` (no decompression), or
    /// `None` when the block is not stored.
    pub fn get_log_entry(&self, block_num: u32) -> ShipLogResult<Option<Vec<u8>>> {
        match self.log.read_entry(block_num) {
            Ok((payload, _version)) => Ok(Some(payload)),
            Err(ShipLogError::OutOfRange { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Erase the listed transactions from block `block_num`'s entry in place.
    ///
    /// Record bodies are zeroed and their pruned flags set; the entry's size
    /// and every file offset stay unchanged. `ids` is updated in place to the
    /// residue of ids not found in the block.
    pub fn prune_transactions(
        &self,
        block_num: u32,
        ids: &mut Vec<TransactionId>,
    ) -> ShipLogResult<()> {
        self.log
            .modify_entry(block_num, |_version, payload| prune_payload(payload, ids))
    }

    /// Drain queued writes, then join the writer thread.
    pub fn stop(&mut self) {
        self.log.stop();
    }

    /// Discard queued writes, then join the writer thread.
    pub fn light_stop(&mut self) {
        self.log.light_stop();
    }
}

/// Encode one block's traces into an entry payload.
fn encode_payload(
    codec: CompressionType,
    entries: &[(TransactionTrace, Option<Vec<u8>>)],
) -> ShipLogResult<Vec<u8>> {
    let mut out = vec![codec.tag()];
    for (trace, packed) in entries {
        // The packed transaction travels only for included transactions; the
        // rest store the id-only placeholder.
        let packed = if trace.receipt.is_some() {
            packed.clone()
        } else {
            None
        };
        let record = TraceRecord {
            trace: trace.clone(),
            packed,
        };
        let raw = postcard::to_allocvec(&record).map_err(|e| ShipLogError::Encode(e.to_string()))?;
        let body = compress(codec, &raw)?;
        let record_len = u32::try_from(RECORD_HEADER + body.len())
            .map_err(|_| ShipLogError::Encode("trace record too large".into()))?;
        out.write_u32::<LittleEndian>(record_len)?;
        out.push(0); // pruned flag
        out.extend_from_slice(record.trace.id.as_bytes());
        out.extend_from_slice(&body);
    }
    Ok(out)
}

/// Walk an entry payload, zeroing the bodies of records whose id appears in
/// `ids`. Found ids are removed from `ids`.
fn prune_payload(payload: &mut [u8], ids: &mut Vec<TransactionId>) -> ShipLogResult<()> {
    if payload.is_empty() {
        return Ok(());
    }
    CompressionType::from_tag(payload[0])?;
    let mut off = 1usize;
    while off < payload.len() {
        if off + 4 > payload.len() {
            return Err(ShipLogError::Decode(
                "truncated trace record length".into(),
            ));
        }
        let record_len = u32::from_le_bytes([
            payload[off],
            payload[off + 1],
            payload[off + 2],
            payload[off + 3],
        ]) as usize;
        let flag_off = off + 4;
        if record_len < RECORD_HEADER || flag_off + record_len > payload.len() {
            return Err(ShipLogError::Decode("trace record overruns payload".into()));
        }
        let id_off = flag_off + 1;
        let body_off = id_off + 32;
        let body_end = flag_off + record_len;

        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&payload[id_off..body_off]);
        let record_id = TransactionId::new(id_bytes);
        if let Some(found) = ids.iter().position(|id| *id == record_id) {
            payload[body_off..body_end].fill(0);
            payload[flag_off] = 1;
            ids.remove(found);
        }
        off = body_end;
    }
    Ok(())
}

/// Decode an entry payload into its records. Pruned records keep their id and
/// flag but carry no body.
pub fn decode_entry(payload: &[u8]) -> ShipLogResult<Vec<TraceEntryRecord>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let codec = CompressionType::from_tag(payload[0])?;
    let mut out = Vec::new();
    let mut off = 1usize;
    while off < payload.len() {
        if off + 4 > payload.len() {
            return Err(ShipLogError::Decode(
                "truncated trace record length".into(),
            ));
        }
        let record_len = u32::from_le_bytes([
            payload[off],
            payload[off + 1],
            payload[off + 2],
            payload[off + 3],
        ]) as usize;
        let flag_off = off + 4;
        if record_len < RECORD_HEADER || flag_off + record_len > payload.len() {
            return Err(ShipLogError::Decode("trace record overruns payload".into()));
        }
        let pruned = payload[flag_off] != 0;
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&payload[flag_off + 1..flag_off + 1 + 32]);
        let body = &payload[flag_off + RECORD_HEADER..flag_off + record_len];
        let record = if pruned {
            None
        } else {
            let raw = decompress(codec, body)?;
            Some(
                postcard::from_bytes::<TraceRecord>(&raw)
                    .map_err(|e| ShipLogError::Decode(e.to_string()))?,
            )
        };
        out.push(TraceEntryRecord {
            id: TransactionId::new(id_bytes),
            pruned,
            record,
        });
        off = flag_off + record_len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(seed: u8, block_num: u32, included: bool) -> TransactionTrace {
        TransactionTrace {
            id: TransactionId::from_seed(seed),
            block_num,
            receipt: included.then_some(TransactionReceipt {
                status: TransactionStatus::Executed,
                cpu_usage_us: 120,
                net_usage_words: 16,
            }),
            elapsed_us: 950,
            error_message: None,
        }
    }

    #[test]
    fn payload_round_trip_all_codecs() {
        for codec in [
            CompressionType::None,
            CompressionType::Zlib,
            CompressionType::Zstd,
        ] {
            let entries = vec![
                (trace(1, 7, true), Some(b"packed-txn-1".to_vec())),
                (trace(2, 7, false), Some(b"ignored".to_vec())),
                (trace(3, 7, true), None),
            ];
            let payload = encode_payload(codec, &entries).unwrap();
            let decoded = decode_entry(&payload).unwrap();

            assert_eq!(decoded.len(), 3);
            assert!(decoded.iter().all(|r| !r.pruned));
            let first = decoded[0].record.as_ref().unwrap();
            assert_eq!(first.trace, entries[0].0);
            assert_eq!(first.packed.as_deref(), Some(&b"packed-txn-1"[..]));
            // Not included: the packed payload is dropped at encode time.
            assert_eq!(decoded[1].record.as_ref().unwrap().packed, None);
            assert_eq!(decoded[2].record.as_ref().unwrap().packed, None);
        }
    }

    #[test]
    fn prune_zeroes_body_and_keeps_length() {
        let entries = vec![
            (trace(1, 3, true), Some(b"packed-1".to_vec())),
            (trace(2, 3, true), Some(b"packed-2".to_vec())),
        ];
        let mut payload = encode_payload(CompressionType::Zlib, &entries).unwrap();
        let before_len = payload.len();

        let mut ids = vec![TransactionId::from_seed(1), TransactionId::from_seed(9)];
        prune_payload(&mut payload, &mut ids).unwrap();

        // Not-found residue stays; length is untouched.
        assert_eq!(ids, vec![TransactionId::from_seed(9)]);
        assert_eq!(payload.len(), before_len);

        let decoded = decode_entry(&payload).unwrap();
        assert!(decoded[0].pruned);
        assert!(decoded[0].record.is_none());
        assert_eq!(decoded[0].id, TransactionId::from_seed(1));
        assert!(!decoded[1].pruned);
        assert_eq!(
            decoded[1].record.as_ref().unwrap().packed.as_deref(),
            Some(&b"packed-2"[..])
        );
    }

    #[test]
    fn prune_is_idempotent() {
        let entries = vec![(trace(1, 3, true), Some(b"packed-1".to_vec()))];
        let mut payload = encode_payload(CompressionType::None, &entries).unwrap();

        let mut ids = vec![TransactionId::from_seed(1)];
        prune_payload(&mut payload, &mut ids).unwrap();
        assert!(ids.is_empty());

        let snapshot = payload.clone();
        let mut ids = vec![TransactionId::from_seed(1)];
        prune_payload(&mut payload, &mut ids).unwrap();
        assert!(ids.is_empty());
        assert_eq!(payload, snapshot);
    }

    #[test]
    fn empty_block_encodes_codec_tag_only() {
        let payload = encode_payload(CompressionType::Zstd, &[]).unwrap();
        assert_eq!(payload, vec![CompressionType::Zstd.tag()]);
        assert!(decode_entry(&payload).unwrap().is_empty());
    }

    #[test]
    fn decode_rejects_overrunning_record() {
        let mut payload = encode_payload(
            CompressionType::None,
            &[(trace(1, 1, true), None)],
        )
        .unwrap();
        // Inflate the first record's declared length past the payload end.
        payload[1..5].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            decode_entry(&payload),
            Err(ShipLogError::Decode(_))
        ));
    }
}
