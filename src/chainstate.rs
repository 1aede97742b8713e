//! Chain-state deltas log.
//!
//! Stores one opaque, compressed delta blob per block. Delta computation from
//! the database happens outside this crate; the log frames and persists what
//! it is given. Payload framing: `[codec: u8][compressed delta bytes]`.
//! No pruning: deltas are erased only by whole-segment retention.

use crate::compression::{compress, decompress, CompressionType};
use crate::error::{ShipLogError, ShipLogResult};
use crate::log::{BlockInfo, Config, ShipLog};
use std::path::Path;

/// File stem of the chain-state log.
const LOG_NAME: &str = "chain_state_history";

/// The chain-state deltas log.
pub struct ChainStateLog {
    log: ShipLog,
    /// Codec applied to newly stored deltas.
    pub compression: CompressionType,
}

impl ChainStateLog {
    /// Open (creating or recovering) the chain-state log under `config`.
    pub fn new(config: &Config) -> ShipLogResult<Self> {
        Ok(Self {
            log: ShipLog::new(LOG_NAME, config)?,
            compression: CompressionType::Zlib,
        })
    }

    /// Whether a chain-state log already exists under `log_dir`.
    pub fn exists(log_dir: &Path) -> bool {
        log_dir.join(format!("{LOG_NAME}.log")).exists()
    }

    /// Half-open `[begin, end)` range of stored blocks.
    pub fn begin_end_block_nums(&self) -> (u32, u32) {
        self.log.begin_end_block_nums()
    }

    /// Compress and submit the delta computed for `block`.
    pub fn store(&self, block: &BlockInfo, delta: &[u8]) -> ShipLogResult<()> {
        let mut payload = vec![self.compression.tag()];
        payload.extend_from_slice(&compress(self.compression, delta)?);
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

    /// Decompress a payload returned by [`ChainStateLog::get_log_entry`] back
    /// into the delta bytes.
    pub fn unpack_entry(payload: &[u8]) -> ShipLogResult<Vec<u8>> {
        let Some((tag, body)) = payload.split_first() else {
            return Err(ShipLogError::Decode("empty chain-state payload".into()));
        };
        decompress(CompressionType::from_tag(*tag)?, body)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::BlockId;

    fn block(block_num: u32) -> BlockInfo {
        BlockInfo {
            id: BlockId::for_block(block_num, 0x55),
            prev_id: if block_num == 0 {
                BlockId::default()
            } else {
                BlockId::for_block(block_num - 1, 0x55)
            },
        }
    }

    #[test]
    fn store_and_unpack_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = ChainStateLog::new(&Config::new(tmp.path())).unwrap();

        let delta: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();
        log.store(&block(1), &delta).unwrap();
        log.store(&block(2), b"small delta").unwrap();
        log.stop();

        assert_eq!(log.begin_end_block_nums(), (1, 3));
        let payload = log.get_log_entry(1).unwrap().unwrap();
        assert_eq!(payload[0], CompressionType::Zlib.tag());
        assert_eq!(ChainStateLog::unpack_entry(&payload).unwrap(), delta);
        assert_eq!(
            ChainStateLog::unpack_entry(&log.get_log_entry(2).unwrap().unwrap()).unwrap(),
            b"small delta"
        );
        assert!(log.get_log_entry(3).unwrap().is_none());
    }

    #[test]
    fn exists_reflects_the_active_file() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!ChainStateLog::exists(tmp.path()));
        let _log = ChainStateLog::new(&Config::new(tmp.path())).unwrap();
        assert!(ChainStateLog::exists(tmp.path()));
    }
}
