//! Sidecar index file: a dense array of entry start offsets.
//!
//! Index entry `k` is the `u64` LE offset at which block
//! `first_block_num + k` begins in the log. The index is derived state; it
//! may be deleted and rebuilt from the log at any time (see `recover`).

use crate::error::ShipLogResult;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

const SLOT_SIZE: u64 = 8;

/// Read/append handle over one `.index` file.
pub struct LogIndex {
    file: File,
    path: PathBuf,
    first_block_num: u32,
}

impl LogIndex {
    /// Open (creating if missing) the index at `path` for a log whose first
    /// entry is `first_block_num`.
    pub fn open(path: impl Into<PathBuf>, first_block_num: u32) -> ShipLogResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            first_block_num,
        })
    }

    /// Open an existing index read-only (retained segments).
    pub fn open_readonly(path: impl Into<PathBuf>, first_block_num: u32) -> ShipLogResult<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self {
            file,
            path,
            first_block_num,
        })
    }

    /// Path this index was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// First block number covered by slot 0.
    pub fn first_block_num(&self) -> u32 {
        self.first_block_num
    }

    /// Number of indexed blocks.
    pub fn num_blocks(&self) -> ShipLogResult<u64> {
        Ok(self.file.metadata()?.len() / SLOT_SIZE)
    }

    /// Log-file offset at which `block_num` begins.
    ///
    /// The caller guarantees `block_num` is within the indexed range.
    pub fn position_of(&self, block_num: u32) -> ShipLogResult<u64> {
        let slot = u64::from(block_num - self.first_block_num) * SLOT_SIZE;
        let mut f = &self.file;
        f.seek(SeekFrom::Start(slot))?;
        Ok(f.read_u64::<LittleEndian>()?)
    }

    /// Append the offset of the next block.
    pub fn append(&mut self, pos: u64) -> ShipLogResult<()> {
        let mut f = &self.file;
        f.seek(SeekFrom::End(0))?;
        f.write_u64::<LittleEndian>(pos)?;
        Ok(())
    }

    /// Drop all slots for blocks at or above `block_num`.
    pub fn truncate_to(&mut self, block_num: u32) -> ShipLogResult<()> {
        let len = u64::from(block_num - self.first_block_num) * SLOT_SIZE;
        self.file.set_len(len)?;
        Ok(())
    }

    /// Drop every slot.
    pub fn clear(&mut self) -> ShipLogResult<()> {
        self.file.set_len(0)?;
        Ok(())
    }

    /// Flush pending writes to the OS.
    pub fn sync(&self) -> ShipLogResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reset the first covered block (after a rebuild or segment rotation).
    pub fn set_first_block_num(&mut self, first_block_num: u32) {
        self.first_block_num = first_block_num;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_read_truncate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = LogIndex::open(tmp.path().join("x.index"), 10).unwrap();

        for pos in [0u64, 100, 250, 999] {
            index.append(pos).unwrap();
        }
        assert_eq!(index.num_blocks().unwrap(), 4);
        assert_eq!(index.position_of(10).unwrap(), 0);
        assert_eq!(index.position_of(12).unwrap(), 250);
        assert_eq!(index.position_of(13).unwrap(), 999);

        index.truncate_to(12).unwrap();
        assert_eq!(index.num_blocks().unwrap(), 2);
        assert_eq!(index.position_of(11).unwrap(), 100);

        // Appends continue at the truncated end.
        index.append(777).unwrap();
        assert_eq!(index.position_of(12).unwrap(), 777);
    }

    #[test]
    fn clear_empties_the_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = LogIndex::open(tmp.path().join("y.index"), 1).unwrap();
        index.append(5).unwrap();
        index.clear().unwrap();
        assert_eq!(index.num_blocks().unwrap(), 0);
    }
}
