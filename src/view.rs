//! Positional read/write view over one log file.
//!
//! `LogData` presents a random-access byte window over a `.log` file. All
//! positional accessors require `pos` to point at a valid entry start; that
//! precondition is enforced externally by the index and the catalog, never
//! re-checked here.
//!
//! Plain `std::fs` positional I/O (seek + read on a shared handle) is used
//! rather than memory mapping; the on-disk contract does not mandate either.

use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::{
    ship_version, BlockId, EntryHeader, BLOCK_ID_OFFSET, HEADER_SIZE, PAYLOAD_SIZE_OFFSET,
};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Access mode for a [`LogData`] view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only.
    ReadOnly,
    /// Reads plus fixed-length in-place payload rewrites.
    ReadWrite,
}

/// A read-only or read-write window over one log file.
pub struct LogData {
    file: File,
    path: PathBuf,
    mode: OpenMode,
}

impl LogData {
    /// Open `path` in `mode`. The file must already exist.
    pub fn open(path: impl Into<PathBuf>, mode: OpenMode) -> ShipLogResult<Self> {
        let path = path.into();
        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new().read(true).open(&path)?,
            OpenMode::ReadWrite => OpenOptions::new().read(true).write(true).open(&path)?,
        };
        Ok(Self { file, path, mode })
    }

    /// Path this view was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size in bytes.
    pub fn size(&self) -> ShipLogResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Log format version, probed from the first entry's magic.
    pub fn version(&self) -> ShipLogResult<u32> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(0))?;
        Ok(ship_version(f.read_u64::<LittleEndian>()?))
    }

    /// Block number of the first entry.
    pub fn first_block_num(&self) -> ShipLogResult<u32> {
        self.block_num_at(0)
    }

    /// Position of the first entry. Always 0.
    pub fn first_block_position(&self) -> u64 {
        0
    }

    /// Block number of the entry starting at `pos`, read from the big-endian
    /// prefix of its block id without materializing the full id.
    pub fn block_num_at(&self, pos: u64) -> ShipLogResult<u32> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos + BLOCK_ID_OFFSET))?;
        Ok(f.read_u32::<BigEndian>()?)
    }

    /// Block id of the entry starting at `pos`.
    pub fn block_id_at(&self, pos: u64) -> ShipLogResult<BlockId> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos + BLOCK_ID_OFFSET))?;
        let mut id = [0u8; 32];
        f.read_exact(&mut id)?;
        Ok(BlockId::new(id))
    }

    /// Payload size of the entry starting at `pos`.
    pub fn payload_size_at(&self, pos: u64) -> ShipLogResult<u64> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos + PAYLOAD_SIZE_OFFSET))?;
        Ok(f.read_u64::<LittleEndian>()?)
    }

    /// Decode the header of the entry starting at `pos`.
    pub fn header_at(&self, pos: u64, assert_version: bool) -> ShipLogResult<EntryHeader> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos))?;
        EntryHeader::read(&mut f, assert_version)
    }

    /// Read the payload of the entry starting at `pos`, returning the bytes
    /// and the entry's format version.
    pub fn read_payload(&self, pos: u64) -> ShipLogResult<(Vec<u8>, u32)> {
        let (mut stream, version) = self.ro_stream_at(pos)?;
        let mut payload = Vec::new();
        stream.read_to_end(&mut payload)?;
        Ok((payload, version))
    }

    /// A bounded reader over the payload of the entry starting at `pos`, plus
    /// the entry's format version.
    pub fn ro_stream_at(&self, pos: u64) -> ShipLogResult<(impl Read + '_, u32)> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos))?;
        let version = ship_version(f.read_u64::<LittleEndian>()?);
        let size = self.payload_size_at(pos)?;
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos + HEADER_SIZE))?;
        Ok((f.take(size), version))
    }

    /// Overwrite the payload of the entry starting at `pos` in place.
    ///
    /// `bytes` must be exactly the entry's payload size: offsets of this and
    /// every other entry are load-bearing, so length changes are refused.
    pub fn write_payload_at(&self, pos: u64, bytes: &[u8]) -> ShipLogResult<()> {
        if self.mode != OpenMode::ReadWrite {
            return Err(ShipLogError::InvalidState(
                "payload rewrite on a read-only log view".into(),
            ));
        }
        let expected = self.payload_size_at(pos)?;
        if bytes.len() as u64 != expected {
            return Err(ShipLogError::LengthChanged {
                expected,
                actual: bytes.len() as u64,
            });
        }
        let mut f = &self.file;
        f.seek(SeekFrom::Start(pos + HEADER_SIZE))?;
        f.write_all(bytes)?;
        f.flush()?;
        Ok(())
    }

    /// Read the `u64` LE position word stored at absolute offset `at`.
    pub fn position_word_at(&self, at: u64) -> ShipLogResult<u64> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(at))?;
        Ok(f.read_u64::<LittleEndian>()?)
    }

    /// Read the trailing start-position word of the final entry, i.e. the
    /// last 8 bytes of the file. Validation is the caller's job.
    pub fn trailing_position(&self) -> ShipLogResult<u64> {
        let size = self.size()?;
        self.position_word_at(size.saturating_sub(8))
    }
}
