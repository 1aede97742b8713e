//! Catalog of retained log segments.
//!
//! A retained segment is a finalized `(log, index)` file pair whose name
//! encodes its inclusive block range: `<name>-<lo>-<hi>.log` with `<lo>` and
//! `<hi>` zero-padded decimal block numbers. Retained segments cover strictly
//! lower block numbers than the active segment; their ranges are disjoint and
//! contiguous.
//!
//! Segments are opened on demand and kept behind an LRU cap so a deep history
//! does not pin one file handle per segment.

use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::{BlockId, EntryHeader};
use crate::index::LogIndex;
use crate::recover::ensure_index;
use crate::view::{LogData, OpenMode};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Soft cap on concurrently open retained segments.
const MAX_OPEN_SEGMENTS: usize = 8;

/// Zero-pad width for block numbers in segment file names.
const BLOCK_NUM_WIDTH: usize = 8;

/// One retained segment: paths plus the inclusive block range from its name.
#[derive(Debug, Clone)]
pub struct Segment {
    /// First block stored in the segment.
    pub first_block: u32,
    /// Last block stored in the segment (inclusive).
    pub last_block: u32,
    /// Path of the `.log` file.
    pub log_path: PathBuf,
    /// Path of the `.index` file.
    pub index_path: PathBuf,
}

struct OpenSegment {
    data: LogData,
    index: LogIndex,
}

/// Ordered collection of retained segments with block-number routing.
pub struct Catalog {
    name: String,
    segments: Vec<Segment>,
    open: LruCache<u32, OpenSegment>,
}

/// Compose a retained segment file name.
pub(crate) fn segment_file_name(name: &str, lo: u32, hi: u32, ext: &str) -> String {
    format!("{name}-{lo:0w$}-{hi:0w$}.{ext}", w = BLOCK_NUM_WIDTH)
}

/// Parse `<name>-<lo>-<hi>.log` into its inclusive block range.
fn parse_segment_file_name(name: &str, file_name: &str) -> Option<(u32, u32)> {
    let rest = file_name.strip_prefix(name)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".log")?;
    let (lo, hi) = rest.split_once('-')?;
    Some((lo.parse().ok()?, hi.parse().ok()?))
}

impl Catalog {
    /// Discover retained segments of `name` under `retained_dir`.
    ///
    /// Overlapping or non-contiguous ranges fail the open: retention only ever
    /// removes the oldest segment, so holes mean external tampering.
    pub fn open(retained_dir: &Path, name: &str) -> ShipLogResult<Self> {
        let mut segments = Vec::new();
        if retained_dir.exists() {
            for dirent in std::fs::read_dir(retained_dir)? {
                let dirent = dirent?;
                let file_name = dirent.file_name();
                let Some(file_name) = file_name.to_str() else {
                    continue;
                };
                let Some((lo, hi)) = parse_segment_file_name(name, file_name) else {
                    continue;
                };
                if lo > hi || (lo == 0 && hi == 0) {
                    warn!(file = file_name, "ignoring segment with bad range");
                    continue;
                }
                segments.push(Segment {
                    first_block: lo,
                    last_block: hi,
                    log_path: dirent.path(),
                    index_path: retained_dir.join(segment_file_name(name, lo, hi, "index")),
                });
            }
        }
        segments.sort_by_key(|s| s.first_block);
        for pair in segments.windows(2) {
            if pair[1].first_block != pair[0].last_block + 1 {
                return Err(ShipLogError::CorruptLog(format!(
                    "retained segments not contiguous: [{}, {}] then [{}, {}]",
                    pair[0].first_block, pair[0].last_block,
                    pair[1].first_block, pair[1].last_block
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            segments,
            open: LruCache::new(NonZeroUsize::new(MAX_OPEN_SEGMENTS).expect("cap is non-zero")),
        })
    }

    /// Whether the catalog holds no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Number of retained segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Smallest block covered, or 0 when empty.
    pub fn first_block_num(&self) -> u32 {
        self.segments.first().map_or(0, |s| s.first_block)
    }

    /// Largest block covered, or 0 when empty.
    pub fn last_block_num(&self) -> u32 {
        self.segments.last().map_or(0, |s| s.last_block)
    }

    /// Whether some retained segment stores `block_num`.
    pub fn contains(&self, block_num: u32) -> bool {
        !self.is_empty()
            && block_num >= self.first_block_num()
            && block_num <= self.last_block_num()
    }

    fn find(&self, block_num: u32) -> Option<usize> {
        self.segments
            .binary_search_by(|s| {
                if block_num < s.first_block {
                    std::cmp::Ordering::Greater
                } else if block_num > s.last_block {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .ok()
    }

    fn open_segment(&mut self, idx: usize) -> ShipLogResult<&OpenSegment> {
        let seg = self.segments[idx].clone();
        if !self.open.contains(&seg.first_block) {
            let data = LogData::open(&seg.log_path, OpenMode::ReadOnly)?;
            // The index is derived state; recreate it if someone deleted it.
            let last_pos = data.trailing_position()?;
            ensure_index(
                &data,
                &seg.index_path,
                seg.first_block,
                seg.last_block + 1,
                last_pos,
                None,
            )?;
            let index = LogIndex::open_readonly(&seg.index_path, seg.first_block)?;
            self.open.put(seg.first_block, OpenSegment { data, index });
        }
        Ok(self
            .open
            .get(&seg.first_block)
            .expect("segment opened above"))
    }

    /// Id of `block_num`, or `None` when no segment covers it.
    pub fn get_block_id(&mut self, block_num: u32) -> ShipLogResult<Option<BlockId>> {
        let Some(idx) = self.find(block_num) else {
            return Ok(None);
        };
        let seg = self.open_segment(idx)?;
        let pos = seg.index.position_of(block_num)?;
        Ok(Some(seg.data.block_id_at(pos)?))
    }

    /// Header of `block_num`'s entry, or `None` when no segment covers it.
    pub fn get_entry_header(&mut self, block_num: u32) -> ShipLogResult<Option<EntryHeader>> {
        let Some(idx) = self.find(block_num) else {
            return Ok(None);
        };
        let seg = self.open_segment(idx)?;
        let pos = seg.index.position_of(block_num)?;
        Ok(Some(seg.data.header_at(pos, true)?))
    }

    /// Payload and version of `block_num`'s entry, or `None` when not covered.
    pub fn read_entry(&mut self, block_num: u32) -> ShipLogResult<Option<(Vec<u8>, u32)>> {
        let Some(idx) = self.find(block_num) else {
            return Ok(None);
        };
        let seg = self.open_segment(idx)?;
        let pos = seg.index.position_of(block_num)?;
        Ok(Some(seg.data.read_payload(pos)?))
    }

    /// Rewrite `block_num`'s payload in place via `f(version, payload)`.
    ///
    /// Returns the new payload bytes, or `None` when no segment covers the
    /// block. The rewrite goes through a fresh read-write view; cached
    /// read-only handles stay untouched.
    pub fn modify_entry<F>(&mut self, block_num: u32, f: F) -> ShipLogResult<Option<Vec<u8>>>
    where
        F: FnOnce(u32, &mut [u8]) -> ShipLogResult<()>,
    {
        let Some(idx) = self.find(block_num) else {
            return Ok(None);
        };
        let seg = self.open_segment(idx)?;
        let pos = seg.index.position_of(block_num)?;
        let log_path = self.segments[idx].log_path.clone();

        let rw = LogData::open(&log_path, OpenMode::ReadWrite)?;
        let (mut payload, version) = rw.read_payload(pos)?;
        f(version, &mut payload)?;
        rw.write_payload_at(pos, &payload)?;
        Ok(Some(payload))
    }

    /// Register the segment finalized by a split. Called with the files
    /// already renamed into place.
    pub fn add_segment(
        &mut self,
        log_path: PathBuf,
        index_path: PathBuf,
        lo: u32,
        hi: u32,
    ) -> ShipLogResult<()> {
        if let Some(last) = self.segments.last() {
            if lo != last.last_block + 1 {
                return Err(ShipLogError::InvalidState(format!(
                    "segment [{lo}, {hi}] does not extend catalog ending at {}",
                    last.last_block
                )));
            }
        }
        self.segments.push(Segment {
            first_block: lo,
            last_block: hi,
            log_path,
            index_path,
        });
        Ok(())
    }

    /// Trim the catalog to at most `max_retained_files` segments.
    ///
    /// The oldest segment is moved to `archive_dir` when one is configured
    /// (rename where possible, copy+delete across filesystems), deleted
    /// otherwise.
    pub fn enforce_retention(
        &mut self,
        max_retained_files: u32,
        archive_dir: Option<&Path>,
    ) -> ShipLogResult<()> {
        while self.segments.len() > max_retained_files as usize {
            let seg = self.segments.remove(0);
            self.open.pop(&seg.first_block);
            match archive_dir {
                Some(dir) => {
                    std::fs::create_dir_all(dir)?;
                    let log_to =
                        dir.join(segment_file_name(&self.name, seg.first_block, seg.last_block, "log"));
                    let index_to =
                        dir.join(segment_file_name(&self.name, seg.first_block, seg.last_block, "index"));
                    move_file(&seg.log_path, &log_to)?;
                    if seg.index_path.exists() {
                        move_file(&seg.index_path, &index_to)?;
                    }
                    info!(
                        first_block = seg.first_block,
                        last_block = seg.last_block,
                        archive = %dir.display(),
                        "archived retained segment"
                    );
                }
                None => {
                    std::fs::remove_file(&seg.log_path)?;
                    if seg.index_path.exists() {
                        std::fs::remove_file(&seg.index_path)?;
                    }
                    info!(
                        first_block = seg.first_block,
                        last_block = seg.last_block,
                        "deleted retained segment"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Rename `from` to `to`, falling back to copy+delete when rename fails
/// (e.g. across filesystems).
pub(crate) fn move_file(from: &Path, to: &Path) -> ShipLogResult<()> {
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}
