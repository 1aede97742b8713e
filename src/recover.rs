//! Open-time recovery: validate the tail, repair torn writes, rebuild the index.
//!
//! ## Recovery posture
//!
//! A log that merely *ends early* (torn header, torn payload, or a trailing
//! position word clipped by a crash) is repaired by truncating back to the
//! last entry boundary, with a warning. A log whose interior framing is wrong
//! (bad magic where a complete magic exists, misplaced trailing word mid-file,
//! non-contiguous block numbers) fails the open with `CorruptLog`.
//!
//! Entries are written sequentially, so a complete-but-invalid magic can never
//! be the residue of a torn write; it is always corruption.
//!
//! Recovery is idempotent: re-running on a repaired log takes the fast path
//! and rewrites nothing.

use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::{is_ship, is_supported_version, HEADER_SIZE, POS_SIZE};
use crate::index::LogIndex;
use crate::view::{LogData, OpenMode};
use std::fs::OpenOptions;
use std::path::Path;
use tracing::{debug, warn};

/// State of the active segment after recovery.
pub(crate) struct ActiveLogState {
    /// Block number of the first entry.
    pub begin_block: u32,
    /// One past the last stored block.
    pub end_block: u32,
    /// Format version probed from the first entry.
    pub version: u32,
    /// Id of the last stored block.
    pub last_block_id: crate::formats::BlockId,
    /// Valid byte length of the log file (== file size after repair).
    pub size: u64,
}

/// Result of a forward scan over a log file.
pub(crate) struct ScanOutcome {
    /// Start offset of every valid entry, in order.
    pub positions: Vec<u64>,
    /// Byte length of the valid prefix.
    pub valid_len: u64,
}

/// Forward-scan `view` from offset 0, validating each entry's framing.
///
/// With `allow_torn_tail`, a tail that ends early terminates the scan at the
/// last good boundary; without it, any early end is `CorruptLog`.
pub(crate) fn scan_log(
    view: &LogData,
    size: u64,
    allow_torn_tail: bool,
) -> ShipLogResult<ScanOutcome> {
    let mut positions = Vec::new();
    let mut pos = 0u64;
    let mut prev_block: Option<u32> = None;

    while pos < size {
        let remaining = size - pos;
        if remaining < HEADER_SIZE + POS_SIZE {
            // Sequential writes: fewer bytes than a minimal entry is a torn tail.
            return torn_or_corrupt(positions, pos, allow_torn_tail);
        }
        let header = view.header_at(pos, false)?;
        if !is_ship(header.magic) {
            return Err(ShipLogError::CorruptLog(format!(
                "invalid entry magic {:#018x} at offset {pos}",
                header.magic
            )));
        }
        if !is_supported_version(header.magic) {
            return Err(ShipLogError::UnsupportedVersion {
                version: crate::formats::ship_version(header.magic),
                max: crate::formats::LOG_VERSION,
            });
        }
        let block_num = header.block_num();
        if let Some(prev) = prev_block {
            if block_num != prev.wrapping_add(1) {
                return Err(ShipLogError::CorruptLog(format!(
                    "block numbers not contiguous at offset {pos} (prev {prev}, got {block_num})"
                )));
            }
        }
        // Checked: a garbage payload_size must not wrap into a "valid" end.
        let entry_end = (pos + HEADER_SIZE)
            .checked_add(header.payload_size)
            .and_then(|v| v.checked_add(POS_SIZE));
        let entry_end = match entry_end {
            Some(end) if end <= size => end,
            _ => return torn_or_corrupt(positions, pos, allow_torn_tail),
        };
        // The trailing word must point back at this entry's first byte.
        let stored = view.position_word_at(entry_end - POS_SIZE)?;
        if stored != pos {
            if entry_end == size {
                // Final entry with a clipped/garbled back-pointer: torn tail.
                return torn_or_corrupt(positions, pos, allow_torn_tail);
            }
            return Err(ShipLogError::CorruptLog(format!(
                "entry at offset {pos} has trailing position {stored}"
            )));
        }
        positions.push(pos);
        prev_block = Some(block_num);
        pos = entry_end;
    }

    Ok(ScanOutcome {
        positions,
        valid_len: pos,
    })
}

fn torn_or_corrupt(
    positions: Vec<u64>,
    pos: u64,
    allow_torn_tail: bool,
) -> ShipLogResult<ScanOutcome> {
    if allow_torn_tail {
        Ok(ScanOutcome {
            positions,
            valid_len: pos,
        })
    } else {
        Err(ShipLogError::CorruptLog(format!(
            "torn entry at offset {pos}"
        )))
    }
}

/// Fast tail validation via the trailing position word.
///
/// Returns the final entry's start offset when the word checks out, `None`
/// when the log needs a full scan.
fn fast_tail(view: &LogData, size: u64) -> ShipLogResult<Option<u64>> {
    let candidate = view.trailing_position()?;
    match candidate.checked_add(HEADER_SIZE) {
        Some(header_end) if header_end <= size - POS_SIZE => {}
        _ => return Ok(None),
    }
    let header = match view.header_at(candidate, false) {
        Ok(h) => h,
        Err(_) => return Ok(None),
    };
    if !is_ship(header.magic) || !is_supported_version(header.magic) {
        return Ok(None);
    }
    let entry_end = (candidate + HEADER_SIZE)
        .checked_add(header.payload_size)
        .and_then(|v| v.checked_add(POS_SIZE));
    if entry_end != Some(size) {
        return Ok(None);
    }
    Ok(Some(candidate))
}

/// Recover the active segment at `log_path` / `index_path`.
///
/// Repairs a torn tail by truncating the log (and the index) back to the last
/// good entry boundary, rebuilds the index when it is missing or inconsistent,
/// and returns the recovered block range. `Ok(None)` means the log is empty
/// (possibly after discarding an unreadable remnant shorter than one entry).
pub(crate) fn recover_active(
    log_path: &Path,
    index_path: &Path,
) -> ShipLogResult<Option<ActiveLogState>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(log_path)?;
    let size = file.metadata()?.len();
    if size == 0 {
        // A crash between segment-rotation renames can leave a stale index
        // beside an empty log; the index is derived state, drop it.
        if index_path.exists() {
            OpenOptions::new().write(true).open(index_path)?.set_len(0)?;
        }
        return Ok(None);
    }
    if size < HEADER_SIZE + POS_SIZE {
        warn!(
            log = %log_path.display(),
            size,
            "log shorter than one entry; treating as empty"
        );
        file.set_len(0)?;
        if index_path.exists() {
            OpenOptions::new().write(true).open(index_path)?.set_len(0)?;
        }
        return Ok(None);
    }

    let view = LogData::open(log_path, OpenMode::ReadOnly)?;

    let (last_pos, positions, size) = match fast_tail(&view, size)? {
        Some(last_pos) => (last_pos, None, size),
        None => {
            let outcome = scan_log(&view, size, true)?;
            if outcome.valid_len < size {
                warn!(
                    log = %log_path.display(),
                    valid_len = outcome.valid_len,
                    size,
                    "torn tail detected; truncating log"
                );
                file.set_len(outcome.valid_len)?;
                file.sync_data()?;
            }
            match outcome.positions.last().copied() {
                Some(last_pos) => (last_pos, Some(outcome.positions), outcome.valid_len),
                None => {
                    // Nothing valid survived; the whole file was one torn write.
                    if index_path.exists() {
                        OpenOptions::new().write(true).open(index_path)?.set_len(0)?;
                    }
                    return Ok(None);
                }
            }
        }
    };

    let begin_block = view.first_block_num()?;
    let end_block = view.block_num_at(last_pos)? + 1;
    let version = view.version()?;
    let last_block_id = view.block_id_at(last_pos)?;

    ensure_index(&view, index_path, begin_block, end_block, last_pos, positions)?;

    debug!(
        log = %log_path.display(),
        begin_block,
        end_block,
        version,
        "active log recovered"
    );

    Ok(Some(ActiveLogState {
        begin_block,
        end_block,
        version,
        last_block_id,
        size,
    }))
}

/// Validate the index against the log; rebuild it from a scan on mismatch.
///
/// `positions` may carry offsets from an earlier scan to avoid re-reading the
/// log. Cheap validation: slot count matches the block range, the first slot
/// is 0, and the last slot names the final entry's offset.
pub(crate) fn ensure_index(
    view: &LogData,
    index_path: &Path,
    begin_block: u32,
    end_block: u32,
    last_pos: u64,
    positions: Option<Vec<u64>>,
) -> ShipLogResult<()> {
    let expected = u64::from(end_block - begin_block);
    if index_path.exists() {
        let index = LogIndex::open_readonly(index_path, begin_block)?;
        if index.num_blocks()? == expected
            && index.position_of(begin_block)? == 0
            && index.position_of(end_block - 1)? == last_pos
        {
            return Ok(());
        }
        warn!(
            index = %index_path.display(),
            "index inconsistent with log; rebuilding"
        );
    } else {
        warn!(index = %index_path.display(), "index missing; rebuilding");
    }

    let positions = match positions {
        Some(p) => p,
        None => scan_log(view, view.size()?, false)?.positions,
    };
    let mut index = LogIndex::open(index_path, begin_block)?;
    index.clear()?;
    for pos in positions {
        index.append(pos)?;
    }
    index.sync()?;
    Ok(())
}
