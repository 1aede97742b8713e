//! Log coordinator: the public façade over one state history log.
//!
//! A [`ShipLog`] spans the active `.log`/`.index` pair plus the catalog of
//! retained segments, and funnels every mutation through the dedicated writer
//! thread. Readers take the mutex for the duration of one entry read; the
//! writer takes it only for range updates and file-shape changes, so readers
//! never observe a half-truncated or half-rotated file.
//!
//! ## Visibility contract
//!
//! `store_entry` returns after enqueueing; a read issued afterwards is not
//! guaranteed to observe the entry until `begin_end_block_nums` reports it
//! (or the log is stopped). Recently appended payloads are served from an
//! in-memory buffer so fetches overlapping the write cursor do not contend
//! with the writer on disk.

use crate::catalog::Catalog;
use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::{BlockId, EntryHeader, LOG_VERSION};
use crate::index::LogIndex;
use crate::recover::recover_active;
use crate::view::{LogData, OpenMode};
use crate::writer::{LogWriter, WriteJob, WriteQueue};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

/// Number of recently appended payloads kept in memory, keyed by block
/// number. Two entries cover the window between submission and commit at
/// block-production cadence; this is a fixed property of the log, not
/// configuration.
pub const NUM_BUFFERED_ENTRIES: usize = 2;

/// Configuration for one state history log.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of the active `.log`/`.index` pair.
    pub log_dir: PathBuf,
    /// Directory of retained segments; defaults to `log_dir`.
    pub retained_dir: Option<PathBuf>,
    /// Destination for segments retired by retention; `None` deletes them.
    pub archive_dir: Option<PathBuf>,
    /// Blocks per segment before rotation; `None` never splits.
    pub stride: Option<u32>,
    /// Cap on the number of retained segments.
    pub max_retained_files: u32,
}

impl Config {
    /// Configuration with defaults: no rotation, ten retained segments,
    /// retained segments beside the active pair, retired segments deleted.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            retained_dir: None,
            archive_dir: None,
            stride: None,
            max_retained_files: 10,
        }
    }
}

/// Identity of the block being stored: its id and its parent's id.
#[derive(Debug, Clone, Copy)]
pub struct BlockInfo {
    /// Id of the block.
    pub id: BlockId,
    /// Id of the parent block.
    pub prev_id: BlockId,
}

impl BlockInfo {
    /// The block number carried by `id`.
    pub fn block_num(&self) -> u32 {
        self.id.block_num()
    }
}

/// Reader-visible state, guarded by the coordinator mutex.
pub(crate) struct Shared {
    /// First block of the active segment.
    pub(crate) active_first: u32,
    /// One past the last committed block.
    pub(crate) end_block: u32,
    /// Format version of the active log.
    pub(crate) version: u32,
    /// Most recently appended payloads, newest-`NUM_BUFFERED_ENTRIES` only.
    pub(crate) buffered: BTreeMap<u32, Arc<Vec<u8>>>,
    /// Retained segments.
    pub(crate) catalog: Catalog,
    /// Read view of the active log.
    pub(crate) read_log: LogData,
    /// Read handle of the active index.
    pub(crate) index: LogIndex,
}

/// Lock the shared state, mapping a poisoned mutex to an error instead of
/// propagating the panic.
pub(crate) fn lock_shared(shared: &Mutex<Shared>) -> ShipLogResult<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| ShipLogError::InvalidState("state history lock poisoned".into()))
}

/// A durable, append-only, per-block log with random access by block number.
pub struct ShipLog {
    name: String,
    shared: Arc<Mutex<Shared>>,
    queue: WriteQueue,
}

impl std::fmt::Debug for ShipLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShipLog").field("name", &self.name).finish_non_exhaustive()
    }
}

impl ShipLog {
    /// Open (creating or recovering) the log `<name>.log` under the
    /// configured directories and start its writer.
    ///
    /// Refuses to open when the recovered active segment is already longer
    /// than `stride`: rotation boundaries are fixed at write time, so a
    /// stride lowered between runs cannot be applied retroactively.
    pub fn new(name: &str, config: &Config) -> ShipLogResult<Self> {
        std::fs::create_dir_all(&config.log_dir)?;
        let retained_dir = config
            .retained_dir
            .clone()
            .unwrap_or_else(|| config.log_dir.clone());
        std::fs::create_dir_all(&retained_dir)?;

        let catalog = Catalog::open(&retained_dir, name)?;
        let log_path = config.log_dir.join(format!("{name}.log"));
        let index_path = config.log_dir.join(format!("{name}.index"));

        let recovered = recover_active(&log_path, &index_path)?;
        let (active_first, end_block, version, last_block_id) = match &recovered {
            Some(state) => {
                if !catalog.is_empty() && state.begin_block != catalog.last_block_num() + 1 {
                    return Err(ShipLogError::CorruptLog(format!(
                        "active log starts at {} but retained segments end at {}",
                        state.begin_block,
                        catalog.last_block_num()
                    )));
                }
                (
                    state.begin_block,
                    state.end_block,
                    state.version,
                    Some(state.last_block_id),
                )
            }
            None => {
                let next = if catalog.is_empty() {
                    0
                } else {
                    catalog.last_block_num() + 1
                };
                (next, next, LOG_VERSION, None)
            }
        };

        if let Some(stride) = config.stride {
            let active_len = end_block - active_first;
            if active_len > stride {
                error!(
                    name,
                    stride, active_len, "active segment longer than stride; refusing to open"
                );
                return Err(ShipLogError::InvalidConfig(format!(
                    "stride {stride} is below the {active_len} blocks already in the active segment"
                )));
            }
        }

        // The writer's append handle plus a separate read handle per file.
        let writer_index = LogIndex::open(&index_path, active_first)?;
        let write_log = OpenOptions::new().read(true).write(true).open(&log_path)?;
        let end_pos = recovered.as_ref().map_or(0, |state| state.size);
        let read_log = LogData::open(&log_path, OpenMode::ReadOnly)?;
        let shared_index = LogIndex::open_readonly(&index_path, active_first)?;

        let shared = Arc::new(Mutex::new(Shared {
            active_first,
            end_block,
            version,
            buffered: BTreeMap::new(),
            catalog,
            read_log,
            index: shared_index,
        }));

        let writer = LogWriter {
            name: name.to_string(),
            log_dir: config.log_dir.clone(),
            retained_dir,
            archive_dir: config.archive_dir.clone(),
            stride: config.stride,
            max_retained_files: config.max_retained_files,
            version,
            write_log,
            index: writer_index,
            end_pos,
            active_first,
            end_block,
            last_block_id,
            shared: shared.clone(),
        };
        let queue = WriteQueue::spawn(writer)?;

        info!(
            name,
            begin = active_first,
            end = end_block,
            "state history log opened"
        );
        Ok(Self {
            name: name.to_string(),
            shared,
            queue,
        })
    }

    /// Name of this log (its file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Half-open `[begin, end)` range of stored blocks, spanning retained
    /// segments and the active one.
    pub fn begin_end_block_nums(&self) -> (u32, u32) {
        match self.shared.lock() {
            Ok(shared) => {
                let begin = if shared.catalog.is_empty() {
                    shared.active_first
                } else {
                    shared.catalog.first_block_num()
                };
                (begin, shared.end_block)
            }
            Err(_) => (0, 0),
        }
    }

    /// Id of `block_num`, consulting retained segments first, or `None` when
    /// the block is not stored.
    pub fn get_block_id(&self, block_num: u32) -> ShipLogResult<Option<BlockId>> {
        self.queue.check_fault()?;
        let mut shared = lock_shared(&self.shared)?;
        if let Some(id) = shared.catalog.get_block_id(block_num)? {
            return Ok(Some(id));
        }
        if block_num >= shared.active_first && block_num < shared.end_block {
            let pos = shared.index.position_of(block_num)?;
            return Ok(Some(shared.read_log.block_id_at(pos)?));
        }
        Ok(None)
    }

    /// Header of `block_num`'s entry, or `None` when the block is not stored.
    pub fn get_entry_header(&self, block_num: u32) -> ShipLogResult<Option<EntryHeader>> {
        self.queue.check_fault()?;
        let mut shared = lock_shared(&self.shared)?;
        if let Some(header) = shared.catalog.get_entry_header(block_num)? {
            return Ok(Some(header));
        }
        if block_num >= shared.active_first && block_num < shared.end_block {
            let pos = shared.index.position_of(block_num)?;
            return Ok(Some(shared.read_log.header_at(pos, true)?));
        }
        Ok(None)
    }

    /// Payload bytes and format version of `block_num`'s entry.
    ///
    /// Served from the in-memory buffer when the block was appended within
    /// the last [`NUM_BUFFERED_ENTRIES`] stores, else from the covering
    /// retained segment, else from the active log.
    pub fn read_entry(&self, block_num: u32) -> ShipLogResult<(Vec<u8>, u32)> {
        self.queue.check_fault()?;
        let mut shared = lock_shared(&self.shared)?;
        if let Some(payload) = shared.buffered.get(&block_num) {
            let payload = payload.as_ref().clone();
            let version = shared.version;
            return Ok((payload, version));
        }
        if let Some(entry) = shared.catalog.read_entry(block_num)? {
            return Ok(entry);
        }
        if block_num >= shared.active_first && block_num < shared.end_block {
            let pos = shared.index.position_of(block_num)?;
            return Ok(shared.read_log.read_payload(pos)?);
        }
        Err(self.out_of_range(&shared, block_num))
    }

    /// Queue `payload` as the entry for block `id`, claiming `prev_id` as its
    /// parent. Returns immediately; the write is asynchronous.
    ///
    /// The writer commits in submission order, rewinding the active log when
    /// `id` re-occupies an already-stored block number with a matching parent
    /// link. A parent mismatch faults the writer; the fault is latched and
    /// later operations refuse.
    pub fn store_entry(&self, id: BlockId, prev_id: BlockId, payload: Vec<u8>) -> ShipLogResult<()> {
        self.queue.check_fault()?;
        let payload = Arc::new(payload);
        let block_num = id.block_num();
        {
            let mut shared = lock_shared(&self.shared)?;
            shared.buffered.insert(block_num, payload.clone());
        }
        let submitted = self.queue.submit(WriteJob {
            id,
            prev_id,
            payload,
        });
        if submitted.is_err() {
            if let Ok(mut shared) = self.shared.lock() {
                shared.buffered.remove(&block_num);
            }
        }
        submitted
    }

    /// Rewrite `block_num`'s payload in place via `f(version, payload)`.
    ///
    /// The transform borrows a fixed-length mutable window; offsets and the
    /// index stay valid because the payload's byte length cannot change.
    pub fn modify_entry<F>(&self, block_num: u32, f: F) -> ShipLogResult<()>
    where
        F: FnOnce(u32, &mut [u8]) -> ShipLogResult<()>,
    {
        self.queue.check_fault()?;
        let mut shared = lock_shared(&self.shared)?;

        let new_payload = if shared.catalog.contains(block_num) {
            shared
                .catalog
                .modify_entry(block_num, f)?
                .ok_or_else(|| {
                    ShipLogError::InvalidState(format!(
                        "catalog claimed block {block_num} but did not store it"
                    ))
                })?
        } else if block_num >= shared.active_first && block_num < shared.end_block {
            let pos = shared.index.position_of(block_num)?;
            let rw = LogData::open(shared.read_log.path(), OpenMode::ReadWrite)?;
            let (mut payload, version) = rw.read_payload(pos)?;
            f(version, &mut payload)?;
            rw.write_payload_at(pos, &payload)?;
            payload
        } else {
            return Err(self.out_of_range(&shared, block_num));
        };

        // Keep any buffered copy coherent with the on-disk bytes.
        if shared.buffered.contains_key(&block_num) {
            shared.buffered.insert(block_num, Arc::new(new_payload));
        }
        Ok(())
    }

    /// Drain queued writes, then join the writer thread. Idempotent.
    pub fn stop(&mut self) {
        self.queue.stop();
    }

    /// Discard queued writes, then join the writer thread. Idempotent.
    pub fn light_stop(&mut self) {
        self.queue.light_stop();
    }

    fn out_of_range(&self, shared: &Shared, block_num: u32) -> ShipLogError {
        let begin = if shared.catalog.is_empty() {
            shared.active_first
        } else {
            shared.catalog.first_block_num()
        };
        ShipLogError::OutOfRange {
            block_num,
            begin,
            end: shared.end_block,
        }
    }
}

impl Drop for ShipLog {
    fn drop(&mut self) {
        self.stop();
    }
}
