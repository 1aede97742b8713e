//! Single-consumer write pipeline.
//!
//! All mutations of the active segment happen on one dedicated thread fed by
//! a channel of [`WriteJob`]s; callers never touch the write handles. Jobs
//! commit strictly in submission order. A failed write latches into a
//! process-visible fault slot and every later job is dropped; synchronous
//! operations observe the fault and refuse.
//!
//! File-shape changes (fork rewind truncation, segment rotation) run under
//! the shared mutex so readers never observe a half-moved file. Plain appends
//! stay off the lock except for the final range update.

use crate::catalog::{move_file, segment_file_name};
use crate::error::{ShipLogError, ShipLogResult};
use crate::formats::{BlockId, EntryHeader, BLOCK_ID_OFFSET, POS_SIZE};
use crate::index::LogIndex;
use crate::log::{lock_shared, Shared, NUM_BUFFERED_ENTRIES};
use crate::view::{LogData, OpenMode};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// One queued append.
pub(crate) struct WriteJob {
    /// Id of the block being appended.
    pub id: BlockId,
    /// Id the caller believes is stored for the preceding block.
    pub prev_id: BlockId,
    /// Owned payload bytes, shared with the buffered-entry map.
    pub payload: Arc<Vec<u8>>,
}

/// Latched writer fault, visible to every caller.
#[derive(Default)]
pub(crate) struct WriterFault {
    failed: AtomicBool,
    message: Mutex<Option<String>>,
}

impl WriterFault {
    pub(crate) fn latch(&self, err: &ShipLogError) {
        if let Ok(mut slot) = self.message.lock() {
            slot.get_or_insert_with(|| err.to_string());
        }
        self.failed.store(true, Ordering::Release);
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn check(&self) -> ShipLogResult<()> {
        if !self.is_failed() {
            return Ok(());
        }
        let message = self
            .message
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
            .unwrap_or_else(|| "unknown writer fault".to_string());
        Err(ShipLogError::WriterFailed(message))
    }
}

/// Handle to the writer thread: submission side plus shutdown.
pub(crate) struct WriteQueue {
    tx: Option<Sender<WriteJob>>,
    thread: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    fault: Arc<WriterFault>,
}

impl WriteQueue {
    /// Spawn the dedicated writer thread around `writer`.
    pub(crate) fn spawn(mut writer: LogWriter) -> ShipLogResult<Self> {
        let (tx, rx) = mpsc::channel::<WriteJob>();
        let cancel = Arc::new(AtomicBool::new(false));
        let fault = Arc::new(WriterFault::default());

        let thread_cancel = cancel.clone();
        let thread_fault = fault.clone();
        let name = format!("{}-writer", writer.name);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    if thread_cancel.load(Ordering::Relaxed) {
                        continue;
                    }
                    if thread_fault.is_failed() {
                        continue;
                    }
                    let block_num = job.id.block_num();
                    if let Err(e) = writer.write_entry(&job) {
                        error!(block_num, error = %e, "write failed; latching fault");
                        writer.discard_buffered(block_num);
                        thread_fault.latch(&e);
                    }
                }
                writer.finish();
            })
            .map_err(ShipLogError::Io)?;

        Ok(Self {
            tx: Some(tx),
            thread: Some(thread),
            cancel,
            fault,
        })
    }

    /// Refuse when a writer fault is latched.
    pub(crate) fn check_fault(&self) -> ShipLogResult<()> {
        self.fault.check()
    }

    /// Enqueue a job; returns immediately.
    pub(crate) fn submit(&self, job: WriteJob) -> ShipLogResult<()> {
        self.fault.check()?;
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ShipLogError::InvalidState("log is stopped".into()))?;
        tx.send(job)
            .map_err(|_| ShipLogError::InvalidState("writer thread is gone".into()))
    }

    /// Drain outstanding work, then join the writer thread.
    pub(crate) fn stop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Discard pending work, then join the writer thread.
    pub(crate) fn light_stop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.stop();
    }
}

/// Writer-thread-owned state of the active segment.
pub(crate) struct LogWriter {
    pub(crate) name: String,
    pub(crate) log_dir: PathBuf,
    pub(crate) retained_dir: PathBuf,
    pub(crate) archive_dir: Option<PathBuf>,
    pub(crate) stride: Option<u32>,
    pub(crate) max_retained_files: u32,
    pub(crate) version: u32,
    pub(crate) write_log: File,
    pub(crate) index: LogIndex,
    /// Byte length of the active log (== next entry's start offset).
    pub(crate) end_pos: u64,
    /// First block of the active segment.
    pub(crate) active_first: u32,
    /// One past the last committed block.
    pub(crate) end_block: u32,
    pub(crate) last_block_id: Option<BlockId>,
    pub(crate) shared: Arc<Mutex<Shared>>,
}

impl LogWriter {
    fn active_log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.name))
    }

    fn active_index_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.index", self.name))
    }

    fn active_is_empty(&self) -> bool {
        self.end_block == self.active_first
    }

    fn read_block_id_at(&self, pos: u64) -> ShipLogResult<BlockId> {
        let mut f = &self.write_log;
        f.seek(SeekFrom::Start(pos + BLOCK_ID_OFFSET))?;
        let mut id = [0u8; 32];
        f.read_exact(&mut id)?;
        Ok(BlockId::new(id))
    }

    /// Commit one append: verify the parent link, rewind on fork, rotate at
    /// the stride boundary, write the entry, publish the new range.
    ///
    /// Verification precedes truncation, so a job whose parent link matches
    /// nothing faults the writer without disturbing stored entries.
    pub(crate) fn write_entry(&mut self, job: &WriteJob) -> ShipLogResult<()> {
        let block_num = job.id.block_num();
        let mut rewound = false;

        if !self.active_is_empty() {
            if block_num > self.end_block {
                return Err(ShipLogError::InvalidState(format!(
                    "append of block {block_num} leaves a gap (expected {})",
                    self.end_block
                )));
            }
        } else if self.active_first != 0 && block_num != self.active_first {
            if block_num > self.active_first {
                return Err(ShipLogError::InvalidState(format!(
                    "append of block {block_num} leaves a gap (expected {})",
                    self.active_first
                )));
            }
            // Rewinding past an empty active segment reaches retained history.
            return Err(ShipLogError::InvalidState(format!(
                "cannot rewind to block {block_num}: earlier blocks are retained"
            )));
        }

        self.verify_parent(block_num, &job.prev_id)?;

        if !self.active_is_empty() && block_num < self.end_block {
            self.rewind_to(block_num)?;
            rewound = true;
        }

        if let Some(stride) = self.stride {
            if !self.active_is_empty() && block_num - self.active_first >= stride {
                self.split()?;
            }
        }

        let pos = self.end_pos;
        let header = EntryHeader::new(self.version, job.id, job.payload.len() as u64);
        let mut buf =
            Vec::with_capacity((EntryHeader::SERIAL_SIZE + POS_SIZE) as usize + job.payload.len());
        header.write(&mut buf)?;
        buf.extend_from_slice(&job.payload);
        buf.write_u64::<LittleEndian>(pos)?;

        let mut f = &self.write_log;
        f.seek(SeekFrom::Start(pos))?;
        f.write_all(&buf)?;
        f.flush()?;
        self.index.append(pos)?;

        if self.active_is_empty() {
            self.active_first = block_num;
            self.index.set_first_block_num(block_num);
        }
        self.end_pos = pos + buf.len() as u64;
        self.end_block = block_num + 1;
        self.last_block_id = Some(job.id);

        let mut shared = lock_shared(&self.shared)?;
        shared.active_first = self.active_first;
        shared.end_block = self.end_block;
        shared.index.set_first_block_num(self.active_first);
        if rewound {
            shared.buffered.retain(|k, _| *k <= block_num);
        }
        while shared.buffered.len() > NUM_BUFFERED_ENTRIES {
            shared.buffered.pop_first();
        }
        Ok(())
    }

    /// Truncate the active log, its index, and the committed range back to
    /// just before `block_num`.
    fn rewind_to(&mut self, block_num: u32) -> ShipLogResult<()> {
        if block_num <= self.active_first {
            // Fork point at or below the active segment start: the whole
            // active log goes.
            let mut shared = lock_shared(&self.shared)?;
            if !shared.catalog.is_empty() && block_num <= shared.catalog.last_block_num() {
                return Err(ShipLogError::InvalidState(format!(
                    "cannot rewind to block {block_num}: blocks through {} are retained",
                    shared.catalog.last_block_num()
                )));
            }
            warn!(
                name = self.name.as_str(),
                block_num, "fork rewind resets the active log"
            );
            self.write_log.set_len(0)?;
            self.index.clear()?;
            self.index.set_first_block_num(block_num);
            self.end_pos = 0;
            self.active_first = block_num;
            self.end_block = block_num;
            self.last_block_id = None;
            shared.active_first = block_num;
            shared.end_block = block_num;
            shared.index.set_first_block_num(block_num);
            return Ok(());
        }

        let pos = self.index.position_of(block_num)?;
        let prev_pos = self.index.position_of(block_num - 1)?;
        let prev_id = self.read_block_id_at(prev_pos)?;
        warn!(
            name = self.name.as_str(),
            block_num,
            truncate_to = pos,
            "fork rewind truncates the active log"
        );

        let mut shared = lock_shared(&self.shared)?;
        self.write_log.set_len(pos)?;
        self.index.truncate_to(block_num)?;
        self.end_pos = pos;
        self.end_block = block_num;
        self.last_block_id = Some(prev_id);
        shared.end_block = block_num;
        Ok(())
    }

    /// Check `prev_id` against the id stored for `block_num - 1`, wherever
    /// that block lives: the active log (tail or interior, for fork rewinds)
    /// or the last retained segment.
    fn verify_parent(&mut self, block_num: u32, prev_id: &BlockId) -> ShipLogResult<()> {
        let in_active = !self.active_is_empty()
            && block_num > self.active_first
            && block_num <= self.end_block;
        let expected = if in_active {
            if block_num == self.end_block {
                self.last_block_id
            } else {
                let prev_pos = self.index.position_of(block_num - 1)?;
                Some(self.read_block_id_at(prev_pos)?)
            }
        } else {
            let mut shared = lock_shared(&self.shared)?;
            if shared.catalog.is_empty() {
                None
            } else {
                shared.catalog.get_block_id(block_num.wrapping_sub(1))?
            }
        };
        match expected {
            Some(expected) if expected != *prev_id => Err(ShipLogError::ForkMismatch {
                block_num,
                expected: expected.short_hex(),
                actual: prev_id.short_hex(),
            }),
            _ => Ok(()),
        }
    }

    /// Finalize the active segment as a retained one and start a fresh,
    /// empty active segment.
    fn split(&mut self) -> ShipLogResult<()> {
        self.write_log.sync_data()?;
        self.index.sync()?;

        let lo = self.active_first;
        let hi = self.end_block - 1;
        let log_to = self
            .retained_dir
            .join(segment_file_name(&self.name, lo, hi, "log"));
        let index_to = self
            .retained_dir
            .join(segment_file_name(&self.name, lo, hi, "index"));

        let mut shared = lock_shared(&self.shared)?;
        move_file(&self.active_log_path(), &log_to)?;
        move_file(&self.active_index_path(), &index_to)?;

        self.write_log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.active_log_path())?;
        self.index = LogIndex::open(self.active_index_path(), self.end_block)?;
        self.end_pos = 0;
        self.active_first = self.end_block;

        shared.catalog.add_segment(log_to, index_to, lo, hi)?;
        shared
            .catalog
            .enforce_retention(self.max_retained_files, self.archive_dir.as_deref())?;
        shared.read_log = LogData::open(self.active_log_path(), OpenMode::ReadOnly)?;
        shared.index = LogIndex::open_readonly(self.active_index_path(), self.end_block)?;
        shared.active_first = self.end_block;

        info!(
            name = self.name.as_str(),
            first_block = lo,
            last_block = hi,
            "split state history log"
        );
        Ok(())
    }

    /// Drop the buffered payload of a block whose write failed.
    pub(crate) fn discard_buffered(&self, block_num: u32) {
        if let Ok(mut shared) = self.shared.lock() {
            shared.buffered.remove(&block_num);
        }
    }

    /// Final flush when the queue closes.
    pub(crate) fn finish(&mut self) {
        if let Err(e) = self.write_log.sync_data() {
            warn!(name = self.name.as_str(), error = %e, "final log sync failed");
        }
        if let Err(e) = self.index.sync() {
            warn!(name = self.name.as_str(), error = %e, "final index sync failed");
        }
    }
}
