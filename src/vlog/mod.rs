//! Append-only value log for key-value separated storage.
//!
//! Large values are appended to numbered log files and referenced from the
//! LSM tree by `(fid, offset, len)` pointers; the tree keeps only keys and
//! small values. Exactly one file, the one with the highest fid, is
//! writable at a time. Rotation freezes it and starts a successor, and a
//! garbage collector samples frozen files for dead data, rewrites the
//! surviving entries back through the tree, and deletes the file once no
//! iterator can still hold pointers into it.
//!
//! # Disk Layout
//!
//! ```text
//! <dir>/
//!   000001.vlog     frozen
//!   000002.vlog     frozen
//!   000003.vlog     head (writable)
//!   DISCARD         per-file discard statistics
//!   emberlog.lock   directory lock
//! ```
//!
//! File names are the zero-padded decimal fid. Each file starts with a
//! 20-byte header; see [`logfile`] for the record format.

pub(crate) mod discard;
pub(crate) mod entry;
pub(crate) mod gc;
pub(crate) mod header;
pub(crate) mod logfile;
pub mod tasks;

pub use entry::{
    key_with_ts, parse_ts, Entry, Request, ValuePointer, BIT_DELETE,
    BIT_DISCARD_EARLIER_VERSIONS, BIT_FIN_TXN, BIT_MERGE_ENTRY, BIT_TXN, BIT_VALUE_POINTER,
};

use std::collections::HashMap;
use std::fs::{self, File};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::config::VlogConfig;
use crate::errdata;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::index::Index;
use crate::registry::KeyRegistry;
use discard::DiscardStats;
use header::{Header, MAX_HEADER_SIZE};
use logfile::{LogFile, Mapping, CRC32, LOG_HEADER_SIZE};

const VLOG_SUFFIX: &str = ".vlog";
const LOCK_FILE: &str = "emberlog.lock";
const CRC_SIZE: usize = 4;

/// Pointer offsets are u32, so no file may grow past this.
const MAX_VLOG_FILE_SIZE: u64 = u32::MAX as u64;

/// The files known to the value log. A fid is either present here or its
/// file has been deleted, except while queued in `to_delete` waiting for the
/// iterator count to reach zero.
#[derive(Default)]
struct FilesView {
    map: HashMap<u32, Arc<LogFile>>,
    to_delete: Vec<u32>,
}

#[derive(Default)]
struct WriterState {
    num_entries_written: u32,
}

pub struct ValueLog {
    dir: PathBuf,
    config: VlogConfig,
    index: Arc<dyn Index>,
    registry: Arc<dyn KeyRegistry>,

    files: RwLock<FilesView>,
    max_fid: AtomicU32,
    /// Published watermark of the head file. Stored after the mmap copy;
    /// readers must see it before trusting a pointer into the head.
    writable_log_offset: AtomicU32,
    num_active_iterators: AtomicI32,

    /// Serializes the write pipeline. The caller contract is a single
    /// writer; the lock turns a violation into blocking instead of a race.
    writer: Mutex<WriterState>,
    /// Capacity-one slot: whoever holds it is the running collection.
    garbage_slot: Mutex<()>,

    discard: Option<DiscardStats>,
    _dir_lock: Option<FileLock>,
}

impl ValueLog {
    /// Opens the value log in `config.dir`, enumerating existing `.vlog`
    /// files, truncating a corrupt head tail, and starting a fresh head
    /// file. With `in_memory` set, no disk state is touched at all.
    pub fn open(
        config: VlogConfig,
        index: Arc<dyn Index>,
        registry: Arc<dyn KeyRegistry>,
    ) -> Result<ValueLog> {
        if config.in_memory {
            return Ok(Self::assemble(config, index, registry, None, None));
        }

        if config.value_log_file_size < 1024 {
            return errdata!("value log file size must be at least 1KB");
        }
        if config.value_log_file_size as u64 > MAX_VLOG_FILE_SIZE / 2 {
            return errdata!("value log file size must leave room for the doubled head mapping");
        }

        fs::create_dir_all(&config.dir)?;
        let dir_lock = if config.read_only {
            None
        } else {
            Some(FileLock::lock(config.dir.join(LOCK_FILE))?)
        };
        let discard = DiscardStats::open(&config.dir)?;

        let vlog = Self::assemble(config, index, registry, Some(discard), dir_lock);
        vlog.populate_files()?;
        Ok(vlog)
    }

    fn assemble(
        config: VlogConfig,
        index: Arc<dyn Index>,
        registry: Arc<dyn KeyRegistry>,
        discard: Option<DiscardStats>,
        dir_lock: Option<FileLock>,
    ) -> ValueLog {
        ValueLog {
            dir: config.dir.clone(),
            config,
            index,
            registry,
            files: RwLock::new(FilesView::default()),
            max_fid: AtomicU32::new(0),
            writable_log_offset: AtomicU32::new(0),
            num_active_iterators: AtomicI32::new(0),
            writer: Mutex::new(WriterState::default()),
            garbage_slot: Mutex::new(()),
            discard,
            _dir_lock: dir_lock,
        }
    }

    /// Scans the directory, opens every log file, repairs the head's tail,
    /// and creates the fresh head this process will write to.
    fn populate_files(&self) -> Result<()> {
        let mut fids = self.scan_dir()?;
        fids.sort_unstable();

        if fids.is_empty() {
            if self.config.read_only {
                return errdata!("no value log files in read-only mode");
            }
            self.create_log_file(1)?;
            return Ok(());
        }

        let head_fid = fids[fids.len() - 1];
        let mut recovered_head = None;
        for &fid in &fids {
            let path = self.fpath(fid);
            if fid == head_fid {
                recovered_head = Some(self.open_head(&path, fid)?);
            } else {
                let len = fs::metadata(&path)?.len();
                if len < LOG_HEADER_SIZE as u64 {
                    return errdata!("frozen value log file {fid} is shorter than its header");
                }
                let lf = Arc::new(LogFile::open(&path, fid, false, self.registry.as_ref())?);
                self.files.write().map.insert(fid, lf);
            }
        }

        {
            let mut files = self.files.write();
            if let Some(head) = recovered_head {
                files.map.insert(head_fid, head);
            }
            self.max_fid.store(head_fid, Ordering::SeqCst);
        }

        if self.config.read_only {
            // Writes are refused, but reads against the recovered head must
            // still pass the watermark check.
            let head = self.head_file()?;
            self.writable_log_offset.store(head.size(), Ordering::SeqCst);
        } else {
            // Never append to a recovered file; always start a fresh head.
            self.create_log_file(head_fid + 1)?;
        }
        Ok(())
    }

    /// Opens the recovered head file, locates the end of its valid records,
    /// and truncates the tail (or reports it in read-only mode).
    fn open_head(&self, path: &Path, fid: u32) -> Result<Arc<LogFile>> {
        let len = fs::metadata(path)?.len();
        if len < LOG_HEADER_SIZE as u64 {
            if self.config.read_only {
                return errdata!("head value log file {fid} is shorter than its header");
            }
            // The header never made it to disk; start the file over.
            tracing::warn!(fid, "recreating value log file shorter than its header");
            fs::remove_file(path)?;
            let map_len = 2 * self.config.value_log_file_size as usize;
            return Ok(Arc::new(LogFile::create(
                path,
                fid,
                map_len,
                self.registry.as_ref(),
            )?));
        }

        let writable = !self.config.read_only;
        let lf = Arc::new(LogFile::open(path, fid, writable, self.registry.as_ref())?);
        let end = lf.iterate(LOG_HEADER_SIZE, |_entry, _vp| Ok(()))?;
        if self.config.read_only {
            if (end as u64) < len {
                return Err(Error::TruncateNeeded {
                    end_offset: end,
                    size: len as u32,
                });
            }
        } else {
            if (end as u64) < len {
                tracing::info!(fid, end, size = len, "truncating value log tail");
            }
            lf.done_writing(end)?;
        }
        Ok(lf)
    }

    fn scan_dir(&self) -> Result<Vec<u32>> {
        let mut fids = Vec::new();
        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let name = dirent.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(VLOG_SUFFIX) else {
                continue;
            };
            let fid: u32 = stem
                .parse()
                .map_err(|_| Error::InvalidData(format!("cannot parse log id from {name:?}")))?;
            if fids.contains(&fid) {
                return errdata!("duplicate value log file for fid {fid}");
            }
            fids.push(fid);
        }
        Ok(fids)
    }

    fn fpath(&self, fid: u32) -> PathBuf {
        self.dir.join(format!("{fid:06}{VLOG_SUFFIX}"))
    }

    /// Creates a new head file and publishes it, resetting the watermark.
    fn create_log_file(&self, fid: u32) -> Result<Arc<LogFile>> {
        let path = self.fpath(fid);
        let map_len = 2 * self.config.value_log_file_size as usize;
        let lf = Arc::new(LogFile::create(&path, fid, map_len, self.registry.as_ref())?);
        {
            let mut files = self.files.write();
            debug_assert!(self.max_fid.load(Ordering::SeqCst) < fid);
            files.map.insert(fid, lf.clone());
            self.max_fid.store(fid, Ordering::SeqCst);
            self.writable_log_offset
                .store(LOG_HEADER_SIZE, Ordering::SeqCst);
        }
        sync_dir(&self.dir)?;
        tracing::debug!(fid, "created value log file");
        Ok(lf)
    }

    pub(crate) fn woffset(&self) -> u32 {
        self.writable_log_offset.load(Ordering::SeqCst)
    }

    fn head_file(&self) -> Result<Arc<LogFile>> {
        let files = self.files.read();
        let max_fid = self.max_fid.load(Ordering::SeqCst);
        files
            .map
            .get(&max_fid)
            .cloned()
            .ok_or_else(|| Error::InvalidData(format!("head value log file {max_fid} missing")))
    }

    /// Fids currently serving reads, sorted, excluding files queued for
    /// deletion. Callers pass the files view they already hold.
    fn sorted_fids(files: &FilesView) -> Vec<u32> {
        let mut fids: Vec<u32> = files
            .map
            .keys()
            .filter(|fid| !files.to_delete.contains(fid))
            .copied()
            .collect();
        fids.sort_unstable();
        fids
    }

    fn skip_vlog(&self, e: &Entry) -> bool {
        e.value.len() < self.config.value_threshold
    }

    /// Checks that no request in the batch can push a single file past the
    /// 4GB offset space, simulating rotation along the way.
    fn validate_writes(&self, reqs: &[Request]) -> Result<()> {
        let mut offset = self.woffset() as u64;
        for req in reqs {
            let size = estimate_request_size(req);
            let estimated = offset + size;
            if estimated > MAX_VLOG_FILE_SIZE {
                return errdata!(
                    "request of {size} bytes at offset {offset} exceeds the 4GB file limit"
                );
            }
            if estimated >= self.config.value_log_file_size as u64 {
                // The request ends past the rotation point, so it will land
                // in a fresh file.
                offset = 0;
                continue;
            }
            offset = estimated;
        }
        Ok(())
    }

    /// Appends every entry of every request to the head file, filling in
    /// `req.ptrs` positionally. Values below the inline threshold get a zero
    /// pointer. Thread-unsafe by design: only the single writer task calls
    /// this; an internal lock enforces that at runtime.
    pub fn write(&self, reqs: &mut [Request]) -> Result<()> {
        if self.config.in_memory {
            for req in reqs.iter_mut() {
                req.ptrs.clear();
                req.ptrs.resize(req.entries.len(), ValuePointer::default());
            }
            return Ok(());
        }
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }

        let mut wstate = self.writer.lock();
        self.validate_writes(reqs)?;

        let mut curlf = self.head_file()?;
        let mut buf = Vec::new();
        for req in reqs.iter_mut() {
            req.ptrs.clear();
            let mut written = 0u32;

            for e in &req.entries {
                if self.skip_vlog(e) {
                    req.ptrs.push(ValuePointer::default());
                    continue;
                }

                buf.clear();
                let offset = self.woffset();
                let plen = curlf.encode_entry(&mut buf, e, offset)?;
                curlf.append(offset, &buf)?;
                // Publish only after the bytes are in place.
                self.writable_log_offset
                    .store(offset + plen as u32, Ordering::SeqCst);

                req.ptrs.push(ValuePointer {
                    fid: curlf.fid,
                    len: plen as u32,
                    offset,
                });
                written += 1;
            }
            wstate.num_entries_written += written;

            // Rotate between requests so a transaction never spans files.
            if self.woffset() > self.config.value_log_file_size
                || wstate.num_entries_written > self.config.value_log_max_entries
            {
                curlf.done_writing(self.woffset())?;
                curlf = self.create_log_file(curlf.fid + 1)?;
                wstate.num_entries_written = 0;
                tracing::debug!(fid = curlf.fid, "rotated value log head");
            }
        }

        if self.config.sync_writes {
            curlf.sync()?;
        }
        Ok(())
    }

    /// Resolves `vp.fid`, checks the head watermark, and returns the file
    /// with its mapping read-locked.
    fn file_rlocked(
        &self,
        vp: ValuePointer,
    ) -> Result<(Arc<LogFile>, ArcRwLockReadGuard<RawRwLock, Mapping>)> {
        let files = self.files.read();
        let Some(lf) = files.map.get(&vp.fid).cloned() else {
            return errdata!("value log file {} not found", vp.fid);
        };
        if vp.fid == self.max_fid.load(Ordering::SeqCst) {
            let current = self.woffset();
            if vp.offset >= current {
                return errdata!(
                    "pointer offset {} is beyond the writable offset {current}",
                    vp.offset
                );
            }
        }
        let guard = lf.map().read_arc();
        Ok((lf, guard))
    }

    /// Reads the value a pointer refers to. The returned guard borrows the
    /// file's mapping (or owns a decrypted copy) and keeps the file alive
    /// until dropped.
    pub fn read(&self, vp: ValuePointer) -> Result<ValueGuard> {
        let (lf, map_guard) = self.file_rlocked(vp)?;

        let size = lf.size();
        let end = vp.offset as u64 + vp.len as u64;
        if end > size as u64 {
            return errdata!(
                "pointer [{}, {end}) is beyond the file size {size}",
                vp.offset
            );
        }
        let Some(record) = map_guard.slice(vp.offset as usize, vp.len as usize) else {
            return errdata!("value log file {} is no longer mapped", vp.fid);
        };
        if (vp.len as usize) < CRC_SIZE {
            return errdata!("pointer length {} is shorter than a record trailer", vp.len);
        }

        if self.config.verify_value_checksum {
            let body = &record[..vp.len as usize - CRC_SIZE];
            let stored = BigEndian::read_u32(&record[vp.len as usize - CRC_SIZE..]);
            if CRC32.checksum(body) != stored {
                return Err(Error::ChecksumMismatch);
            }
        }

        let (h, header_len) = Header::decode(record)
            .map_err(|_| Error::InvalidData(format!("bad record header at {}", vp.offset)))?;
        let klen = h.klen as usize;
        let vlen = h.vlen as usize;
        if header_len + klen + vlen + CRC_SIZE > vp.len as usize {
            return errdata!(
                "record of {} key and {} value bytes overflows pointer length {}",
                klen,
                vlen,
                vp.len
            );
        }

        if lf.encryption_enabled() {
            let mut kv = record[header_len..header_len + klen + vlen].to_vec();
            lf.decrypt_kv(&mut kv, vp.offset);
            let value = kv.split_off(klen);
            Ok(ValueGuard::owned(value))
        } else {
            let start = vp.offset as usize + header_len + klen;
            Ok(ValueGuard::mapped(map_guard, start, vlen))
        }
    }

    /// Syncs the head file. A no-op under `sync_writes`, where every write
    /// batch already flushes inline.
    pub fn sync(&self) -> Result<()> {
        if self.config.sync_writes || self.config.in_memory {
            return Ok(());
        }
        // The head can be mid-rotation; a missing entry just means the next
        // sync will cover the new file.
        let head = {
            let files = self.files.read();
            let max_fid = self.max_fid.load(Ordering::SeqCst);
            files.map.get(&max_fid).cloned()
        };
        match head {
            Some(lf) => lf.sync(),
            None => Ok(()),
        }
    }

    /// Runs one garbage collection pass at the given discard ratio. Fails
    /// with `Rejected` when a pass is already running and `NoRewrite` when
    /// no candidate was worth rewriting.
    pub fn run_gc(&self, discard_ratio: f64) -> Result<()> {
        gc::run(self, discard_ratio)
    }

    /// Called by LSM compaction to report newly dead bytes per file.
    pub fn update_discard_stats(&self, stats: &HashMap<u32, i64>) -> Result<()> {
        let Some(discard) = &self.discard else {
            return Ok(());
        };
        for (&fid, &delta) in stats {
            discard.update(fid, delta)?;
        }
        Ok(())
    }

    pub fn incr_iterator_count(&self) {
        self.num_active_iterators.fetch_add(1, Ordering::SeqCst);
    }

    pub fn iterator_count(&self) -> i32 {
        self.num_active_iterators.load(Ordering::SeqCst)
    }

    /// Drops one iterator reference. When the count reaches zero, every file
    /// queued for deletion is removed from disk before this returns.
    pub fn decr_iterator_count(&self) -> Result<()> {
        let remaining = self.num_active_iterators.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining != 0 {
            return Ok(());
        }

        let stale: Vec<Arc<LogFile>> = {
            let mut files = self.files.write();
            let fids: Vec<u32> = files.to_delete.drain(..).collect();
            fids.iter().filter_map(|fid| files.map.remove(fid)).collect()
        };
        for lf in stale {
            self.delete_log_file(&lf)?;
        }
        Ok(())
    }

    /// RAII form of the iterator bracket.
    pub fn iterator_guard(&self) -> IteratorGuard<'_> {
        self.incr_iterator_count();
        IteratorGuard { vlog: self }
    }

    pub(crate) fn delete_log_file(&self, lf: &LogFile) -> Result<()> {
        tracing::info!(fid = lf.fid, "deleting value log file");
        lf.delete()?;
        sync_dir(&self.dir)
    }

    /// Deletes every log file and starts over at fid 1. The caller must
    /// have stopped the writer; pending iterators are not honored here.
    pub fn drop_all(&self) -> Result<usize> {
        if self.config.in_memory {
            return Ok(0);
        }
        let mut count = 0;
        {
            let mut files = self.files.write();
            for (_fid, lf) in files.map.drain() {
                lf.delete()?;
                count += 1;
            }
            files.to_delete.clear();
            self.max_fid.store(0, Ordering::SeqCst);
            self.writable_log_offset.store(0, Ordering::SeqCst);
        }
        sync_dir(&self.dir)?;
        tracing::info!(count, "dropped all value log files");
        if !self.config.read_only {
            self.create_log_file(1)?;
        }
        Ok(count)
    }

    /// Blocks until any in-flight collection finishes, then holds the slot
    /// forever so no further collection can start.
    pub(crate) fn fence_gc(&self) {
        let guard = self.garbage_slot.lock();
        std::mem::forget(guard);
    }

    /// Closes every file, truncating the head to the watermark. Garbage
    /// collection is fenced off first.
    pub fn close(&self) -> Result<()> {
        if self.config.in_memory {
            return Ok(());
        }
        tracing::debug!("stopping value log garbage collection");
        self.fence_gc();
        if let Some(discard) = &self.discard {
            discard.sync()?;
        }

        let files = self.files.read();
        let max_fid = self.max_fid.load(Ordering::SeqCst);
        let mut first_err = None;
        for (fid, lf) in files.map.iter() {
            let truncate_to =
                (!self.config.read_only && *fid == max_fid).then(|| self.woffset());
            if let Err(e) = lf.close(truncate_to) {
                tracing::warn!(fid, error = %e, "failed to close value log file");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Point-in-time counters for monitoring and tests.
    pub fn metrics(&self) -> VlogMetrics {
        let files = self.files.read();
        VlogMetrics {
            file_count: files.map.len(),
            max_fid: self.max_fid.load(Ordering::SeqCst),
            writable_offset: self.woffset(),
            pending_deletions: files.to_delete.len(),
            active_iterators: self.iterator_count(),
            entries_written: self.writer.lock().num_entries_written,
        }
    }

    /// Logs the current metrics and flags suspicious states.
    pub fn status(&self) -> VlogMetrics {
        let m = self.metrics();
        tracing::info!(
            files = m.file_count,
            max_fid = m.max_fid,
            writable_offset = m.writable_offset,
            pending_deletions = m.pending_deletions,
            active_iterators = m.active_iterators,
            "value log status"
        );
        if m.pending_deletions > 0 && m.active_iterators == 0 {
            tracing::warn!(
                pending = m.pending_deletions,
                "files pending deletion with no active iterators"
            );
        }
        m
    }

    #[cfg(test)]
    pub(crate) fn force_rotate(&self) -> Result<()> {
        let mut wstate = self.writer.lock();
        let head = self.head_file()?;
        head.done_writing(self.woffset())?;
        self.create_log_file(head.fid + 1)?;
        wstate.num_entries_written = 0;
        Ok(())
    }
}

/// Metrics snapshot for monitoring and debugging.
#[derive(Debug, Clone)]
pub struct VlogMetrics {
    pub file_count: usize,
    pub max_fid: u32,
    pub writable_offset: u32,
    pub pending_deletions: usize,
    pub active_iterators: i32,
    pub entries_written: u32,
}

/// RAII guard for an outstanding LSM iterator. Files rewritten by the
/// collector stay on disk until the last guard drops.
pub struct IteratorGuard<'a> {
    vlog: &'a ValueLog,
}

impl Drop for IteratorGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.vlog.decr_iterator_count() {
            tracing::warn!(error = %e, "failed to delete value log files pending removal");
        }
    }
}

/// Value bytes resolved from a pointer. Borrows the file's mapping under its
/// read lock, or owns a decrypted copy; either way the bytes stay valid for
/// the guard's lifetime.
pub struct ValueGuard {
    inner: GuardInner,
    start: usize,
    len: usize,
}

enum GuardInner {
    Mapped(ArcRwLockReadGuard<RawRwLock, Mapping>),
    Owned(Vec<u8>),
}

impl ValueGuard {
    fn mapped(guard: ArcRwLockReadGuard<RawRwLock, Mapping>, start: usize, len: usize) -> Self {
        Self {
            inner: GuardInner::Mapped(guard),
            start,
            len,
        }
    }

    fn owned(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            inner: GuardInner::Owned(data),
            start: 0,
            len,
        }
    }
}

impl Deref for ValueGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.inner {
            // The mapping cannot be unmapped while the read guard is held.
            GuardInner::Mapped(map) => map.slice(self.start, self.len).unwrap_or(&[]),
            GuardInner::Owned(data) => &data[..],
        }
    }
}

impl AsRef<[u8]> for ValueGuard {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl std::fmt::Debug for ValueGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueGuard").field("len", &self.len).finish()
    }
}

fn estimate_request_size(req: &Request) -> u64 {
    req.entries
        .iter()
        .map(|e| (MAX_HEADER_SIZE + e.key.len() + e.value.len() + CRC_SIZE) as u64)
        .sum()
}

/// Fsyncs the directory so file creations and deletions are durable.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::index::mem::MemIndex;
    use crate::registry::{NoRegistry, StaticRegistry};
    use crate::tmpfs::TempDir;
    use std::os::unix::fs::FileExt;

    fn test_config(dir: &Path) -> VlogConfig {
        VlogConfig::new(dir)
            .value_log_file_size(1 << 20)
            .value_threshold(1)
            .gc(GcConfig::default()
                .sample_size_ratio(1.0)
                .sample_count_ratio(1.0))
    }

    fn open_vlog(config: VlogConfig) -> (Arc<ValueLog>, Arc<MemIndex>) {
        let index = Arc::new(MemIndex::new());
        let vlog = ValueLog::open(config, index.clone(), Arc::new(NoRegistry))
            .expect("Failed to open value log");
        (Arc::new(vlog), index)
    }

    fn write_one(vlog: &ValueLog, entry: Entry) -> ValuePointer {
        let mut req = Request::new(vec![entry]);
        vlog.write(std::slice::from_mut(&mut req))
            .expect("Failed to write");
        req.ptrs[0]
    }

    #[test]
    fn test_basic_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));

        let mut entry = Entry::new(key_with_ts(b"samplekey", 1), b"sampleval".to_vec());
        entry.meta = 123;
        let vp = write_one(&vlog, entry.clone());

        assert_eq!(vp.fid, 1);
        assert_eq!(vp.offset, LOG_HEADER_SIZE);
        assert!(vp.len > 0);

        let value = vlog.read(vp).expect("Failed to read");
        assert_eq!(&*value, b"sampleval");

        // The stored record carries the metadata too.
        let head = vlog.head_file().expect("head");
        let mut metas = Vec::new();
        head.iterate(0, |e, _vp| {
            metas.push((e.key, e.meta));
            Ok(())
        })
        .expect("Failed to iterate");
        assert_eq!(metas, vec![(entry.key, 123)]);
    }

    #[test]
    fn test_pointers_are_ordered() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));

        let entries: Vec<Entry> = (0..5)
            .map(|i| Entry::new(key_with_ts(format!("key{i}").as_bytes(), 1), vec![i as u8; 50]))
            .collect();
        let mut req = Request::new(entries);
        vlog.write(std::slice::from_mut(&mut req)).expect("write");

        for pair in req.ptrs.windows(2) {
            assert!((pair[0].fid, pair[0].offset) < (pair[1].fid, pair[1].offset));
            assert_eq!(pair[0].offset + pair[0].len, pair[1].offset);
        }
    }

    #[test]
    fn test_inline_values_get_zero_pointers() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path()).value_threshold(64);
        let (vlog, _index) = open_vlog(config);

        let mut req = Request::new(vec![
            Entry::new(key_with_ts(b"small", 1), b"tiny".to_vec()),
            Entry::new(key_with_ts(b"large", 1), vec![7u8; 128]),
        ]);
        vlog.write(std::slice::from_mut(&mut req)).expect("write");

        assert!(req.ptrs[0].is_zero());
        assert!(!req.ptrs[1].is_zero());
        let value = vlog.read(req.ptrs[1]).expect("Failed to read");
        assert_eq!(&*value, &[7u8; 128][..]);
    }

    #[test]
    fn test_rotation_by_size() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path()).value_log_file_size(64 * 1024);
        let (vlog, _index) = open_vlog(config);

        let mut first = None;
        let mut rotated = None;
        for i in 0..80 {
            let entry = Entry::new(key_with_ts(format!("key{i:03}").as_bytes(), 1), vec![0xab; 1024]);
            let vp = write_one(&vlog, entry);
            first.get_or_insert(vp);
            if vp.fid > 1 {
                rotated.get_or_insert(vp);
            }
        }

        let first = first.expect("wrote entries");
        let rotated = rotated.expect("rotation must have happened");
        assert_eq!(vlog.max_fid.load(Ordering::SeqCst), rotated.fid);
        // The new head starts right after its file header.
        assert_eq!(rotated.offset, LOG_HEADER_SIZE);

        // Pointers into the frozen file keep working.
        let value = vlog.read(first).expect("Failed to read frozen file");
        assert_eq!(value.len(), 1024);
        let value = vlog.read(rotated).expect("Failed to read head");
        assert_eq!(value.len(), 1024);
    }

    #[test]
    fn test_rotation_by_entry_count() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path()).value_log_max_entries(10);
        let (vlog, _index) = open_vlog(config);

        for i in 0..12 {
            write_one(
                &vlog,
                Entry::new(key_with_ts(format!("key{i}").as_bytes(), 1), vec![1u8; 16]),
            );
        }
        assert!(vlog.max_fid.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_checksum_tamper_detected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path()).verify_value_checksum(true);
        let (vlog, _index) = open_vlog(config);

        let vp = write_one(
            &vlog,
            Entry::new(key_with_ts(b"key", 1), b"some long enough value".to_vec()),
        );
        assert!(vlog.read(vp).is_ok());

        // Flip a byte inside the record's value region on disk; the shared
        // mapping sees the same pages.
        let file = fs::OpenOptions::new()
            .write(true)
            .open(vlog.fpath(vp.fid))
            .expect("Failed to open file");
        file.write_at(b"X", (vp.offset + vp.len - 6) as u64)
            .expect("Failed to tamper");

        assert!(matches!(vlog.read(vp), Err(Error::ChecksumMismatch)));
    }

    #[test]
    fn test_reopen_truncates_partial_tail() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let index = Arc::new(MemIndex::new());

        let ptrs = {
            let vlog = ValueLog::open(config.clone(), index.clone(), Arc::new(NoRegistry))
                .expect("Failed to open");
            let mut req = Request::new(
                (0..3)
                    .map(|i| Entry::new(key_with_ts(format!("key{i}").as_bytes(), 1), vec![i as u8; 64]))
                    .collect(),
            );
            vlog.write(std::slice::from_mut(&mut req)).expect("write");
            req.ptrs
            // Dropped without close: the head keeps its doubled length and
            // zeroed tail, as after a crash.
        };

        // Corrupt the last record before reopening.
        let path = dir.path().join("000001.vlog");
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .expect("Failed to open file");
        file.write_at(b"??", (ptrs[2].offset + 3) as u64)
            .expect("Failed to corrupt");

        let vlog = ValueLog::open(config, index, Arc::new(NoRegistry)).expect("Failed to reopen");

        // The surviving prefix is readable.
        assert_eq!(&*vlog.read(ptrs[0]).expect("read"), &[0u8; 64][..]);
        assert_eq!(&*vlog.read(ptrs[1]).expect("read"), &[1u8; 64][..]);
        // The corrupt record was truncated away.
        assert!(vlog.read(ptrs[2]).is_err());
        // The old head froze at the truncation point and a new head exists.
        assert_eq!(vlog.max_fid.load(Ordering::SeqCst), 2);
        assert_eq!(
            fs::metadata(&path).expect("Failed to stat").len(),
            ptrs[2].offset as u64
        );
    }

    #[test]
    fn test_validate_writes_rejects_file_overflow() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));

        let req = Request::new(vec![Entry::new(
            key_with_ts(b"key", 1),
            vec![0u8; 256],
        )]);
        assert!(vlog.validate_writes(std::slice::from_ref(&req)).is_ok());

        // Pretend the head is nearly full.
        vlog.writable_log_offset
            .store(u32::MAX - 64, Ordering::SeqCst);
        assert!(vlog.validate_writes(std::slice::from_ref(&req)).is_err());
    }

    #[test]
    fn test_gc_rejected_while_slot_held() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));

        let _slot = vlog.garbage_slot.lock();
        assert_eq!(vlog.run_gc(0.5), Err(Error::Rejected));
    }

    #[test]
    fn test_in_memory_mode_touches_no_disk() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let sub = dir.path().join("never-created");
        let config = VlogConfig::new(&sub).in_memory(true);
        let (vlog, _index) = open_vlog(config);

        let mut req = Request::new(vec![Entry::new(key_with_ts(b"key", 1), vec![9u8; 4096])]);
        vlog.write(std::slice::from_mut(&mut req)).expect("write");
        assert_eq!(req.ptrs.len(), 1);
        assert!(req.ptrs[0].is_zero());
        assert!(!sub.exists());

        assert_eq!(vlog.drop_all().expect("drop_all"), 0);
        vlog.sync().expect("sync");
        vlog.close().expect("close");
    }

    #[test]
    fn test_read_only_mode() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let index = Arc::new(MemIndex::new());

        let vp = {
            let vlog = ValueLog::open(config.clone(), index.clone(), Arc::new(NoRegistry))
                .expect("Failed to open");
            let vp = write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![3u8; 128]));
            vlog.close().expect("Failed to close");
            vp
        };

        let vlog = ValueLog::open(config.read_only(true), index, Arc::new(NoRegistry))
            .expect("Failed to reopen read-only");
        assert_eq!(&*vlog.read(vp).expect("read"), &[3u8; 128][..]);

        let mut req = Request::new(vec![Entry::new(key_with_ts(b"new", 1), vec![1u8; 64])]);
        assert_eq!(
            vlog.write(std::slice::from_mut(&mut req)),
            Err(Error::ReadOnly)
        );
    }

    #[test]
    fn test_read_only_reports_truncate_needed() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let index = Arc::new(MemIndex::new());

        {
            let vlog = ValueLog::open(config.clone(), index.clone(), Arc::new(NoRegistry))
                .expect("Failed to open");
            write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![3u8; 128]));
            // No close: the head keeps its zeroed tail.
        }

        let result = ValueLog::open(config.read_only(true), index, Arc::new(NoRegistry));
        assert!(matches!(result, Err(Error::TruncateNeeded { .. })));
    }

    #[test]
    fn test_drop_all_recreates_first_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));

        let vp = write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![1u8; 64]));
        vlog.force_rotate().expect("rotate");
        write_one(&vlog, Entry::new(key_with_ts(b"key2", 1), vec![2u8; 64]));

        let dropped = vlog.drop_all().expect("Failed to drop");
        assert_eq!(dropped, 2);

        // Back to a single fresh head at fid 1.
        assert_eq!(vlog.max_fid.load(Ordering::SeqCst), 1);
        assert_eq!(vlog.woffset(), LOG_HEADER_SIZE);
        assert!(vlog.read(vp).is_err());

        // And it is writable again.
        let vp = write_one(&vlog, Entry::new(key_with_ts(b"key3", 1), vec![3u8; 64]));
        assert_eq!(&*vlog.read(vp).expect("read"), &[3u8; 64][..]);
    }

    #[test]
    fn test_encrypted_end_to_end() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        let index = Arc::new(MemIndex::new());
        let registry = Arc::new(StaticRegistry::new(99, vec![42u8; 32]));

        let secret = b"very secret value material".to_vec();
        let vp = {
            let vlog = ValueLog::open(config.clone(), index.clone(), registry.clone())
                .expect("Failed to open");
            let vp = write_one(&vlog, Entry::new(key_with_ts(b"key", 1), secret.clone()));
            assert_eq!(&*vlog.read(vp).expect("read"), secret.as_slice());
            vlog.close().expect("close");
            vp
        };

        // Plaintext never hits the disk.
        let raw = fs::read(dir.path().join("000001.vlog")).expect("Failed to read file");
        assert!(!raw.windows(secret.len()).any(|w| w == secret.as_slice()));

        // And the file is readable again after reopening with the registry.
        let vlog = ValueLog::open(config, index, registry).expect("Failed to reopen");
        assert_eq!(&*vlog.read(vp).expect("read"), secret.as_slice());
    }

    #[test]
    fn test_close_stops_reads() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));
        let vp = write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![5u8; 64]));

        vlog.close().expect("Failed to close");
        assert!(vlog.read(vp).is_err());
        // A second collection can never start after the fence.
        assert_eq!(vlog.run_gc(0.5), Err(Error::Rejected));
    }

    #[test]
    fn test_metrics_snapshot() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));
        write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![1u8; 64]));

        let m = vlog.status();
        assert_eq!(m.file_count, 1);
        assert_eq!(m.max_fid, 1);
        assert!(m.writable_offset > LOG_HEADER_SIZE);
        assert_eq!(m.pending_deletions, 0);
        assert_eq!(m.active_iterators, 0);
        assert_eq!(m.entries_written, 1);
    }

    #[test]
    fn test_duplicate_fid_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = test_config(dir.path());
        {
            let (vlog, _index) = open_vlog(config.clone());
            write_one(&vlog, Entry::new(key_with_ts(b"key", 1), vec![1u8; 64]));
            vlog.close().expect("close");
        }
        // Same fid with and without zero padding.
        fs::write(dir.path().join("1.vlog"), b"bogus").expect("write");

        let index: Arc<dyn Index> = Arc::new(MemIndex::new());
        assert!(ValueLog::open(config, index, Arc::new(NoRegistry)).is_err());
    }
}
