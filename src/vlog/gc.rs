//! Garbage collection: candidate selection, sampling, and rewrite.
//!
//! A collection run picks a frozen file, samples a window of it to estimate
//! how much of it is dead, and if the estimate clears the configured ratio,
//! rewrites the still-live entries back through the LSM tree so the file can
//! be deleted. At most one run is in flight at a time.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::errdata;
use crate::error::{Error, Result};
use crate::index::ValueMeta;
use crate::vlog::entry::{parse_ts, Entry, ValuePointer, BIT_DELETE, BIT_FIN_TXN, BIT_VALUE_POINTER};
use crate::vlog::logfile::LogFile;
use crate::vlog::ValueLog;

/// Wall-clock cap on a single sampling pass.
const SAMPLE_TIME_BUDGET: Duration = Duration::from_secs(10);

/// Slice size for flushing staged rewrite entries; halved on `TxnTooBig`.
const REWRITE_BATCH: usize = 1024;

/// One collection pass. Holds the capacity-one slot for its duration.
pub(crate) fn run(vlog: &ValueLog, discard_ratio: f64) -> Result<()> {
    let Some(_slot) = vlog.garbage_slot.try_lock() else {
        return Err(Error::Rejected);
    };

    let candidates = pick_candidates(vlog);
    if candidates.is_empty() {
        tracing::debug!("no value log file eligible for garbage collection");
        return Err(Error::NoRewrite);
    }

    let mut tried = HashSet::new();
    let mut last_err = Error::NoRewrite;
    for lf in candidates {
        if !tried.insert(lf.fid) {
            continue;
        }
        match do_run_gc(vlog, &lf, discard_ratio) {
            Ok(()) => return Ok(()),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Candidate files for collection: the file with the most recorded discard
/// (when it is not the head), plus one random frozen file biased toward
/// older fids by sampling the random index twice.
fn pick_candidates(vlog: &ValueLog) -> Vec<Arc<LogFile>> {
    let files = vlog.files.read();
    let fids = ValueLog::sorted_fids(&files);
    if fids.len() <= 1 {
        return Vec::new();
    }
    let max_fid = vlog.max_fid.load(Ordering::SeqCst);

    let mut out = Vec::new();
    if let Some(discard) = &vlog.discard {
        let (fid, bytes) = discard.max_discard();
        if bytes > 0 && fid < max_fid {
            if let Some(lf) = files.map.get(&fid) {
                tracing::info!(fid, bytes, "picked max-discard value log file");
                out.push(lf.clone());
            }
        }
    }

    let idx_head = fids
        .iter()
        .position(|&fid| fid >= max_fid)
        .unwrap_or(fids.len());
    if idx_head == 0 {
        return out;
    }
    let mut rng = rand::thread_rng();
    let mut idx = rng.gen_range(0..idx_head);
    if idx > 0 {
        idx = rng.gen_range(0..=idx);
    }
    if let Some(lf) = files.map.get(&fids[idx]) {
        tracing::debug!(fid = fids[idx], "randomly picked value log file");
        out.push(lf.clone());
    }
    out
}

fn do_run_gc(vlog: &ValueLog, lf: &Arc<LogFile>, discard_ratio: f64) -> Result<()> {
    let sampler = Sampler {
        size_ratio: vlog.config.gc.sample_size_ratio,
        count_ratio: vlog.config.gc.sample_count_ratio,
        from_beginning: false,
    };
    sample(vlog, lf, &sampler, discard_ratio)?;
    rewrite(vlog, lf)?;
    // The file is gone or queued for deletion; its stats are spent.
    if let Some(discard) = &vlog.discard {
        discard.update(lf.fid, -1)?;
    }
    Ok(())
}

pub(crate) struct Sampler {
    pub size_ratio: f64,
    pub count_ratio: f64,
    pub from_beginning: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SampleStats {
    pub total: f64,
    pub discard: f64,
    pub count: usize,
}

/// Estimates the discardable fraction of `lf` by scanning a bounded window,
/// optionally starting at a random point in the file. Fails with `NoRewrite`
/// when the window came up short or too little of it was dead.
pub(crate) fn sample(
    vlog: &ValueLog,
    lf: &Arc<LogFile>,
    sampler: &Sampler,
    discard_ratio: f64,
) -> Result<SampleStats> {
    let file_size = lf.size();
    let size_window = file_size as f64 * sampler.size_ratio;
    let count_window = (vlog.config.value_log_max_entries as f64 * sampler.count_ratio) as usize;

    // Random start point, pulled back by one window so the window fits.
    let skip_first = if sampler.from_beginning {
        0.0
    } else {
        let start = rand::thread_rng().gen_range(0..file_size.max(1)) as f64;
        (start - size_window).max(0.0)
    };

    let mut skipped = 0.0;
    let mut stats = SampleStats::default();
    let started = Instant::now();

    lf.iterate(0, |e, vp| {
        let esz = vp.len as f64;
        if skipped < skip_first {
            skipped += esz;
            return Ok(());
        }
        if stats.count > count_window
            || stats.total > size_window
            || started.elapsed() > SAMPLE_TIME_BUDGET
        {
            return Err(Error::Stop);
        }
        stats.total += esz;
        stats.count += 1;

        let vs = vlog.index.get(&e.key)?;
        if discard_entry(&e, &vs) {
            stats.discard += esz;
            return Ok(());
        }
        if vs.value.is_empty() {
            return errdata!("live key with empty value meta during sampling");
        }
        let vp_lsm = ValuePointer::decode(&vs.value)?;
        if vp_lsm.fid > lf.fid || vp_lsm.offset > e.offset {
            // The tree already points at a newer copy.
            stats.discard += esz;
        } else if vp_lsm.fid == lf.fid && vp_lsm.offset == e.offset {
            // Live copy; a rewrite would have to carry it.
        } else {
            // The tree references an older location. Version-keep policies
            // make that legal; the copy under scan is dead either way.
            stats.discard += esz;
        }
        Ok(())
    })?;

    tracing::debug!(
        fid = lf.fid,
        count = stats.count,
        total = stats.total,
        discard = stats.discard,
        "sampled value log file"
    );

    if (stats.count < count_window && stats.total < size_window * 0.75)
        || stats.discard < discard_ratio * stats.total
    {
        tracing::debug!(fid = lf.fid, "skipping rewrite, not enough discardable data");
        return Err(Error::NoRewrite);
    }
    Ok(stats)
}

/// Re-inserts every live entry of `lf` through the LSM tree, then deletes
/// the file (or queues it if iterators still hold pointers into it).
pub(crate) fn rewrite(vlog: &ValueLog, lf: &Arc<LogFile>) -> Result<()> {
    let max_fid = vlog.max_fid.load(Ordering::SeqCst);
    if lf.fid >= max_fid {
        return errdata!("refusing to rewrite head value log file {}", lf.fid);
    }
    tracing::info!(fid = lf.fid, "rewriting value log file");

    let mut staged: Vec<Entry> = Vec::with_capacity(1000);
    let mut staged_size: u64 = 0;
    let mut scanned = 0usize;
    let mut live = 0usize;

    lf.iterate(0, |e, _vp| {
        scanned += 1;
        let vs = vlog.index.get(&e.key)?;
        if discard_entry(&e, &vs) {
            return Ok(());
        }
        if vs.value.is_empty() {
            return errdata!("live key with empty value meta during rewrite");
        }
        let vp_lsm = ValuePointer::decode(&vs.value)?;
        if vp_lsm.fid > lf.fid {
            return Ok(());
        }
        if vp_lsm.offset > e.offset {
            return Ok(());
        }
        if vp_lsm.fid == lf.fid && vp_lsm.offset == e.offset {
            live += 1;
            // Strip the flag bits; the re-insert decides its own placement.
            let ne = Entry {
                key: e.key,
                value: e.value,
                user_meta: e.user_meta,
                meta: 0,
                expires_at: e.expires_at,
                offset: 0,
                header_len: 0,
            };
            let cost = ne.estimate_size(vlog.config.value_threshold) + ne.value.len() as u64;
            if (staged.len() + 1) as u64 >= vlog.config.max_batch_count
                || staged_size + cost >= vlog.config.max_batch_size
            {
                vlog.index.batch_set(&staged)?;
                staged.clear();
                staged_size = 0;
            }
            staged.push(ne);
            staged_size += cost;
        } else {
            // The tree references an older location for this key, which can
            // happen under version-keep policies. Compaction ages it out.
        }
        Ok(())
    })?;

    // Flush the remainder, backing off when the tree rejects a batch.
    let mut batch_size = REWRITE_BATCH;
    let mut i = 0;
    while i < staged.len() {
        if batch_size == 0 {
            tracing::warn!(fid = lf.fid, "rewrite batch size dropped to zero");
            return Err(Error::NoRewrite);
        }
        let end = (i + batch_size).min(staged.len());
        match vlog.index.batch_set(&staged[i..end]) {
            Ok(()) => i = end,
            Err(Error::TxnTooBig) => {
                batch_size /= 2;
                tracing::debug!(batch_size, "halving rewrite batch");
            }
            Err(e) => return Err(e),
        }
    }
    tracing::info!(fid = lf.fid, scanned, live, "value log rewrite complete");

    let delete_now = {
        let mut files = vlog.files.write();
        if !files.map.contains_key(&lf.fid) {
            return errdata!("value log file {} vanished during rewrite", lf.fid);
        }
        if vlog.iterator_count() == 0 {
            files.map.remove(&lf.fid);
            true
        } else {
            tracing::debug!(fid = lf.fid, "deferring value log file deletion");
            files.to_delete.push(lf.fid);
            false
        }
    };
    if delete_now {
        vlog.delete_log_file(lf)?;
    }
    Ok(())
}

/// True when the scanned entry is not the copy the LSM tree still cares
/// about: superseded version, tombstoned or expired, inlined value, or a
/// bare transaction-finalizer marker.
pub(crate) fn discard_entry(e: &Entry, vs: &ValueMeta) -> bool {
    if vs.version != parse_ts(&e.key) {
        return true;
    }
    if is_deleted_or_expired(vs.meta, vs.expires_at) {
        return true;
    }
    if vs.meta & BIT_VALUE_POINTER == 0 {
        return true;
    }
    if vs.meta & BIT_FIN_TXN != 0 {
        return true;
    }
    false
}

pub(crate) fn is_deleted_or_expired(meta: u8, expires_at: u64) -> bool {
    if meta & BIT_DELETE != 0 {
        return true;
    }
    if expires_at == 0 {
        return false;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    expires_at <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcConfig, VlogConfig};
    use crate::index::mem::MemIndex;
    use crate::registry::NoRegistry;
    use crate::tmpfs::TempDir;
    use crate::vlog::entry::{key_with_ts, Request};
    use std::collections::HashMap;
    use std::path::Path;

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

    /// Writes `n` random-ish values, registers the pointers in the index,
    /// and freezes the file so it is eligible for collection.
    fn fill_frozen_file(vlog: &ValueLog, index: &MemIndex, n: usize) -> Vec<Vec<u8>> {
        let mut keys = Vec::new();
        let entries: Vec<Entry> = (0..n)
            .map(|i| {
                let key = key_with_ts(format!("key{i:03}").as_bytes(), 1);
                keys.push(key.clone());
                Entry::new(key, vec![i as u8; 32])
            })
            .collect();
        let mut req = Request::new(entries);
        vlog.write(std::slice::from_mut(&mut req)).expect("write");
        for (key, vp) in keys.iter().zip(req.ptrs.iter()) {
            index.put_pointer(key, *vp);
        }
        vlog.force_rotate().expect("rotate");
        keys
    }

    #[test]
    fn test_discard_entry_cases() {
        let key = key_with_ts(b"key", 5);
        let entry = Entry::new(key.clone(), b"value".to_vec());
        let live = ValueMeta {
            version: 5,
            value: ValuePointer { fid: 1, len: 10, offset: 20 }.encode().to_vec(),
            meta: BIT_VALUE_POINTER,
            user_meta: 0,
            expires_at: 0,
        };
        assert!(!discard_entry(&entry, &live));

        // Version mismatch (key rewritten since).
        let mut vs = live.clone();
        vs.version = 6;
        assert!(discard_entry(&entry, &vs));

        // Tombstone.
        let mut vs = live.clone();
        vs.meta |= BIT_DELETE;
        assert!(discard_entry(&entry, &vs));

        // Expired.
        let mut vs = live.clone();
        vs.expires_at = 1;
        assert!(discard_entry(&entry, &vs));

        // Value inlined in the tree.
        let mut vs = live.clone();
        vs.meta = 0;
        assert!(discard_entry(&entry, &vs));

        // Transaction finalizer.
        let mut vs = live.clone();
        vs.meta |= BIT_FIN_TXN;
        assert!(discard_entry(&entry, &vs));
    }

    #[test]
    fn test_no_rewrite_when_file_is_clean() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, index) = open_vlog(test_config(dir.path()));
        fill_frozen_file(&vlog, &index, 50);

        let mut stats = HashMap::new();
        stats.insert(1u32, 1i64);
        vlog.update_discard_stats(&stats).expect("stats");

        assert_eq!(vlog.run_gc(0.5), Err(Error::NoRewrite));
        // The clean file must survive.
        assert!(dir.path().join("000001.vlog").exists());
    }

    #[test]
    fn test_gc_reclaims_deleted_keys() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, index) = open_vlog(test_config(dir.path()));
        let keys = fill_frozen_file(&vlog, &index, 100);

        // Delete keys 0..45 through the tree.
        for key in &keys[..45] {
            index.remove(key);
        }
        let mut stats = HashMap::new();
        stats.insert(1u32, 45 * 60i64);
        vlog.update_discard_stats(&stats).expect("stats");

        vlog.run_gc(0.1).expect("Failed to collect");

        // Survivors were re-inserted through the tree, deleted keys stay gone.
        for (i, key) in keys.iter().enumerate() {
            let meta = index.get_meta(key);
            if i < 45 {
                assert!(meta.is_none(), "key{i:03} should be gone");
            } else {
                let meta = meta.expect("surviving key must be present");
                assert_eq!(meta.value, vec![i as u8; 32]);
                assert_eq!(meta.meta & BIT_VALUE_POINTER, 0);
            }
        }

        // The file is gone, physically and from the view, and its stats
        // were reset.
        assert!(!dir.path().join("000001.vlog").exists());
        assert!(vlog.files.read().map.get(&1).is_none());
        let discard = vlog.discard.as_ref().expect("stats exist");
        assert_eq!(discard.get(1), 0);
    }

    #[test]
    fn test_deferred_delete_waits_for_iterators() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, index) = open_vlog(test_config(dir.path()));
        let keys = fill_frozen_file(&vlog, &index, 60);
        for key in &keys {
            index.remove(key);
        }
        let mut stats = HashMap::new();
        stats.insert(1u32, 60 * 60i64);
        vlog.update_discard_stats(&stats).expect("stats");

        vlog.incr_iterator_count();
        vlog.run_gc(0.1).expect("Failed to collect");

        // Still on disk while the iterator is out.
        let path = dir.path().join("000001.vlog");
        assert!(path.exists());
        assert_eq!(vlog.metrics().pending_deletions, 1);

        // The zero-transition deletes it before returning.
        vlog.decr_iterator_count().expect("Failed to decrement");
        assert!(!path.exists());
        assert_eq!(vlog.metrics().pending_deletions, 0);
    }

    #[test]
    fn test_rewrite_halves_batches_on_txn_too_big() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, index) = open_vlog(test_config(dir.path()));
        fill_frozen_file(&vlog, &index, 150);
        index.set_max_batch(100);

        let mut stats = HashMap::new();
        stats.insert(1u32, 150 * 60i64);
        vlog.update_discard_stats(&stats).expect("stats");

        // Nothing was deleted, so make the whole file "dead enough" by
        // collecting at ratio 0; every live entry still gets rewritten.
        vlog.run_gc(0.0).expect("Failed to collect");

        assert_eq!(index.applied(), 150);
        assert!(index.rejected() > 0);
        assert!(!dir.path().join("000001.vlog").exists());
    }

    #[test]
    fn test_rewrite_refuses_head() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));
        let head = vlog.head_file().expect("head");
        assert!(rewrite(&vlog, &head).is_err());
    }

    #[test]
    fn test_pick_candidates_prefers_max_discard() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, index) = open_vlog(test_config(dir.path()));
        fill_frozen_file(&vlog, &index, 10);
        // A second frozen file so the random fallback has a pool.
        let entries: Vec<Entry> = (0..10)
            .map(|i| Entry::new(key_with_ts(format!("other{i}").as_bytes(), 1), vec![0u8; 32]))
            .collect();
        let mut req = Request::new(entries);
        vlog.write(std::slice::from_mut(&mut req)).expect("write");
        vlog.force_rotate().expect("rotate");

        let mut stats = HashMap::new();
        stats.insert(2u32, 9_999i64);
        vlog.update_discard_stats(&stats).expect("stats");

        let candidates = pick_candidates(&vlog);
        assert!(!candidates.is_empty());
        assert_eq!(candidates[0].fid, 2);
    }

    #[test]
    fn test_single_file_is_never_collected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let (vlog, _index) = open_vlog(test_config(dir.path()));
        // Only the head exists.
        assert_eq!(vlog.run_gc(0.0), Err(Error::NoRewrite));
    }
}
