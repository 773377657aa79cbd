//! Persisted per-file discard statistics.
//!
//! Compaction in the LSM tree learns how many bytes in each value log file
//! are dead and reports them here; the garbage collector asks for the file
//! with the most discardable data. The map is tiny but must survive
//! restarts, so it is persisted as an append-only record log in the value
//! directory, replayed on open and compacted in place once enough records
//! accumulate.
//!
//! ## Record Format
//!
//! ```text
//! +------------+--------------------------------------------+-----------+
//! | length:u32 | op:u8 | fid:u32 | amount:u64                | crc32:u32 |
//! +------------+--------------------------------------------+-----------+
//! ```
//!
//! All integers are big-endian. `op` is either a merge (add `amount` to the
//! file's total) or a clear (the file was deleted; drop its entry). A
//! corrupt tail is truncated on open, like the log files themselves.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use parking_lot::Mutex;

use crate::errdata;
use crate::error::Result;
use crate::vlog::logfile::CRC32;

pub(crate) const DISCARD_FILE: &str = "DISCARD";

const OP_MERGE: u8 = 0x01;
const OP_CLEAR: u8 = 0x02;

/// op + fid + amount.
const PAYLOAD_SIZE: usize = 13;
/// length prefix + crc trailer.
const FRAME_OVERHEAD: usize = 8;

/// Compact once this many records have been appended since the last rewrite.
const COMPACT_MIN_RECORDS: u32 = 1024;

pub(crate) struct DiscardStats {
    inner: Mutex<Inner>,
}

struct Inner {
    stats: HashMap<u32, u64>,
    writer: BufWriter<File>,
    path: PathBuf,
    appended: u32,
}

impl DiscardStats {
    /// Opens (or creates) the stats log in `dir` and replays it. A corrupt
    /// tail is cut off at the last good record.
    pub(crate) fn open(dir: &Path) -> Result<DiscardStats> {
        let path = dir.join(DISCARD_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let mut stats = HashMap::new();
        let mut offset = 0usize;
        while offset + FRAME_OVERHEAD <= buf.len() {
            let plen = BigEndian::read_u32(&buf[offset..offset + 4]) as usize;
            if plen != PAYLOAD_SIZE || offset + FRAME_OVERHEAD + plen > buf.len() {
                break;
            }
            let payload = &buf[offset + 4..offset + 4 + plen];
            let stored = BigEndian::read_u32(&buf[offset + 4 + plen..offset + FRAME_OVERHEAD + plen]);
            if CRC32.checksum(payload) != stored {
                break;
            }

            let fid = BigEndian::read_u32(&payload[1..5]);
            let amount = BigEndian::read_u64(&payload[5..13]);
            match payload[0] {
                OP_MERGE => {
                    *stats.entry(fid).or_insert(0) += amount;
                }
                OP_CLEAR => {
                    stats.remove(&fid);
                }
                op => return errdata!("unknown discard stats op {op:#04x}"),
            }
            offset += FRAME_OVERHEAD + plen;
        }

        if (offset as u64) < buf.len() as u64 {
            tracing::warn!(
                path = ?path,
                offset,
                "truncating corrupt discard stats tail"
            );
            file.set_len(offset as u64)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(DiscardStats {
            inner: Mutex::new(Inner {
                stats,
                writer: BufWriter::new(file),
                path,
                appended: 0,
            }),
        })
    }

    /// Applies a delta for `fid`. A negative delta clears the entry (the
    /// file was deleted); zero is a no-op.
    pub(crate) fn update(&self, fid: u32, delta: i64) -> Result<()> {
        let mut inner = self.inner.lock();
        if delta > 0 {
            *inner.stats.entry(fid).or_insert(0) += delta as u64;
            inner.append(OP_MERGE, fid, delta as u64)?;
        } else if delta < 0 {
            inner.stats.remove(&fid);
            inner.append(OP_CLEAR, fid, 0)?;
        } else {
            return Ok(());
        }

        if inner.appended >= COMPACT_MIN_RECORDS.max(2 * inner.stats.len() as u32) {
            inner.compact()?;
        }
        Ok(())
    }

    /// The file with the most known-dead bytes, `(0, 0)` when nothing has
    /// been reported.
    pub(crate) fn max_discard(&self) -> (u32, u64) {
        let inner = self.inner.lock();
        inner
            .stats
            .iter()
            .max_by_key(|&(_, &bytes)| bytes)
            .map(|(&fid, &bytes)| (fid, bytes))
            .unwrap_or((0, 0))
    }

    #[cfg(test)]
    pub(crate) fn get(&self, fid: u32) -> u64 {
        self.inner.lock().stats.get(&fid).copied().unwrap_or(0)
    }

    /// Flushes buffered records and fsyncs the log.
    pub(crate) fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.writer.flush()?;
        inner.writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl Inner {
    fn append(&mut self, op: u8, fid: u32, amount: u64) -> Result<()> {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload[0] = op;
        BigEndian::write_u32(&mut payload[1..5], fid);
        BigEndian::write_u64(&mut payload[5..13], amount);

        self.writer.write_u32::<BigEndian>(PAYLOAD_SIZE as u32)?;
        self.writer.write_all(&payload)?;
        self.writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
        self.writer.flush()?;

        self.appended += 1;
        Ok(())
    }

    /// Rewrites the log as one merge record per live entry and atomically
    /// swaps it into place.
    fn compact(&mut self) -> Result<()> {
        let tmp_path = self.path.with_extension("compact");
        let tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        {
            let mut writer = BufWriter::new(&tmp);
            let mut fids: Vec<u32> = self.stats.keys().copied().collect();
            fids.sort_unstable();
            for fid in fids {
                let amount = self.stats[&fid];
                let mut payload = [0u8; PAYLOAD_SIZE];
                payload[0] = OP_MERGE;
                BigEndian::write_u32(&mut payload[1..5], fid);
                BigEndian::write_u64(&mut payload[5..13], amount);

                writer.write_u32::<BigEndian>(PAYLOAD_SIZE as u32)?;
                writer.write_all(&payload)?;
                writer.write_u32::<BigEndian>(CRC32.checksum(&payload))?;
            }
            writer.flush()?;
        }
        tmp.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        file.seek(SeekFrom::End(0))?;
        self.writer = BufWriter::new(file);
        self.appended = 0;

        tracing::debug!(entries = self.stats.len(), "compacted discard stats");
        Ok(())
    }
}
