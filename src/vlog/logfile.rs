//! A single on-disk value log file.
//!
//! # File Format
//!
//! ```text
//! +---------------------------------------+
//! | key_id (8 bytes) | base_iv (12 bytes) |
//! +---------------------------------------+
//! | Record 1                              |
//! +---------------------------------------+
//! | Record 2                              |
//! +---------------------------------------+
//! | ...                                   |
//! +---------------------------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +------------------+-----------+-------------+------------+
//! | header (varlen)  | key bytes | value bytes | crc32 (4)  |
//! +------------------+-----------+-------------+------------+
//! ```
//!
//! - `key_id` is little-endian; 0 means the file is plaintext
//! - The CRC32 (Castagnoli, big-endian) covers the header and the key/value
//!   bytes exactly as stored, ciphertext included
//! - When encryption is on, the key/value region is XORed with an AES-CTR
//!   keystream derived from `base_iv` and the record offset; header and CRC
//!   stay plaintext
//!
//! The head file is mapped read-write at twice the rotation size so appends
//! never remap; frozen files are mapped read-only at their exact size. The
//! per-file lock guards the mapping's lifetime: readers hold it shared for
//! as long as they borrow record bytes, deletion takes it exclusively.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};
use memmap2::{Mmap, MmapRaw};
use parking_lot::RwLock;
use rand::Rng;

use crate::errdata;
use crate::error::{Error, Result};
use crate::registry::{Cipher, KeyRegistry};
use crate::vlog::entry::{Entry, ValuePointer};
use crate::vlog::header::Header;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// key_id (8 bytes) followed by the 12-byte base IV.
pub(crate) const LOG_HEADER_SIZE: u32 = 20;

const CRC_SIZE: usize = 4;

/// Keys longer than this cannot be valid; hitting one means the scan ran
/// into garbage.
const MAX_KEY_SIZE: u64 = 1 << 16;

/// The file's memory map. Readers access it through the owning lock; the
/// single writer appends past the published size, so the bytes a reader can
/// reach are never concurrently mutated.
pub(crate) enum Mapping {
    Writable(MmapRaw),
    Frozen(Mmap),
    Unmapped,
}

impl Mapping {
    fn len(&self) -> usize {
        match self {
            Mapping::Writable(m) => m.len(),
            Mapping::Frozen(m) => m.len(),
            Mapping::Unmapped => 0,
        }
    }

    /// Borrows `len` bytes at `offset`, or `None` when out of bounds.
    pub(crate) fn slice(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        match self {
            Mapping::Writable(m) => {
                if end > m.len() {
                    return None;
                }
                // SAFETY: the range is inside the mapping, and callers only
                // request bytes below the published watermark, which the
                // writer never touches again.
                Some(unsafe { std::slice::from_raw_parts(m.as_ptr().add(offset), len) })
            }
            Mapping::Frozen(m) => m.get(offset..end),
            Mapping::Unmapped => None,
        }
    }

    /// Copies `data` into the mapping at `offset`. Only the single writer
    /// calls this, and only beyond the published watermark. Returns false
    /// when the write would overrun the mapping or the file is frozen.
    fn copy_from(&self, offset: usize, data: &[u8]) -> bool {
        match self {
            Mapping::Writable(m) => {
                let Some(end) = offset.checked_add(data.len()) else {
                    return false;
                };
                if end > m.len() {
                    return false;
                }
                // SAFETY: in bounds, and no reader can observe this region
                // until the watermark is advanced after the copy.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr(),
                        m.as_mut_ptr().add(offset),
                        data.len(),
                    );
                }
                true
            }
            _ => false,
        }
    }

    fn flush(&self) -> io::Result<()> {
        match self {
            Mapping::Writable(m) => m.flush(),
            _ => Ok(()),
        }
    }
}

pub struct LogFile {
    pub(crate) fid: u32,
    path: PathBuf,
    file: File,
    key_id: u64,
    base_iv: [u8; 12],
    cipher: Option<Cipher>,
    size: AtomicU32,
    write_at: AtomicU32,
    map: Arc<RwLock<Mapping>>,
}

impl LogFile {
    /// Creates a fresh head file: writes the 20-byte file header and maps
    /// the file read-write at `map_len` bytes.
    pub(crate) fn create(
        path: &Path,
        fid: u32,
        map_len: usize,
        registry: &dyn KeyRegistry,
    ) -> Result<LogFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let (key_id, cipher) = match registry.latest_data_key()? {
            Some(dk) => {
                if dk.key_id == 0 {
                    return errdata!("data key id 0 is reserved for plaintext files");
                }
                (dk.key_id, Some(Cipher::new(&dk.data)?))
            }
            None => (0, None),
        };

        let mut base_iv = [0u8; 12];
        rand::thread_rng().fill(&mut base_iv[..]);

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        header[..8].copy_from_slice(&key_id.to_le_bytes());
        header[8..].copy_from_slice(&base_iv);

        file.set_len(map_len as u64)?;
        let mapping = Mapping::Writable(MmapRaw::map_raw(&file)?);
        if !mapping.copy_from(0, &header) {
            return errdata!("mapping of {map_len} bytes too small for the file header");
        }

        Ok(LogFile {
            fid,
            path: path.to_path_buf(),
            file,
            key_id,
            base_iv,
            cipher,
            size: AtomicU32::new(LOG_HEADER_SIZE),
            write_at: AtomicU32::new(LOG_HEADER_SIZE),
            map: Arc::new(RwLock::new(mapping)),
        })
    }

    /// Opens an existing file and maps it at its current size. `writable`
    /// selects a raw read-write mapping so the recovery path can still
    /// truncate and freeze the file.
    pub(crate) fn open(
        path: &Path,
        fid: u32,
        writable: bool,
        registry: &dyn KeyRegistry,
    ) -> Result<LogFile> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let len = file.metadata()?.len();
        if len < LOG_HEADER_SIZE as u64 {
            return errdata!("value log file {path:?} is shorter than its header");
        }
        if len > u32::MAX as u64 {
            return errdata!("value log file {path:?} exceeds the 4GB offset space");
        }

        let mapping = if writable {
            Mapping::Writable(MmapRaw::map_raw(&file)?)
        } else {
            // SAFETY: frozen files are immutable until deleted, and deletion
            // takes the mapping's write lock first.
            Mapping::Frozen(unsafe { Mmap::map(&file)? })
        };

        let header = mapping
            .slice(0, LOG_HEADER_SIZE as usize)
            .ok_or(Error::Truncate)?;
        let mut key_id_bytes = [0u8; 8];
        key_id_bytes.copy_from_slice(&header[..8]);
        let key_id = u64::from_le_bytes(key_id_bytes);
        let mut base_iv = [0u8; 12];
        base_iv.copy_from_slice(&header[8..]);

        let cipher = if key_id == 0 {
            None
        } else {
            match registry.data_key(key_id)? {
                Some(dk) => Some(Cipher::new(&dk.data)?),
                None => return errdata!("no data key registered for key id {key_id}"),
            }
        };

        Ok(LogFile {
            fid,
            path: path.to_path_buf(),
            file,
            key_id,
            base_iv,
            cipher,
            size: AtomicU32::new(len as u32),
            write_at: AtomicU32::new(len as u32),
            map: Arc::new(RwLock::new(mapping)),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u32 {
        self.size.load(Ordering::SeqCst)
    }

    pub(crate) fn map(&self) -> &Arc<RwLock<Mapping>> {
        &self.map
    }

    pub(crate) fn encryption_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    #[cfg(test)]
    pub(crate) fn key_id(&self) -> u64 {
        self.key_id
    }

    /// Regenerates the keystream for the record at `offset` and XORs it over
    /// `kv`. No-op for plaintext files.
    pub(crate) fn decrypt_kv(&self, kv: &mut [u8], offset: u32) {
        if let Some(cipher) = &self.cipher {
            cipher.xor_block(kv, &self.base_iv, offset);
        }
    }

    /// Appends the framed record for `e` to `buf`, encrypting the key/value
    /// region when the file carries a data key. Returns the on-disk length.
    pub(crate) fn encode_entry(&self, buf: &mut Vec<u8>, e: &Entry, offset: u32) -> Result<usize> {
        if e.key.len() as u64 > MAX_KEY_SIZE {
            return errdata!("key of {} bytes exceeds the maximum key size", e.key.len());
        }
        let header = Header {
            klen: e.key.len() as u32,
            vlen: e.value.len() as u32,
            expires_at: e.expires_at,
            meta: e.meta,
            user_meta: e.user_meta,
        };

        let start = buf.len();
        header.encode(buf);
        match &self.cipher {
            Some(cipher) => {
                let mut kv = Vec::with_capacity(e.key.len() + e.value.len());
                kv.extend_from_slice(&e.key);
                kv.extend_from_slice(&e.value);
                cipher.xor_block(&mut kv, &self.base_iv, offset);
                buf.extend_from_slice(&kv);
            }
            None => {
                buf.extend_from_slice(&e.key);
                buf.extend_from_slice(&e.value);
            }
        }
        let crc = CRC32.checksum(&buf[start..]);
        buf.extend_from_slice(&crc.to_be_bytes());
        Ok(buf.len() - start)
    }

    /// Decodes one full record previously produced by `encode_entry`.
    pub(crate) fn decode_entry(&self, data: &[u8], offset: u32) -> Result<Entry> {
        let (entry, consumed) = self.read_record(data, offset)?;
        if consumed as usize != data.len() {
            return errdata!(
                "record at offset {offset} is {consumed} bytes, buffer has {}",
                data.len()
            );
        }
        Ok(entry)
    }

    /// Decodes the record at the front of `data`, which sits at `offset` in
    /// the file. Framing problems surface as `Truncate`, bad checksums as
    /// `ChecksumMismatch`; both stop iteration cleanly.
    fn read_record(&self, data: &[u8], offset: u32) -> Result<(Entry, u32)> {
        let (h, header_len) = Header::decode(data)?;
        if h.klen as u64 > MAX_KEY_SIZE {
            return Err(Error::Truncate);
        }
        let klen = h.klen as usize;
        let vlen = h.vlen as usize;
        let total = header_len + klen + vlen + CRC_SIZE;
        if data.len() < total {
            return Err(Error::Truncate);
        }

        let stored = BigEndian::read_u32(&data[total - CRC_SIZE..total]);
        if CRC32.checksum(&data[..total - CRC_SIZE]) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let mut kv = data[header_len..header_len + klen + vlen].to_vec();
        self.decrypt_kv(&mut kv, offset);
        let value = kv.split_off(klen);

        Ok((
            Entry {
                key: kv,
                value,
                user_meta: h.user_meta,
                meta: h.meta,
                expires_at: h.expires_at,
                offset,
                header_len: header_len as u32,
            },
            total as u32,
        ))
    }

    /// Scans records from `start` (0 means the first record) to the end of
    /// the valid data or the first corruption, invoking `f` per record.
    /// Returns the offset one past the last good record. The callback may
    /// return `Error::Stop` to end the scan early.
    pub(crate) fn iterate<F>(&self, start: u32, mut f: F) -> Result<u32>
    where
        F: FnMut(Entry, ValuePointer) -> Result<()>,
    {
        let start = start.max(LOG_HEADER_SIZE);
        let map = self.map.read();
        let size = (self.size() as usize).min(map.len()) as u32;

        let mut offset = start;
        let mut valid_end = start;
        while offset < size {
            let Some(data) = map.slice(offset as usize, (size - offset) as usize) else {
                break;
            };
            let (entry, consumed) = match self.read_record(data, offset) {
                Ok(decoded) => decoded,
                Err(Error::Truncate) | Err(Error::ChecksumMismatch) => break,
                Err(e) => return Err(e),
            };
            offset += consumed;
            valid_end = offset;

            let vp = ValuePointer {
                fid: self.fid,
                len: consumed,
                offset: entry.offset,
            };
            match f(entry, vp) {
                Ok(()) => {}
                Err(Error::Stop) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(valid_end)
    }

    /// Copies `data` into the mapping at `offset` and publishes the new
    /// size. Called only by the single writer.
    pub(crate) fn append(&self, offset: u32, data: &[u8]) -> Result<()> {
        let end = offset as u64 + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(Error::TxnTooBig);
        }
        let map = self.map.read();
        if !map.copy_from(offset as usize, data) {
            return Err(Error::TxnTooBig);
        }
        self.size.store(end as u32, Ordering::SeqCst);
        self.write_at.store(end as u32, Ordering::SeqCst);
        Ok(())
    }

    /// Flushes dirty pages and fsyncs the file.
    pub(crate) fn sync(&self) -> Result<()> {
        let map = self.map.read();
        map.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Seals the file at `end`: flush, fsync, truncate, and remap read-only.
    /// The file is frozen from here on.
    pub(crate) fn done_writing(&self, end: u32) -> Result<()> {
        let mut map = self.map.write();
        map.flush()?;
        self.file.sync_all()?;

        *map = Mapping::Unmapped;
        self.file.set_len(end as u64)?;
        self.file.sync_all()?;
        // SAFETY: the file is frozen at `end`; nothing writes to it again.
        *map = Mapping::Frozen(unsafe { Mmap::map(&self.file)? });

        self.size.store(end, Ordering::SeqCst);
        self.write_at.store(end, Ordering::SeqCst);
        Ok(())
    }

    /// Unmaps and closes the file, truncating it first when `truncate_to`
    /// is set.
    pub(crate) fn close(&self, truncate_to: Option<u32>) -> Result<()> {
        let mut map = self.map.write();
        map.flush()?;
        *map = Mapping::Unmapped;
        if let Some(end) = truncate_to {
            self.file.set_len(end as u64)?;
            self.file.sync_all()?;
        }
        Ok(())
    }

    /// Unmaps and removes the file from disk.
    pub(crate) fn delete(&self) -> Result<()> {
        let mut map = self.map.write();
        *map = Mapping::Unmapped;
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

impl std::fmt::Debug for LogFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("fid", &self.fid)
            .field("path", &self.path)
            .field("size", &self.size())
            .field("write_at", &self.write_at.load(Ordering::SeqCst))
            .finish()
    }
}
