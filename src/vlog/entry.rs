use byteorder::{BigEndian, ByteOrder};

use crate::errdata;
use crate::error::Result;

/// Set if the key has been deleted.
pub const BIT_DELETE: u8 = 1 << 0;
/// Set if the value is stored in the value log rather than inline.
pub const BIT_VALUE_POINTER: u8 = 1 << 1;
/// Set if earlier versions of this key can be discarded.
pub const BIT_DISCARD_EARLIER_VERSIONS: u8 = 1 << 2;
/// Set by the merge operator; compaction must not drop the entry.
pub const BIT_MERGE_ENTRY: u8 = 1 << 3;
/// Set if the entry is part of a transaction.
pub const BIT_TXN: u8 = 1 << 6;
/// Set on the marker that terminates a transaction in the log.
pub const BIT_FIN_TXN: u8 = 1 << 7;

/// A single key-value record, in memory. `offset` and `header_len` are
/// filled in once the record has been persisted or decoded from disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub meta: u8,
    pub expires_at: u64,
    pub offset: u32,
    pub header_len: u32,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    /// Approximate cost of this entry in the LSM tree, used to bound rewrite
    /// batches. Values below `threshold` are stored inline; larger ones cost
    /// a pointer.
    pub(crate) fn estimate_size(&self, threshold: usize) -> u64 {
        if self.value.len() < threshold {
            (self.key.len() + self.value.len() + 2) as u64
        } else {
            (self.key.len() + ValuePointer::SIZE + 2) as u64
        }
    }
}

/// Appends the 8-byte version suffix to a user key. Versions are stored
/// inverted so keys sort newest-first.
pub fn key_with_ts(key: &[u8], version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 8);
    out.extend_from_slice(key);
    out.extend_from_slice(&(u64::MAX - version).to_be_bytes());
    out
}

/// Extracts the version from a timestamped key. Keys without a suffix parse
/// as version 0.
pub fn parse_ts(key: &[u8]) -> u64 {
    if key.len() <= 8 {
        return 0;
    }
    let ts = BigEndian::read_u64(&key[key.len() - 8..]);
    u64::MAX - ts
}

/// Reference into the value log: file id, on-disk record length, and the
/// byte offset of the record header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValuePointer {
    pub fid: u32,
    pub len: u32,
    pub offset: u32,
}

impl ValuePointer {
    pub const SIZE: usize = 12;

    /// A zero pointer marks a value stored inline in the LSM tree.
    pub fn is_zero(&self) -> bool {
        self.fid == 0 && self.len == 0 && self.offset == 0
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        BigEndian::write_u32(&mut buf[..4], self.fid);
        BigEndian::write_u32(&mut buf[4..8], self.len);
        BigEndian::write_u32(&mut buf[8..], self.offset);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<ValuePointer> {
        if buf.len() < Self::SIZE {
            return errdata!("value pointer needs {} bytes, got {}", Self::SIZE, buf.len());
        }
        Ok(ValuePointer {
            fid: BigEndian::read_u32(&buf[..4]),
            len: BigEndian::read_u32(&buf[4..8]),
            offset: BigEndian::read_u32(&buf[8..]),
        })
    }
}

/// One unit of the write pipeline: entries in, one pointer out per entry.
/// Entries small enough to stay inline get a zero pointer.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub entries: Vec<Entry>,
    pub ptrs: Vec<ValuePointer>,
}

impl Request {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self {
            entries,
            ptrs: Vec::new(),
        }
    }
}
