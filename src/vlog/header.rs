use crate::error::{Error, Result};

/// Worst-case encoded header length: two single-byte fields plus three
/// maximal varints (5 + 5 + 10).
pub(crate) const MAX_HEADER_SIZE: usize = 22;

/// Variable-length record header.
///
/// ```text
/// +------+-----------+---------------+---------------+---------------------+
/// | meta | user_meta | klen (varint) | vlen (varint) | expires_at (varint) |
/// +------+-----------+---------------+---------------+---------------------+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Header {
    pub klen: u32,
    pub vlen: u32,
    pub expires_at: u64,
    pub meta: u8,
    pub user_meta: u8,
}

impl Header {
    /// Appends the encoded header to `buf`, returning the encoded length.
    pub fn encode(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        buf.push(self.meta);
        buf.push(self.user_meta);
        put_uvarint(buf, self.klen as u64);
        put_uvarint(buf, self.vlen as u64);
        put_uvarint(buf, self.expires_at);
        buf.len() - start
    }

    /// Decodes a header from the front of `buf`, returning it with its
    /// encoded length. Short or malformed input yields `Truncate`.
    pub fn decode(buf: &[u8]) -> Result<(Header, usize)> {
        if buf.len() < 2 {
            return Err(Error::Truncate);
        }
        let meta = buf[0];
        let user_meta = buf[1];
        let mut idx = 2;

        let (klen, n) = uvarint(&buf[idx..]).ok_or(Error::Truncate)?;
        idx += n;
        let (vlen, n) = uvarint(&buf[idx..]).ok_or(Error::Truncate)?;
        idx += n;
        let (expires_at, n) = uvarint(&buf[idx..]).ok_or(Error::Truncate)?;
        idx += n;

        if klen > u32::MAX as u64 || vlen > u32::MAX as u64 {
            return Err(Error::Truncate);
        }

        Ok((
            Header {
                klen: klen as u32,
                vlen: vlen as u32,
                expires_at,
                meta,
                user_meta,
            },
            idx,
        ))
    }
}

fn put_uvarint(buf: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        buf.push(x as u8 | 0x80);
        x >>= 7;
    }
    buf.push(x as u8);
}

fn uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut x = 0u64;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == 10 || (i == 9 && b > 1) {
            // Would overflow a u64.
            return None;
        }
        if b < 0x80 {
            return Some((x | (b as u64) << shift, i + 1));
        }
        x |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
