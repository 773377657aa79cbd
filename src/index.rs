//! Interfaces the value log requires from the owning LSM tree.
//!
//! The tree is an external collaborator: the value log only needs to look up
//! the latest record for a key during garbage collection and to push batches
//! of surviving entries back in when a file is rewritten.

use crate::error::Result;
use crate::vlog::Entry;

/// The latest record the LSM tree holds for a key.
///
/// For keys whose value lives in the value log, `value` carries an encoded
/// [`ValuePointer`](crate::vlog::ValuePointer) and `meta` has the
/// value-pointer bit set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMeta {
    pub version: u64,
    pub value: Vec<u8>,
    pub meta: u8,
    pub user_meta: u8,
    pub expires_at: u64,
}

pub trait Index: Send + Sync {
    /// Returns the latest record for `key`. A missing key is not an error;
    /// it yields an empty, zero-version `ValueMeta`.
    fn get(&self, key: &[u8]) -> Result<ValueMeta>;

    /// Applies a batch of re-inserted entries. May fail with
    /// [`Error::TxnTooBig`](crate::Error::TxnTooBig), in which case the
    /// caller retries with smaller batches.
    fn batch_set(&self, entries: &[Entry]) -> Result<()>;
}
