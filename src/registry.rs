//! Data-encryption key lookup and the per-record stream cipher.
//!
//! The key registry itself lives outside this crate; the value log only asks
//! it for a data key when creating a file (the latest key) or opening one
//! (the key named by the file header). Key id 0 is reserved and means the
//! file is plaintext.

use aes::{Aes128, Aes192, Aes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;

use crate::errdata;
use crate::error::Result;

/// A data-encryption key handed out by the registry.
#[derive(Clone)]
pub struct DataKey {
    pub key_id: u64,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("DataKey").field("key_id", &self.key_id).finish()
    }
}

pub trait KeyRegistry: Send + Sync {
    /// The key new log files should be encrypted with, or `None` when
    /// encryption is disabled.
    fn latest_data_key(&self) -> Result<Option<DataKey>>;

    /// The key identified by a file header. `None` when the id is unknown.
    fn data_key(&self, key_id: u64) -> Result<Option<DataKey>>;
}

/// Registry used when encryption is disabled.
pub struct NoRegistry;

impl KeyRegistry for NoRegistry {
    fn latest_data_key(&self) -> Result<Option<DataKey>> {
        Ok(None)
    }

    fn data_key(&self, _key_id: u64) -> Result<Option<DataKey>> {
        Ok(None)
    }
}

/// Serves a single fixed key. Suitable for tests and single-key deployments;
/// anything with rotation needs a real registry behind the trait.
pub struct StaticRegistry {
    key: DataKey,
}

impl StaticRegistry {
    /// `key_id` must be non-zero; 0 marks plaintext files.
    pub fn new(key_id: u64, data: Vec<u8>) -> Self {
        debug_assert!(key_id != 0, "key id 0 is reserved for plaintext files");
        Self {
            key: DataKey { key_id, data },
        }
    }
}

impl KeyRegistry for StaticRegistry {
    fn latest_data_key(&self) -> Result<Option<DataKey>> {
        Ok(Some(self.key.clone()))
    }

    fn data_key(&self, key_id: u64) -> Result<Option<DataKey>> {
        if key_id == self.key.key_id {
            Ok(Some(self.key.clone()))
        } else {
            Ok(None)
        }
    }
}

/// AES-CTR keystream applied over a record's key and value bytes. The IV is
/// the file's 12-byte base IV followed by the record offset, so a reader can
/// regenerate the keystream for any record from its pointer alone.
pub(crate) enum Cipher {
    Aes128([u8; 16]),
    Aes192([u8; 24]),
    Aes256([u8; 32]),
}

impl Cipher {
    pub(crate) fn new(key: &[u8]) -> Result<Cipher> {
        match key.len() {
            16 => {
                let mut k = [0u8; 16];
                k.copy_from_slice(key);
                Ok(Cipher::Aes128(k))
            }
            24 => {
                let mut k = [0u8; 24];
                k.copy_from_slice(key);
                Ok(Cipher::Aes192(k))
            }
            32 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(key);
                Ok(Cipher::Aes256(k))
            }
            n => errdata!("data key must be 16, 24 or 32 bytes, got {n}"),
        }
    }

    /// XORs `data` in place with the keystream for the record at `offset`.
    /// Applying it twice round-trips.
    pub(crate) fn xor_block(&self, data: &mut [u8], base_iv: &[u8; 12], offset: u32) {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(base_iv);
        iv[12..].copy_from_slice(&offset.to_be_bytes());

        match self {
            Cipher::Aes128(key) => {
                let mut cipher = Ctr128BE::<Aes128>::new(key.into(), (&iv).into());
                cipher.apply_keystream(data);
            }
            Cipher::Aes192(key) => {
                let mut cipher = Ctr128BE::<Aes192>::new(key.into(), (&iv).into());
                cipher.apply_keystream(data);
            }
            Cipher::Aes256(key) => {
                let mut cipher = Ctr128BE::<Aes256>::new(key.into(), (&iv).into());
                cipher.apply_keystream(data);
            }
        }
    }
}
