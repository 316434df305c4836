// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Symmetric packet encryption.
use super::{config::valid_key_len, proto::MessageType};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use bytes::{BufMut, Bytes, BytesMut};
use rand::{thread_rng, RngCore};
use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
};
use thiserror::Error;

const VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 2 + NONCE_LEN;

/// Returns how many bytes encryption adds to a frame.
pub(crate) const fn overhead() -> usize {
    HEADER_LEN + TAG_LEN
}

/// An error returned by [Keyring] operations.
#[derive(Debug, Error)]
pub enum KeyringError {
    /// Keys must be 16 (AES-128) or 32 (AES-256) bytes.
    #[error("key must be 16 or 32 bytes, got {}", .0)]
    KeySize(usize),

    /// A keyring must hold at least one key.
    #[error("keyring is empty")]
    Empty,

    /// The key isn't installed.
    #[error("key is not installed")]
    UnknownKey,

    /// The primary key can't be removed; install another one with
    /// [use_key](Keyring::use_key) first.
    #[error("cannot remove the primary key")]
    RemovePrimary,

    /// The frame was produced by an unknown encryption version.
    #[error("unknown encryption version: {}", .0)]
    Version(u8),

    /// The frame is too short to be an encrypted frame.
    #[error("truncated encrypted frame")]
    Truncated,

    /// No installed key could decrypt the frame.
    #[error("no installed key could decrypt the frame")]
    Decrypt,

    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
}

#[derive(Clone)]
enum Cipher {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

#[derive(Clone)]
struct Key {
    raw: Vec<u8>,
    cipher: Cipher,
}

impl Key {
    fn new(raw: &[u8]) -> Result<Self, KeyringError> {
        let bad_len = || KeyringError::KeySize(raw.len());

        if !valid_key_len(raw.len()) {
            return Err(bad_len());
        }

        let cipher = match raw.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(raw).map_err(|_| bad_len())?),
            _ => Cipher::Aes256(Aes256Gcm::new_from_slice(raw).map_err(|_| bad_len())?),
        };

        Ok(Self {
            raw: raw.to_vec(),
            cipher,
        })
    }

    fn encrypt(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = Nonce::from_slice(nonce);

        match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(nonce, payload),
            Cipher::Aes256(c) => c.encrypt(nonce, payload),
        }
    }

    fn decrypt(&self, nonce: &[u8], payload: Payload<'_, '_>) -> Result<Vec<u8>, aes_gcm::Error> {
        let nonce = Nonce::from_slice(nonce);

        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, payload),
            Cipher::Aes256(c) => c.decrypt(nonce, payload),
        }
    }
}

/// An ordered set of symmetric keys.
///
/// The first key (the primary) encrypts outgoing frames. Every key is tried when
/// decrypting, so keys can be rotated across a cluster without downtime:
///
/// 1. [add_key](Keyring::add_key) the new key on every node.
/// 2. [use_key](Keyring::use_key) the new key on every node.
/// 3. [remove_key](Keyring::remove_key) the old key on every node.
///
/// Readers never block on rotation; every mutation swaps in a new copy of the key list.
/// Cloning a keyring is cheap, and clones share the same keys.
#[derive(Clone)]
pub struct Keyring {
    keys: Arc<RwLock<Arc<Vec<Key>>>>,
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("keys", &self.load().len())
            .finish()
    }
}

impl Keyring {
    /// Create a keyring. The first key is the primary key.
    pub fn new<K: AsRef<[u8]>>(keys: &[K]) -> Result<Self, KeyringError> {
        if keys.is_empty() {
            return Err(KeyringError::Empty);
        }

        let mut ring: Vec<Key> = Vec::with_capacity(keys.len());
        for raw in keys {
            let raw: &[u8] = raw.as_ref();
            if ring.iter().all(|k| k.raw != raw) {
                ring.push(Key::new(raw)?);
            }
        }

        Ok(Self {
            keys: Arc::new(RwLock::new(Arc::new(ring))),
        })
    }

    fn load(&self) -> Arc<Vec<Key>> {
        Arc::clone(&self.keys.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn update<F>(&self, f: F) -> Result<(), KeyringError>
    where F: FnOnce(&mut Vec<Key>) -> Result<(), KeyringError> {
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::clone(&keys);
        f(&mut next)?;
        *keys = Arc::new(next);
        Ok(())
    }

    /// Install a key for decryption. Installing a key twice is a no-op.
    pub fn add_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        let key = Key::new(key)?;

        self.update(|keys| {
            if keys.iter().all(|k| k.raw != key.raw) {
                keys.push(key);
            }
            Ok(())
        })
    }

    /// Make an installed key the primary key.
    pub fn use_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        self.update(|keys| {
            let i = (keys.iter().position(|k| k.raw == key)).ok_or(KeyringError::UnknownKey)?;
            let k = keys.remove(i);
            keys.insert(0, k);
            Ok(())
        })
    }

    /// Remove an installed key. The primary key can't be removed.
    pub fn remove_key(&self, key: &[u8]) -> Result<(), KeyringError> {
        self.update(|keys| match keys.iter().position(|k| k.raw == key) {
            Some(0) => Err(KeyringError::RemovePrimary),
            Some(i) => {
                keys.remove(i);
                Ok(())
            }
            None => Err(KeyringError::UnknownKey),
        })
    }

    /// Returns the primary key.
    pub fn primary_key(&self) -> Vec<u8> {
        self.load()
            .first()
            .map(|k| k.raw.clone())
            .unwrap_or_default()
    }

    /// Returns every installed key, primary first.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.load().iter().map(|k| k.raw.clone()).collect()
    }

    /// Wrap `frame` in an encrypted frame using the primary key.
    pub(crate) fn encrypt(&self, frame: &[u8]) -> Result<Bytes, KeyringError> {
        let keys = self.load();
        let key = keys.first().ok_or(KeyringError::Empty)?;

        let mut nonce = [0; NONCE_LEN];
        thread_rng().fill_bytes(&mut nonce);

        let aad = [MessageType::Encrypt as u8, VERSION];
        let payload = Payload { msg: frame, aad: &aad };
        let sealed = key.encrypt(&nonce, payload).map_err(|_| KeyringError::Encrypt)?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + sealed.len());
        buf.put_slice(&aad);
        buf.put_slice(&nonce);
        buf.put_slice(&sealed);

        Ok(buf.freeze())
    }

    /// Remove the encryption layer from an encrypted frame (including its tag), trying
    /// each installed key in order.
    pub(crate) fn decrypt(&self, frame: &[u8]) -> Result<Bytes, KeyringError> {
        if frame.len() < HEADER_LEN + TAG_LEN {
            return Err(KeyringError::Truncated);
        }
        if frame[1] != VERSION {
            return Err(KeyringError::Version(frame[1]));
        }

        let (aad, rest) = frame.split_at(2);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        self.load()
            .iter()
            .find_map(|k| k.decrypt(nonce, Payload { msg: sealed, aad }).ok())
            .map(Bytes::from)
            .ok_or(KeyringError::Decrypt)
    }
}
