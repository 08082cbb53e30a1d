//! Connection string vault.
//!
//! Keeps a connection string in memory only as AES-256-CBC ciphertext under a
//! random per-write key. The plaintext exists only inside `set`/`get` and in
//! whatever the caller does with the returned `String`.
//!
//! # Security
//!
//! This is obfuscation, not protection. The key lives right next to the
//! ciphertext and the IV is derived from the key, so anyone able to read the
//! process memory can recover the string. What it prevents is the plaintext
//! showing up in casual memory inspection, `Debug` output or logs.

use crate::core::{DbDataError, Result};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{Rng, RngCore};
use std::fmt;
use zeroize::Zeroizing;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;
/// Start of the IV window inside the base64 form of the key
const IV_OFFSET: usize = 7;

/// Encrypted holder for a connection string
pub struct ConnectionStringVault {
    key: Zeroizing<[u8; KEY_LEN]>,
    cipher: Option<Zeroizing<Vec<u8>>>,
}

impl ConnectionStringVault {
    /// Creates an empty vault; `get` returns an empty string
    pub fn new() -> Self {
        ConnectionStringVault {
            key: Zeroizing::new([0u8; KEY_LEN]),
            cipher: None,
        }
    }

    /// Creates a vault holding `connection_string`
    pub fn with_connection_string(connection_string: &str) -> Result<Self> {
        let mut vault = Self::new();
        vault.set(connection_string)?;
        Ok(vault)
    }

    /// Decrypts and returns the stored connection string.
    ///
    /// Returns an empty string without touching the cipher when nothing is
    /// stored.
    ///
    /// # Errors
    ///
    /// `DbDataError::Config` if the cipher cannot be created or the stored
    /// ciphertext does not decrypt.
    pub fn get(&self) -> Result<String> {
        match &self.cipher {
            Some(cipher) => decrypt(&self.key, cipher),
            None => Ok(String::new()),
        }
    }

    /// Encrypts and stores `value` under a freshly generated key.
    ///
    /// The previous key and ciphertext are discarded (and zeroed) even when
    /// `value` is empty, in which case no ciphertext is stored.
    pub fn set(&mut self, value: &str) -> Result<()> {
        let key = generate_key();
        let cipher = if value.is_empty() {
            None
        } else {
            Some(Zeroizing::new(encrypt(&key, value)?))
        };
        self.key = key;
        self.cipher = cipher;
        Ok(())
    }

    /// True when no connection string is stored
    pub fn is_empty(&self) -> bool {
        self.cipher.is_none()
    }

    /// Drops (and zeroes) the key and the ciphertext
    pub fn clear(&mut self) {
        self.key = Zeroizing::new([0u8; KEY_LEN]);
        self.cipher = None;
    }

    /// The stored ciphertext, if any
    pub fn ciphertext(&self) -> Option<&[u8]> {
        self.cipher.as_ref().map(|cipher| cipher.as_slice())
    }
}

impl Default for ConnectionStringVault {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionStringVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionStringVault")
            .field("is_empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

/// 32 random bytes, none of them zero
fn generate_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut rng = rand::rng();
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    rng.fill_bytes(key.as_mut_slice());
    for byte in key.iter_mut().filter(|byte| **byte == 0) {
        *byte = rng.random_range(1..=u8::MAX);
    }
    key
}

/// ASCII bytes of `base64(key)[7..23]`, reversed
fn derive_iv(key: &[u8; KEY_LEN]) -> Zeroizing<[u8; IV_LEN]> {
    let encoded = Zeroizing::new(STANDARD.encode(key));
    let mut iv = Zeroizing::new([0u8; IV_LEN]);
    iv.copy_from_slice(&encoded.as_bytes()[IV_OFFSET..IV_OFFSET + IV_LEN]);
    iv.reverse();
    iv
}

fn encrypt(key: &[u8; KEY_LEN], plain_text: &str) -> Result<Vec<u8>> {
    let iv = derive_iv(key);
    let cipher = Aes256CbcEnc::new_from_slices(key.as_slice(), iv.as_slice())
        .map_err(|e| DbDataError::Config(format!("cannot create AES encryptor: {e}")))?;
    Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain_text.as_bytes()))
}

fn decrypt(key: &[u8; KEY_LEN], cipher_text: &[u8]) -> Result<String> {
    let iv = derive_iv(key);
    let cipher = Aes256CbcDec::new_from_slices(key.as_slice(), iv.as_slice())
        .map_err(|e| DbDataError::Config(format!("cannot create AES decryptor: {e}")))?;
    let plain = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
        .map_err(|_| DbDataError::Config("stored connection string does not decrypt".to_string()))?;
    String::from_utf8(plain).map_err(|e| {
        drop(Zeroizing::new(e.into_bytes()));
        DbDataError::Config("stored connection string is not valid UTF-8".to_string())
    })
}
