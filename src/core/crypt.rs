//! Pre-shared key cipher used by transforming extensions
//!
//! Wire layout (kept byte compatible with existing peers):
//! - key: uppercase hex MD5 digest of the textual key, used as 32 raw bytes
//! - IV: 16 random lowercase hex characters, used as the 16 IV bytes
//! - output: `hex(AES-256-CTR(data)) || IV`, the IV is appended

use aes::cipher::{KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use thiserror::Error;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Length of the textual IV appended to every ciphertext
pub const IV_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptError {
    #[error("ciphertext too short ({0} chars), no room for IV")]
    TooShort(usize),

    #[error("ciphertext is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("ciphertext is not valid UTF-8")]
    Utf8,

    #[error("invalid key or IV length")]
    InvalidLength,
}

fn derive_key(key: &str) -> String {
    hex::encode_upper(Md5::digest(key.as_bytes()))
}

fn apply(key: &str, iv: &[u8], data: &mut [u8]) -> Result<(), CryptError> {
    let key = derive_key(key);
    let mut cipher = Aes256Ctr::new_from_slices(key.as_bytes(), iv)
        .map_err(|_| CryptError::InvalidLength)?;
    cipher.apply_keystream(data);
    Ok(())
}

fn random_iv() -> String {
    // 8 random bytes give exactly 16 hex characters
    hex::encode(rand::random::<[u8; IV_LEN / 2]>())
}

/// Encrypt raw bytes, returning hex ciphertext with the IV appended
pub fn encrypt(data: &[u8], key: &str) -> Result<String, CryptError> {
    encrypt_with_iv(data, key, &random_iv())
}

fn encrypt_with_iv(data: &[u8], key: &str, iv: &str) -> Result<String, CryptError> {
    let mut buf = data.to_vec();
    apply(key, iv.as_bytes(), &mut buf)?;
    let mut out = hex::encode(buf);
    out.push_str(iv);
    Ok(out)
}

/// Decrypt text produced by [`encrypt`] back to raw bytes
pub fn decrypt(text: &str, key: &str) -> Result<Vec<u8>, CryptError> {
    if text.len() < IV_LEN || !text.is_char_boundary(text.len() - IV_LEN) {
        return Err(CryptError::TooShort(text.len()));
    }
    let (body, iv) = text.split_at(text.len() - IV_LEN);
    let mut buf = hex::decode(body)?;
    apply(key, iv.as_bytes(), &mut buf)?;
    Ok(buf)
}

/// Decrypt text produced by [`encrypt`] into a UTF-8 string
pub fn decrypt_to_string(text: &str, key: &str) -> Result<String, CryptError> {
    String::from_utf8(decrypt(text, key)?).map_err(|_| CryptError::Utf8)
}

/// Decrypt a ciphertext carried as raw bytes (e.g. a frame body)
pub fn decrypt_bytes(data: &[u8], key: &str) -> Result<Vec<u8>, CryptError> {
    let text = std::str::from_utf8(data).map_err(|_| CryptError::Utf8)?;
    decrypt(text, key)
}
