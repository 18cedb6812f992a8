//! AES-CFB encryption for the stored token blob.
//!
//! Each record is encrypted with a fresh random IV which is prepended to the
//! ciphertext; the whole blob is carried as URL-safe base64. Plaintext is
//! padded to the 16-byte block with PKCS#7-style bytes before encryption, so
//! a decrypt under the wrong key surfaces as an unpad failure rather than a
//! silently wrong token.

use aes::{Aes128, Aes192, Aes256};
use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE},
    Engine,
};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;

/// AES block size in bytes (shared by all key sizes)
const BLOCK_SIZE: usize = 16;

/// Length of a generated site encryption key
const SECRET_LENGTH: usize = 32;

/// Typed failures of the codec. None of these panic; the caller decides
/// whether a failure aborts the OAuth completion or is logged and skipped.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("could not create the cipher, key must be 16, 24 or 32 bytes (got {0})")]
    BadKeyLength(usize),

    #[error("could not decode the message: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("decoded message length must be a multiple of the cipher block size")]
    BlockSize,

    #[error("unpad error, this can happen when an incorrect encryption key is used")]
    Unpad,

    #[error("decrypted data is not valid UTF-8")]
    Utf8,
}

/// Encrypts `plaintext` under `key` and returns URL-safe base64 of
/// IV + ciphertext.
///
/// The key must be a valid AES key (16, 24, or 32 bytes). A fresh IV is
/// drawn from the OS RNG on every call, so encrypting the same plaintext
/// twice yields different ciphertexts.
pub fn encrypt(key: &[u8], plaintext: &str) -> Result<String, CryptoError> {
    let mut buf = pad(plaintext.as_bytes());

    let mut iv = [0u8; BLOCK_SIZE];
    OsRng.fill_bytes(&mut iv);

    cfb_encrypt(key, &iv, &mut buf)?;

    let mut out = Vec::with_capacity(BLOCK_SIZE + buf.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&buf);
    Ok(URL_SAFE.encode(out))
}

/// Reverses [`encrypt`].
///
/// Fails with a decode error on malformed base64, a block-size error when
/// the body (after the IV) is not block-aligned, and an unpad error when the
/// padding does not check out — the signature of a wrong key or corrupted
/// data.
pub fn decrypt(key: &[u8], ciphertext: &str) -> Result<String, CryptoError> {
    let decoded = URL_SAFE.decode(ciphertext)?;

    if decoded.len() < BLOCK_SIZE || decoded.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::BlockSize);
    }

    let (iv, body) = decoded.split_at(BLOCK_SIZE);
    let mut buf = body.to_vec();
    cfb_decrypt(key, iv, &mut buf)?;

    let plaintext = unpad(&buf)?;
    String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::Utf8)
}

/// Produces a new high-entropy site encryption key: 256 random bytes,
/// base64-encoded, truncated to 32 characters.
pub fn generate_secret() -> String {
    let mut raw = [0u8; 256];
    OsRng.fill_bytes(&mut raw);

    let mut secret = BASE64.encode(raw);
    secret.truncate(SECRET_LENGTH);
    secret
}

fn cfb_encrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 => Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(buf),
        24 => Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(buf),
        32 => Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .encrypt(buf),
        n => return Err(CryptoError::BadKeyLength(n)),
    }
    Ok(())
}

fn cfb_decrypt(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), CryptoError> {
    match key.len() {
        16 => Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(buf),
        24 => Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(buf),
        32 => Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| CryptoError::BadKeyLength(key.len()))?
            .decrypt(buf),
        n => return Err(CryptoError::BadKeyLength(n)),
    }
    Ok(())
}

/// PKCS#7-style padding: always appends 1..=16 bytes, each holding the pad
/// length, so the plaintext length is recoverable.
fn pad(src: &[u8]) -> Vec<u8> {
    let padding = BLOCK_SIZE - src.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(src.len() + padding);
    out.extend_from_slice(src);
    out.extend(std::iter::repeat(padding as u8).take(padding));
    out
}

/// Strips the padding; fails when the final byte exceeds the buffer length.
fn unpad(src: &[u8]) -> Result<&[u8], CryptoError> {
    let unpadding = *src.last().ok_or(CryptoError::Unpad)? as usize;
    if unpadding > src.len() {
        return Err(CryptoError::Unpad);
    }
    Ok(&src[..src.len() - unpadding])
}
