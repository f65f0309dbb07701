//! Whole-package XChaCha20-Poly1305 sealing keyed by an Argon2id passphrase
//!
//! The in-place entry points ([`Cipher::seal_in_place`], [`Cipher::open_in_place`])
//! never allocate for payload bytes, so the caller decides where plaintext
//! and ciphertext live. [`Cipher::encrypt`] and [`Cipher::decrypt`] are the
//! allocating convenience forms.

use std::ops::Range;

use chacha20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Tag, XChaCha20Poly1305, XNonce,
};
use onionbox_core::BoxError;
use rand::RngCore;
use secrecy::SecretString;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::kdf::{derive_key, KdfParams};
use crate::{HEADER_SIZE, NONCE_SIZE, OVERHEAD, SALT_SIZE, TAG_SIZE};

/// Associated data binding every envelope to this format revision.
const AAD: &[u8] = b"onionbox-package-v1";

#[derive(Debug, Error)]
pub enum CipherError {
    /// Wrong passphrase, tampered or truncated envelope. Deliberately opaque.
    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("sealing failed: {0}")]
    Seal(String),
}

impl From<CipherError> for BoxError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::AuthenticationFailed => BoxError::AuthenticationFailed,
            other => BoxError::Crypto(other.to_string()),
        }
    }
}

/// Length of the envelope for a plaintext of `plaintext_len` bytes.
pub fn sealed_len(plaintext_len: usize) -> usize {
    plaintext_len + OVERHEAD
}

/// Passphrase-based package cipher. Holds only KDF parameters; no key state.
#[derive(Debug, Clone, Default)]
pub struct Cipher {
    params: KdfParams,
}

impl Cipher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Seal a framed buffer in place.
    ///
    /// `framed` must be laid out as `[HEADER_SIZE spare][plaintext][TAG_SIZE spare]`.
    /// On return the header holds a fresh salt and nonce, the plaintext has
    /// been replaced by ciphertext and the tail holds the tag.
    pub fn seal_in_place(
        &self,
        framed: &mut [u8],
        passphrase: &SecretString,
    ) -> Result<(), CipherError> {
        if framed.len() < OVERHEAD {
            return Err(CipherError::Seal(format!(
                "framed buffer too short: {} bytes (minimum {OVERHEAD})",
                framed.len()
            )));
        }

        let (header, rest) = framed.split_at_mut(HEADER_SIZE);
        let body_len = rest.len() - TAG_SIZE;
        let (body, tag_out) = rest.split_at_mut(body_len);

        let (salt, nonce_bytes) = header.split_at_mut(SALT_SIZE);
        let mut rng = rand::thread_rng();
        rng.fill_bytes(salt);
        rng.fill_bytes(nonce_bytes);

        let mut salt_arr = [0u8; SALT_SIZE];
        salt_arr.copy_from_slice(salt);
        let key = derive_key(passphrase, &salt_arr, &self.params)?;

        let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(nonce_bytes), AAD, body)
            .map_err(|e| CipherError::Seal(format!("package encryption failed: {e}")))?;
        tag_out.copy_from_slice(tag.as_slice());
        Ok(())
    }

    /// Open an envelope in place, returning the plaintext's range within it.
    ///
    /// On failure the body may be left partially transformed; callers must
    /// treat the buffer as garbage and wipe it.
    pub fn open_in_place(
        &self,
        envelope: &mut [u8],
        passphrase: &SecretString,
    ) -> Result<Range<usize>, CipherError> {
        if envelope.len() < OVERHEAD {
            return Err(CipherError::AuthenticationFailed);
        }

        let body_end = envelope.len() - TAG_SIZE;
        let (head, tag_bytes) = envelope.split_at_mut(body_end);
        let (header, body) = head.split_at_mut(HEADER_SIZE);

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&header[..SALT_SIZE]);
        let nonce = XNonce::from_slice(&header[SALT_SIZE..SALT_SIZE + NONCE_SIZE]);
        let key = derive_key(passphrase, &salt, &self.params)?;

        let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
        cipher
            .decrypt_in_place_detached(nonce, AAD, body, Tag::from_slice(tag_bytes))
            .map_err(|_| {
                tracing::debug!(envelope_len = body_end + TAG_SIZE, "package authentication failed");
                CipherError::AuthenticationFailed
            })?;

        Ok(HEADER_SIZE..body_end)
    }

    /// Encrypt `plaintext` into a freshly allocated envelope.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        passphrase: &SecretString,
    ) -> Result<Vec<u8>, CipherError> {
        let mut framed = vec![0u8; sealed_len(plaintext.len())];
        framed[HEADER_SIZE..HEADER_SIZE + plaintext.len()].copy_from_slice(plaintext);
        if let Err(e) = self.seal_in_place(&mut framed, passphrase) {
            zeroize::Zeroize::zeroize(&mut framed);
            return Err(e);
        }
        Ok(framed)
    }

    /// Decrypt an envelope produced by [`Cipher::encrypt`] or [`Cipher::seal_in_place`].
    pub fn decrypt(
        &self,
        envelope: &[u8],
        passphrase: &SecretString,
    ) -> Result<Zeroizing<Vec<u8>>, CipherError> {
        let mut work = Zeroizing::new(envelope.to_vec());
        let range = self.open_in_place(&mut work, passphrase)?;
        Ok(Zeroizing::new(work[range].to_vec()))
    }
}
