//! Key derivation: Argon2id passphrase + envelope salt → package key

use argon2::{Algorithm, Argon2, Params, Version};
use onionbox_core::config::CryptoConfig;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::cipher::CipherError;
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit package key derived from a passphrase via Argon2id.
///
/// Zeroized on drop to prevent secrets lingering in memory.
pub struct PackageKey {
    bytes: [u8; KEY_SIZE],
}

impl PackageKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for PackageKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for PackageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&CryptoConfig> for KdfParams {
    fn from(config: &CryptoConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Derive the package key from a passphrase and the envelope salt.
///
/// Deterministic for a given `(passphrase, salt, params)` triple; the salt is
/// random per package and travels in the clear inside the envelope.
pub fn derive_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> Result<PackageKey, CipherError> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CipherError::Kdf(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = PackageKey {
        bytes: [0u8; KEY_SIZE],
    };
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key.bytes)
        .map_err(|e| CipherError::Kdf(format!("Argon2id KDF failed: {e}")))?;

    Ok(key)
}
