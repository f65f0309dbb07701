//! onionbox-crypto: passphrase encryption and integrity digests for packages
//!
//! Envelope layout produced by [`Cipher`]:
//! ```text
//! [16 bytes: Argon2id salt][24 bytes: XChaCha20 nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! ```
//!
//! The whole serialized archive is sealed as one blob. Both sealing and
//! opening work in place so callers can keep plaintext inside pinned memory.

pub mod cipher;
pub mod integrity;
pub mod kdf;

pub use cipher::{Cipher, CipherError};
pub use integrity::Digest;
pub use kdf::{derive_key, KdfParams, PackageKey};

/// Size of a derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the Argon2id salt stored in the envelope
pub const SALT_SIZE: usize = 16;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes in front of the ciphertext
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;

/// Total envelope overhead over the plaintext length
pub const OVERHEAD: usize = HEADER_SIZE + TAG_SIZE;
