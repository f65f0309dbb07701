//! BLAKE3 integrity digests over package bytes
//!
//! A digest is computed once when a package is stored and recomputed before
//! every release. Equality on [`Digest`] is constant-time.

/// Integrity value for one stored package (32-byte BLAKE3 hash).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Digest(blake3::Hash);

impl Digest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

// Digests never show up in logs or error messages.
impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Digest([REDACTED])")
    }
}

/// Hash a byte slice in one call.
pub fn compute(data: &[u8]) -> Digest {
    Digest(blake3::hash(data))
}

/// Hash a byte slice by feeding the hasher `chunk_size` bytes at a time.
///
/// Produces the same digest as [`compute`]; used where the caller wants the
/// per-step working set bounded by the buffer's chunk size.
pub fn compute_chunked(data: &[u8], chunk_size: usize) -> Digest {
    let mut hasher = blake3::Hasher::new();
    for chunk in data.chunks(chunk_size.max(1)) {
        hasher.update(chunk);
    }
    Digest(hasher.finalize())
}

/// Recompute the digest of `data` and compare it against `expected`.
pub fn verify(data: &[u8], expected: &Digest) -> bool {
    compute(data) == *expected
}

/// [`verify`] with chunked hashing.
pub fn verify_chunked(data: &[u8], expected: &Digest, chunk_size: usize) -> bool {
    compute_chunked(data, chunk_size) == *expected
}
