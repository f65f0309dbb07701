//! One package held in pinned memory, plus its download and expiry bookkeeping.
//!
//! Every read of `content` and every change to `downloads` happens under the
//! buffer's own lock, so concurrent downloads of the same package are totally
//! ordered and a download limit can never be overshot.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use onionbox_core::{BoxError, BoxResult};
use onionbox_crypto::integrity::{self, Digest};
use tokio::sync::Mutex;
use tracing::debug;

use crate::pinned::{PinMode, PinnedRegion};

/// Per-package policy chosen at upload time.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Maximum successful downloads; 0 means unlimited.
    pub download_limit: u64,
    /// Lifetime from creation; `None` means the package never expires.
    pub expires_in: Option<Duration>,
    /// Working-set size for digest and copy passes.
    pub chunk_size: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            download_limit: 0,
            expires_in: None,
            chunk_size: 1024,
        }
    }
}

pub(crate) struct BufferState {
    content: PinnedRegion,
    downloads: u64,
    destroyed: bool,
}

fn limit_hit(limit: u64, downloads: u64) -> bool {
    limit > 0 && downloads >= limit
}

pub struct SecureBuffer {
    name: String,
    encrypted: bool,
    digest: Digest,
    download_limit: u64,
    created_at: SystemTime,
    expires_at: Option<SystemTime>,
    chunk_size: usize,
    pin_mode: PinMode,
    state: Arc<Mutex<BufferState>>,
}

impl SecureBuffer {
    /// Take ownership of `content` and record its digest.
    ///
    /// `content` must already be pinned; the buffer keeps it pinned until
    /// [`SecureBuffer::destroy`].
    pub fn new(
        name: impl Into<String>,
        content: PinnedRegion,
        encrypted: bool,
        options: BufferOptions,
    ) -> Self {
        let chunk_size = options.chunk_size.max(1);
        let created_at = SystemTime::now();
        // An expiry too far out to represent behaves as "never".
        let expires_at = options
            .expires_in
            .and_then(|ttl| created_at.checked_add(ttl));
        let digest = integrity::compute_chunked(content.as_slice(), chunk_size);
        let pin_mode = content.mode();

        Self {
            name: name.into(),
            encrypted,
            digest,
            download_limit: options.download_limit,
            created_at,
            expires_at,
            chunk_size,
            pin_mode,
            state: Arc::new(Mutex::new(BufferState {
                content,
                downloads: 0,
                destroyed: false,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn rename(&mut self, name: String) {
        self.name = name;
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn download_limit(&self) -> u64 {
        self.download_limit
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn has_expiry(&self) -> bool {
        self.expires_at.is_some()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// True iff an expiry is set and `now` is at or past it.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }

    pub async fn downloads(&self) -> u64 {
        self.state.lock().await.downloads
    }

    pub async fn is_limit_reached(&self) -> bool {
        let state = self.state.lock().await;
        limit_hit(self.download_limit, state.downloads)
    }

    /// Non-blocking limit probe for the sweeper; `None` if the buffer is busy.
    pub fn try_is_limit_reached(&self) -> Option<bool> {
        self.state
            .try_lock()
            .ok()
            .map(|state| limit_hit(self.download_limit, state.downloads))
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }

    /// Current content length (0 once destroyed).
    pub async fn len(&self) -> usize {
        self.state.lock().await.content.len()
    }

    /// Verify the stored bytes and copy them into a fresh pinned snapshot.
    ///
    /// The hash-and-copy pass runs on the blocking pool with the buffer's lock
    /// held. Does not count as a download; see [`SecureBuffer::record_download`].
    pub async fn checkout(&self) -> BoxResult<PinnedRegion> {
        let state = self.state.clone().lock_owned().await;
        if state.destroyed {
            return Err(BoxError::NotFound);
        }
        if limit_hit(self.download_limit, state.downloads) {
            return Err(BoxError::LimitReached);
        }

        let digest = self.digest;
        let chunk_size = self.chunk_size;
        let pin_mode = self.pin_mode;
        tokio::task::spawn_blocking(move || -> BoxResult<PinnedRegion> {
            let content = state.content.as_slice();
            if !integrity::verify_chunked(content, &digest, chunk_size) {
                return Err(BoxError::IntegrityFailed);
            }

            let mut snapshot = PinnedRegion::with_capacity(content.len(), pin_mode)?;
            for chunk in content.chunks(chunk_size) {
                snapshot.extend_from_slice(chunk)?;
            }
            Ok(snapshot)
        })
        .await
        .map_err(|e| BoxError::Io(std::io::Error::other(format!("checkout task failed: {e}"))))?
    }

    /// Count one completed download and return the new total.
    ///
    /// Refuses with `LimitReached` if the limit was already hit by a racing
    /// download, and with `NotFound` if the buffer was destroyed meanwhile.
    pub async fn record_download(&self) -> BoxResult<u64> {
        let mut state = self.state.lock().await;
        if state.destroyed {
            return Err(BoxError::NotFound);
        }
        if limit_hit(self.download_limit, state.downloads) {
            return Err(BoxError::LimitReached);
        }
        state.downloads += 1;
        Ok(state.downloads)
    }

    /// Zero, unpin and drop the content. Idempotent.
    pub async fn destroy(&self) -> BoxResult<()> {
        let mut state = self.state.lock().await;
        self.destroy_locked(&mut state)
    }

    /// [`SecureBuffer::destroy`], but give up after `wait` if the lock is busy.
    ///
    /// Returns `Ok(false)` when the wait elapsed without destroying anything.
    pub async fn destroy_within(&self, wait: Duration) -> BoxResult<bool> {
        match tokio::time::timeout(wait, self.state.lock()).await {
            Ok(mut state) => self.destroy_locked(&mut state).map(|()| true),
            Err(_) => Ok(false),
        }
    }

    fn destroy_locked(&self, state: &mut BufferState) -> BoxResult<()> {
        if state.destroyed {
            return Ok(());
        }
        state.content.release()?;
        state.destroyed = true;
        debug!(name = %self.name, "buffer destroyed");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn hold(&self) -> tokio::sync::MutexGuard<'_, BufferState> {
        self.state.lock().await
    }

    #[cfg(test)]
    pub(crate) async fn tamper(&self, index: usize) {
        let mut state = self.state.lock().await;
        state.content.as_mut_slice()[index] ^= 0xFF;
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("name", &self.name)
            .field("encrypted", &self.encrypted)
            .field("download_limit", &self.download_limit)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
