//! Registry of live packages, keyed by public name.
//!
//! Locking is two-tier. The store's `RwLock` covers structural changes to the
//! map (insert, remove); each [`SecureBuffer`] has its own lock for content
//! and counters. Lock order is always store → buffer, never the reverse.
//!
//! Invariant: an entry present in the map refers to a buffer that has not
//! been destroyed. Destroy + remove happen together under the write lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use onionbox_core::config::OnionboxConfig;
use onionbox_core::{BoxError, BoxResult};
use onionbox_crypto::cipher::sealed_len;
use onionbox_crypto::{Cipher, KdfParams, HEADER_SIZE};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferOptions, SecureBuffer};
use crate::names;
use crate::pinned::{PinMode, PinnedRegion};

/// Runtime knobs for a [`BufferStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub sweep_interval: Duration,
    /// Longest the sweeper waits on one buffer's lock before skipping it.
    pub sweep_lock_wait: Duration,
    pub name_attempts: u32,
    pub pin_mode: PinMode,
    pub chunk_size: usize,
    pub kdf: KdfParams,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&OnionboxConfig::default())
    }
}

impl StoreOptions {
    pub fn from_config(config: &OnionboxConfig) -> Self {
        Self {
            sweep_interval: Duration::from_secs(config.store.sweep_interval_secs),
            sweep_lock_wait: Duration::from_millis(config.store.sweep_lock_wait_ms),
            name_attempts: config.store.name_attempts,
            pin_mode: PinMode::from_required(config.store.require_pinning),
            chunk_size: config.upload.chunk_size,
            kdf: KdfParams::from(&config.crypto),
        }
    }
}

/// Upload-time policy for [`BufferStore::publish`].
#[derive(Debug, Default)]
pub struct PublishOptions {
    pub passphrase: Option<SecretString>,
    pub download_limit: u64,
    pub expires_in: Option<Duration>,
}

/// Decoded package bytes handed to a downloader.
#[derive(Debug)]
pub struct Package {
    pub name: String,
    pub bytes: PinnedRegion,
    /// Downloads recorded so far, including this one.
    pub downloads: u64,
    /// This download used up the limit and the package is gone.
    pub exhausted: bool,
}

impl Package {
    pub fn content_type(&self) -> &'static str {
        "application/zip"
    }

    pub fn file_name(&self) -> String {
        format!("{}.zip", self.name)
    }
}

/// Why a buffer is being destroyed, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    Expired,
    LimitReached,
    Shutdown,
}

impl DestroyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DestroyReason::Expired => "expired",
            DestroyReason::LimitReached => "limit",
            DestroyReason::Shutdown => "shutdown",
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub exhausted: usize,
    /// Buffers left for the next pass because their lock stayed busy.
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    pub fn destroyed(&self) -> usize {
        self.expired + self.exhausted
    }
}

pub struct BufferStore {
    entries: RwLock<HashMap<String, Arc<SecureBuffer>>>,
    cipher: Cipher,
    options: StoreOptions,
}

impl BufferStore {
    pub fn new(options: StoreOptions) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            cipher: Cipher::new(options.kdf.clone()),
            options,
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// Register a buffer. Never replaces a live entry of the same name.
    pub async fn add(&self, buffer: Arc<SecureBuffer>) -> BoxResult<()> {
        let mut entries = self.entries.write().await;
        match entries.entry(buffer.name().to_owned()) {
            Entry::Occupied(_) => Err(BoxError::NameCollision(buffer.name().to_owned())),
            Entry::Vacant(slot) => {
                slot.insert(buffer);
                Ok(())
            }
        }
    }

    pub async fn get(&self, name: &str) -> BoxResult<Arc<SecureBuffer>> {
        self.entries
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(BoxError::NotFound)
    }

    pub async fn exists(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Entry count without waiting; `None` while a writer holds the map.
    pub fn try_len(&self) -> Option<usize> {
        self.entries.try_read().ok().map(|entries| entries.len())
    }

    /// Destroy `buffer` and remove it from the map as one step.
    ///
    /// If destruction fails the entry stays registered (its content is
    /// already zeroed) so a later call or sweep can retry.
    pub async fn destroy(&self, buffer: &SecureBuffer) -> BoxResult<()> {
        let mut entries = self.entries.write().await;
        buffer.destroy().await?;
        remove_if_same(&mut entries, buffer);
        Ok(())
    }

    /// Destroy every live buffer. Used at shutdown.
    ///
    /// Keeps going past failures and reports the first one.
    pub async fn destroy_all(&self) -> BoxResult<usize> {
        let mut entries = self.entries.write().await;
        let names: Vec<String> = entries.keys().cloned().collect();
        let mut destroyed = 0;
        let mut first_err = None;

        for name in names {
            let Some(buffer) = entries.get(&name).cloned() else {
                continue;
            };
            match buffer.destroy().await {
                Ok(()) => {
                    entries.remove(&name);
                    destroyed += 1;
                }
                Err(e) => {
                    error!(name = %name, kind = %e.kind(), error = %e, "failed to destroy buffer");
                    first_err.get_or_insert(e);
                }
            }
        }

        info!(destroyed, remaining = entries.len(), "destroyed all buffers");
        match first_err {
            Some(e) => Err(e),
            None => Ok(destroyed),
        }
    }

    /// One sweep pass: evict expired and limit-exhausted buffers.
    ///
    /// Candidates are collected under the read lock; each eviction then takes
    /// the write lock on its own and waits at most `sweep_lock_wait` for the
    /// buffer's lock.
    pub async fn sweep_expired(&self) -> SweepReport {
        let now = SystemTime::now();
        let candidates: Vec<Arc<SecureBuffer>> =
            self.entries.read().await.values().cloned().collect();
        let mut report = SweepReport::default();

        for buffer in candidates {
            let reason = if buffer.is_expired_at(now) {
                DestroyReason::Expired
            } else if buffer.try_is_limit_reached() == Some(true) {
                DestroyReason::LimitReached
            } else {
                continue;
            };

            let mut entries = self.entries.write().await;
            let live = entries
                .get(buffer.name())
                .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), Arc::as_ptr(&buffer)));
            if !live {
                continue;
            }

            match buffer.destroy_within(self.options.sweep_lock_wait).await {
                Ok(true) => {
                    entries.remove(buffer.name());
                    debug!(name = %buffer.name(), reason = reason.as_str(), "swept buffer");
                    match reason {
                        DestroyReason::Expired => report.expired += 1,
                        _ => report.exhausted += 1,
                    }
                }
                Ok(false) => {
                    debug!(name = %buffer.name(), "buffer busy, retrying next sweep");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(
                        name = %buffer.name(),
                        kind = %e.kind(),
                        error = %e,
                        "sweep failed to destroy buffer"
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Sweep every `sweep_interval` until `cancel` fires.
    pub async fn run_sweeper<F>(&self, cancel: CancellationToken, mut on_report: F)
    where
        F: FnMut(&SweepReport) + Send,
    {
        let mut ticker = tokio::time::interval(self.options.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.options.sweep_interval, "sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sweeper stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep_expired().await;
                    if report.destroyed() > 0 || report.failed > 0 {
                        info!(
                            expired = report.expired,
                            exhausted = report.exhausted,
                            skipped = report.skipped,
                            failed = report.failed,
                            "sweep complete"
                        );
                    }
                    on_report(&report);
                }
            }
        }
    }

    /// Seal (optionally) and register an assembled archive under a fresh name.
    pub async fn publish(
        &self,
        archive: PinnedRegion,
        options: PublishOptions,
    ) -> BoxResult<String> {
        let (content, encrypted) = match options.passphrase {
            Some(passphrase) => (self.seal(archive, passphrase).await?, true),
            None => (archive, false),
        };

        let buffer = SecureBuffer::new(
            names::generate(&mut rand::thread_rng()),
            content,
            encrypted,
            BufferOptions {
                download_limit: options.download_limit,
                expires_in: options.expires_in,
                chunk_size: self.options.chunk_size,
            },
        );
        let buffer = self.insert_unique(buffer).await?;

        info!(
            name = %buffer.name(),
            encrypted,
            download_limit = buffer.download_limit(),
            expires = buffer.has_expiry(),
            "package stored"
        );
        Ok(buffer.name().to_owned())
    }

    async fn insert_unique(&self, mut buffer: SecureBuffer) -> BoxResult<Arc<SecureBuffer>> {
        let mut entries = self.entries.write().await;
        for _ in 0..self.options.name_attempts {
            if let Entry::Vacant(slot) = entries.entry(buffer.name().to_owned()) {
                let buffer = Arc::new(buffer);
                slot.insert(buffer.clone());
                return Ok(buffer);
            }
            debug!(name = %buffer.name(), "name collision, regenerating");
            buffer.rename(names::generate(&mut rand::thread_rng()));
        }
        drop(entries);

        let name = buffer.name().to_owned();
        buffer.destroy().await?;
        Err(BoxError::NameCollision(name))
    }

    /// Fetch, verify, decrypt and count one download of `name`.
    ///
    /// A wrong or missing passphrase does not consume a download. The call
    /// that reaches the limit destroys and evicts the buffer.
    pub async fn download(
        &self,
        name: &str,
        passphrase: Option<&SecretString>,
    ) -> BoxResult<Package> {
        let buffer = self.get(name).await?;

        if buffer.is_expired() {
            self.evict(&buffer, DestroyReason::Expired).await;
            return Err(BoxError::NotFound);
        }

        let snapshot = match buffer.checkout().await {
            Ok(snapshot) => snapshot,
            Err(BoxError::LimitReached) => {
                self.evict(&buffer, DestroyReason::LimitReached).await;
                return Err(BoxError::LimitReached);
            }
            Err(e) => return Err(e),
        };

        let bytes = if buffer.is_encrypted() {
            let Some(passphrase) = passphrase else {
                return Err(BoxError::AuthenticationFailed);
            };
            let passphrase = SecretString::from(passphrase.expose_secret().to_owned());
            self.open(snapshot, passphrase).await?
        } else {
            snapshot
        };

        match buffer.record_download().await {
            Ok(downloads) => {
                let exhausted = buffer.download_limit() > 0 && downloads >= buffer.download_limit();
                if exhausted {
                    self.evict(&buffer, DestroyReason::LimitReached).await;
                }
                Ok(Package {
                    name: buffer.name().to_owned(),
                    bytes,
                    downloads,
                    exhausted,
                })
            }
            Err(BoxError::LimitReached) => {
                self.evict(&buffer, DestroyReason::LimitReached).await;
                Err(BoxError::LimitReached)
            }
            Err(e) => Err(e),
        }
    }

    /// Destroy + remove, logging instead of propagating failure.
    ///
    /// The entry stays registered on failure and the sweeper retries it.
    async fn evict(&self, buffer: &SecureBuffer, reason: DestroyReason) {
        match self.destroy(buffer).await {
            Ok(()) => info!(name = %buffer.name(), reason = reason.as_str(), "package destroyed"),
            Err(e) => error!(
                name = %buffer.name(),
                reason = reason.as_str(),
                kind = %e.kind(),
                error = %e,
                "failed to destroy package, sweeper will retry"
            ),
        }
    }

    async fn seal(&self, archive: PinnedRegion, passphrase: SecretString) -> BoxResult<PinnedRegion> {
        let mut archive = archive;
        let mut framed =
            PinnedRegion::with_capacity(sealed_len(archive.len()), self.options.pin_mode)?;
        framed.resize_zeroed(HEADER_SIZE)?;
        framed.extend_from_slice(archive.as_slice())?;
        framed.resize_zeroed(sealed_len(archive.len()))?;
        archive.release()?;

        let cipher = self.cipher.clone();
        tokio::task::spawn_blocking(move || -> BoxResult<PinnedRegion> {
            let mut framed = framed;
            cipher.seal_in_place(framed.as_mut_slice(), &passphrase)?;
            Ok(framed)
        })
        .await
        .map_err(|e| BoxError::Crypto(format!("seal task failed: {e}")))?
    }

    async fn open(&self, envelope: PinnedRegion, passphrase: SecretString) -> BoxResult<PinnedRegion> {
        let cipher = self.cipher.clone();
        tokio::task::spawn_blocking(move || -> BoxResult<PinnedRegion> {
            let mut region = envelope;
            let range = cipher.open_in_place(region.as_mut_slice(), &passphrase)?;
            let len = range.len();
            region.as_mut_slice().copy_within(range, 0);
            region.truncate(len);
            Ok(region)
        })
        .await
        .map_err(|e| BoxError::Crypto(format!("open task failed: {e}")))?
    }
}

fn remove_if_same(entries: &mut HashMap<String, Arc<SecureBuffer>>, buffer: &SecureBuffer) {
    let same = entries
        .get(buffer.name())
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), buffer));
    if same {
        entries.remove(buffer.name());
    } else {
        warn!(name = %buffer.name(), "destroyed buffer was no longer registered");
    }
}
