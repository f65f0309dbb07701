//! Streaming archive assembly.
//!
//! Producers [`ChunkPipeline::submit`] files into a bounded queue; a single
//! worker task drains it, copying each file in `chunk_size` pieces through a
//! pinned scratch buffer into a ZIP archive that itself lives in pinned
//! memory. Completion is explicit: [`ChunkPipeline::finish`] closes the queue
//! and waits for the worker to drain it.
//!
//! Cancellation is cooperative. The worker checks its token between reads,
//! and dropping an unfinished pipeline cancels it. A cancelled or failed
//! pipeline never yields a partial archive; the region is wiped on drop.

use std::collections::HashSet;
use std::io::{self, Write};

use onionbox_core::config::OnionboxConfig;
use onionbox_core::{BoxError, BoxResult};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::pinned::{PinMode, PinnedRegion, RegionWriter};

/// One uploaded file waiting to be archived.
pub struct FileSource {
    pub name: String,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSource {
    pub fn new<R>(name: impl Into<String>, reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            name: name.into(),
            reader: Box::new(reader),
        }
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub chunk_size: usize,
    pub queue_depth: usize,
    pub pin_mode: PinMode,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&OnionboxConfig::default())
    }
}

impl PipelineOptions {
    pub fn from_config(config: &OnionboxConfig) -> Self {
        Self {
            chunk_size: config.upload.chunk_size,
            queue_depth: config.upload.queue_depth,
            pin_mode: PinMode::from_required(config.store.require_pinning),
        }
    }
}

pub struct ChunkPipeline {
    queue: mpsc::Sender<FileSource>,
    worker: JoinHandle<BoxResult<PinnedRegion>>,
    cancel: CancellationToken,
    guard: DropGuard,
}

impl ChunkPipeline {
    /// Spawn the archive worker.
    ///
    /// The pipeline runs under a child of `cancel`: cancelling the parent
    /// stops it, aborting the pipeline leaves the parent untouched.
    pub fn start(options: PipelineOptions, cancel: &CancellationToken) -> Self {
        let cancel = cancel.child_token();
        let (queue, rx) = mpsc::channel(options.queue_depth.max(1));
        let worker = tokio::spawn(drain_queue(rx, options, cancel.clone()));
        let guard = cancel.clone().drop_guard();
        Self {
            queue,
            worker,
            cancel,
            guard,
        }
    }

    /// Enqueue a file, waiting for queue space.
    ///
    /// Fails with `Cancelled` once the pipeline is cancelled, or with an I/O
    /// error if the worker has already stopped; [`ChunkPipeline::finish`]
    /// then reports the worker's own error.
    pub async fn submit(&self, source: FileSource) -> BoxResult<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BoxError::Cancelled),
            sent = self.queue.send(source) => sent.map_err(|_| {
                BoxError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "archive worker stopped"))
            }),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Close the queue, wait for every queued file to be archived, and return
    /// the finished archive.
    pub async fn finish(self) -> BoxResult<PinnedRegion> {
        let ChunkPipeline {
            queue,
            worker,
            cancel: _,
            guard,
        } = self;
        drop(queue);

        let result = match worker.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(BoxError::Cancelled),
            Err(e) => Err(BoxError::Io(io::Error::other(format!(
                "archive worker panicked: {e}"
            )))),
        };
        guard.disarm();
        result
    }

    /// Cancel the worker and wait for it to discard its partial archive.
    pub async fn abort(self) {
        self.cancel.cancel();
        let ChunkPipeline { queue, worker, .. } = self;
        drop(queue);
        if let Err(e) = worker.await {
            warn!(error = %e, "archive worker did not stop cleanly");
        }
    }
}

async fn drain_queue(
    mut rx: mpsc::Receiver<FileSource>,
    options: PipelineOptions,
    cancel: CancellationToken,
) -> BoxResult<PinnedRegion> {
    let chunk_size = options.chunk_size.max(1);
    let mut chunk = PinnedRegion::zeroed(chunk_size, options.pin_mode)?;
    let mut zip = ZipWriter::new(RegionWriter::new(PinnedRegion::new(options.pin_mode)));
    let entry_options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut names = EntryNames::default();
    let mut files = 0usize;
    let mut total = 0u64;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(files, "archive cancelled");
                return Err(BoxError::Cancelled);
            }
            next = rx.recv() => next,
        };
        let Some(mut source) = next else {
            break;
        };

        let entry = names.assign(&source.name);
        zip.start_file(entry.as_str(), entry_options)
            .map_err(zip_error)?;
        let written =
            copy_chunked(&mut source.reader, &mut zip, chunk.as_mut_slice(), &cancel).await?;
        debug!(entry = %entry, bytes = written, "file archived");
        files += 1;
        total += written;
    }

    let archive = zip.finish().map_err(zip_error)?.into_region();
    chunk.release()?;
    info!(files, bytes = total, archive_bytes = archive.len(), "archive assembled");
    Ok(archive)
}

async fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk: &mut [u8],
    cancel: &CancellationToken,
) -> BoxResult<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: Write,
{
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BoxError::Cancelled),
            read = reader.read(chunk) => read?,
        };
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&chunk[..n])?;
        total += n as u64;
    }
}

fn zip_error(e: zip::result::ZipError) -> BoxError {
    match e {
        zip::result::ZipError::Io(io) => BoxError::Io(io),
        other => BoxError::Io(io::Error::other(other)),
    }
}

/// Assigns archive entry names: path components stripped, duplicates
/// suffixed as `name (2).ext`, empty names replaced with `file`.
#[derive(Debug, Default)]
struct EntryNames {
    used: HashSet<String>,
}

impl EntryNames {
    fn assign(&mut self, requested: &str) -> String {
        let base = sanitize(requested);
        if self.used.insert(base.clone()) {
            return base;
        }

        let (stem, ext) = split_extension(&base);
        let mut n = 2u32;
        loop {
            let candidate = format!("{stem} ({n}){ext}");
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}

fn sanitize(requested: &str) -> String {
    let base = requested
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let base = base.trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(0) | None => (name, ""),
        Some(i) => name.split_at(i),
    }
}
