//! Ephemeral package storage for onionbox.
//!
//! - [`pinned`]: page-locked memory regions that are zeroed before release
//! - [`buffer`]: one package with its download limit and expiry
//! - [`store`]: the name → buffer registry, download protocol and sweeper
//! - [`pipeline`]: chunked, cancellable ZIP assembly of uploaded files
//! - [`names`]: human-readable package names

pub mod buffer;
pub mod names;
pub mod pinned;
pub mod pipeline;
pub mod store;

pub use buffer::{BufferOptions, SecureBuffer};
pub use pinned::{PinMode, PinnedRegion, RegionWriter};
pub use pipeline::{ChunkPipeline, FileSource, PipelineOptions};
pub use store::{BufferStore, DestroyReason, Package, PublishOptions, StoreOptions, SweepReport};
