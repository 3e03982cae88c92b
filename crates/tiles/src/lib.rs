//! Tile lifecycle for the pyramid viewer.
//!
//! [`TileStore`] owns the active tile table together with the decode, upload
//! and recycle queues. [`DecodeWorker`] drains the decode queue on its own
//! thread through a [`TileSource`]. Pixel buffers always round-trip through a
//! shared [`TilePixelPool`].

mod image_source;
mod pool;
mod source;
mod store;
mod worker;

pub use image_source::{DEFAULT_PROXY_EDGE, RgbaImageTileSource, pyramid_level_count};
pub use pool::{TilePixelPool, TilePixelPoolConfig, TilePixelPoolStats};
pub use source::{TileRequest, TileSource, TileSourceError, check_request};
pub use store::{
    DecodeJob, DecodeOutcome, IdleWaker, LayoutDelta, NoopIdleWaker, StoreSnapshot, TileId,
    TileStatus, TileStore,
};
pub use worker::{DecodeWorker, WorkerSpawnError};

#[cfg(test)]
mod tests;
