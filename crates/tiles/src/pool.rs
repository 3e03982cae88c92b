use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;
use model::TilePixels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePixelPoolConfig {
    pub max_buffers_per_bucket: usize,
}

impl Default for TilePixelPoolConfig {
    fn default() -> Self {
        Self {
            max_buffers_per_bucket: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TilePixelPoolStats {
    pub allocated: u64,
    pub reused: u64,
    pub released: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    buckets: HashMap<(u32, u32), Vec<TilePixels>>,
    stats: TilePixelPoolStats,
}

/// Free lists of pixel buffers bucketed by `(width, height)`.
///
/// Cloning shares the same pool. Every buffer leaving a tile goes back through
/// here so allocations are reused across tiles of matching size.
#[derive(Debug, Clone)]
pub struct TilePixelPool {
    config: TilePixelPoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl TilePixelPool {
    pub fn new(config: TilePixelPoolConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(PoolState::default())),
        }
    }

    pub fn config(&self) -> TilePixelPoolConfig {
        self.config
    }

    /// Returns a zeroed buffer of the requested size.
    pub fn acquire(&self, width: u32, height: u32) -> TilePixels {
        let reused = {
            let mut state = self.state.lock().expect("tile pixel pool lock poisoned");
            let reused = state
                .buckets
                .get_mut(&(width, height))
                .and_then(Vec::pop);
            if reused.is_some() {
                state.stats.reused += 1;
            } else {
                state.stats.allocated += 1;
            }
            reused
        };
        match reused {
            Some(mut pixels) => {
                pixels.clear();
                pixels
            }
            None => {
                trace!("tile pixel pool allocating {width}x{height}");
                TilePixels::zeroed(width, height)
            }
        }
    }

    pub fn release(&self, pixels: TilePixels) {
        let mut state = self.state.lock().expect("tile pixel pool lock poisoned");
        state.stats.released += 1;
        let limit = self.config.max_buffers_per_bucket;
        let bucket = state.buckets.entry(pixels.bucket()).or_default();
        if bucket.len() < limit {
            bucket.push(pixels);
        } else {
            state.stats.dropped += 1;
        }
    }

    pub fn free_count(&self, width: u32, height: u32) -> usize {
        self.state
            .lock()
            .expect("tile pixel pool lock poisoned")
            .buckets
            .get(&(width, height))
            .map_or(0, Vec::len)
    }

    pub fn total_free(&self) -> usize {
        self.state
            .lock()
            .expect("tile pixel pool lock poisoned")
            .buckets
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn stats(&self) -> TilePixelPoolStats {
        self.state
            .lock()
            .expect("tile pixel pool lock poisoned")
            .stats
    }

    /// Drops every pooled allocation.
    pub fn clear(&self) {
        self.state
            .lock()
            .expect("tile pixel pool lock poisoned")
            .buckets
            .clear();
    }
}

impl Default for TilePixelPool {
    fn default() -> Self {
        Self::new(TilePixelPoolConfig::default())
    }
}
