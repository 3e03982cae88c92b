//! Drawing the tile pyramid.
//!
//! [`TileRenderer`] walks the visible tiles of a layout plan and draws each one
//! through a [`TileCanvas`], falling back to a resident ancestor, the proxy
//! image or a placeholder. [`upload_on_idle`] drains decoded tiles to the
//! canvas under the upload scheduler's quota. [`WgpuTileCanvas`] is the GPU
//! implementation of the canvas.

use model::{ProxyImage, RectF, TextureSlot, TilePixels};

mod atlas_slots;
mod fallback;
mod frame;
mod idle;
mod wgpu_canvas;

pub use atlas_slots::AtlasSlotAllocator;
pub use frame::TileRenderer;
pub use idle::upload_on_idle;
pub use wgpu_canvas::{TileQuadGpu, WgpuTileCanvas, WgpuTileCanvasConfig, WgpuTileCanvasError};

/// View-wide parameters of one frame. Target rectangles handed to the canvas
/// are unrotated screen space; the canvas rotates them about the view center.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTransform {
    pub view_width: u32,
    pub view_height: u32,
    pub rotation_degrees: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TileUploadError {
    #[error("tile atlas has no free slot")]
    AtlasFull,
    #[error("tile upload is {width}x{height}, atlas slots are {tile_size}x{tile_size}")]
    SizeMismatch {
        width: u32,
        height: u32,
        tile_size: u32,
    },
    #[error("gpu context lost")]
    ContextLost,
}

/// Drawing surface for tiles.
///
/// Source rectangles for `draw_tile` are texel coordinates inside the uploaded
/// tile; for `draw_proxy` they are proxy image pixels.
pub trait TileCanvas {
    fn begin_frame(&mut self, transform: &FrameTransform);
    fn upload_tile(&mut self, pixels: &TilePixels) -> Result<TextureSlot, TileUploadError>;
    fn release_texture(&mut self, slot: TextureSlot);
    fn set_proxy_image(&mut self, proxy: Option<&ProxyImage>);
    fn draw_tile(&mut self, slot: TextureSlot, source: RectF, target: RectF);
    fn draw_proxy(&mut self, source: RectF, target: RectF);
    fn draw_placeholder(&mut self, target: RectF);
    fn end_frame(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOutcome {
    /// `false` asks the host to render again soon.
    pub complete: bool,
    pub tiles_drawn: usize,
    pub ancestor_draws: usize,
    pub proxy_draws: usize,
    pub placeholder_draws: usize,
    pub uploaded: u32,
    pub decode_requests: usize,
    pub background_queued: usize,
}
