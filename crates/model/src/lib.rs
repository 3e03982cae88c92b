use std::sync::Arc;

use static_assertions::const_assert;

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const BYTES_PER_PIXEL: usize = 4;

const_assert!(DEFAULT_TILE_SIZE.is_power_of_two());

/// Identity of one square region of one pyramid level.
///
/// `x` and `y` are full-resolution source pixels and are always aligned to the
/// tile footprint `tile_size << level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub x: u32,
    pub y: u32,
    pub level: u32,
}

impl TileKey {
    pub const fn new(x: u32, y: u32, level: u32) -> Self {
        Self { x, y, level }
    }

    pub fn footprint(self, tile_size: u32) -> u32 {
        tile_size
            .checked_shl(self.level)
            .expect("tile footprint overflow")
    }

    pub fn is_aligned(self, tile_size: u32) -> bool {
        let footprint = self.footprint(tile_size);
        self.x % footprint == 0 && self.y % footprint == 0
    }

    /// The tile one level up whose quadrant contains this tile.
    pub fn parent(self, tile_size: u32) -> TileKey {
        let parent_level = self
            .level
            .checked_add(1)
            .expect("tile parent level overflow");
        let size = tile_size
            .checked_shl(parent_level)
            .expect("parent footprint overflow");
        TileKey {
            x: size * (self.x / size),
            y: size * (self.y / size),
            level: parent_level,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    Activated,
    Queued,
    Decoding,
    Decoded,
    DecodeFailed,
    Recycling,
    Recycled,
}

impl TileState {
    pub fn allows(self, next: TileState) -> bool {
        use TileState::*;
        matches!(
            (self, next),
            (Activated, Queued)
                | (Activated, Recycled)
                | (Queued, Activated)
                | (Queued, Decoding)
                | (Decoding, Recycling)
                | (Decoding, Decoded)
                | (Decoding, DecodeFailed)
                | (Recycling, Recycled)
                | (Decoded, Activated)
                | (Decoded, Recycled)
                | (DecodeFailed, Recycled)
                | (Recycled, Activated)
        )
    }

    pub fn is_live(self) -> bool {
        !matches!(self, TileState::Recycling | TileState::Recycled)
    }
}

/// Half-open pixel rectangle in source-image space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileRange {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl TileRange {
    pub const EMPTY: TileRange = TileRange {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn is_empty(&self) -> bool {
        self.left >= self.right || self.top >= self.bottom
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.left && x < self.right && y >= self.top && y < self.bottom
    }

    /// Tile origins covering this range, row-major, stepping by `footprint`.
    pub fn tile_origins(self, footprint: u32) -> impl Iterator<Item = (u32, u32)> {
        assert!(footprint > 0, "tile footprint must be positive");
        let columns = if self.is_empty() {
            0
        } else {
            (self.right - self.left).div_ceil(footprint)
        };
        let rows = if self.is_empty() {
            0
        } else {
            (self.bottom - self.top).div_ceil(footprint)
        };
        (0..rows).flat_map(move |row| {
            (0..columns).map(move |column| {
                (
                    self.left + column * footprint,
                    self.top + row * footprint,
                )
            })
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RectF {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl RectF {
    pub const fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Externally supplied view of the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub center_x: f32,
    pub center_y: f32,
    pub scale: f32,
    pub rotation_degrees: i32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            center_x: 0.0,
            center_y: 0.0,
            scale: 1.0,
            rotation_degrees: 0,
        }
    }
}

impl Viewport {
    pub fn is_transient_rotation(&self) -> bool {
        self.rotation_degrees % 90 != 0
    }
}

/// RGBA8 pixel buffer, tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePixels {
    width: u32,
    height: u32,
    bytes: Vec<u8>,
}

impl TilePixels {
    pub fn zeroed(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bytes: vec![0; rgba8_len(width, height)],
        }
    }

    pub fn from_rgba8(width: u32, height: u32, bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() != rgba8_len(width, height) {
            return None;
        }
        Some(Self {
            width,
            height,
            bytes,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bucket(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn bytes_per_row(&self) -> u32 {
        self.width * BYTES_PER_PIXEL as u32
    }

    pub fn clear(&mut self) {
        self.bytes.fill(0);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

pub fn rgba8_len(width: u32, height: u32) -> usize {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(BYTES_PER_PIXEL))
        .expect("rgba8 buffer length overflow")
}

/// Low-resolution preview of the whole source image.
#[derive(Debug, Clone)]
pub struct ProxyImage {
    pixels: Arc<TilePixels>,
}

impl ProxyImage {
    pub fn new(pixels: TilePixels) -> Self {
        Self {
            pixels: Arc::new(pixels),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &TilePixels {
        &self.pixels
    }

    pub fn same_image(&self, other: &ProxyImage) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// Location of an uploaded tile inside the GPU atlas.
///
/// `generation` changes whenever the slot is freed, so a stale slot held by a
/// tile never aliases a newer upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureSlot {
    pub layer: u32,
    pub index: u16,
    pub generation: u32,
}
