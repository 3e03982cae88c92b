use model::{ProxyImage, TileKey, TilePixels};

/// One decode request, as handed to a [`TileSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileRequest {
    pub key: TileKey,
    pub tile_size: u32,
}

impl TileRequest {
    /// Source pixels covered by the tile along one axis.
    pub fn footprint(&self) -> u32 {
        self.key.footprint(self.tile_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TileSourceError {
    #[error("tile {key:?} lies outside the {image_width}x{image_height} image")]
    OutOfBounds {
        key: TileKey,
        image_width: u32,
        image_height: u32,
    },
    #[error("level {level} is outside a pyramid of {level_count} levels")]
    LevelOutOfRange { level: u32, level_count: u32 },
    #[error("tile buffer is {width}x{height}, expected {tile_size}x{tile_size}")]
    SizeMismatch {
        width: u32,
        height: u32,
        tile_size: u32,
    },
    #[error("tile decode failed: {0}")]
    Decode(String),
}

/// Provider of pyramid tiles and image metadata.
///
/// `get_tile` is only called from the decode worker and may block for a long
/// time. It fills `pixels` (already sized `tile_size` x `tile_size` and zeroed)
/// with RGBA8 data; areas past the image edge stay transparent.
pub trait TileSource: Send + Sync {
    fn image_width(&self) -> u32;
    fn image_height(&self) -> u32;
    fn level_count(&self) -> u32;
    fn proxy_image(&self) -> Option<ProxyImage>;
    fn get_tile(&self, request: TileRequest, pixels: &mut TilePixels)
    -> Result<(), TileSourceError>;
}

/// Rejects requests no correct caller should make for `source`.
pub fn check_request(
    source: &dyn TileSource,
    request: TileRequest,
    pixels: &TilePixels,
) -> Result<(), TileSourceError> {
    let level_count = source.level_count();
    if request.key.level >= level_count {
        return Err(TileSourceError::LevelOutOfRange {
            level: request.key.level,
            level_count,
        });
    }
    let (image_width, image_height) = (source.image_width(), source.image_height());
    if request.key.x >= image_width
        || request.key.y >= image_height
        || !request.key.is_aligned(request.tile_size)
    {
        return Err(TileSourceError::OutOfBounds {
            key: request.key,
            image_width,
            image_height,
        });
    }
    if pixels.width() != request.tile_size || pixels.height() != request.tile_size {
        return Err(TileSourceError::SizeMismatch {
            width: pixels.width(),
            height: pixels.height(),
            tile_size: request.tile_size,
        });
    }
    Ok(())
}
