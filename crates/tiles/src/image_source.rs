//! In-memory [`TileSource`] over a decoded RGBA image.
//!
//! Levels past 0 are resampled on demand from the full-resolution image, one
//! tile footprint at a time.

use std::path::Path;

use image::RgbaImage;
use image::imageops::{self, FilterType};
use model::{BYTES_PER_PIXEL, ProxyImage, TilePixels};

use crate::source::{TileRequest, TileSource, TileSourceError, check_request};

pub const DEFAULT_PROXY_EDGE: u32 = 512;

pub struct RgbaImageTileSource {
    image: RgbaImage,
    level_count: u32,
    proxy: Option<ProxyImage>,
}

impl RgbaImageTileSource {
    pub fn new(image: RgbaImage, tile_size: u32) -> Self {
        Self::with_proxy_edge(image, tile_size, Some(DEFAULT_PROXY_EDGE))
    }

    /// `proxy_edge` bounds the longer side of the proxy; `None` disables it.
    pub fn with_proxy_edge(image: RgbaImage, tile_size: u32, proxy_edge: Option<u32>) -> Self {
        let level_count = pyramid_level_count(image.width(), image.height(), tile_size);
        let proxy = proxy_edge.and_then(|edge| build_proxy(&image, edge));
        Self {
            image,
            level_count,
            proxy,
        }
    }

    pub fn open(path: impl AsRef<Path>, tile_size: u32) -> Result<Self, TileSourceError> {
        let image = image::open(path.as_ref())
            .map_err(|error| TileSourceError::Decode(error.to_string()))?
            .to_rgba8();
        Ok(Self::new(image, tile_size))
    }
}

impl TileSource for RgbaImageTileSource {
    fn image_width(&self) -> u32 {
        self.image.width()
    }

    fn image_height(&self) -> u32 {
        self.image.height()
    }

    fn level_count(&self) -> u32 {
        self.level_count
    }

    fn proxy_image(&self) -> Option<ProxyImage> {
        self.proxy.clone()
    }

    fn get_tile(
        &self,
        request: TileRequest,
        pixels: &mut TilePixels,
    ) -> Result<(), TileSourceError> {
        check_request(self, request, pixels)?;
        let footprint = request.footprint();
        let (x, y) = (request.key.x, request.key.y);
        let crop_width = footprint.min(self.image.width() - x);
        let crop_height = footprint.min(self.image.height() - y);
        let region = imageops::crop_imm(&self.image, x, y, crop_width, crop_height).to_image();

        let downscale = 1u32 << request.key.level;
        let target_width = crop_width.div_ceil(downscale);
        let target_height = crop_height.div_ceil(downscale);
        let region = if downscale == 1 {
            region
        } else {
            imageops::resize(&region, target_width, target_height, FilterType::Triangle)
        };

        pixels.clear();
        let stride = pixels.bytes_per_row() as usize;
        let row_len = target_width as usize * BYTES_PER_PIXEL;
        let bytes = pixels.bytes_mut();
        for (row, source_row) in region.as_raw().chunks_exact(row_len).enumerate() {
            let start = row * stride;
            bytes[start..start + row_len].copy_from_slice(source_row);
        }
        Ok(())
    }
}

/// Levels needed until one tile covers the longer image side.
pub fn pyramid_level_count(width: u32, height: u32, tile_size: u32) -> u32 {
    let tiles = width.max(height).div_ceil(tile_size.max(1)).max(1);
    let ceil_log2 = if tiles <= 1 {
        0
    } else {
        u32::BITS - (tiles - 1).leading_zeros()
    };
    ceil_log2.max(1)
}

fn build_proxy(image: &RgbaImage, edge: u32) -> Option<ProxyImage> {
    if edge == 0 || image.width() == 0 || image.height() == 0 {
        return None;
    }
    let longer = image.width().max(image.height());
    let proxy = if longer <= edge {
        image.clone()
    } else {
        let width = (u64::from(image.width()) * u64::from(edge) / u64::from(longer)).max(1) as u32;
        let height =
            (u64::from(image.height()) * u64::from(edge) / u64::from(longer)).max(1) as u32;
        imageops::resize(image, width, height, FilterType::Triangle)
    };
    let (width, height) = proxy.dimensions();
    TilePixels::from_rgba8(width, height, proxy.into_raw()).map(ProxyImage::new)
}

#[cfg(test)]
mod tests {
    use image::Rgba;
    use model::TileKey;

    use super::*;

    fn checkerboard(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            if (x / 16 + y / 16) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        })
    }

    #[test]
    fn level_count_grows_with_longer_side() {
        assert_eq!(pyramid_level_count(4096, 4096, 256), 4);
        assert_eq!(pyramid_level_count(4097, 100, 256), 5);
        assert_eq!(pyramid_level_count(100, 100, 256), 1);
        assert_eq!(pyramid_level_count(512, 256, 256), 1);
    }

    #[test]
    fn edge_tile_pads_with_transparent_pixels() {
        let source = RgbaImageTileSource::new(checkerboard(300, 300), 256);
        let mut pixels = TilePixels::zeroed(256, 256);
        source
            .get_tile(
                TileRequest {
                    key: TileKey::new(256, 256, 0),
                    tile_size: 256,
                },
                &mut pixels,
            )
            .expect("edge tile");

        let stride = pixels.bytes_per_row() as usize;
        let inside = &pixels.bytes()[0..4];
        let outside = &pixels.bytes()[44 * stride + 44 * 4..44 * stride + 48];
        assert_eq!(inside[3], 255);
        assert_eq!(outside, &[0, 0, 0, 0]);
    }

    #[test]
    fn coarse_level_tile_covers_double_footprint() {
        let mut image = RgbaImage::new(512, 512);
        for (x, _, pixel) in image.enumerate_pixels_mut() {
            *pixel = if x < 256 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 0, 255, 255])
            };
        }
        let source = RgbaImageTileSource::new(image, 128);
        let mut pixels = TilePixels::zeroed(128, 128);
        source
            .get_tile(
                TileRequest {
                    key: TileKey::new(0, 0, 1),
                    tile_size: 128,
                },
                &mut pixels,
            )
            .expect("level 1 tile");

        assert_eq!(&pixels.bytes()[0..4], &[255, 0, 0, 255]);
        let last = pixels.bytes().len() - 4;
        assert_eq!(&pixels.bytes()[last..], &[255, 0, 0, 255]);
    }

    #[test]
    fn rejects_misaligned_and_out_of_range_requests() {
        let source = RgbaImageTileSource::new(checkerboard(512, 512), 256);
        let mut pixels = TilePixels::zeroed(256, 256);
        let misaligned = source.get_tile(
            TileRequest {
                key: TileKey::new(100, 0, 0),
                tile_size: 256,
            },
            &mut pixels,
        );
        assert!(matches!(
            misaligned,
            Err(TileSourceError::OutOfBounds { .. })
        ));
        let too_deep = source.get_tile(
            TileRequest {
                key: TileKey::new(0, 0, 3),
                tile_size: 256,
            },
            &mut pixels,
        );
        assert!(matches!(
            too_deep,
            Err(TileSourceError::LevelOutOfRange { .. })
        ));
        let mut small = TilePixels::zeroed(64, 64);
        let wrong_size = source.get_tile(
            TileRequest {
                key: TileKey::new(0, 0, 0),
                tile_size: 256,
            },
            &mut small,
        );
        assert!(matches!(
            wrong_size,
            Err(TileSourceError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn proxy_fits_requested_edge() {
        let source = RgbaImageTileSource::with_proxy_edge(checkerboard(1000, 500), 256, Some(100));
        let proxy = source.proxy_image().expect("proxy");
        assert_eq!((proxy.width(), proxy.height()), (100, 50));
        let without = RgbaImageTileSource::with_proxy_edge(checkerboard(10, 10), 256, None);
        assert!(without.proxy_image().is_none());
    }
}
