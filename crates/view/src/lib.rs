//! Viewport geometry for the tile pyramid.
//!
//! Turns a `Viewport` plus the view size into a `TileLayoutPlan`: which level
//! to draw, the tile-aligned range drawn at that level, the pair of levels
//! kept resident around it, and where the first tile lands on screen.

use std::ops::Range;

use model::{RectF, TileKey, TileRange, Viewport};
use smallvec::SmallVec;

/// Threshold above which the next sharper level is kept resident as well.
const SHARPER_LEVEL_PREFETCH_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageGeometry {
    pub image_width: u32,
    pub image_height: u32,
    pub level_count: u32,
    pub tile_size: u32,
}

impl ImageGeometry {
    pub fn validate(&self) -> Result<(), ViewGeometryError> {
        if self.tile_size == 0 || !self.tile_size.is_power_of_two() {
            return Err(ViewGeometryError::InvalidTileSize);
        }
        if self
            .tile_size
            .checked_shl(self.level_count)
            .is_none_or(|footprint| footprint == 0)
        {
            return Err(ViewGeometryError::LevelCountTooLarge);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ViewGeometryError {
    #[error("viewport scale must be finite and positive")]
    InvalidScale,
    #[error("viewport center must be finite")]
    NonFiniteValue,
    #[error("tile size must be a non-zero power of two")]
    InvalidTileSize,
    #[error("pyramid level count overflows the tile footprint")]
    LevelCountTooLarge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileLayoutPlan {
    image: ImageGeometry,
    level: u32,
    visible_range: TileRange,
    from_level: u32,
    resident_ranges: SmallVec<[TileRange; 2]>,
    offset_x: i32,
    offset_y: i32,
    scale: f32,
    rotation_degrees: i32,
    view_width: u32,
    view_height: u32,
}

impl TileLayoutPlan {
    pub fn compute(
        image: ImageGeometry,
        view_width: u32,
        view_height: u32,
        viewport: Viewport,
    ) -> Result<Self, ViewGeometryError> {
        image.validate()?;
        if !viewport.scale.is_finite() || viewport.scale <= 0.0 {
            return Err(ViewGeometryError::InvalidScale);
        }
        if !viewport.center_x.is_finite() || !viewport.center_y.is_finite() {
            return Err(ViewGeometryError::NonFiniteValue);
        }

        let scale = f64::from(viewport.scale);
        let center_x = f64::from(viewport.center_x);
        let center_y = f64::from(viewport.center_y);
        let level = select_level(viewport.scale, image.level_count);
        let level_count = i64::from(image.level_count);

        let (visible_range, offset_x, offset_y, from_level) = if level < image.level_count {
            let range = tile_range(
                image,
                view_width,
                view_height,
                center_x,
                center_y,
                level,
                scale,
                viewport.rotation_degrees,
            );
            let offset_x =
                (f64::from(view_width) / 2.0 + (f64::from(range.left) - center_x) * scale).round();
            let offset_y =
                (f64::from(view_height) / 2.0 + (f64::from(range.top) - center_y) * scale).round();
            let from_level = if scale * f64::from(1u32 << level) > SHARPER_LEVEL_PREFETCH_RATIO {
                i64::from(level) - 1
            } else {
                i64::from(level)
            };
            (range, offset_x, offset_y, from_level)
        } else {
            let offset_x = (f64::from(view_width) / 2.0 - center_x * scale).round();
            let offset_y = (f64::from(view_height) / 2.0 - center_y * scale).round();
            (
                TileRange::EMPTY,
                offset_x,
                offset_y,
                i64::from(level) - 2,
            )
        };

        let from_level = from_level.min(level_count - 2).max(0);
        let end_level = (from_level + 2).min(level_count).max(from_level);
        let mut resident_ranges = SmallVec::new();
        for resident_level in from_level..end_level {
            let resident_level = resident_level as u32;
            let band_scale = 1.0 / f64::from(1u32 << (resident_level + 1));
            resident_ranges.push(tile_range(
                image,
                view_width,
                view_height,
                center_x,
                center_y,
                resident_level,
                band_scale,
                viewport.rotation_degrees,
            ));
        }

        Ok(Self {
            image,
            level,
            visible_range,
            from_level: from_level as u32,
            resident_ranges,
            offset_x: offset_x as i32,
            offset_y: offset_y as i32,
            scale: viewport.scale,
            rotation_degrees: viewport.rotation_degrees,
            view_width,
            view_height,
        })
    }

    pub fn image(&self) -> ImageGeometry {
        self.image
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn is_proxy_only(&self) -> bool {
        self.level >= self.image.level_count
    }

    pub fn visible_range(&self) -> TileRange {
        self.visible_range
    }

    pub fn resident_levels(&self) -> Range<u32> {
        let end = self.from_level + self.resident_ranges.len() as u32;
        self.from_level..end
    }

    pub fn resident_range(&self, level: u32) -> Option<TileRange> {
        if !self.resident_levels().contains(&level) {
            return None;
        }
        self.resident_ranges
            .get((level - self.from_level) as usize)
            .copied()
    }

    /// Whether `key` belongs to the resident window of this plan.
    pub fn keeps(&self, key: TileKey) -> bool {
        self.resident_range(key.level)
            .is_some_and(|range| range.contains(key.x, key.y))
    }

    /// Every tile key the resident window needs, level by level.
    pub fn resident_keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        let tile_size = self.image.tile_size;
        self.resident_levels().flat_map(move |level| {
            let range = self.resident_ranges[(level - self.from_level) as usize];
            let footprint = tile_size << level;
            range
                .tile_origins(footprint)
                .map(move |(x, y)| TileKey::new(x, y, level))
        })
    }

    pub fn offset(&self) -> (i32, i32) {
        (self.offset_x, self.offset_y)
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn rotation_degrees(&self) -> i32 {
        self.rotation_degrees
    }

    pub fn is_transient_rotation(&self) -> bool {
        self.rotation_degrees % 90 != 0
    }

    pub fn view_size(&self) -> (u32, u32) {
        (self.view_width, self.view_height)
    }

    /// On-screen edge length of one tile at the drawn level.
    pub fn tile_screen_length(&self) -> f32 {
        ((self.image.tile_size << self.level.min(self.image.level_count)) as f32) * self.scale
    }

    /// Visible tiles with their unrotated screen rectangles, row-major.
    pub fn visible_tile_targets(&self) -> impl Iterator<Item = (TileKey, RectF)> + '_ {
        let footprint = self.image.tile_size << self.level.min(self.image.level_count);
        let length = self.tile_screen_length();
        let range = self.visible_range;
        let level = self.level;
        let (offset_x, offset_y) = (self.offset_x as f32, self.offset_y as f32);
        range.tile_origins(footprint).map(move |(tile_x, tile_y)| {
            let column = ((tile_x - range.left) / footprint) as f32;
            let row = ((tile_y - range.top) / footprint) as f32;
            let x = offset_x + column * length;
            let y = offset_y + row * length;
            (
                TileKey::new(tile_x, tile_y, level),
                RectF::new(x, y, x + length, y + length),
            )
        })
    }

    /// Screen rectangle of the whole image, used when only the proxy is drawn.
    pub fn image_target(&self) -> RectF {
        let width = (self.image.image_width as f32 * self.scale).round();
        let height = (self.image.image_height as f32 * self.scale).round();
        let (x, y) = (self.offset_x as f32, self.offset_y as f32);
        RectF::new(x, y, x + width, y + height)
    }
}

pub fn select_level(scale: f32, level_count: u32) -> u32 {
    let raw = (1.0 / f64::from(scale)).log2().floor();
    if raw <= 0.0 {
        return 0;
    }
    if raw >= f64::from(level_count) {
        return level_count;
    }
    raw as u32
}

/// Tile-aligned source rectangle covered by the rotated view at `level`.
#[allow(clippy::too_many_arguments)]
pub fn tile_range(
    image: ImageGeometry,
    view_width: u32,
    view_height: u32,
    center_x: f64,
    center_y: f64,
    level: u32,
    scale: f64,
    rotation_degrees: i32,
) -> TileRange {
    let (cosine, sine) = rotation_cos_sin(-rotation_degrees);
    let view_width = f64::from(view_width);
    let view_height = f64::from(view_height);
    let width = (cosine * view_width - sine * view_height)
        .abs()
        .max((cosine * view_width + sine * view_height).abs())
        .ceil();
    let height = (sine * view_width + cosine * view_height)
        .abs()
        .max((sine * view_width - cosine * view_height).abs())
        .ceil();

    let left = (center_x - width / (2.0 * scale)).floor() as i64;
    let top = (center_y - height / (2.0 * scale)).floor() as i64;
    let right = (left as f64 + width / scale).ceil() as i64;
    let bottom = (top as f64 + height / scale).ceil() as i64;

    let footprint = i64::from(image.tile_size) << level;
    let left = (footprint * left.div_euclid(footprint)).max(0);
    let top = (footprint * top.div_euclid(footprint)).max(0);
    let right = right.min(i64::from(image.image_width));
    let bottom = bottom.min(i64::from(image.image_height));
    if left >= right || top >= bottom {
        return TileRange::EMPTY;
    }
    TileRange {
        left: left as u32,
        top: top as u32,
        right: right as u32,
        bottom: bottom as u32,
    }
}

fn rotation_cos_sin(degrees: i32) -> (f64, f64) {
    match degrees.rem_euclid(360) {
        0 => (1.0, 0.0),
        90 => (0.0, 1.0),
        180 => (-1.0, 0.0),
        270 => (0.0, -1.0),
        other => {
            let radians = f64::from(other).to_radians();
            (radians.cos(), radians.sin())
        }
    }
}
