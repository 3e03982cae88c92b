//! Source-rectangle math for drawing a tile from something other than itself.

use model::{RectF, TileKey};

/// Maps `source`, in `child` texel space, into `parent` texel space.
///
/// The child covers one quadrant of its parent, so each axis either halves
/// (left/top quadrant) or halves and shifts by half a tile.
pub(super) fn source_in_parent(
    child: TileKey,
    parent: TileKey,
    source: RectF,
    tile_size: f32,
) -> RectF {
    let (left, right) = if child.x == parent.x {
        (source.left / 2.0, source.right / 2.0)
    } else {
        ((tile_size + source.left) / 2.0, (tile_size + source.right) / 2.0)
    };
    let (top, bottom) = if child.y == parent.y {
        (source.top / 2.0, source.bottom / 2.0)
    } else {
        ((tile_size + source.top) / 2.0, (tile_size + source.bottom) / 2.0)
    };
    RectF::new(left, top, right, bottom)
}

/// Proxy pixels and screen rectangle for the image-covered part of a tile.
///
/// Returns `None` when the tile lies entirely past the image edge.
pub(super) fn proxy_region(
    key: TileKey,
    footprint: u32,
    target: RectF,
    image_size: (u32, u32),
    proxy_size: (u32, u32),
) -> Option<(RectF, RectF)> {
    let (image_width, image_height) = image_size;
    if key.x >= image_width || key.y >= image_height || footprint == 0 {
        return None;
    }
    let covered_width = footprint.min(image_width - key.x) as f32;
    let covered_height = footprint.min(image_height - key.y) as f32;
    let footprint = footprint as f32;

    let x_ratio = proxy_size.0 as f32 / image_width as f32;
    let y_ratio = proxy_size.1 as f32 / image_height as f32;
    let source = RectF::new(
        key.x as f32 * x_ratio,
        key.y as f32 * y_ratio,
        (key.x as f32 + covered_width) * x_ratio,
        (key.y as f32 + covered_height) * y_ratio,
    );
    let clipped_target = RectF::new(
        target.left,
        target.top,
        target.left + target.width() * covered_width / footprint,
        target.top + target.height() * covered_height / footprint,
    );
    Some((source, clipped_target))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_child_maps_to_left_half_of_parent() {
        let child = TileKey::new(0, 0, 0);
        let parent = child.parent(256);
        let mapped = source_in_parent(child, parent, RectF::new(0.0, 0.0, 256.0, 256.0), 256.0);
        assert_eq!(mapped, RectF::new(0.0, 0.0, 128.0, 128.0));
    }

    #[test]
    fn right_bottom_child_maps_to_far_quadrant() {
        let child = TileKey::new(256, 256, 0);
        let parent = child.parent(256);
        let mapped = source_in_parent(child, parent, RectF::new(0.0, 0.0, 256.0, 256.0), 256.0);
        assert_eq!(mapped, RectF::new(128.0, 128.0, 256.0, 256.0));
    }

    #[test]
    fn two_level_walk_narrows_to_sixteenth() {
        let child = TileKey::new(768, 0, 0);
        let parent = child.parent(256);
        let grandparent = parent.parent(256);
        let in_parent = source_in_parent(child, parent, RectF::new(0.0, 0.0, 256.0, 256.0), 256.0);
        let in_grandparent = source_in_parent(parent, grandparent, in_parent, 256.0);
        assert_eq!(in_grandparent, RectF::new(192.0, 0.0, 256.0, 64.0));
    }

    #[test]
    fn proxy_region_scales_by_resolution_ratio_and_clips_edge() {
        let (source, target) = proxy_region(
            TileKey::new(768, 0, 0),
            256,
            RectF::new(10.0, 20.0, 266.0, 276.0),
            (1000, 1000),
            (100, 100),
        )
        .expect("inside image");
        let expected = RectF::new(76.8, 0.0, 100.0, 25.6);
        for (actual, expected) in [
            (source.left, expected.left),
            (source.top, expected.top),
            (source.right, expected.right),
            (source.bottom, expected.bottom),
        ] {
            assert!((actual - expected).abs() < 1e-3, "{source:?}");
        }
        assert!((target.width() - 232.0).abs() < 1e-3);
        assert!((target.height() - 256.0).abs() < 1e-3);
        assert!(
            proxy_region(TileKey::new(1024, 0, 0), 256, target, (1000, 1000), (100, 100)).is_none()
        );
    }
}
