use frame_scheduler::FrameUploadBudget;
use log::{trace, warn};
use model::{ProxyImage, RectF, TileKey, TileState};
use tiles::TileStore;
use view::TileLayoutPlan;

use crate::fallback::{proxy_region, source_in_parent};
use crate::{FrameOutcome, FrameTransform, TileCanvas};

/// Per-frame drawing of the visible tiles with fallbacks.
#[derive(Debug, Default)]
pub struct TileRenderer {
    installed_proxy: Option<ProxyImage>,
}

impl TileRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets which proxy the canvas holds, so the next frame re-sends it.
    pub fn invalidate_canvas_state(&mut self) {
        self.installed_proxy = None;
    }

    pub fn render(
        &mut self,
        store: &TileStore,
        plan: &TileLayoutPlan,
        proxy: Option<&ProxyImage>,
        budget: &mut FrameUploadBudget,
        canvas: &mut dyn TileCanvas,
    ) -> FrameOutcome {
        for slot in store.drain_released_textures() {
            canvas.release_texture(slot);
        }
        self.sync_proxy(proxy, canvas);

        let (view_width, view_height) = plan.view_size();
        canvas.begin_frame(&FrameTransform {
            view_width,
            view_height,
            rotation_degrees: plan.rotation_degrees(),
        });

        let mut outcome = FrameOutcome {
            complete: true,
            ..FrameOutcome::default()
        };
        if plan.is_proxy_only() {
            let target = plan.image_target();
            match proxy {
                Some(proxy) => {
                    let source = RectF::new(0.0, 0.0, proxy.width() as f32, proxy.height() as f32);
                    canvas.draw_proxy(source, target);
                    outcome.proxy_draws += 1;
                }
                None => {
                    canvas.draw_placeholder(target);
                    outcome.placeholder_draws += 1;
                }
            }
        } else {
            let mut pass = DrawPass {
                store,
                plan,
                proxy,
                budget,
                canvas: &mut *canvas,
                outcome: &mut outcome,
            };
            for (key, target) in plan.visible_tile_targets() {
                pass.draw_tile(key, target);
            }
        }
        canvas.end_frame();

        if outcome.complete {
            outcome.background_queued = store.queue_background();
        }
        trace!(
            "frame: drawn {} ancestors {} proxy {} placeholder {} uploaded {} complete {}",
            outcome.tiles_drawn,
            outcome.ancestor_draws,
            outcome.proxy_draws,
            outcome.placeholder_draws,
            outcome.uploaded,
            outcome.complete
        );
        outcome
    }

    fn sync_proxy(&mut self, proxy: Option<&ProxyImage>, canvas: &mut dyn TileCanvas) {
        let unchanged = match (&self.installed_proxy, proxy) {
            (Some(installed), Some(proxy)) => installed.same_image(proxy),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        canvas.set_proxy_image(proxy);
        self.installed_proxy = proxy.cloned();
    }
}

struct DrawPass<'a> {
    store: &'a TileStore,
    plan: &'a TileLayoutPlan,
    proxy: Option<&'a ProxyImage>,
    budget: &'a mut FrameUploadBudget,
    canvas: &'a mut dyn TileCanvas,
    outcome: &'a mut FrameOutcome,
}

impl DrawPass<'_> {
    fn draw_tile(&mut self, key: TileKey, target: RectF) {
        let tile_size = self.store.tile_size() as f32;
        let full = RectF::new(0.0, 0.0, tile_size, tile_size);
        let Some(status) = self.store.tile_status(key) else {
            // Not laid out yet, e.g. during a transient rotation.
            self.outcome.complete = false;
            self.draw_fallback(key, target);
            return;
        };

        if let Some(slot) = status.texture {
            self.canvas.draw_tile(slot, full, target);
            self.outcome.tiles_drawn += 1;
            return;
        }

        match status.state {
            TileState::Decoded => {
                if self.budget.try_consume() {
                    let canvas = &mut *self.canvas;
                    match self.store.upload_tile(key, |pixels| canvas.upload_tile(pixels)) {
                        Some(Ok(slot)) => {
                            self.canvas.draw_tile(slot, full, target);
                            self.outcome.tiles_drawn += 1;
                            self.outcome.uploaded += 1;
                            return;
                        }
                        Some(Err(error)) => warn!("inline upload of {key:?} failed: {error}"),
                        None => {}
                    }
                }
                self.outcome.complete = false;
            }
            TileState::DecodeFailed => {}
            _ => {
                self.outcome.complete = false;
                if self.store.request_decode(key) {
                    self.outcome.decode_requests += 1;
                }
            }
        }
        self.draw_fallback(key, target);
    }

    fn draw_fallback(&mut self, key: TileKey, target: RectF) {
        let image = self.plan.image();
        let tile_size = image.tile_size as f32;
        let mut source = RectF::new(0.0, 0.0, tile_size, tile_size);
        let mut current = key;
        while current.level + 1 < image.level_count {
            let parent = current.parent(image.tile_size);
            source = source_in_parent(current, parent, source, tile_size);
            if let Some(slot) = self.store.resident_texture(parent) {
                self.canvas.draw_tile(slot, source, target);
                self.outcome.ancestor_draws += 1;
                return;
            }
            current = parent;
        }

        let proxy_draw = self.proxy.and_then(|proxy| {
            proxy_region(
                key,
                key.footprint(image.tile_size),
                target,
                (image.image_width, image.image_height),
                (proxy.width(), proxy.height()),
            )
        });
        match proxy_draw {
            Some((source, clipped_target)) => {
                self.canvas.draw_proxy(source, clipped_target);
                self.outcome.proxy_draws += 1;
            }
            None => {
                self.canvas.draw_placeholder(target);
                self.outcome.placeholder_draws += 1;
            }
        }
    }
}
