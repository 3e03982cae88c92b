//! Host-facing entry point for displaying one tiled image.
//!
//! [`TiledImageView`] owns the tile store, the decode worker, the upload
//! scheduler and the renderer. The host feeds it viewport changes, calls
//! [`TiledImageView::render`] every frame and [`TiledImageView::on_idle`] from
//! its idle callback.

use std::sync::Arc;

use frame_scheduler::{UploadScheduler, UploadSchedulerConfig};
use log::{debug, info, warn};
use model::{DEFAULT_TILE_SIZE, ProxyImage, Viewport};
use renderer::{FrameOutcome, TileCanvas, TileRenderer, upload_on_idle};
use tiles::{
    DecodeWorker, IdleWaker, StoreSnapshot, TilePixelPool, TilePixelPoolConfig, TileSource,
    TileStore, WorkerSpawnError,
};
use view::{ImageGeometry, TileLayoutPlan, ViewGeometryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileViewerConfig {
    pub tile_size: u32,
    pub upload: UploadSchedulerConfig,
    pub pool: TilePixelPoolConfig,
}

impl Default for TileViewerConfig {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            upload: UploadSchedulerConfig::default(),
            pool: TilePixelPoolConfig::default(),
        }
    }
}

impl TileViewerConfig {
    pub fn validate(&self) -> Result<(), ViewerConfigError> {
        if !self.tile_size.is_power_of_two() {
            return Err(ViewerConfigError::TileSizeNotPowerOfTwo(self.tile_size));
        }
        if self.upload.uploads_per_idle_tick == 0 {
            return Err(ViewerConfigError::ZeroIdleUploadQuota);
        }
        if self.upload.uploads_per_frame == 0 {
            return Err(ViewerConfigError::ZeroFrameUploadQuota);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ViewerConfigError {
    #[error("tile size {0} is not a power of two")]
    TileSizeNotPowerOfTwo(u32),
    #[error("uploads per idle tick must be at least one")]
    ZeroIdleUploadQuota,
    #[error("uploads per frame must be at least one")]
    ZeroFrameUploadQuota,
    #[error("tile source reports an empty {width}x{height} image")]
    EmptyImage { width: u32, height: u32 },
    #[error(transparent)]
    Geometry(#[from] ViewGeometryError),
}

#[derive(Debug, thiserror::Error)]
pub enum TileViewerError {
    #[error(transparent)]
    Config(#[from] ViewerConfigError),
    #[error(transparent)]
    Worker(#[from] WorkerSpawnError),
}

pub struct TiledImageView {
    config: TileViewerConfig,
    store: Arc<TileStore>,
    worker: Option<DecodeWorker>,
    scheduler: UploadScheduler,
    renderer: TileRenderer,
    image: Option<ImageGeometry>,
    proxy: Option<ProxyImage>,
    viewport: Viewport,
    view_size: (u32, u32),
    plan: Option<TileLayoutPlan>,
    idle_tick: u64,
}

impl TiledImageView {
    /// Builds the viewer and starts its decode worker.
    pub fn new(
        config: TileViewerConfig,
        idle_waker: Arc<dyn IdleWaker>,
    ) -> Result<Self, TileViewerError> {
        config.validate()?;
        let store = Arc::new(TileStore::new(
            config.tile_size,
            TilePixelPool::new(config.pool),
            idle_waker,
        ));
        let worker = DecodeWorker::start(Arc::clone(&store))?;
        Ok(Self {
            config,
            store,
            worker: Some(worker),
            scheduler: UploadScheduler::new(config.upload),
            renderer: TileRenderer::new(),
            image: None,
            proxy: None,
            viewport: Viewport {
                center_x: 0.0,
                center_y: 0.0,
                scale: 1.0,
                rotation_degrees: 0,
            },
            view_size: (0, 0),
            plan: None,
            idle_tick: 0,
        })
    }

    pub fn config(&self) -> TileViewerConfig {
        self.config
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn plan(&self) -> Option<&TileLayoutPlan> {
        self.plan.as_ref()
    }

    pub fn store(&self) -> &Arc<TileStore> {
        &self.store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn is_prepared(&self) -> bool {
        self.worker.is_some()
    }

    /// Installs the image to show. Every tile of the previous image is
    /// recycled and the current viewport is laid out against the new one.
    /// A source with no pyramid levels is drawn from its proxy alone.
    pub fn set_source(&mut self, source: Arc<dyn TileSource>) -> Result<(), ViewerConfigError> {
        let image = ImageGeometry {
            image_width: source.image_width(),
            image_height: source.image_height(),
            level_count: source.level_count(),
            tile_size: self.config.tile_size,
        };
        if image.image_width == 0 || image.image_height == 0 {
            return Err(ViewerConfigError::EmptyImage {
                width: image.image_width,
                height: image.image_height,
            });
        }
        image.validate()?;

        let recycled = self.store.recycle_all();
        self.proxy = source.proxy_image();
        self.store.set_source(Some(source));
        self.image = Some(image);
        info!(
            "tile source {}x{} with {} levels, recycled {recycled} tiles",
            image.image_width, image.image_height, image.level_count
        );
        self.relayout()?;
        Ok(())
    }

    /// The host swapped or reset the image behind the view.
    pub fn notify_source_invalidated(
        &mut self,
        source: Arc<dyn TileSource>,
    ) -> Result<(), ViewerConfigError> {
        debug!("tile source invalidated");
        self.set_source(source)
    }

    /// Returns whether anything changed.
    pub fn set_view_size(&mut self, width: u32, height: u32) -> bool {
        if self.view_size == (width, height) {
            return false;
        }
        self.view_size = (width, height);
        if let Err(error) = self.relayout() {
            warn!("layout after resize failed: {error}");
            self.plan = None;
        }
        true
    }

    /// Moves the view. Returns whether the viewport changed; an unchanged
    /// viewport leaves every queue untouched.
    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<bool, ViewGeometryError> {
        if !viewport.scale.is_finite() || viewport.scale <= 0.0 {
            return Err(ViewGeometryError::InvalidScale);
        }
        if !viewport.center_x.is_finite() || !viewport.center_y.is_finite() {
            return Err(ViewGeometryError::NonFiniteValue);
        }
        if viewport == self.viewport {
            return Ok(false);
        }
        self.viewport = viewport;
        self.relayout()?;
        Ok(true)
    }

    fn relayout(&mut self) -> Result<(), ViewGeometryError> {
        let Some(image) = self.image else {
            self.plan = None;
            return Ok(());
        };
        let (view_width, view_height) = self.view_size;
        let plan = TileLayoutPlan::compute(image, view_width, view_height, self.viewport)?;
        if self.is_prepared() && !plan.is_transient_rotation() {
            self.store.apply_layout(&plan);
        }
        self.plan = Some(plan);
        Ok(())
    }

    /// Draws one frame. An incomplete outcome asks the host to render again.
    pub fn render(&mut self, canvas: &mut dyn TileCanvas) -> FrameOutcome {
        let Some(plan) = self.plan.as_ref() else {
            for slot in self.store.drain_released_textures() {
                canvas.release_texture(slot);
            }
            return FrameOutcome {
                complete: true,
                ..FrameOutcome::default()
            };
        };
        let mut budget = self.scheduler.begin_frame();
        self.renderer.render(
            &self.store,
            plan,
            self.proxy.as_ref(),
            &mut budget,
            canvas,
        )
    }

    /// The host's idle callback. Returns whether it must be invoked again.
    pub fn on_idle(&mut self, canvas: &mut dyn TileCanvas, render_requested: bool) -> bool {
        let tick = self.idle_tick;
        self.idle_tick += 1;
        upload_on_idle(
            &self.store,
            &mut self.scheduler,
            tick,
            render_requested,
            canvas,
        )
    }

    /// Stops decoding and releases every tile and texture, e.g. when the host
    /// goes to the background.
    pub fn free_resources(&mut self, canvas: &mut dyn TileCanvas) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        let recycled = self.store.recycle_all();
        let released = self.store.drain_released_textures();
        for slot in &released {
            canvas.release_texture(*slot);
        }
        self.store.pool().clear();
        let dropped = self.store.clear_recycled();
        debug!(
            "freed resources: recycled {recycled} tiles, dropped {dropped}, released {} textures",
            released.len()
        );
    }

    /// Restarts decoding after [`Self::free_resources`] and lays out the
    /// current viewport again.
    pub fn prepare_resources(&mut self) -> Result<(), WorkerSpawnError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.worker = Some(DecodeWorker::start(Arc::clone(&self.store))?);
        if let Some(plan) = self.plan.as_ref() {
            if !plan.is_transient_rotation() {
                self.store.apply_layout(plan);
            }
        }
        debug!("resources prepared");
        Ok(())
    }

    /// The GPU context was lost. Tiles become non-resident and are decoded
    /// again when next drawn; the host supplies a fresh canvas.
    pub fn invalidate_gpu_resources(&mut self) {
        let invalidated = self.store.invalidate_textures();
        self.renderer.invalidate_canvas_state();
        debug!("gpu resources invalidated for {invalidated} tiles");
    }
}
