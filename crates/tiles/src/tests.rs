use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use model::{ProxyImage, TextureSlot, TileKey, TilePixels, TileState, Viewport};
use view::{ImageGeometry, TileLayoutPlan};

use super::*;

const TILE: u32 = 256;

struct SolidSource {
    width: u32,
    height: u32,
    level_count: u32,
    failing: Vec<TileKey>,
    calls: AtomicUsize,
}

impl SolidSource {
    fn new(width: u32, height: u32, level_count: u32) -> Self {
        Self {
            width,
            height,
            level_count,
            failing: Vec::new(),
            calls: AtomicUsize::new(0),
        }
    }
}

impl TileSource for SolidSource {
    fn image_width(&self) -> u32 {
        self.width
    }

    fn image_height(&self) -> u32 {
        self.height
    }

    fn level_count(&self) -> u32 {
        self.level_count
    }

    fn proxy_image(&self) -> Option<ProxyImage> {
        None
    }

    fn get_tile(&self, request: TileRequest, pixels: &mut TilePixels) -> Result<(), TileSourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&request.key) {
            return Err(TileSourceError::Decode("corrupt region".to_owned()));
        }
        pixels.bytes_mut().fill(0xFF);
        Ok(())
    }
}

/// Blocks each decode until the test releases it.
struct GatedSource {
    started: Sender<TileKey>,
    release: Receiver<()>,
}

impl TileSource for GatedSource {
    fn image_width(&self) -> u32 {
        512
    }

    fn image_height(&self) -> u32 {
        256
    }

    fn level_count(&self) -> u32 {
        1
    }

    fn proxy_image(&self) -> Option<ProxyImage> {
        None
    }

    fn get_tile(&self, request: TileRequest, pixels: &mut TilePixels) -> Result<(), TileSourceError> {
        self.started
            .send(request.key)
            .map_err(|error| TileSourceError::Decode(error.to_string()))?;
        self.release
            .recv()
            .map_err(|error| TileSourceError::Decode(error.to_string()))?;
        pixels.bytes_mut().fill(0x80);
        Ok(())
    }
}

/// Panics while decoding one key and fills every other tile.
struct PanickingSource {
    panics_on: TileKey,
}

impl TileSource for PanickingSource {
    fn image_width(&self) -> u32 {
        512
    }

    fn image_height(&self) -> u32 {
        256
    }

    fn level_count(&self) -> u32 {
        1
    }

    fn proxy_image(&self) -> Option<ProxyImage> {
        None
    }

    fn get_tile(&self, request: TileRequest, pixels: &mut TilePixels) -> Result<(), TileSourceError> {
        if request.key == self.panics_on {
            panic!("truncated scanline in {:?}", request.key);
        }
        pixels.bytes_mut().fill(0x40);
        Ok(())
    }
}

#[derive(Default)]
struct CountingWaker {
    wakes: AtomicUsize,
}

impl IdleWaker for CountingWaker {
    fn request_idle(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }
}

fn strip_plan(center_x: f32) -> TileLayoutPlan {
    let image = ImageGeometry {
        image_width: 512,
        image_height: 256,
        level_count: 1,
        tile_size: TILE,
    };
    TileLayoutPlan::compute(
        image,
        256,
        256,
        Viewport {
            center_x,
            center_y: 128.0,
            scale: 1.0,
            rotation_degrees: 0,
        },
    )
    .expect("strip plan")
}

fn store_with(source: Arc<dyn TileSource>) -> (Arc<TileStore>, Arc<CountingWaker>) {
    let waker = Arc::new(CountingWaker::default());
    let store = Arc::new(TileStore::new(TILE, TilePixelPool::default(), waker.clone()));
    store.set_source(Some(source));
    (store, waker)
}

fn slot(index: u16) -> TextureSlot {
    TextureSlot {
        layer: 0,
        index,
        generation: 0,
    }
}

#[test_log::test]
fn layout_activates_resident_window_of_large_image() {
    let (store, _) = store_with(Arc::new(SolidSource::new(4096, 4096, 4)));
    let plan = TileLayoutPlan::compute(
        ImageGeometry {
            image_width: 4096,
            image_height: 4096,
            level_count: 4,
            tile_size: TILE,
        },
        1024,
        768,
        Viewport {
            center_x: 2048.0,
            center_y: 2048.0,
            scale: 1.0,
            rotation_degrees: 0,
        },
    )
    .expect("plan");

    let delta = store.apply_layout(&plan);

    assert_eq!(delta.activated, 96);
    assert_eq!(delta.recycled, 0);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.active, 96);
    assert_eq!(snapshot.queued_for_decode, 96);
    assert_eq!(
        store.tile_status(TileKey::new(2048, 2048, 0)).map(|status| status.state),
        Some(TileState::Queued)
    );
    assert_eq!(store.tile_status(TileKey::new(0, 0, 0)), None);
    store.check_invariants();
}

#[test_log::test]
fn repeated_layout_changes_nothing() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    let plan = strip_plan(300.0);

    assert_eq!(store.apply_layout(&plan).activated, 2);
    let before = store.snapshot();
    assert!(store.apply_layout(&plan).is_empty());
    assert_eq!(store.snapshot(), before);
    store.check_invariants();
}

#[test_log::test]
fn decode_queue_is_last_in_first_out() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));

    let job = store.try_take_decode_job().expect("job");
    assert_eq!(job.key(), TileKey::new(256, 0, 0));
    assert_eq!(store.tile_status(job.key()).map(|s| s.state), Some(TileState::Decoding));
    store.check_invariants();
}

#[test_log::test]
fn request_decode_promotes_queued_tile() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));

    assert!(store.request_decode(TileKey::new(0, 0, 0)));
    assert!(!store.request_decode(TileKey::new(0, 0, 0)));
    let job = store.try_take_decode_job().expect("job");
    assert_eq!(job.key(), TileKey::new(0, 0, 0));
}

#[test_log::test]
fn successful_decode_feeds_upload_queue_and_wakes_idle_once() {
    let (store, waker) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));

    for _ in 0..2 {
        let mut job = store.try_take_decode_job().expect("job");
        let result = job.decode();
        assert_eq!(store.finish_decode(job, result), DecodeOutcome::Decoded);
    }

    assert_eq!(store.pending_uploads(), 2);
    assert_eq!(waker.wakes.load(Ordering::SeqCst), 1);
    assert!(store.disarm_idle());
    store.check_invariants();
}

#[test_log::test]
fn upload_consumes_pixels_and_makes_tile_resident() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(0.0));
    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    store.finish_decode(job, result);
    let free_before = store.pool().free_count(TILE, TILE);

    let uploaded = store.upload_next(|pixels| {
        assert!(pixels.bytes().iter().all(|byte| *byte == 0xFF));
        Ok::<_, ()>(slot(3))
    });

    assert_eq!(uploaded, Some(Ok(TileKey::new(0, 0, 0))));
    let status = store.tile_status(TileKey::new(0, 0, 0)).expect("status");
    assert_eq!(status.state, TileState::Activated);
    assert_eq!(status.texture, Some(slot(3)));
    assert_eq!(store.pool().free_count(TILE, TILE), free_before + 1);
    assert!(!store.disarm_idle());
    store.check_invariants();
}

#[test_log::test]
fn failed_upload_keeps_pixels_for_inline_retry() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(0.0));
    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    store.finish_decode(job, result);

    let failed = store.upload_next(|_| Err::<TextureSlot, _>("atlas full"));
    assert_eq!(failed, Some(Err("atlas full")));
    assert_eq!(store.pending_uploads(), 0);

    let key = TileKey::new(0, 0, 0);
    assert_eq!(store.tile_status(key).map(|s| s.state), Some(TileState::Decoded));
    let retried = store.upload_tile(key, |_| Ok::<_, ()>(slot(1)));
    assert_eq!(retried, Some(Ok(slot(1))));
    store.check_invariants();
}

#[test_log::test]
fn decode_failure_is_terminal_until_recycled() {
    let mut source = SolidSource::new(512, 256, 1);
    source.failing.push(TileKey::new(0, 0, 0));
    let source = Arc::new(source);
    let (store, waker) = store_with(source.clone());
    store.apply_layout(&strip_plan(0.0));

    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    assert_eq!(store.finish_decode(job, result), DecodeOutcome::Failed);

    let key = TileKey::new(0, 0, 0);
    assert_eq!(store.tile_status(key).map(|s| s.state), Some(TileState::DecodeFailed));
    assert!(!store.request_decode(key));
    assert!(store.try_take_decode_job().is_none());
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.pool().free_count(TILE, TILE), 1);
    assert_eq!(waker.wakes.load(Ordering::SeqCst), 0);

    store.apply_layout(&strip_plan(512.0));
    store.apply_layout(&strip_plan(0.0));
    assert_eq!(store.tile_status(key).map(|s| s.state), Some(TileState::Queued));
    store.check_invariants();
}

#[test_log::test]
fn recycling_mid_decode_defers_until_worker_finishes() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));
    let mut job = store.try_take_decode_job().expect("job");
    let id = job.id();
    assert_eq!(job.key(), TileKey::new(256, 0, 0));
    assert_eq!(store.state_of(id), TileState::Decoding);

    let delta = store.apply_layout(&strip_plan(0.0));
    assert_eq!(delta.recycled, 1);
    assert_eq!(store.state_of(id), TileState::Recycling);
    assert_eq!(store.tile_status(TileKey::new(256, 0, 0)), None);
    store.check_invariants();

    let result = job.decode();
    assert_eq!(store.finish_decode(job, result), DecodeOutcome::Discarded);
    assert_eq!(store.state_of(id), TileState::Recycled);
    assert_eq!(store.pool().free_count(TILE, TILE), 1);
    assert_eq!(store.pending_uploads(), 0);
    store.check_invariants();
}

#[test_log::test]
fn worker_discards_tile_that_left_range_while_decoding() {
    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (release_tx, release_rx) = crossbeam_channel::unbounded();
    let (store, _) = store_with(Arc::new(GatedSource {
        started: started_tx,
        release: release_rx,
    }));
    let mut worker = DecodeWorker::start(Arc::clone(&store)).expect("start worker");

    store.apply_layout(&strip_plan(300.0));
    let first = started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("first decode started");
    assert_eq!(first, TileKey::new(256, 0, 0));

    store.apply_layout(&strip_plan(0.0));
    assert_eq!(store.snapshot().in_flight, 1);

    release_tx.send(()).expect("release first");
    release_tx.send(()).expect("release second");
    let second = started_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("second decode started");
    assert_eq!(second, TileKey::new(0, 0, 0));
    worker.stop();

    let snapshot = store.snapshot();
    assert_eq!(snapshot.in_flight, 0);
    assert_eq!(snapshot.recycled, 1);
    assert_eq!(snapshot.queued_for_upload, 1);
    assert_eq!(store.pool().free_count(TILE, TILE), 1);
    store.check_invariants();
}

#[test_log::test]
fn reactivated_tile_starts_clean() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(0.0));
    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    store.finish_decode(job, result);
    store.upload_next(|_| Ok::<_, ()>(slot(7)));

    store.apply_layout(&strip_plan(512.0));
    assert_eq!(store.drain_released_textures(), vec![slot(7)]);
    let reborn = store
        .tile_status(TileKey::new(256, 0, 0))
        .expect("tile reused for new key");
    assert_eq!(reborn.state, TileState::Queued);
    assert_eq!(reborn.texture, None);
    assert_eq!(store.snapshot().recycled, 0);
    store.check_invariants();
}

#[test_log::test]
fn invalidated_textures_require_fresh_decode() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(0.0));
    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    store.finish_decode(job, result);
    store.upload_next(|_| Ok::<_, ()>(slot(0)));
    let key = TileKey::new(0, 0, 0);
    assert!(!store.request_decode(key));

    assert_eq!(store.invalidate_textures(), 1);
    assert!(store.drain_released_textures().is_empty());
    assert_eq!(store.resident_texture(key), None);
    assert!(store.request_decode(key));
    store.check_invariants();
}

#[test_log::test]
fn background_pass_queues_behind_visible_work() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));
    let mut first = store.try_take_decode_job().expect("first");
    let mut second = store.try_take_decode_job().expect("second");
    let result = first.decode();
    store.finish_decode(first, result);
    let result = second.decode();
    store.finish_decode(second, result);
    store.upload_next(|_| Ok::<_, ()>(slot(0)));
    store.upload_next(|_| Ok::<_, ()>(slot(1)));
    store.invalidate_textures();

    assert_eq!(store.queue_background(), 2);
    store.request_decode(TileKey::new(0, 0, 0));
    let job = store.try_take_decode_job().expect("job");
    assert_eq!(job.key(), TileKey::new(0, 0, 0));
    store.check_invariants();
}

#[test_log::test]
fn recycle_all_empties_table_and_queues() {
    let (store, _) = store_with(Arc::new(SolidSource::new(4096, 4096, 4)));
    store.apply_layout(&strip_plan(300.0));
    let mut job = store.try_take_decode_job().expect("job");
    let result = job.decode();
    store.finish_decode(job, result);

    assert_eq!(store.recycle_all(), 2);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.queued_for_decode, 0);
    assert_eq!(snapshot.queued_for_upload, 0);
    assert_eq!(snapshot.recycled, 2);
    store.check_invariants();
}

#[test_log::test]
fn clamped_layout_never_activates_keys_outside_image() {
    let (store, _) = store_with(Arc::new(SolidSource::new(1000, 700, 2)));
    let plan = TileLayoutPlan::compute(
        ImageGeometry {
            image_width: 1000,
            image_height: 700,
            level_count: 2,
            tile_size: TILE,
        },
        800,
        600,
        Viewport {
            center_x: 990.0,
            center_y: 690.0,
            scale: 2.0,
            rotation_degrees: 0,
        },
    )
    .expect("plan");
    store.apply_layout(&plan);

    while let Some(job) = store.try_take_decode_job() {
        let key = job.key();
        assert!(key.x < 1000 && key.y < 700, "{key:?} outside image");
        store.finish_decode(job, Ok(()));
    }
    store.check_invariants();
}

#[test_log::test]
fn panicking_source_marks_tile_failed() {
    let (store, _) = store_with(Arc::new(PanickingSource {
        panics_on: TileKey::new(256, 0, 0),
    }));
    store.apply_layout(&strip_plan(300.0));
    let mut job = store.try_take_decode_job().expect("job");
    assert_eq!(job.key(), TileKey::new(256, 0, 0));

    let result = job.decode();
    assert!(
        matches!(&result, Err(TileSourceError::Decode(message)) if message.contains("truncated scanline")),
        "{result:?}"
    );
    assert_eq!(store.finish_decode(job, result), DecodeOutcome::Failed);
    assert_eq!(store.pool().free_count(TILE, TILE), 1);
    store.check_invariants();
}

#[test_log::test]
fn worker_survives_panicking_source() {
    let (store, _) = store_with(Arc::new(PanickingSource {
        panics_on: TileKey::new(256, 0, 0),
    }));
    let mut worker = DecodeWorker::start(Arc::clone(&store)).expect("start worker");
    store.apply_layout(&strip_plan(300.0));

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = store.snapshot();
        if snapshot.queued_for_decode == 0 && snapshot.in_flight == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "decode worker stalled");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(worker.is_running());

    let state = |key| store.tile_status(key).map(|status| status.state);
    assert_eq!(state(TileKey::new(256, 0, 0)), Some(TileState::DecodeFailed));
    assert_eq!(state(TileKey::new(0, 0, 0)), Some(TileState::Decoded));
    assert_eq!(store.pending_uploads(), 1);

    assert_eq!(store.recycle_all(), 2);
    assert_eq!(store.snapshot().recycled, 2);
    worker.stop();
    store.check_invariants();
}

#[test_log::test]
fn clear_recycled_drops_free_list() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));
    assert_eq!(store.recycle_all(), 2);
    assert_eq!(store.snapshot().recycled, 2);

    assert_eq!(store.clear_recycled(), 2);
    let snapshot = store.snapshot();
    assert_eq!(snapshot.recycled, 0);
    assert_eq!(snapshot.active, 0);
    store.check_invariants();

    store.apply_layout(&strip_plan(0.0));
    assert_eq!(store.snapshot().active, 1);
    store.check_invariants();
}

#[test_log::test]
fn clear_recycled_keeps_tiles_still_decoding() {
    let (store, _) = store_with(Arc::new(SolidSource::new(512, 256, 1)));
    store.apply_layout(&strip_plan(300.0));
    let mut job = store.try_take_decode_job().expect("job");
    assert_eq!(store.recycle_all(), 2);
    assert_eq!(store.clear_recycled(), 1);
    assert_eq!(store.snapshot().in_flight, 1);

    let result = job.decode();
    assert_eq!(store.finish_decode(job, result), DecodeOutcome::Discarded);
    assert_eq!(store.snapshot().recycled, 1);
    store.check_invariants();
}
