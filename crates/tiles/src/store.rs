use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, trace, warn};
use model::{TextureSlot, TileKey, TilePixels, TileState};
use slotmap::SlotMap;
use view::TileLayoutPlan;

use crate::pool::TilePixelPool;
use crate::source::{TileRequest, TileSource, TileSourceError};

slotmap::new_key_type! {
    pub struct TileId;
}

/// Host hook that schedules an idle callback on the render thread.
pub trait IdleWaker: Send + Sync {
    fn request_idle(&self);
}

#[derive(Debug, Default)]
pub struct NoopIdleWaker;

impl IdleWaker for NoopIdleWaker {
    fn request_idle(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueMembership {
    None,
    Decode,
    Upload,
    Recycled,
}

#[derive(Debug)]
struct Tile {
    key: TileKey,
    state: TileState,
    pixels: Option<TilePixels>,
    texture: Option<TextureSlot>,
    queue: QueueMembership,
}

impl Tile {
    fn transition(&mut self, next: TileState) {
        if !self.state.allows(next) {
            panic!(
                "illegal tile transition {:?} -> {:?} for {:?}",
                self.state, next, self.key
            );
        }
        trace!("tile {:?}: {:?} -> {:?}", self.key, self.state, next);
        self.state = next;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStatus {
    pub state: TileState,
    pub texture: Option<TextureSlot>,
}

impl TileStatus {
    pub fn is_resident(&self) -> bool {
        self.texture.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutDelta {
    pub activated: usize,
    pub recycled: usize,
}

impl LayoutDelta {
    pub fn is_empty(&self) -> bool {
        self.activated == 0 && self.recycled == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSnapshot {
    pub active: usize,
    pub resident: usize,
    pub queued_for_decode: usize,
    pub queued_for_upload: usize,
    pub recycled: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    Decoded,
    Failed,
    Discarded,
}

/// A tile handed to the decode worker together with its pooled buffer.
pub struct DecodeJob {
    id: TileId,
    request: TileRequest,
    pixels: TilePixels,
    source: Arc<dyn TileSource>,
}

impl DecodeJob {
    pub fn id(&self) -> TileId {
        self.id
    }

    pub fn key(&self) -> TileKey {
        self.request.key
    }

    /// Runs the source decode. Must be called without the store lock held.
    ///
    /// A panicking source is reported as a decode error so the tile still
    /// settles and the worker keeps running.
    pub fn decode(&mut self) -> Result<(), TileSourceError> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            self.source.get_tile(self.request, &mut self.pixels)
        }))
        .unwrap_or_else(|payload| {
            Err(TileSourceError::Decode(format!(
                "tile source panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string payload")
}

struct StoreState {
    tiles: SlotMap<TileId, Tile>,
    active: HashMap<TileKey, TileId>,
    decode_queue: VecDeque<TileId>,
    upload_queue: VecDeque<TileId>,
    recycled: Vec<TileId>,
    released_textures: Vec<TextureSlot>,
    source: Option<Arc<dyn TileSource>>,
}

impl StoreState {
    fn recycle(&mut self, id: TileId, pool: &TilePixelPool) {
        let tile = &mut self.tiles[id];
        let removed = self.active.remove(&tile.key);
        assert_eq!(removed, Some(id), "recycled tile missing from active table");
        if let Some(slot) = tile.texture.take() {
            self.released_textures.push(slot);
        }
        match tile.state {
            TileState::Activated => tile.transition(TileState::Recycled),
            TileState::Queued => {
                remove_from_queue(&mut self.decode_queue, id);
                tile.transition(TileState::Activated);
                tile.transition(TileState::Recycled);
            }
            TileState::Decoding => {
                tile.transition(TileState::Recycling);
                return;
            }
            TileState::Decoded => {
                if tile.queue == QueueMembership::Upload {
                    remove_from_queue(&mut self.upload_queue, id);
                }
                if let Some(pixels) = tile.pixels.take() {
                    pool.release(pixels);
                }
                tile.transition(TileState::Recycled);
            }
            TileState::DecodeFailed => tile.transition(TileState::Recycled),
            TileState::Recycling | TileState::Recycled => {
                panic!("tile {:?} in state {:?} is not active", tile.key, tile.state)
            }
        }
        tile.queue = QueueMembership::Recycled;
        self.recycled.push(id);
    }

    fn activate(&mut self, key: TileKey) -> TileId {
        let id = match self.recycled.pop() {
            Some(id) => id,
            None => self.tiles.insert(Tile {
                key,
                state: TileState::Recycled,
                pixels: None,
                texture: None,
                queue: QueueMembership::Recycled,
            }),
        };
        let tile = &mut self.tiles[id];
        debug_assert!(tile.pixels.is_none() && tile.texture.is_none());
        tile.key = key;
        tile.transition(TileState::Activated);
        tile.queue = QueueMembership::None;
        let previous = self.active.insert(key, id);
        assert!(previous.is_none(), "tile {key:?} activated twice");
        id
    }

    /// Queues an idle tile for decode; `front` marks it least urgent.
    fn enqueue_decode(&mut self, id: TileId, front: bool) {
        let tile = &mut self.tiles[id];
        tile.transition(TileState::Queued);
        tile.queue = QueueMembership::Decode;
        if front {
            self.decode_queue.push_front(id);
        } else {
            self.decode_queue.push_back(id);
        }
    }

    fn finish_upload(&mut self, id: TileId, slot: TextureSlot, pool: &TilePixelPool) {
        let tile = &mut self.tiles[id];
        if let Some(pixels) = tile.pixels.take() {
            pool.release(pixels);
        }
        if let Some(stale) = tile.texture.replace(slot) {
            self.released_textures.push(stale);
        }
        tile.queue = QueueMembership::None;
        tile.transition(TileState::Activated);
    }
}

fn remove_from_queue(queue: &mut VecDeque<TileId>, id: TileId) {
    let position = queue
        .iter()
        .position(|queued| *queued == id)
        .expect("tile missing from the queue it claims to be in");
    queue.remove(position);
}

/// Active tile table and the decode, upload and recycle queues.
///
/// Every state change and queue move happens under one lock. Decoding runs
/// outside it on a [`DecodeJob`].
pub struct TileStore {
    tile_size: u32,
    pool: TilePixelPool,
    state: Mutex<StoreState>,
    notify_tx: Sender<()>,
    notify_rx: Receiver<()>,
    worker_stop: AtomicBool,
    idle_armed: AtomicBool,
    idle_waker: Arc<dyn IdleWaker>,
}

impl TileStore {
    pub fn new(tile_size: u32, pool: TilePixelPool, idle_waker: Arc<dyn IdleWaker>) -> Self {
        assert!(
            tile_size.is_power_of_two(),
            "tile size must be a power of two"
        );
        let (notify_tx, notify_rx) = crossbeam_channel::bounded(1);
        Self {
            tile_size,
            pool,
            state: Mutex::new(StoreState {
                tiles: SlotMap::with_key(),
                active: HashMap::new(),
                decode_queue: VecDeque::new(),
                upload_queue: VecDeque::new(),
                recycled: Vec::new(),
                released_textures: Vec::new(),
                source: None,
            }),
            notify_tx,
            notify_rx,
            worker_stop: AtomicBool::new(false),
            idle_armed: AtomicBool::new(false),
            idle_waker,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("tile store lock poisoned")
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn pool(&self) -> &TilePixelPool {
        &self.pool
    }

    pub fn set_source(&self, source: Option<Arc<dyn TileSource>>) {
        self.lock().source = source;
    }

    pub fn source(&self) -> Option<Arc<dyn TileSource>> {
        self.lock().source.clone()
    }

    /// Reconciles the active table with the resident window of `plan`.
    ///
    /// Tiles outside the window are recycled; missing ones are activated and
    /// queued for decode. Applying the same plan twice changes nothing.
    pub fn apply_layout(&self, plan: &TileLayoutPlan) -> LayoutDelta {
        let mut delta = LayoutDelta::default();
        {
            let mut state = self.lock();
            let leaving = state
                .active
                .iter()
                .filter(|(key, _)| !plan.keeps(**key))
                .map(|(_, id)| *id)
                .collect::<Vec<_>>();
            for id in leaving {
                state.recycle(id, &self.pool);
                delta.recycled += 1;
            }
            for key in plan.resident_keys() {
                if state.active.contains_key(&key) {
                    continue;
                }
                let id = state.activate(key);
                state.enqueue_decode(id, false);
                delta.activated += 1;
            }
        }
        if delta.activated > 0 {
            self.notify_worker();
        }
        if !delta.is_empty() {
            debug!(
                "layout at level {}: activated {} recycled {}",
                plan.level(),
                delta.activated,
                delta.recycled
            );
        }
        delta
    }

    pub fn tile_status(&self, key: TileKey) -> Option<TileStatus> {
        let state = self.lock();
        let id = state.active.get(&key)?;
        let tile = &state.tiles[*id];
        Some(TileStatus {
            state: tile.state,
            texture: tile.texture,
        })
    }

    pub fn resident_texture(&self, key: TileKey) -> Option<TextureSlot> {
        let state = self.lock();
        let id = state.active.get(&key)?;
        state.tiles[*id].texture
    }

    /// Asks for `key` to be decoded next. Returns whether the decode queue changed.
    ///
    /// Resident and already-decoded tiles are left alone. A queued tile moves to
    /// the head of the LIFO so recently exposed tiles win.
    pub fn request_decode(&self, key: TileKey) -> bool {
        let changed = {
            let mut state = self.lock();
            let Some(id) = state.active.get(&key).copied() else {
                return false;
            };
            let tile = &state.tiles[id];
            match (tile.state, tile.texture) {
                (TileState::Activated, None) => {
                    state.enqueue_decode(id, false);
                    true
                }
                (TileState::Queued, _) => {
                    if state.decode_queue.back() == Some(&id) {
                        false
                    } else {
                        remove_from_queue(&mut state.decode_queue, id);
                        state.decode_queue.push_back(id);
                        true
                    }
                }
                _ => false,
            }
        };
        if changed {
            self.notify_worker();
        }
        changed
    }

    /// Queues every active, non-resident, idle tile behind the visible work.
    pub fn queue_background(&self) -> usize {
        let queued = {
            let mut state = self.lock();
            let idle = state
                .active
                .values()
                .copied()
                .filter(|id| {
                    let tile = &state.tiles[*id];
                    tile.state == TileState::Activated && tile.texture.is_none()
                })
                .collect::<Vec<_>>();
            for id in &idle {
                state.enqueue_decode(*id, true);
            }
            idle.len()
        };
        if queued > 0 {
            trace!("background pass queued {queued} tiles");
            self.notify_worker();
        }
        queued
    }

    /// Moves the most recently queued tile to `Decoding`.
    pub fn try_take_decode_job(&self) -> Option<DecodeJob> {
        let mut state = self.lock();
        let source = state.source.clone()?;
        let id = state.decode_queue.pop_back()?;
        let tile = &mut state.tiles[id];
        tile.transition(TileState::Decoding);
        tile.queue = QueueMembership::None;
        let request = TileRequest {
            key: tile.key,
            tile_size: self.tile_size,
        };
        let pixels = self.pool.acquire(self.tile_size, self.tile_size);
        Some(DecodeJob {
            id,
            request,
            pixels,
            source,
        })
    }

    /// Blocks until a job is available or the worker is told to stop.
    pub fn next_decode_job(&self) -> Option<DecodeJob> {
        loop {
            if self.worker_stop.load(Ordering::Acquire) {
                return None;
            }
            if let Some(job) = self.try_take_decode_job() {
                return Some(job);
            }
            if self.notify_rx.recv().is_err() {
                return None;
            }
        }
    }

    pub fn finish_decode(
        &self,
        job: DecodeJob,
        result: Result<(), TileSourceError>,
    ) -> DecodeOutcome {
        let DecodeJob {
            id,
            request,
            pixels,
            ..
        } = job;
        let outcome = {
            let mut state = self.lock();
            let tile = &mut state.tiles[id];
            let current = tile.state;
            match current {
                TileState::Recycling => {
                    self.pool.release(pixels);
                    tile.transition(TileState::Recycled);
                    tile.queue = QueueMembership::Recycled;
                    state.recycled.push(id);
                    DecodeOutcome::Discarded
                }
                TileState::Decoding => match result {
                    Ok(()) => {
                        tile.pixels = Some(pixels);
                        tile.transition(TileState::Decoded);
                        tile.queue = QueueMembership::Upload;
                        state.upload_queue.push_back(id);
                        DecodeOutcome::Decoded
                    }
                    Err(error) => {
                        warn!("decode of {:?} failed: {error}", request.key);
                        self.pool.release(pixels);
                        tile.transition(TileState::DecodeFailed);
                        DecodeOutcome::Failed
                    }
                },
                other => panic!("decode finished for {:?} in state {other:?}", request.key),
            }
        };
        if outcome == DecodeOutcome::Decoded && !self.idle_armed.swap(true, Ordering::AcqRel) {
            self.idle_waker.request_idle();
        }
        outcome
    }

    /// Uploads the oldest decoded tile through `upload`.
    ///
    /// On failure the tile keeps its pixels and leaves the upload queue; a
    /// later draw of that tile retries inline.
    pub fn upload_next<E, F>(&self, upload: F) -> Option<Result<TileKey, E>>
    where
        F: FnOnce(&TilePixels) -> Result<TextureSlot, E>,
    {
        let mut state = self.lock();
        let id = state.upload_queue.pop_front()?;
        let tile = &mut state.tiles[id];
        assert_eq!(tile.state, TileState::Decoded, "upload queue holds non-decoded tile");
        tile.queue = QueueMembership::None;
        let key = tile.key;
        let pixels = tile
            .pixels
            .as_ref()
            .expect("decoded tile without pixels");
        match upload(pixels) {
            Ok(slot) => {
                state.finish_upload(id, slot, &self.pool);
                Some(Ok(key))
            }
            Err(error) => Some(Err(error)),
        }
    }

    /// Uploads one specific decoded tile, used by the renderer for visible tiles.
    pub fn upload_tile<E, F>(&self, key: TileKey, upload: F) -> Option<Result<TextureSlot, E>>
    where
        F: FnOnce(&TilePixels) -> Result<TextureSlot, E>,
    {
        let mut state = self.lock();
        let id = state.active.get(&key).copied()?;
        let tile = &state.tiles[id];
        if tile.state != TileState::Decoded {
            return None;
        }
        let in_queue = tile.queue == QueueMembership::Upload;
        let pixels = tile
            .pixels
            .as_ref()
            .expect("decoded tile without pixels");
        match upload(pixels) {
            Ok(slot) => {
                if in_queue {
                    remove_from_queue(&mut state.upload_queue, id);
                }
                state.finish_upload(id, slot, &self.pool);
                Some(Ok(slot))
            }
            Err(error) => Some(Err(error)),
        }
    }

    pub fn pending_uploads(&self) -> usize {
        self.lock().upload_queue.len()
    }

    /// Marks the idle callback as not scheduled. Returns `true` when uploads
    /// arrived meanwhile and the caller must keep it armed instead.
    pub fn disarm_idle(&self) -> bool {
        self.idle_armed.store(false, Ordering::Release);
        if self.pending_uploads() > 0 {
            self.idle_armed.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn recycle_all(&self) -> usize {
        let mut state = self.lock();
        let ids = state.active.values().copied().collect::<Vec<_>>();
        for id in &ids {
            state.recycle(*id, &self.pool);
        }
        if !ids.is_empty() {
            debug!("recycled all {} active tiles", ids.len());
        }
        ids.len()
    }

    /// Drops the recycled free list. Tiles still settling in `Recycling` join
    /// a fresh list once their decode returns.
    pub fn clear_recycled(&self) -> usize {
        let mut state = self.lock();
        let ids = std::mem::take(&mut state.recycled);
        for id in &ids {
            state.tiles.remove(*id);
        }
        if !ids.is_empty() {
            debug!("dropped {} recycled tiles", ids.len());
        }
        ids.len()
    }

    /// Drops every texture handle without releasing it; the canvas already
    /// lost them.
    pub fn invalidate_textures(&self) -> usize {
        let mut state = self.lock();
        state.released_textures.clear();
        let mut invalidated = 0;
        for (_, tile) in state.tiles.iter_mut() {
            if tile.texture.take().is_some() {
                invalidated += 1;
            }
        }
        debug!("invalidated {invalidated} tile textures");
        invalidated
    }

    pub fn drain_released_textures(&self) -> Vec<TextureSlot> {
        std::mem::take(&mut self.lock().released_textures)
    }

    pub fn request_worker_stop(&self) {
        self.worker_stop.store(true, Ordering::Release);
        self.notify_worker();
    }

    pub fn reset_worker_stop(&self) {
        self.worker_stop.store(false, Ordering::Release);
    }

    fn notify_worker(&self) {
        // A pending token already wakes the worker.
        let _ = self.notify_tx.try_send(());
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        let state = self.lock();
        let mut snapshot = StoreSnapshot {
            active: state.active.len(),
            queued_for_decode: state.decode_queue.len(),
            queued_for_upload: state.upload_queue.len(),
            recycled: state.recycled.len(),
            ..StoreSnapshot::default()
        };
        for (_, tile) in state.tiles.iter() {
            if tile.texture.is_some() {
                snapshot.resident += 1;
            }
            if matches!(tile.state, TileState::Decoding | TileState::Recycling) {
                snapshot.in_flight += 1;
            }
        }
        snapshot
    }

    /// Panics when queue membership, tile states and the active table disagree.
    pub fn check_invariants(&self) {
        let state = self.lock();
        let mut seen = HashSet::new();
        let queues = [
            (QueueMembership::Decode, TileState::Queued, state.decode_queue.iter()),
            (QueueMembership::Upload, TileState::Decoded, state.upload_queue.iter()),
        ];
        for (membership, expected_state, ids) in queues {
            for id in ids {
                assert!(seen.insert(*id), "tile {id:?} sits in two queues");
                let tile = &state.tiles[*id];
                assert_eq!(tile.queue, membership, "queue membership of {:?}", tile.key);
                assert_eq!(tile.state, expected_state, "queued state of {:?}", tile.key);
                assert_eq!(state.active.get(&tile.key), Some(id));
            }
        }
        for id in &state.recycled {
            assert!(seen.insert(*id), "recycled tile {id:?} also queued");
            let tile = &state.tiles[*id];
            assert_eq!(tile.state, TileState::Recycled);
            assert_eq!(tile.queue, QueueMembership::Recycled);
            assert!(tile.pixels.is_none() && tile.texture.is_none());
        }
        for (key, id) in &state.active {
            let tile = &state.tiles[*id];
            assert_eq!(tile.key, *key, "active table key mismatch");
            assert!(tile.state.is_live(), "active tile {key:?} is {:?}", tile.state);
        }
        for (id, tile) in state.tiles.iter() {
            match tile.state {
                TileState::Queued => assert_eq!(tile.queue, QueueMembership::Decode),
                TileState::Recycled => assert!(state.recycled.contains(&id)),
                TileState::Recycling => {
                    assert_ne!(state.active.get(&tile.key), Some(&id));
                }
                TileState::Decoded => assert!(tile.pixels.is_some()),
                _ => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, id: TileId) -> TileState {
        self.lock().tiles[id].state
    }
}
