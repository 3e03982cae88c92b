use frame_scheduler::{IdleTickInput, UploadScheduler};
use log::{trace, warn};
use tiles::TileStore;

use crate::TileCanvas;

/// One idle-callback tick: uploads up to the scheduler's quota of decoded
/// tiles. Returns whether the host should invoke the idle callback again.
pub fn upload_on_idle(
    store: &TileStore,
    scheduler: &mut UploadScheduler,
    tick_sequence_id: u64,
    render_requested: bool,
    canvas: &mut dyn TileCanvas,
) -> bool {
    for slot in store.drain_released_textures() {
        canvas.release_texture(slot);
    }

    let decision = scheduler.schedule_idle_tick(IdleTickInput {
        tick_sequence_id,
        render_requested,
        pending_uploads: store.pending_uploads(),
    });
    if let Some(reason) = decision.skip_reason {
        trace!("idle tick {tick_sequence_id} skipped: {reason:?}");
    }

    for _ in 0..decision.upload_quota {
        match store.upload_next(|pixels| canvas.upload_tile(pixels)) {
            Some(Ok(key)) => trace!("idle upload of {key:?}"),
            Some(Err(error)) => {
                warn!("idle upload failed: {error}");
                break;
            }
            None => break,
        }
    }

    if decision.keep_armed(store.pending_uploads()) {
        return true;
    }
    store.disarm_idle()
}
