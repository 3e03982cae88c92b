//! Pacing of GPU tile uploads against drawing.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSchedulerConfig {
    pub uploads_per_idle_tick: u32,
    pub uploads_per_frame: u32,
}

impl Default for UploadSchedulerConfig {
    fn default() -> Self {
        Self {
            uploads_per_idle_tick: 1,
            uploads_per_frame: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTickInput {
    pub tick_sequence_id: u64,
    pub render_requested: bool,
    pub pending_uploads: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleSkipReason {
    RenderRequested,
    QueueEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleTickDecision {
    pub tick_sequence_id: u64,
    pub upload_quota: u32,
    pub skip_reason: Option<IdleSkipReason>,
    /// Set when work was deferred and the idle callback must fire again.
    pub retry_next_tick: bool,
}

impl IdleTickDecision {
    /// Whether the host should re-arm the idle callback once the tick is done.
    pub fn keep_armed(&self, remaining_uploads: usize) -> bool {
        self.retry_next_tick || remaining_uploads > 0
    }
}

/// Per-frame allowance for inline uploads of visible tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUploadBudget {
    remaining: u32,
    spent: u32,
}

impl FrameUploadBudget {
    pub fn new(quota: u32) -> Self {
        Self {
            remaining: quota,
            spent: 0,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        self.spent += 1;
        true
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn spent(&self) -> u32 {
        self.spent
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSchedulerStats {
    pub ticks: u64,
    pub ticks_skipped_for_render: u64,
    pub uploads_granted: u64,
}

#[derive(Debug, Clone)]
pub struct UploadScheduler {
    config: UploadSchedulerConfig,
    stats: UploadSchedulerStats,
}

impl UploadScheduler {
    pub fn new(config: UploadSchedulerConfig) -> Self {
        Self {
            config,
            stats: UploadSchedulerStats::default(),
        }
    }

    pub fn config(&self) -> UploadSchedulerConfig {
        self.config
    }

    pub fn stats(&self) -> UploadSchedulerStats {
        self.stats
    }

    pub fn schedule_idle_tick(&mut self, input: IdleTickInput) -> IdleTickDecision {
        self.stats.ticks += 1;
        if input.pending_uploads == 0 {
            return IdleTickDecision {
                tick_sequence_id: input.tick_sequence_id,
                upload_quota: 0,
                skip_reason: Some(IdleSkipReason::QueueEmpty),
                retry_next_tick: false,
            };
        }

        if input.render_requested {
            self.stats.ticks_skipped_for_render += 1;
            return IdleTickDecision {
                tick_sequence_id: input.tick_sequence_id,
                upload_quota: 0,
                skip_reason: Some(IdleSkipReason::RenderRequested),
                retry_next_tick: true,
            };
        }

        let upload_quota = self.idle_quota_for_pending(input.pending_uploads);
        self.stats.uploads_granted += u64::from(upload_quota);
        IdleTickDecision {
            tick_sequence_id: input.tick_sequence_id,
            upload_quota,
            skip_reason: None,
            retry_next_tick: false,
        }
    }

    pub fn begin_frame(&self) -> FrameUploadBudget {
        FrameUploadBudget::new(self.config.uploads_per_frame)
    }

    fn idle_quota_for_pending(&self, pending_uploads: usize) -> u32 {
        let ceiling = self.config.uploads_per_idle_tick;
        if ceiling == 0 {
            panic!("invalid upload scheduler config: uploads_per_idle_tick is zero");
        }
        let pending = u32::try_from(pending_uploads).unwrap_or(u32::MAX);
        pending.min(ceiling)
    }
}

impl Default for UploadScheduler {
    fn default() -> Self {
        Self::new(UploadSchedulerConfig::default())
    }
}
