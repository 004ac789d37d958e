//! The per-refresh consumer: token top-up, frame drain, upload, underrun
//! detection and corrective producer scaling.
//!
//! One scheduler runs on the presentation thread. In real-time operation it
//! never blocks: a refresh with no ready frame is recorded as a skip, not
//! waited out, preserving the vsync deadline. Blocking consumption is allowed
//! only in simulated capture mode (offline runs, tests).

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};

use crate::cache::{FrameCache, SlotMeta, SlotUploader};
use crate::config::{available_cores, ConfigError, StimConfig};
use crate::context::PipelineContext;
use crate::frame::Frame;
use crate::params::ParameterSynchronizer;
use crate::producer::ProducerHandle;
use crate::stats::UploadStats;
use crate::synth::FrameSynthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Initializing,
    Running,
    Reapplying,
    Stopping,
}

/// What one refresh tick did, for callers that log or assert on it.
#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub delivered: usize,
    pub skipped: bool,
    pub spawned_producer: bool,
    pub displayed: Option<SlotMeta>,
}

/// Outcome of the underrun policy for one tick where the skip counter has
/// already been updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnderrunAction {
    warn: bool,
    spawn: bool,
}

/// Pure spawn decision: an extra producer is corrective only when the skip
/// streak has reached the cache depth, the producer ceiling has room, and a
/// spare core exists beyond the presentation thread and current producers.
fn underrun_action(
    skip_counter: usize,
    cache_depth: usize,
    producer_count: usize,
    max_producers: usize,
    cores_available: usize,
) -> UnderrunAction {
    if skip_counter < cache_depth {
        return UnderrunAction {
            warn: false,
            spawn: false,
        };
    }
    let spare_core = producer_count + 1 < cores_available;
    UnderrunAction {
        warn: true,
        spawn: spare_core && producer_count < max_producers,
    }
}

pub struct DisplayScheduler<U: SlotUploader> {
    ctx: Arc<PipelineContext>,
    params: ParameterSynchronizer,
    uploader: U,
    cache: FrameCache,
    producers: Vec<ProducerHandle>,
    /// Synthesizer for the degenerate zero-producer mode (`cores = 1`),
    /// where synthesis runs synchronously on the presentation thread.
    local_synth: Option<FrameSynthesizer>,
    state: SchedulerState,
    simulated: bool,
    skip_counter: usize,
    cache_depth: usize,
    max_producers: usize,
    next_producer_index: usize,
    drain_cursor: usize,
    upload_stats: UploadStats,
}

impl<U: SlotUploader> DisplayScheduler<U> {
    /// `simulated` enables blocking consumption (non-real-time capture).
    pub fn new(ctx: Arc<PipelineContext>, uploader: U, simulated: bool) -> Self {
        let params = ParameterSynchronizer::new(Arc::clone(&ctx));
        Self {
            ctx,
            params,
            uploader,
            cache: FrameCache::new(1),
            producers: Vec::new(),
            local_synth: None,
            state: SchedulerState::Idle,
            simulated,
            skip_counter: 0,
            cache_depth: 1,
            max_producers: 0,
            next_producer_index: 0,
            drain_cursor: 0,
            upload_stats: UploadStats::new(),
        }
    }

    /// Allocate GPU slots, spawn producers, and prefill every slot before
    /// declaring the pipeline ready. Any allocation failure aborts the start.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != SchedulerState::Idle {
            return Err(anyhow!("scheduler already initialized"));
        }
        self.state = SchedulerState::Initializing;

        // Pick up critical changes accepted while stopped: table rebuild,
        // track reset, entropy streams back to the configured seed.
        self.ctx.reinitialize();

        let (config, _) = self.ctx.shared.snapshot();
        let (nx, ny) = config.grid();
        self.cache_depth = config.cache_depth;
        self.max_producers = config.producer_count();
        self.cache = FrameCache::new(self.cache_depth);
        self.upload_stats = UploadStats::new();
        self.skip_counter = 0;

        self.uploader
            .allocate(self.cache_depth, nx, ny)
            .map_err(|e| {
                self.state = SchedulerState::Idle;
                e.context("GPU slot allocation failed; run aborted")
            })?;

        // One producer by default; underrun recovery may add more up to the
        // configured ceiling.
        let initial_producers = self.max_producers.min(1);
        for index in 0..initial_producers {
            let producer =
                ProducerHandle::spawn(index, Arc::clone(&self.ctx), self.cache_depth)?;
            self.producers.push(producer);
        }
        self.next_producer_index = initial_producers;
        self.drain_cursor = 0;
        if self.producers.is_empty() {
            self.local_synth = Some(FrameSynthesizer::new(Arc::clone(&self.ctx)));
        }

        self.prefill()?;

        log::info!(
            "pipeline ready: {}x{} stixels, {} slots, {} producer(s)",
            nx,
            ny,
            self.cache_depth,
            self.producers.len()
        );
        self.state = SchedulerState::Running;
        Ok(())
    }

    fn prefill(&mut self) -> Result<()> {
        if let Some(mut synth) = self.local_synth.take() {
            for _ in 0..self.cache_depth {
                let frame = synth.synthesize();
                self.upload_frame(frame)?;
            }
            self.local_synth = Some(synth);
            return Ok(());
        }

        let producer_count = self.producers.len();
        for n in 0..self.cache_depth {
            self.producers[n % producer_count].grant_token();
        }
        for n in 0..self.cache_depth {
            let producer = &mut self.producers[n % producer_count];
            let frame = producer
                .take_frame_blocking()
                .ok_or_else(|| anyhow!("producer {} died during prefill", producer.index()))?;
            self.upload_frame(frame)?;
        }
        Ok(())
    }

    fn upload_frame(&mut self, frame: Frame) -> Result<u64> {
        let started = Instant::now();
        let (slot, frame_number) = self.cache.store(&frame);
        self.uploader
            .upload(slot, frame.nx, frame.ny, frame.pixels.as_bytes())?;
        self.upload_stats.record(started.elapsed());
        Ok(frame_number)
    }

    /// One display refresh tick.
    pub fn tick(&mut self) -> Result<TickReport> {
        if self.state != SchedulerState::Running {
            return Err(anyhow!("tick outside the Running state"));
        }

        // 1. Top up each producer's token budget toward its target depth.
        if !self.producers.is_empty() {
            let target = (self.cache_depth / self.producers.len()).max(1);
            for producer in &mut self.producers {
                if producer.pending() < target {
                    producer.grant_token();
                }
            }
        }

        // 2. Drain at most one ready frame into the next ring slot.
        let mut delivered = 0;
        let mut cache_was_full = false;
        if !self.cache.is_full() {
            if let Some(mut synth) = self.local_synth.take() {
                let frame = synth.synthesize();
                self.upload_frame(frame)?;
                self.local_synth = Some(synth);
                delivered = 1;
            } else if let Some((from, frame)) = self.next_ready_frame() {
                self.producers[from].grant_token();
                self.upload_frame(frame)?;
                self.drain_cursor = (from + 1) % self.producers.len();
                delivered = 1;
            }
        } else {
            cache_was_full = true;
        }

        // 3. Consecutive-skip bookkeeping. A refresh that drained nothing
        // into a non-full cache is a miss, full stop; granted-but-unanswered
        // tokens do not excuse it.
        if delivered > 0 {
            self.skip_counter = self.skip_counter.saturating_sub(1);
        } else if !cache_was_full {
            self.skip_counter += 1;
        }

        // 4. Underrun: warn, and spawn a corrective producer if allowed.
        let action = underrun_action(
            self.skip_counter,
            self.cache_depth,
            self.producers.len(),
            self.max_producers,
            available_cores(),
        );
        if action.warn {
            log::warn!(
                "frame underrun: {} consecutive refreshes without a ready frame",
                self.skip_counter
            );
        }
        let mut spawned = false;
        if action.spawn {
            let producer = ProducerHandle::spawn(
                self.next_producer_index,
                Arc::clone(&self.ctx),
                self.cache_depth,
            )?;
            log::info!("spawned corrective producer {}", self.next_producer_index);
            self.next_producer_index += 1;
            self.producers.push(producer);
            self.skip_counter -= 1;
            spawned = true;
        }

        // Presentation: draw the taken slot with its stamped metadata, then
        // resolve any parameter history waiting on that serial.
        let displayed = self.cache.take_display_slot().map(|(_, meta)| meta);
        if let Some(meta) = displayed {
            self.params
                .check_pending_history(meta.serial, meta.frame_number);
        }

        Ok(TickReport {
            delivered,
            skipped: delivered == 0 && !cache_was_full,
            spawned_producer: spawned,
            displayed,
        })
    }

    /// Pop the oldest ready frame across producers, round-robin from the
    /// drain cursor. Blocks only in simulated mode.
    fn next_ready_frame(&mut self) -> Option<(usize, Frame)> {
        let count = self.producers.len();
        if count == 0 {
            return None;
        }
        for offset in 0..count {
            let index = (self.drain_cursor + offset) % count;
            if let Some(frame) = self.producers[index].try_take_frame() {
                return Some((index, frame));
            }
        }
        if self.simulated {
            for offset in 0..count {
                let index = (self.drain_cursor + offset) % count;
                if self.producers[index].pending() > 0 {
                    return self.producers[index]
                        .take_frame_blocking()
                        .map(|frame| (index, frame));
                }
            }
        }
        None
    }

    /// Accept a runtime parameter change (Reapplying window).
    pub fn reapply(&mut self, new_config: StimConfig) -> Result<u64, ConfigError> {
        let previous = self.state;
        self.state = SchedulerState::Reapplying;
        let result = self
            .params
            .accept_change(new_config, previous == SchedulerState::Running);
        self.state = previous;
        result
    }

    /// Signal producers, drain residual frames, free slot resources.
    pub fn shutdown(&mut self) {
        if self.state == SchedulerState::Idle {
            return;
        }
        self.state = SchedulerState::Stopping;
        self.ctx
            .track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mark_end();
        for producer in self.producers.drain(..) {
            producer.shutdown();
        }
        self.local_synth = None;
        self.uploader.release();
        log::info!(
            "pipeline stopped after {} displayed frames",
            self.cache.frames_displayed()
        );
        self.state = SchedulerState::Idle;
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn frames_displayed(&self) -> u64 {
        self.cache.frames_displayed()
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn upload_stats(&self) -> &UploadStats {
        &self.upload_stats
    }

    pub fn uploader(&self) -> &U {
        &self.uploader
    }

    pub fn params(&self) -> &ParameterSynchronizer {
        &self.params
    }

    /// Average synthesis time in the zero-producer synchronous mode.
    pub fn local_synthesis_average(&self) -> Option<std::time::Duration> {
        self.local_synth
            .as_ref()
            .and_then(|s| s.average_synthesis_time())
    }
}

impl<U: SlotUploader> Drop for DisplayScheduler<U> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn underrun_below_threshold_is_silent() {
        let action = underrun_action(3, 4, 1, 3, 8);
        assert_eq!(
            action,
            UnderrunAction {
                warn: false,
                spawn: false
            }
        );
    }

    #[test]
    fn two_consecutive_underruns_spawn_exactly_one_producer() {
        let cache_depth = 4;
        let max_producers = 2;
        let cores_available = 8; // at least two spare cores
        let mut producers = 1;
        let mut skip = cache_depth;

        // First event: threshold reached, room below the ceiling.
        let first = underrun_action(skip, cache_depth, producers, max_producers, cores_available);
        assert!(first.warn && first.spawn);
        producers += 1;
        skip -= 1;

        // Drift back up to the threshold; ceiling now caps the response.
        skip += 1;
        let second = underrun_action(skip, cache_depth, producers, max_producers, cores_available);
        assert!(second.warn);
        assert!(!second.spawn, "second underrun must not add a producer");
    }

    #[test]
    fn no_spawn_without_a_spare_core() {
        let action = underrun_action(4, 4, 1, 4, 2);
        assert!(action.warn);
        assert!(!action.spawn);
    }
}
