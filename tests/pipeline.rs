//! End-to-end scenarios against the in-memory slot backend.

use std::sync::Arc;

use checkflicker::cache::MemorySlotCache;
use checkflicker::config::{available_cores, Margins, RandMode, StimConfig, SubFrameMode};
use checkflicker::context::PipelineContext;
use checkflicker::frame::TrackMode;
use checkflicker::scheduler::{DisplayScheduler, SchedulerState};

/// The reference scenario: 800x600 canvas, 10x10 stixels, zero margins,
/// single-thread synthesis, 30-deep cache, uniform entropy.
fn scenario_config() -> StimConfig {
    StimConfig {
        display_width: 800,
        display_height: 600,
        stixel_width: 10,
        stixel_height: 10,
        rand_mode: RandMode::Uniform,
        contrast: 1.0,
        background: 0.5,
        margins: Margins::default(),
        displacement_x: 0,
        displacement_y: 0,
        sub_frame: SubFrameMode::Triple,
        color_table_size: 1 << 15,
        cache_depth: 30,
        cores: 1,
        seed: 10_000,
        frame_track: Default::default(),
    }
}

fn scheduler_for(config: StimConfig) -> DisplayScheduler<MemorySlotCache> {
    let ctx = PipelineContext::new(config).expect("config should validate");
    DisplayScheduler::new(ctx, MemorySlotCache::new(), true)
}

#[test]
fn prefill_uploads_exactly_cache_depth_frames() {
    let mut scheduler = scheduler_for(scenario_config());
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    scheduler.initialize().expect("init should succeed");
    assert_eq!(scheduler.state(), SchedulerState::Running);

    // All 30 slots are synthesized and uploaded before the first tick.
    let log = scheduler.uploader().upload_log();
    assert_eq!(log.len(), 30);
    assert_eq!(log, (0..30usize).collect::<Vec<_>>());
    for slot in 0..30 {
        let bytes = scheduler
            .uploader()
            .slot_bytes(slot)
            .expect("slot was uploaded");
        assert_eq!(bytes.len(), 80 * 60 * 4);
    }
}

#[test]
fn slots_recycle_round_robin_across_ticks() {
    let mut scheduler = scheduler_for(scenario_config());
    scheduler.initialize().expect("init should succeed");

    for _ in 0..41 {
        scheduler.tick().expect("tick should succeed");
    }

    // The first tick finds the ring full and only displays; every later tick
    // refills the slot it freed, continuing the 0..29 cycle.
    let log = scheduler.uploader().upload_log();
    assert_eq!(log.len(), 30 + 40);
    for (index, &slot) in log.iter().enumerate() {
        assert_eq!(slot, index % 30, "upload {index} hit the wrong slot");
    }
    assert_eq!(scheduler.frames_displayed(), 41);
}

#[test]
fn every_tick_displays_in_upload_order() {
    let mut scheduler = scheduler_for(scenario_config());
    scheduler.initialize().expect("init should succeed");

    for expected in 0..50u64 {
        let report = scheduler.tick().expect("tick should succeed");
        let meta = report.displayed.expect("a prefetched frame is displayed");
        assert_eq!(meta.frame_number, expected);
        assert!(!report.skipped);
    }
}

#[test]
fn threaded_pipeline_delivers_every_tick_in_simulated_mode() {
    if available_cores() < 2 {
        return;
    }

    let mut config = scenario_config();
    config.cores = 2;
    config.cache_depth = 6;
    let mut scheduler = scheduler_for(config);
    scheduler.initialize().expect("init should succeed");
    assert_eq!(scheduler.producer_count(), 1);

    for _ in 0..60 {
        let report = scheduler.tick().expect("tick should succeed");
        assert!(!report.skipped, "simulated mode blocks instead of skipping");
    }
    assert_eq!(scheduler.frames_displayed(), 60);

    scheduler.shutdown();
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[test]
fn upload_stats_cover_every_upload() {
    let mut scheduler = scheduler_for(scenario_config());
    scheduler.initialize().expect("init should succeed");
    for _ in 0..10 {
        scheduler.tick().expect("tick should succeed");
    }
    let stats = scheduler.upload_stats();
    assert_eq!(stats.count, 30 + 9);
    assert!(stats.min.is_some() && stats.max.is_some());
    assert!(stats.min <= stats.max);
}

#[test]
fn consecutive_misses_accumulate_skips_and_spawn_one_producer() {
    if available_cores() < 3 {
        return;
    }

    // Frames heavy enough that one producer cannot keep up with an
    // unthrottled tick loop: every miss must surface as a skip, and the
    // corrective producer comes up once the streak reaches the cache depth.
    let mut config = scenario_config();
    config.display_width = 1600;
    config.display_height = 1600;
    config.stixel_width = 1;
    config.stixel_height = 1;
    config.rand_mode = RandMode::Gaussian;
    config.color_table_size = 4096;
    config.cache_depth = 4;
    config.cores = 3;
    let ctx = PipelineContext::new(config).expect("config should validate");
    let mut scheduler = DisplayScheduler::new(ctx, MemorySlotCache::new(), false);
    scheduler.initialize().expect("init should succeed");
    assert_eq!(scheduler.producer_count(), 1);

    let mut skips = 0usize;
    let mut spawned = false;
    for _ in 0..20_000 {
        let report = scheduler.tick().expect("tick should succeed");
        if report.skipped {
            skips += 1;
        }
        if report.spawned_producer {
            spawned = true;
            break;
        }
    }
    assert!(skips >= 4, "misses were not recorded as skips (saw {skips})");
    assert!(spawned, "underrun never spawned a corrective producer");
    assert_eq!(scheduler.producer_count(), 2);

    // The producer ceiling holds no matter how long the underrun lasts.
    for _ in 0..5_000 {
        scheduler.tick().expect("tick should succeed");
    }
    assert_eq!(scheduler.producer_count(), 2);
}

#[test]
fn restart_rebuilds_the_table_and_resets_the_track() {
    let mut config = scenario_config();
    config.rand_mode = RandMode::Gaussian;
    config.color_table_size = 4096;
    config.cache_depth = 4;
    let ctx = PipelineContext::new(config.clone()).expect("config should validate");
    let mut scheduler =
        DisplayScheduler::new(Arc::clone(&ctx), MemorySlotCache::new(), true);

    scheduler.initialize().expect("init should succeed");
    for _ in 0..3 {
        scheduler.tick().expect("tick should succeed");
    }
    scheduler.shutdown();
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    // A colortable resize is a critical change, legal while stopped.
    let mut change = config;
    change.color_table_size = 8192;
    scheduler
        .reapply(change)
        .expect("critical change accepted while stopped");

    scheduler.initialize().expect("restart should succeed");
    assert_eq!(ctx.table.read().unwrap().len(), 8192);

    // The restarted run opens with the start marker, not the latched end.
    let report = scheduler.tick().expect("tick should succeed");
    let meta = report.displayed.expect("frame displayed");
    assert_eq!(meta.track.mode, TrackMode::Start);
}

#[test]
fn degenerate_grid_fails_before_any_allocation() {
    let mut config = scenario_config();
    config.stixel_width = 2000;
    assert!(PipelineContext::new(config).is_err());
}
