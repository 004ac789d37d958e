//! Explicit pipeline context handle.
//!
//! Everything the synthesis and display sides share lives here and is passed
//! by `Arc` into constructors; there is no ambient global lookup. The color
//! table is rebuilt only on a full re-init and never while producers run, so
//! its `RwLock` is uncontended on the synthesis path; the displacement
//! generator and frame-track state each sit behind their own mutex because
//! more than one producer may touch them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::color_table::GaussianColorTable;
use crate::config::{ConfigError, SharedConfig, StimConfig};
use crate::entropy::BatchRng;
use crate::frame::FrameTrack;

// Domain tweaks keep the table, displacement and producer streams disjoint
// even though they all derive from the one configured seed.
const GAUSS_SEED_TWEAK: u64 = 0x6761_7573_7369_616E;
const DISPLACEMENT_SEED_TWEAK: u64 = 0x6469_7370_6C61_6365;

pub struct PipelineContext {
    pub shared: SharedConfig,
    pub table: RwLock<GaussianColorTable>,
    pub displacement_rng: Mutex<BatchRng>,
    pub track: Mutex<FrameTrack>,
    seed_counter: AtomicU64,
}

impl PipelineContext {
    /// Validate the config, build the color table, and assemble the shared
    /// state for a run.
    pub fn new(config: StimConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;

        let table = GaussianColorTable::build(
            config.color_table_size,
            config.background,
            config.contrast,
            config.seed ^ GAUSS_SEED_TWEAK,
        );
        let displacement_rng =
            Mutex::new(BatchRng::from_seed(config.seed ^ DISPLACEMENT_SEED_TWEAK));
        let track = Mutex::new(FrameTrack::new(config.frame_track));
        let seed_counter = AtomicU64::new(config.seed);

        Ok(Arc::new(Self {
            shared: SharedConfig::new(config),
            table: RwLock::new(table),
            displacement_rng,
            track,
            seed_counter,
        }))
    }

    /// Reset per-run state for a (re)start against the installed config.
    ///
    /// Critical fields can change legally while the pipeline is stopped, so a
    /// restart must pick them up here: the color table is rebuilt when its
    /// build inputs changed, the frame track leaves its latched terminal
    /// phase, and the entropy streams restart from the configured seed. Must
    /// only be called with no producers alive.
    pub fn reinitialize(&self) {
        let (config, _) = self.shared.snapshot();
        let table_seed = config.seed ^ GAUSS_SEED_TWEAK;
        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            if !table.matches(
                config.color_table_size,
                config.background,
                config.contrast,
                table_seed,
            ) {
                *table = GaussianColorTable::build(
                    config.color_table_size,
                    config.background,
                    config.contrast,
                    table_seed,
                );
            }
        }
        *self
            .displacement_rng
            .lock()
            .unwrap_or_else(|e| e.into_inner()) =
            BatchRng::from_seed(config.seed ^ DISPLACEMENT_SEED_TWEAK);
        *self.track.lock().unwrap_or_else(|e| e.into_inner()) =
            FrameTrack::new(config.frame_track);
        self.seed_counter.store(config.seed, Ordering::Relaxed);
    }

    /// Next seed for a synthesizer instance. Incrementing guarantees no two
    /// producers replay the same entropy stream.
    pub fn next_synth_seed(&self) -> u64 {
        self.seed_counter.fetch_add(1, Ordering::Relaxed)
    }
}
