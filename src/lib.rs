//! Real-time pseudorandom checkerboard stimulus pipeline.
//!
//! Once per display refresh the pipeline presents a fresh pseudorandom
//! stixel grid from a fixed ring of pre-rendered GPU slots, while producer
//! threads keep the ring topped up and an operator can change stimulus
//! parameters mid-run without stalling delivery or corrupting the recorded
//! parameter history.
//!
//! The moving parts, leaves first: [`entropy`] (seedable batch generators),
//! [`color_table`] (precomputed gaussian lookup), [`synth`] (config snapshot
//! + entropy -> one [`frame::Frame`]), [`producer`] (worker loops behind a
//! token/frame channel pair), [`cache`] (the slot ring and its upload
//! backends), [`scheduler`] (the per-refresh consumer) and [`params`] (the
//! versioned config with deferred history commits).

pub mod cache;
pub mod color_table;
pub mod config;
pub mod context;
pub mod entropy;
pub mod frame;
pub mod params;
pub mod producer;
pub mod scheduler;
pub mod stats;
pub mod synth;
