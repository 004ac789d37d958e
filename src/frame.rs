//! The Frame value type, its 16-byte-aligned pixel storage, and the
//! photodiode frame-track marker state.
//!
//! A `Frame` is move-only and exclusively owned: by the producer while it is
//! being built, by the handoff channel while queued, and by the cache slot
//! after upload. Nothing mutates a frame after handoff.

use bytemuck::{Pod, Zeroable};

use crate::config::{FrameTrackConfig, Margins};

/// One 16-byte vector lane of pixel storage.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy)]
pub struct PixelBlock(pub [u8; 16]);

// Size equals alignment, so the block has no padding and every bit pattern
// is valid; the derive macro rejects repr(align) conservatively.
unsafe impl Zeroable for PixelBlock {}
unsafe impl Pod for PixelBlock {}

/// Pixel buffer for one frame: `nx * ny * 4` bytes of BGRA data, backed by
/// whole 16-byte blocks so batch transforms can run vector-width steps.
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    blocks: Vec<PixelBlock>,
    len: usize,
}

impl PixelBuffer {
    /// Allocate a zeroed buffer for `nx * ny` pixels.
    pub fn for_grid(nx: u32, ny: u32) -> Self {
        let len = nx as usize * ny as usize * 4;
        let blocks = vec![PixelBlock([0; 16]); (len + 15) / 16];
        Self { blocks, len }
    }

    /// Logical length in bytes (`nx * ny * 4`, not the padded block length).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.blocks)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.blocks)[..self.len]
    }

    /// Word view over the logical pixels; one `u32` per BGRA pixel.
    pub fn as_words(&self) -> &[u32] {
        &bytemuck::cast_slice(&self.blocks)[..self.len / 4]
    }

    pub fn as_words_mut(&mut self) -> &mut [u32] {
        &mut bytemuck::cast_slice_mut(&mut self.blocks)[..self.len / 4]
    }
}

/// Frame-track marker phase. The photodiode distinguishes phases by
/// intensity: the box alternates track/off every displayed frame, flashes
/// `Change` on the frame where a parameter change takes visual effect, and
/// brackets the run with `Start`/`End`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    Start,
    Track,
    Off,
    Change,
    End,
}

impl TrackMode {
    /// Marker box intensity byte for this phase.
    pub fn intensity(self) -> u8 {
        match self {
            Self::Start => 255,
            Self::Track => 255,
            Self::Off => 0,
            Self::Change => 128,
            Self::End => 64,
        }
    }
}

/// Immutable per-frame snapshot of the marker state, stamped onto frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackSnapshot {
    pub enabled: bool,
    pub x: u32,
    pub y: u32,
    pub size: u32,
    pub mode: TrackMode,
}

/// Mutable frame-track state machine, advanced once per synthesized frame.
#[derive(Debug, Clone)]
pub struct FrameTrack {
    config: FrameTrackConfig,
    mode: TrackMode,
    pending_change: bool,
}

impl FrameTrack {
    pub fn new(config: FrameTrackConfig) -> Self {
        Self {
            config,
            mode: TrackMode::Start,
            pending_change: false,
        }
    }

    /// Snapshot for stamping onto the frame being built, then advance.
    pub fn snapshot_and_advance(&mut self) -> TrackSnapshot {
        let snapshot = TrackSnapshot {
            enabled: self.config.enabled,
            x: self.config.x,
            y: self.config.y,
            size: self.config.size,
            mode: self.mode,
        };
        self.mode = match self.mode {
            TrackMode::End => TrackMode::End,
            TrackMode::Off if self.pending_change => TrackMode::Change,
            TrackMode::Off => TrackMode::Track,
            // Start, Track and Change all fall back to the off phase.
            _ => TrackMode::Off,
        };
        if snapshot.mode == TrackMode::Change {
            self.pending_change = false;
        }
        snapshot
    }

    /// Flash `Change` on the next off-phase frame.
    pub fn mark_change(&mut self) {
        self.pending_change = true;
    }

    /// Latch the terminal end-of-run phase.
    pub fn mark_end(&mut self) {
        self.mode = TrackMode::End;
    }
}

/// One fully synthesized stimulus frame plus the metadata the display side
/// needs to draw and record it.
#[derive(Debug)]
pub struct Frame {
    pub pixels: PixelBuffer,
    pub nx: u32,
    pub ny: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub margins: Margins,
    pub background: f32,
    pub displacement: (i32, i32),
    pub track: TrackSnapshot,
    /// Parameter serial active when this frame was generated.
    pub serial: u64,
}
