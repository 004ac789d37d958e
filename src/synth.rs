//! Frame synthesis: config snapshot + entropy in, one finished [`Frame`] out.
//!
//! The synthesizer never holds the config lock across synthesis: it snapshots
//! the fields it needs in one reader-lock acquisition and works from the
//! copy. All pixel work happens on whole 32-bit words over the 16-byte
//! aligned buffer so the batch transforms compile down to vector code.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{RandMode, StimConfig, SubFrameMode};
use crate::context::PipelineContext;
use crate::entropy::BatchRng;
use crate::frame::{Frame, PixelBuffer};
use crate::stats::RollingAverage;

/// Portable batch byte transforms.
///
/// The public contract is the per-byte mapping; the word-parallel (SWAR)
/// implementation is an optimization detail the tests pin down byte by byte.
pub mod xform {
    /// Map every byte to `0xFF` if its sign bit is set, else `0x00`.
    #[inline]
    pub fn binary_threshold(words: &mut [u32]) {
        for word in words {
            *word = ((*word >> 7) & 0x0101_0101).wrapping_mul(0xFF);
        }
    }

    /// Zero every odd-indexed byte (interleave-with-zero): dual sub-frame
    /// packing keeps channels 0 and 2 and blanks the others.
    #[inline]
    pub fn zero_odd_bytes(words: &mut [u32]) {
        for word in words {
            *word &= 0x00FF_00FF;
        }
    }

    /// Replicate byte 0 of each pixel word into bytes 1 and 2 so R = G = B;
    /// byte 3 (alpha) is left untouched.
    #[inline]
    pub fn replicate_low_byte(words: &mut [u32]) {
        for word in words {
            let low = *word & 0xFF;
            *word = (*word & 0xFF00_0000) | low.wrapping_mul(0x0001_0101);
        }
    }
}

/// Turns config snapshots and entropy into finished frames.
///
/// Each synthesizer owns its own batch generator (seeded from the context's
/// incrementing counter) and a scratch word buffer reused across frames.
pub struct FrameSynthesizer {
    ctx: Arc<PipelineContext>,
    rng: BatchRng,
    scratch: Vec<u32>,
    timing: RollingAverage,
}

impl FrameSynthesizer {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        let rng = BatchRng::from_seed(ctx.next_synth_seed());
        Self {
            ctx,
            rng,
            scratch: Vec::new(),
            timing: RollingAverage::new(1000),
        }
    }

    /// Produce one frame from the current config snapshot.
    pub fn synthesize(&mut self) -> Frame {
        let started = Instant::now();
        let (config, serial) = self.ctx.shared.snapshot();
        let (nx, ny) = config.grid();

        let mut pixels = PixelBuffer::for_grid(nx, ny);

        let displacement = if config.displacement_x > 0 || config.displacement_y > 0 {
            let mut rng = self
                .ctx
                .displacement_rng
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            (
                rng.next_displacement(config.displacement_x),
                rng.next_displacement(config.displacement_y),
            )
        } else {
            (0, 0)
        };

        match config.rand_mode {
            RandMode::Uniform => {
                self.rng.fill_words(pixels.as_words_mut());
            }
            RandMode::Binary => {
                self.rng.fill_words(pixels.as_words_mut());
                xform::binary_threshold(pixels.as_words_mut());
            }
            RandMode::Gaussian => {
                self.fill_gaussian(&mut pixels, &config);
            }
        }

        match config.sub_frame {
            SubFrameMode::Single => xform::replicate_low_byte(pixels.as_words_mut()),
            SubFrameMode::Dual => xform::zero_odd_bytes(pixels.as_words_mut()),
            SubFrameMode::Triple => {}
        }

        let track = self
            .ctx
            .track
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot_and_advance();

        self.timing.record(started.elapsed());

        Frame {
            pixels,
            nx,
            ny,
            display_width: config.display_width,
            display_height: config.display_height,
            margins: config.margins,
            background: config.background,
            displacement,
            track,
            serial,
        }
    }

    fn fill_gaussian(&mut self, pixels: &mut PixelBuffer, config: &StimConfig) {
        let words_per_pixel = config.sub_frame.words_per_pixel();
        let pixel_count = pixels.as_words().len();
        self.scratch.resize(pixel_count * words_per_pixel, 0);
        self.rng.fill_words(&mut self.scratch);

        // Uncontended read: rebuilds happen only between runs.
        let table = self.ctx.table.read().unwrap_or_else(|e| e.into_inner());
        let background = config.background;
        let contrast = config.contrast;
        let out = pixels.as_words_mut();
        for (pixel, draws) in out.iter_mut().zip(self.scratch.chunks_exact(words_per_pixel)) {
            let mut word = 0u32;
            match config.sub_frame {
                SubFrameMode::Single => {
                    word = table.lookup(draws[0], background, contrast) as u32;
                }
                SubFrameMode::Dual => {
                    // Active channels are bytes 0 and 2; the packing pass
                    // blanks the odd bytes afterwards.
                    word |= table.lookup(draws[0], background, contrast) as u32;
                    word |= (table.lookup(draws[1], background, contrast) as u32) << 16;
                }
                SubFrameMode::Triple => {
                    word |= table.lookup(draws[0], background, contrast) as u32;
                    word |= (table.lookup(draws[1], background, contrast) as u32) << 8;
                    word |= (table.lookup(draws[2], background, contrast) as u32) << 16;
                }
            }
            *pixel = word;
        }
    }

    /// Average synthesis time over the last 1000 frames.
    pub fn average_synthesis_time(&self) -> Option<Duration> {
        self.timing.average()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Margins, StimConfig, SubFrameMode};

    fn base_config() -> StimConfig {
        StimConfig {
            display_width: 160,
            display_height: 120,
            stixel_width: 10,
            stixel_height: 10,
            rand_mode: RandMode::Uniform,
            contrast: 1.0,
            background: 0.5,
            margins: Margins::default(),
            displacement_x: 0,
            displacement_y: 0,
            sub_frame: SubFrameMode::Triple,
            color_table_size: 4096,
            cache_depth: 4,
            cores: 1,
            seed: 77,
            frame_track: Default::default(),
        }
    }

    fn synthesize_one(config: StimConfig) -> Frame {
        let ctx = PipelineContext::new(config).expect("config should validate");
        FrameSynthesizer::new(ctx).synthesize()
    }

    #[test]
    fn binary_threshold_maps_every_byte_to_an_extreme() {
        let mut words: Vec<u32> = (0..=255u32)
            .map(|b| b | (255 - b) << 8 | b << 16 | (b ^ 0xA5) << 24)
            .collect();
        let reference: Vec<u8> = words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .map(|b| if (b as i8) < 0 { 0xFF } else { 0x00 })
            .collect();

        xform::binary_threshold(&mut words);

        let actual: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert_eq!(actual, reference);
    }

    #[test]
    fn zero_odd_bytes_blanks_alternating_channels() {
        let mut words = vec![0xFFFF_FFFFu32, 0x1234_5678];
        xform::zero_odd_bytes(&mut words);
        for word in &words {
            let bytes = word.to_le_bytes();
            assert_eq!(bytes[1], 0);
            assert_eq!(bytes[3], 0);
        }
        assert_eq!(words[0], 0x00FF_00FF);
    }

    #[test]
    fn replicate_low_byte_makes_rgb_equal_and_keeps_alpha() {
        let mut words = vec![0xAB00_0042u32];
        xform::replicate_low_byte(&mut words);
        let bytes = words[0].to_le_bytes();
        assert_eq!(bytes[0], 0x42);
        assert_eq!(bytes[1], 0x42);
        assert_eq!(bytes[2], 0x42);
        assert_eq!(bytes[3], 0xAB);
    }

    #[test]
    fn synthesis_is_deterministic_for_same_seed() {
        let a = synthesize_one(base_config());
        let b = synthesize_one(base_config());
        assert_eq!(a.pixels.as_bytes(), b.pixels.as_bytes());
        assert_eq!(a.serial, 0);
    }

    #[test]
    fn buffer_length_matches_grid() {
        let frame = synthesize_one(base_config());
        assert_eq!((frame.nx, frame.ny), (16, 12));
        assert_eq!(frame.pixels.len(), 16 * 12 * 4);
    }

    #[test]
    fn binary_mode_output_is_two_valued() {
        let mut config = base_config();
        config.rand_mode = RandMode::Binary;
        let frame = synthesize_one(config);
        assert!(frame
            .pixels
            .as_bytes()
            .iter()
            .all(|&b| b == 0x00 || b == 0xFF));
    }

    #[test]
    fn dual_mode_zeroes_every_odd_byte() {
        for mode in [RandMode::Uniform, RandMode::Binary, RandMode::Gaussian] {
            let mut config = base_config();
            config.rand_mode = mode;
            config.sub_frame = SubFrameMode::Dual;
            let frame = synthesize_one(config);
            for (index, &byte) in frame.pixels.as_bytes().iter().enumerate() {
                if index % 2 == 1 {
                    assert_eq!(byte, 0, "odd byte {index} not blanked in {mode:?} mode");
                }
            }
        }
    }

    #[test]
    fn single_mode_replicates_channels() {
        for mode in [RandMode::Uniform, RandMode::Binary, RandMode::Gaussian] {
            let mut config = base_config();
            config.rand_mode = mode;
            config.sub_frame = SubFrameMode::Single;
            let frame = synthesize_one(config);
            for pixel in frame.pixels.as_bytes().chunks_exact(4) {
                assert_eq!(pixel[0], pixel[1]);
                assert_eq!(pixel[1], pixel[2]);
            }
        }
    }

    #[test]
    fn displacement_draws_stay_in_range() {
        let mut config = base_config();
        config.displacement_x = 5;
        config.displacement_y = 3;
        let ctx = PipelineContext::new(config).expect("config should validate");
        let mut synth = FrameSynthesizer::new(ctx);
        for _ in 0..50 {
            let frame = synth.synthesize();
            assert!(frame.displacement.0.abs() <= 5);
            assert!(frame.displacement.1.abs() <= 3);
        }
    }
}
