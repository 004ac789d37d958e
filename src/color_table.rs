//! Precomputed gaussian color lookup table.
//!
//! Gaussian-mode synthesis never draws deviates per pixel; it indexes this
//! table with raw entropy words masked to the table size. The table is built
//! once per full (re-)init. When contrast or background change at runtime the
//! table is NOT rebuilt: lookups fall back to a parallel "unscaled" table of
//! raw deviates and rescale per access, keeping frame-to-frame statistics
//! identical to a run where the parameters never changed.

use crate::entropy::GaussianRng;

pub struct GaussianColorTable {
    scaled: Vec<u8>,
    unscaled: Vec<f32>,
    mask: u32,
    background: f32,
    contrast: f32,
    seed: u64,
}

impl GaussianColorTable {
    /// Build a table of `size` entries (power of two, checked at config
    /// validation) for the given build-time background and contrast.
    ///
    /// Each entry draws deviates until `background + d*(background*contrast)`
    /// lands in [0, 1], then quantizes by multiplying by 256 and truncating.
    pub fn build(size: usize, background: f32, contrast: f32, seed: u64) -> Self {
        debug_assert!(size.is_power_of_two() && size > 2048);

        let mut rng = GaussianRng::from_seed(seed);
        let mut scaled = Vec::with_capacity(size);
        let mut unscaled = Vec::with_capacity(size);
        for _ in 0..size {
            let deviate = loop {
                let d = rng.next_deviate() as f32;
                let value = background + d * (background * contrast);
                if value >= 0.0 && value <= 1.0 {
                    break d;
                }
            };
            let value = background + deviate * (background * contrast);
            scaled.push(quantize(value));
            unscaled.push(deviate);
        }

        Self {
            scaled,
            unscaled,
            mask: (size - 1) as u32,
            background,
            contrast,
            seed,
        }
    }

    /// True if a table built from these inputs would be identical to this
    /// one, i.e. a re-init can keep it.
    pub fn matches(&self, size: usize, background: f32, contrast: f32, seed: u64) -> bool {
        self.scaled.len() == size
            && self.background == background
            && self.contrast == contrast
            && self.seed == seed
    }

    pub fn len(&self) -> usize {
        self.scaled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scaled.is_empty()
    }

    /// Index mask (`size - 1`); table sizes are always powers of two.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Look up the color byte for a raw entropy word.
    ///
    /// If the caller's background/contrast still match the build-time values
    /// this is a single masked read. Otherwise the unscaled deviate is
    /// rescaled on the fly; no rebuild happens at runtime.
    #[inline]
    pub fn lookup(&self, word: u32, background: f32, contrast: f32) -> u8 {
        let index = (word & self.mask) as usize;
        if background == self.background && contrast == self.contrast {
            self.scaled[index]
        } else {
            let value = self.unscaled[index] * background * contrast + background;
            (255.0 * value.clamp(0.0, 1.0)).round() as u8
        }
    }
}

#[inline]
fn quantize(value: f32) -> u8 {
    // *256 with truncation; value == 1.0 must still fit in a byte.
    ((value * 256.0) as u32).min(255) as u8
}
