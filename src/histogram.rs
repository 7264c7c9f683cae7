// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, invalid_argument_error};
use image::GrayImage;

pub const NUM_BINS: usize = 256;

/// Intensity histogram of one 8-bit greyscale frame. `counts` is the exact
/// per-bin tally; `density` is the normalized per-bin probability, kept for
/// display/telemetry only. The gain decision logic consumes `counts`.
pub struct Histogram {
    counts: [u32; NUM_BINS],
    density: [f64; NUM_BINS],
    total: u32,
}

impl Histogram {
    /// Tallies `image` into 256 unit-width bins. Pure function of the pixel
    /// data. A zero-size frame is a caller error, not a degenerate histogram.
    pub fn analyze(image: &GrayImage) -> Result<Histogram, CanonicalError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid_argument_error(
                format!("Cannot analyze zero-size frame ({}x{})",
                        width, height).as_str()));
        }
        let mut counts = [0u32; NUM_BINS];
        for pixel_value in image.as_raw() {
            counts[*pixel_value as usize] += 1;
        }
        let total = width * height;
        let mut density = [0f64; NUM_BINS];
        for (d, c) in density.iter_mut().zip(counts.iter()) {
            *d = *c as f64 / total as f64;
        }
        Ok(Histogram{counts, density, total})
    }

    pub fn counts(&self) -> &[u32; NUM_BINS] {
        &self.counts
    }

    pub fn density(&self) -> &[f64; NUM_BINS] {
        &self.density
    }

    /// Number of samples tallied; equals width*height of the analyzed frame.
    pub fn total_samples(&self) -> u32 {
        self.total
    }

    /// Occupancy of the top bin: pixels clipped at the maximum representable
    /// intensity.
    pub fn saturated_count(&self) -> u32 {
        self.counts[NUM_BINS - 1]
    }

    /// Smallest intensity value v such that bins 0..=v hold at least
    /// `fraction` of all samples.
    pub fn percentile_value(&self, fraction: f64) -> u8 {
        let threshold = (fraction * self.total as f64) as u32;
        let mut cumulative = 0u32;
        for (value, count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= threshold {
                return value as u8;
            }
        }
        (NUM_BINS - 1) as u8
    }

    /// Highest intensity value present in the frame.
    pub fn max_value(&self) -> u8 {
        for value in (0..NUM_BINS).rev() {
            if self.counts[value] > 0 {
                return value as u8;
            }
        }
        0
    }
}
