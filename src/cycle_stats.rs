use std::fmt;
use std::io;
use std::io::Write;
use std::time::Duration;

use log::debug;

use crate::frame_source::Gain;

/// Diagnostics for one decision cycle. Recreated every cycle; has no
/// identity beyond it.
#[derive(Copy, Clone, Debug)]
pub struct CycleStats {
    /// Frames delivered this cycle divided by the wall-clock time since the
    /// previous cycle.
    pub achieved_fps: f64,

    /// Cumulative driver-reported dropped frames since streaming start.
    pub dropped_frames: i64,

    /// Gain in effect after this cycle's adjustment.
    pub gain: i32,

    /// Top-bin occupancy of this cycle's histogram.
    pub saturated_count: u32,
}

impl fmt::Display for CycleStats {
    /// One whitespace-separated diagnostic line:
    /// `<achieved_fps> <dropped_frames> <gain> <saturated_count>`,
    /// e.g. `24.826216484608742 0 481 3`.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {} {}",
               self.achieved_fps, self.dropped_frames,
               self.gain, self.saturated_count)
    }
}

/// Builds the per-cycle diagnostic record. Owns nothing but the running
/// cycle index.
pub struct CycleReporter {
    cycle_index: u64,
}

impl CycleReporter {
    pub fn new() -> Self {
        CycleReporter{cycle_index: 0}
    }

    pub fn cycle_index(&self) -> u64 {
        self.cycle_index
    }

    /// `elapsed` is the wall-clock time since the previous decision cycle
    /// (since streaming start, for the first cycle).
    pub fn report(&mut self, elapsed: Duration, frames_this_cycle: u32,
                  dropped_frames: i64, gain: Gain, saturated_count: u32)
                  -> CycleStats {
        self.cycle_index += 1;
        let achieved_fps = frames_this_cycle as f64 / elapsed.as_secs_f64();
        debug!("cycle {}: {} frames in {:.4}s",
               self.cycle_index, frames_this_cycle, elapsed.as_secs_f64());
        CycleStats {
            achieved_fps,
            dropped_frames,
            gain: gain.value(),
            saturated_count,
        }
    }
}

impl Default for CycleReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination for per-cycle diagnostic records. Emission failures must be
/// absorbed by the caller; reporting never breaks regulation.
pub trait StatsSink {
    fn emit(&mut self, stats: &CycleStats) -> io::Result<()>;
}

/// Writes one diagnostic line per cycle to stdout.
pub struct ConsoleSink;

impl StatsSink for ConsoleSink {
    fn emit(&mut self, stats: &CycleStats) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", stats)
    }
}
