use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error};

use crate::frame_source::Gain;
use crate::histogram::Histogram;

/// Static configuration for a gain regulation session, read once at startup.
#[derive(Clone, Debug)]
pub struct AgcSettings {
    /// Gain value the controller starts from. Must be within
    /// [0, max_gain].
    pub starting_gain: i32,

    /// Upper clamp for the regulated gain. 510 is the device maximum for the
    /// ZWO class of sensors; the lower clamp is always 0.
    pub max_gain: i32,

    /// Gain adjustment applied per decision cycle.
    pub gain_step: i32,

    /// Number of pixels allowed in the top histogram bin before gain is cut.
    /// A few hot pixels always land there; the threshold keeps them from
    /// triggering a cut.
    pub saturation_threshold: u32,

    /// A gain decision is evaluated every this many delivered frames.
    pub frames_per_cycle: u32,

    /// Per-frame capture timeout. None waits indefinitely.
    pub capture_timeout: Option<Duration>,
}

impl Default for AgcSettings {
    fn default() -> Self {
        AgcSettings {
            starting_gain: 510,
            max_gain: 510,
            gain_step: 1,
            saturation_threshold: 5,
            frames_per_cycle: 5,
            capture_timeout: None,
        }
    }
}

impl AgcSettings {
    pub fn validate(&self) -> Result<(), CanonicalError> {
        if self.max_gain < 0 {
            return Err(invalid_argument_error(
                format!("max_gain {} must be non-negative", self.max_gain).as_str()));
        }
        if self.starting_gain < 0 || self.starting_gain > self.max_gain {
            return Err(invalid_argument_error(
                format!("starting_gain {} outside [0, {}]",
                        self.starting_gain, self.max_gain).as_str()));
        }
        if self.gain_step < 1 {
            return Err(invalid_argument_error(
                format!("gain_step {} must be positive", self.gain_step).as_str()));
        }
        if self.frames_per_cycle < 1 {
            return Err(invalid_argument_error("frames_per_cycle must be positive"));
        }
        Ok(())
    }
}

/// Bang-bang gain regulator. The controller owns the live gain value and
/// mutates it in exactly one place, update(), once per decision cycle: gain
/// moves by one step at every cycle, up or down, and is clamped to
/// [0, max_gain]. There is no hold state between the increase and decrease
/// conditions, so a scene sitting at the threshold oscillates by one step.
pub struct GainController {
    settings: AgcSettings,
    gain: i32,
}

impl GainController {
    pub fn new(settings: AgcSettings) -> Result<Self, CanonicalError> {
        settings.validate()?;
        let gain = settings.starting_gain;
        Ok(GainController{settings, gain})
    }

    /// The gain currently held by the controller.
    pub fn gain(&self) -> Gain {
        Gain::new(self.gain)
    }

    /// One decision cycle. Cuts gain when the frame's blown-highlights bin
    /// exceeds the saturation threshold (strictly), raises it otherwise.
    /// Returns the new gain, to be actuated on the frame source.
    pub fn update(&mut self, histogram: &Histogram) -> Gain {
        if histogram.saturated_count() > self.settings.saturation_threshold {
            self.gain -= self.settings.gain_step;
        } else {
            self.gain += self.settings.gain_step;
        }
        self.gain = self.gain.clamp(0, self.settings.max_gain);
        Gain::new(self.gain)
    }
}
