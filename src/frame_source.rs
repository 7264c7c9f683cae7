use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use canonical_error::CanonicalError;
use image::GrayImage;

/// Sensor analog gain, in the device's native units. The reference sensor
/// class (ZWO ASI) exposes 0..=510; other devices report their own range via
/// FrameSource::gain_bounds().
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Gain(i32);

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)  // Just re-use Debug.
    }
}

impl Gain {
    pub fn new(gain: i32) -> Gain {
        assert!(gain >= 0);
        Gain(gain)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

#[derive(Copy, Clone, Debug)]
pub struct Celsius(pub i32);

/// Some cameras provide in-hardware binning. Binning is either by summing or
/// averaging; it is up to application logic to react and set exposure or gain
/// accordingly.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinFactor {
    X1,  // Unbinned.
    X2,  // Each output pixel is the combined value of 2x2 input pixels.
}

/// Sample format delivered by capture_frame(). The gain regulation path
/// operates on 8-bit intensities.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PixelFormat {
    Raw8,
    Raw16,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RegionOfInterest {
    pub binning: BinFactor,

    // The capture position and dimensions are w.r.t. the dimensions
    // of the sensor after binning.

    /// (x, y) from top left.
    pub capture_startpos: (i32, i32),

    /// (width, height).
    pub capture_dimensions: (i32, i32),
}

/// One video frame delivered by a FrameSource. The acquisition loop owns the
/// frame for the duration of one loop iteration; the Arc lets the source keep
/// or recycle the underlying buffer.
#[derive(Clone, Debug)]
pub struct CapturedFrame {
    /// 8-bit greyscale pixel data, row major.
    pub image: Arc<GrayImage>,

    pub readout_time: SystemTime,

    /// Gain that was in effect when this frame was read out.
    pub gain: Gain,

    pub temperature: Celsius,
}

/// FrameSource models a streaming 8-bit greyscale camera: configuration,
/// streaming start/stop, blocking frame capture, gain actuation, and the
/// driver's cumulative dropped-frame counter.
///
/// Opening a device is each implementation's constructor; a missing device
/// yields a NotFound error. All other failure modes are reported through
/// CanonicalError codes:
/// * InvalidArgument: rejected configuration or gain outside gain_bounds().
/// * DeadlineExceeded: capture_frame() timeout. Recoverable; the caller may
///   simply capture again.
/// * FailedPrecondition: capture_frame() while streaming is stopped.
/// * Internal: device fault. Not recoverable.
#[async_trait]
pub trait FrameSource {
    /// Returns a string identifying what kind of camera this is. e.g.
    /// "ASI120mm mini", "ImageCamera", etc.
    fn model(&self) -> String;

    /// Returns the (width, height) of this camera type's sensor.
    fn dimensions(&self) -> (i32, i32);

    /// The device's actuation range for set_gain(), as (min, max) inclusive.
    fn gain_bounds(&self) -> (i32, i32);

    /// Applies capture geometry and sample format prior to streaming. The
    /// implementation may adjust capture_startpos and/or capture_dimensions
    /// as needed to satisfy constraints of this camera type (e.g. capture
    /// width might need to be a multiple of 16). The adjusted region of
    /// interest is returned.
    fn configure(&mut self, roi: RegionOfInterest, pixel_format: PixelFormat)
                 -> Result<RegionOfInterest, CanonicalError>;

    /// Begins continuous video capture. Starting an already-streaming source
    /// is a no-op.
    async fn start_streaming(&mut self) -> Result<(), CanonicalError>;

    /// Ends continuous video capture. Stopping twice is a no-op.
    async fn stop_streaming(&mut self) -> Result<(), CanonicalError>;

    /// Obtains the next video frame, waiting up to `timeout` for one to
    /// become available; `None` waits indefinitely. A lapsed timeout is
    /// reported as DeadlineExceeded and leaves the stream usable.
    async fn capture_frame(&mut self, timeout: Option<Duration>)
                           -> Result<CapturedFrame, CanonicalError>;

    /// Applies `gain` to the sensor, taking effect for subsequent frames.
    /// Values outside gain_bounds() are rejected with InvalidArgument.
    async fn set_gain(&mut self, gain: Gain) -> Result<(), CanonicalError>;

    /// Returns the gain most recently applied with set_gain().
    fn get_gain(&self) -> Gain;

    /// Cumulative count of frames the driver failed to deliver since
    /// streaming started. Monotonically non-decreasing.
    fn dropped_frame_count(&self) -> i64;
}
