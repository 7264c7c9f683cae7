// Simulated camera that serves a scripted sequence of frames. Stands in for
// the real device driver in tests and demo programs.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use canonical_error::{CanonicalError, deadline_exceeded_error,
                      failed_precondition_error, internal_error,
                      invalid_argument_error};
use image::GrayImage;
use image::imageops::crop_imm;

use crate::frame_source::{BinFactor, CapturedFrame, Celsius, FrameSource,
                          Gain, PixelFormat, RegionOfInterest};

/// One scripted capture outcome.
#[derive(Clone)]
pub enum SimEvent {
    /// Deliver this frame.
    Frame(Arc<GrayImage>),
    /// Report a capture timeout.
    Timeout,
    /// Report a device fault with the given message.
    Fault(String),
}

pub struct ImageCamera {
    events: Vec<SimEvent>,
    next_event: usize,

    /// Once the script is exhausted, keep re-serving the last delivered
    /// frame instead of faulting.
    repeat_last_frame: bool,

    last_image: Option<Arc<GrayImage>>,

    // Sensor geometry of the backing frames.
    width: i32,
    height: i32,
    roi: RegionOfInterest,

    gain: Gain,
    gain_bounds: (i32, i32),

    // Zero means go as fast as frames are requested.
    frame_interval: Duration,
    last_frame_time: Instant,

    // Shared so tests can observe or inject state while the camera is owned
    // by the acquisition loop.
    streaming: Arc<AtomicBool>,
    dropped: Arc<AtomicI64>,
    actuated_gains: Arc<Mutex<Vec<i32>>>,
}

impl ImageCamera {
    /// Camera that re-serves `image` indefinitely.
    pub fn new(image: GrayImage) -> Result<Self, CanonicalError> {
        Self::from_events(vec![SimEvent::Frame(Arc::new(image))])
            .map(|camera| camera.with_repeat_last_frame())
    }

    /// Camera driven by an explicit event script. The script must contain at
    /// least one frame; once exhausted, further captures report a device
    /// fault (unless repeat-last-frame mode is enabled).
    pub fn from_events(events: Vec<SimEvent>) -> Result<Self, CanonicalError> {
        let first_frame = events.iter().find_map(|event| match event {
            SimEvent::Frame(image) => Some(image.clone()),
            _ => None,
        });
        let Some(first_frame) = first_frame else {
            return Err(invalid_argument_error(
                "ImageCamera script contains no frames"));
        };
        let (width, height) = first_frame.dimensions();
        if width == 0 || height == 0 {
            return Err(invalid_argument_error(
                "ImageCamera frames must be non-empty"));
        }
        let (width, height) = (width as i32, height as i32);
        Ok(ImageCamera {
            events,
            next_event: 0,
            repeat_last_frame: false,
            last_image: None,
            width,
            height,
            roi: RegionOfInterest {
                binning: BinFactor::X1,
                capture_startpos: (0, 0),
                capture_dimensions: (width, height),
            },
            gain: Gain::new(0),
            gain_bounds: (0, 510),
            frame_interval: Duration::ZERO,
            last_frame_time: Instant::now(),
            streaming: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicI64::new(0)),
            actuated_gains: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn with_repeat_last_frame(mut self) -> Self {
        self.repeat_last_frame = true;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn with_gain_bounds(mut self, min: i32, max: i32) -> Self {
        self.gain_bounds = (min, max);
        self
    }

    /// Every gain value actuated via set_gain(), in order.
    pub fn actuated_gains(&self) -> Arc<Mutex<Vec<i32>>> {
        self.actuated_gains.clone()
    }

    /// The driver's dropped-frame counter cell. Tests bump it to simulate
    /// frames lost below this layer.
    pub fn dropped_counter(&self) -> Arc<AtomicI64> {
        self.dropped.clone()
    }

    pub fn streaming_flag(&self) -> Arc<AtomicBool> {
        self.streaming.clone()
    }

    fn roi_view(&self, image: &Arc<GrayImage>) -> Arc<GrayImage> {
        let (x, y) = self.roi.capture_startpos;
        let (w, h) = self.roi.capture_dimensions;
        if (x, y) == (0, 0) && (w, h) == (self.width, self.height) {
            return image.clone();
        }
        Arc::new(crop_imm(image.as_ref(),
                          x as u32, y as u32, w as u32, h as u32).to_image())
    }
}

#[async_trait]
impl FrameSource for ImageCamera {
    fn model(&self) -> String {
        "ImageCamera".to_string()
    }

    fn dimensions(&self) -> (i32, i32) {
        (self.width, self.height)
    }

    fn gain_bounds(&self) -> (i32, i32) {
        self.gain_bounds
    }

    fn configure(&mut self, roi: RegionOfInterest, pixel_format: PixelFormat)
                 -> Result<RegionOfInterest, CanonicalError> {
        if pixel_format != PixelFormat::Raw8 {
            return Err(invalid_argument_error(
                format!("ImageCamera serves Raw8 only, got {:?}",
                        pixel_format).as_str()));
        }
        if roi.binning != BinFactor::X1 {
            return Err(invalid_argument_error(
                "ImageCamera does not provide binning"));
        }
        let (x, y) = roi.capture_startpos;
        let (w, h) = roi.capture_dimensions;
        if x < 0 || y < 0 || w < 1 || h < 1
            || x + w > self.width || y + h > self.height {
            return Err(invalid_argument_error(
                format!("ROI {}x{}+{}+{} outside sensor {}x{}",
                        w, h, x, y, self.width, self.height).as_str()));
        }
        self.roi = roi;
        Ok(self.roi)
    }

    async fn start_streaming(&mut self) -> Result<(), CanonicalError> {
        // No-op when already streaming.
        if !self.streaming.swap(true, Ordering::SeqCst) {
            self.last_frame_time = Instant::now();
        }
        Ok(())
    }

    async fn stop_streaming(&mut self) -> Result<(), CanonicalError> {
        self.streaming.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn capture_frame(&mut self, timeout: Option<Duration>)
                           -> Result<CapturedFrame, CanonicalError> {
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(failed_precondition_error(
                "capture_frame called while streaming is stopped"));
        }

        if self.next_event < self.events.len() {
            let event = self.events[self.next_event].clone();
            self.next_event += 1;
            match event {
                SimEvent::Frame(image) => self.last_image = Some(image),
                SimEvent::Timeout => {
                    return Err(deadline_exceeded_error("capture_frame timed out"));
                }
                SimEvent::Fault(message) => {
                    return Err(internal_error(message.as_str()));
                }
            }
        } else if !self.repeat_last_frame || self.last_image.is_none() {
            return Err(internal_error("ImageCamera script exhausted"));
        }

        // Pace frame delivery to the configured interval.
        let next_frame_time = self.last_frame_time + self.frame_interval;
        let wait = next_frame_time.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            if let Some(timeout) = timeout {
                if wait > timeout {
                    tokio::time::sleep(timeout).await;
                    return Err(deadline_exceeded_error("capture_frame timed out"));
                }
            }
            tokio::time::sleep(wait).await;
        }
        self.last_frame_time = Instant::now();

        let image = self.roi_view(self.last_image.as_ref().unwrap());
        Ok(CapturedFrame {
            image,
            readout_time: SystemTime::now(),
            gain: self.gain,
            temperature: Celsius(20),
        })
    }

    async fn set_gain(&mut self, gain: Gain) -> Result<(), CanonicalError> {
        let (min, max) = self.gain_bounds;
        if gain.value() < min || gain.value() > max {
            return Err(invalid_argument_error(
                format!("gain {} outside device range [{}, {}]",
                        gain.value(), min, max).as_str()));
        }
        self.gain = gain;
        self.actuated_gains.lock().unwrap().push(gain.value());
        Ok(())
    }

    fn get_gain(&self) -> Gain {
        self.gain
    }

    fn dropped_frame_count(&self) -> i64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// We arrange to stop streaming when ImageCamera goes out of scope.
impl Drop for ImageCamera {
    fn drop(&mut self) {
        futures::executor::block_on(self.stop_streaming()).unwrap_or_else(|err| {
            panic!("Error stopping ImageCamera: {}", err);
        });
    }
}
