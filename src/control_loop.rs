// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

// Acquisition and gain regulation loop. Pulls one frame per iteration from
// the frame source; every frames_per_cycle-th delivered frame it analyzes
// the frame's histogram, nudges gain, actuates it, and emits a diagnostic
// record. Single execution context; analysis never overlaps acquisition.

use std::time::Instant;

use canonical_error::{CanonicalError, CanonicalErrorCode};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::agc::{AgcSettings, GainController};
use crate::cycle_stats::{CycleReporter, StatsSink};
use crate::frame_source::{FrameSource, Gain};
use crate::histogram::Histogram;

pub struct AutogainLoop {
    camera: Box<dyn FrameSource + Send>,
    controller: GainController,
    reporter: CycleReporter,
    sink: Box<dyn StatsSink + Send>,
    settings: AgcSettings,
}

impl AutogainLoop {
    /// Fails with InvalidArgument if `settings` is inconsistent; nothing is
    /// actuated until run().
    pub fn new(camera: Box<dyn FrameSource + Send>,
               settings: AgcSettings,
               sink: Box<dyn StatsSink + Send>)
               -> Result<Self, CanonicalError> {
        let controller = GainController::new(settings.clone())?;
        Ok(AutogainLoop {
            camera,
            controller,
            reporter: CycleReporter::new(),
            sink,
            settings,
        })
    }

    /// The gain currently held by the controller.
    pub fn gain(&self) -> Gain {
        self.controller.gain()
    }

    /// Number of decision cycles completed so far.
    pub fn cycles_completed(&self) -> u64 {
        self.reporter.cycle_index()
    }

    /// Runs acquisition and regulation until `stop_rx` observes true or a
    /// fatal error occurs. The stop signal takes effect at the next capture
    /// boundary; an in-flight capture completes or times out first.
    /// Streaming is stopped on every exit path.
    pub async fn run(&mut self, stop_rx: watch::Receiver<bool>)
                     -> Result<(), CanonicalError> {
        self.camera.start_streaming().await?;
        info!("Streaming started on {}; evaluating gain every {} frames",
              self.camera.model(), self.settings.frames_per_cycle);
        let outcome = self.regulate(&stop_rx).await;
        let stop_outcome = self.camera.stop_streaming().await;
        outcome?;
        stop_outcome
    }

    async fn regulate(&mut self, stop_rx: &watch::Receiver<bool>)
                      -> Result<(), CanonicalError> {
        let mut frame_count: u64 = 0;
        let mut frames_this_cycle: u32 = 0;
        let mut cycle_start = Instant::now();
        loop {
            if *stop_rx.borrow() {
                info!("Stop requested; exiting acquisition loop");
                return Ok(());
            }
            let frame = match self.camera
                .capture_frame(self.settings.capture_timeout).await {
                Ok(frame) => frame,
                // A lapsed timeout is a missed tick, not a failure. The
                // frame counter and decision cadence do not advance.
                Err(e) if matches!(e.code, CanonicalErrorCode::DeadlineExceeded) => {
                    debug!("capture_frame timed out; retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            frame_count += 1;
            frames_this_cycle += 1;
            if frame_count % self.settings.frames_per_cycle as u64 != 0 {
                continue;
            }

            let histogram = Histogram::analyze(&frame.image)?;
            let gain = self.controller.update(&histogram);
            // The controller clamps to [0, max_gain], so a correctly
            // configured device never rejects this.
            self.camera.set_gain(gain).await?;

            let stats = self.reporter.report(
                cycle_start.elapsed(), frames_this_cycle,
                self.camera.dropped_frame_count(), gain,
                histogram.saturated_count());
            if let Err(e) = self.sink.emit(&stats) {
                warn!("Failed to emit cycle stats: {}", e);
            }
            cycle_start = Instant::now();
            frames_this_cycle = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    use image::GrayImage;

    use crate::cycle_stats::CycleStats;
    use crate::image_camera::{ImageCamera, SimEvent};

    fn frame_with_saturated(saturated: u32) -> SimEvent {
        let mut data = vec![0u8; 256];
        for pixel in data.iter_mut().take(saturated as usize) {
            *pixel = 255;
        }
        SimEvent::Frame(Arc::new(GrayImage::from_raw(16, 16, data).unwrap()))
    }

    struct CollectingSink {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl StatsSink for CollectingSink {
        fn emit(&mut self, stats: &CycleStats) -> io::Result<()> {
            self.lines.lock().unwrap().push(stats.to_string());
            Ok(())
        }
    }

    struct FailingSink;

    impl StatsSink for FailingSink {
        fn emit(&mut self, _stats: &CycleStats) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink gone"))
        }
    }

    /// Sends the stop signal after a fixed number of emissions.
    struct StoppingSink {
        emitted: u32,
        stop_after: u32,
        stop_tx: watch::Sender<bool>,
    }

    impl StatsSink for StoppingSink {
        fn emit(&mut self, _stats: &CycleStats) -> io::Result<()> {
            self.emitted += 1;
            if self.emitted >= self.stop_after {
                let _ = self.stop_tx.send(true);
            }
            Ok(())
        }
    }

    fn settings(starting_gain: i32, frames_per_cycle: u32) -> AgcSettings {
        AgcSettings {
            starting_gain,
            frames_per_cycle,
            ..AgcSettings::default()
        }
    }

    #[tokio::test]
    async fn test_regulation_sequence() {
        // Two frames per cycle: two dark cycles push gain to the clamp, then
        // a saturated cycle pulls it back down. The script then runs dry,
        // which surfaces as a device fault.
        let camera = ImageCamera::from_events(vec![
            frame_with_saturated(0), frame_with_saturated(0),
            frame_with_saturated(0), frame_with_saturated(0),
            frame_with_saturated(6), frame_with_saturated(6),
        ]).unwrap();
        let gains = camera.actuated_gains();
        let streaming = camera.streaming_flag();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = CollectingSink{lines: lines.clone()};

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(509, 2), Box::new(sink)).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = agc_loop.run(stop_rx).await.unwrap_err();

        assert!(matches!(err.code, CanonicalErrorCode::Internal));
        assert_eq!(*gains.lock().unwrap(), vec![510, 510, 509]);
        assert_eq!(agc_loop.cycles_completed(), 3);
        assert!(!streaming.load(Ordering::SeqCst));

        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 3);
        // fps dropped gain saturated
        assert!(lines[0].ends_with(" 0 510 0"));
        assert!(lines[2].ends_with(" 0 509 6"));
    }

    #[tokio::test]
    async fn test_timeout_does_not_advance_cycle() {
        // Three capture attempts, one of them a timeout: the decision fires
        // only after the second delivered frame.
        let camera = ImageCamera::from_events(vec![
            frame_with_saturated(0),
            SimEvent::Timeout,
            frame_with_saturated(0),
        ]).unwrap();
        let gains = camera.actuated_gains();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = CollectingSink{lines: lines.clone()};

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(100, 2), Box::new(sink)).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = agc_loop.run(stop_rx).await.unwrap_err();

        assert!(matches!(err.code, CanonicalErrorCode::Internal));
        assert_eq!(*gains.lock().unwrap(), vec![101]);
        assert_eq!(lines.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_first_frame() {
        let camera = ImageCamera::from_events(
            vec![frame_with_saturated(0)]).unwrap();
        let gains = camera.actuated_gains();
        let streaming = camera.streaming_flag();

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(100, 1),
            Box::new(CollectingSink{lines: Arc::new(Mutex::new(Vec::new()))}))
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        stop_tx.send(true).unwrap();
        agc_loop.run(stop_rx).await.unwrap();

        assert!(gains.lock().unwrap().is_empty());
        assert!(!streaming.load(Ordering::SeqCst));
        assert_eq!(agc_loop.cycles_completed(), 0);
    }

    #[tokio::test]
    async fn test_stop_signal_ends_endless_stream() {
        // Repeating camera would stream forever; the sink raises the stop
        // flag after two cycles and the loop exits cleanly.
        let camera = ImageCamera::new(
            GrayImage::from_pixel(16, 16, image::Luma([30]))).unwrap();
        let gains = camera.actuated_gains();
        let streaming = camera.streaming_flag();

        let (stop_tx, stop_rx) = watch::channel(false);
        let sink = StoppingSink{emitted: 0, stop_after: 2, stop_tx};
        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(100, 1), Box::new(sink)).unwrap();
        agc_loop.run(stop_rx).await.unwrap();

        assert_eq!(*gains.lock().unwrap(), vec![101, 102]);
        assert_eq!(agc_loop.cycles_completed(), 2);
        assert!(!streaming.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let camera = ImageCamera::from_events(vec![
            frame_with_saturated(0), frame_with_saturated(0),
        ]).unwrap();
        let gains = camera.actuated_gains();

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(100, 1), Box::new(FailingSink)).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = agc_loop.run(stop_rx).await.unwrap_err();

        // Only the script running dry ends the loop; the broken sink never
        // does.
        assert!(matches!(err.code, CanonicalErrorCode::Internal));
        assert_eq!(*gains.lock().unwrap(), vec![101, 102]);
        assert_eq!(agc_loop.cycles_completed(), 2);
    }

    #[tokio::test]
    async fn test_clamped_gain_never_rejected_by_device() {
        // Long alternating bright/dark sequence with the controller clamping
        // at both ends of the device range: set_gain must never fail.
        let mut events = Vec::new();
        for _ in 0..520 {
            events.push(frame_with_saturated(50));
        }
        for _ in 0..520 {
            events.push(frame_with_saturated(0));
        }
        let camera = ImageCamera::from_events(events).unwrap()
            .with_gain_bounds(0, 510);
        let gains = camera.actuated_gains();

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera),
            AgcSettings{starting_gain: 505, frames_per_cycle: 1,
                        ..AgcSettings::default()},
            Box::new(CollectingSink{lines: Arc::new(Mutex::new(Vec::new()))}))
            .unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let err = agc_loop.run(stop_rx).await.unwrap_err();

        // The run ends with script exhaustion, never InvalidArgument from
        // set_gain.
        assert!(matches!(err.code, CanonicalErrorCode::Internal));
        let gains = gains.lock().unwrap();
        assert_eq!(gains.len(), 1040);
        assert!(gains.iter().all(|gain| (0..=510).contains(gain)));
        assert!(gains.contains(&0));
        assert!(gains.contains(&510));
    }

    #[tokio::test]
    async fn test_dropped_count_reported_cumulatively() {
        let camera = ImageCamera::from_events(vec![
            frame_with_saturated(0), frame_with_saturated(0),
        ]).unwrap();
        let dropped = camera.dropped_counter();
        dropped.store(4, Ordering::SeqCst);
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = CollectingSink{lines: lines.clone()};

        let mut agc_loop = AutogainLoop::new(
            Box::new(camera), settings(100, 1), Box::new(sink)).unwrap();
        let (_stop_tx, stop_rx) = watch::channel(false);
        agc_loop.run(stop_rx).await.unwrap_err();

        let lines = lines.lock().unwrap();
        assert!(lines[0].ends_with(" 4 101 0"));
        assert!(lines[1].ends_with(" 4 102 0"));
    }
}
