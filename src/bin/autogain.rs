// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error};
use chrono::offset::Local;
use clap::Parser;
use env_logger;
use log::{error, info};
use tokio::sync::watch;

use autogain_camera::agc::AgcSettings;
use autogain_camera::control_loop::AutogainLoop;
use autogain_camera::cycle_stats::ConsoleSink;
use autogain_camera::frame_source::{BinFactor, FrameSource, PixelFormat,
                                    RegionOfInterest};
use autogain_camera::image_camera::ImageCamera;

/// Streams video frames and regulates sensor gain so the scene stays within
/// the 8-bit dynamic range: gain is cut when too many pixels saturate and
/// raised otherwise. One diagnostic line per decision cycle goes to stdout:
/// achieved FPS, cumulative dropped frames, gain, saturated pixel count.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Greyscale image file serving as the simulated scene.
    #[arg(short, long)]
    image: String,

    /// Gain value at session start.
    #[arg(long, default_value_t = 510)]
    starting_gain: i32,

    /// Upper gain clamp. 510 is the device maximum for ZWO-class sensors.
    #[arg(long, default_value_t = 510)]
    max_gain: i32,

    /// Gain adjustment per decision cycle.
    #[arg(long, default_value_t = 1)]
    gain_step: i32,

    /// Number of saturated pixels tolerated before gain is cut.
    #[arg(long, default_value_t = 5)]
    saturation_threshold: u32,

    /// Evaluate the gain decision every this many frames.
    #[arg(long, default_value_t = 5)]
    frames_per_cycle: u32,

    /// Per-frame capture timeout in milliseconds; omit to wait indefinitely.
    #[arg(long)]
    capture_timeout_ms: Option<u64>,

    /// Simulated frame interval in milliseconds (25 FPS by default).
    #[arg(long, default_value_t = 40)]
    frame_interval_ms: u64,
}

async fn run(args: &Args) -> Result<(), CanonicalError> {
    let image = match image::open(&args.image) {
        Ok(image) => image.into_luma8(),
        Err(e) => return Err(not_found_error(
            format!("Cannot load scene image {}: {}", args.image, e).as_str())),
    };

    let settings = AgcSettings {
        starting_gain: args.starting_gain,
        max_gain: args.max_gain,
        gain_step: args.gain_step,
        saturation_threshold: args.saturation_threshold,
        frames_per_cycle: args.frames_per_cycle,
        capture_timeout: args.capture_timeout_ms.map(Duration::from_millis),
    };

    let mut camera = ImageCamera::new(image)?
        .with_frame_interval(Duration::from_millis(args.frame_interval_ms));
    let (device_gain_min, device_gain_max) = camera.gain_bounds();
    if settings.starting_gain < device_gain_min
        || settings.max_gain > device_gain_max {
        return Err(invalid_argument_error(
            format!("Configured gain range [{}, {}] outside device range [{}, {}]",
                    settings.starting_gain, settings.max_gain,
                    device_gain_min, device_gain_max).as_str()));
    }
    let (width, height) = camera.dimensions();
    camera.configure(RegionOfInterest {
        binning: BinFactor::X1,
        capture_startpos: (0, 0),
        capture_dimensions: (width, height),
    }, PixelFormat::Raw8)?;
    info!("Session started at {} on {} ({}x{})",
          Local::now().format("%d/%m/%Y %T"), camera.model(), width, height);

    // Ctrl-C raises the stop flag; the loop exits at the next capture
    // boundary and stops streaming.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received; stopping");
            let _ = stop_tx.send(true);
        }
    });

    let mut agc_loop = AutogainLoop::new(
        Box::new(camera), settings, Box::new(ConsoleSink))?;
    agc_loop.run(stop_rx).await?;
    info!("Session ended after {} decision cycles; final gain {}",
          agc_loop.cycles_completed(), agc_loop.gain());
    Ok(())
}

#[tokio::main]
async fn main() {
    // If any thread panics, bail out.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Thread panicked: {}", panic_info);
        std::process::exit(1);
    }));
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(&args).await {
        error!("Autogain session failed: {}", e);
        std::process::exit(1);
    }
}
