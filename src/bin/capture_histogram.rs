extern crate chrono;
use chrono::offset::Local;
use chrono::DateTime;

use std::env;

use log::info;
use env_logger;

use autogain_camera::frame_source::FrameSource;
use autogain_camera::histogram::Histogram;
use autogain_camera::image_camera::ImageCamera;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = env::args().collect();

    let image = image::open(&args[1]).unwrap().into_luma8();
    let mut camera = ImageCamera::new(image).unwrap();

    camera.start_streaming().await.unwrap();
    let frame = camera.capture_frame(None).await.unwrap();
    camera.stop_streaming().await.unwrap();

    let histogram = Histogram::analyze(&frame.image).unwrap();
    let occupied_bins =
        histogram.counts().iter().filter(|&&count| count > 0).count();

    let datetime: DateTime<Local> = frame.readout_time.into();
    info!("Frame obtained at {}", datetime.format("%d/%m/%Y %T"));
    info!("{} samples in {} occupied bins", histogram.total_samples(),
          occupied_bins);
    info!("99th percentile value: {}, max value: {}, saturated pixels: {}",
          histogram.percentile_value(0.99), histogram.max_value(),
          histogram.saturated_count());
}
