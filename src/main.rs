//! framegrab demo: synthetic camera → grabber → consumer loop + recorder

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use framegrab::capture::device::TriggerMode;
use framegrab::{Config, Grabber, Recorder, SyntheticDevice};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    framegrab::CONFIG.store(Arc::new(config.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.logging.filter)?)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("framegrab launching...");

    // Open the device and start capture
    let device_id = config.grabber.device_id;
    let mut grabber = Grabber::new(SyntheticDevice::new(config.synthetic.clone()));
    grabber.open(device_id);
    if !grabber.is_device_open() {
        return Err(eyre!("Device {} could not be opened", device_id));
    }
    grabber.start_capture(config.grabber.trigger_mode, config.grabber.trigger_signal)?;

    let mut recorder = Recorder::new();
    recorder.set_grabber(grabber.handle());
    if !recorder.start() {
        warn!("Recorder not started ({})", recorder.state());
    }

    // Consumer cycle
    let tick = Duration::from_secs(1) / config.consumer.tick_hz.max(1);
    let record_for = Duration::from_secs(config.consumer.record_seconds);
    let mut ticker = tokio::time::interval(tick);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let started = Instant::now();
    let mut displayed = 0u64;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
            _ = ticker.tick() => {
                if config.grabber.trigger_mode == TriggerMode::Software {
                    if let Err(e) = grabber.device().trigger() {
                        warn!("Software trigger failed: {}", e);
                    }
                }

                grabber.update();
                if grabber.is_frame_new() {
                    displayed += 1;
                    debug!(
                        "Frame ready: {}x{} ({} bytes)",
                        grabber.width(),
                        grabber.height(),
                        grabber.pixels().data().len()
                    );
                }

                if started.elapsed() >= record_for {
                    break;
                }
            }
        }
    }
    recorder.stop();

    let stats = grabber.stats();
    info!(
        "Captured {} frames at {:.1} fps, displayed {}, dropped {}",
        stats.frames_received, stats.capture_fps, displayed, stats.frames_dropped
    );
    info!(
        "Recorded {} frames from {:?} to {:?} ({:?})",
        recorder.len(),
        recorder.first_timestamp(),
        recorder.last_timestamp(),
        recorder.duration()
    );

    grabber.close();
    info!("framegrab shutting down");
    Ok(())
}
