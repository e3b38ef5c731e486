//! camview: run a frame source through the analyzer pipeline

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camview::events::{ChannelSink, FanoutSink, JsonlEventLog};
use camview::{Config, EngineState, Frame, MotionAnalyzer, Pipeline, Severity, Status};
use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TOML config file (defaults to ./camview.toml when present).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Camera index or path, image directory, video file or synthetic://N[@fps].
    /// Cameras need the v4l2-capture feature, video files gstreamer-pipeline.
    #[arg(short, long)]
    source: Option<String>,
    #[arg(long)]
    camera_id: Option<String>,
    /// Frames kept for preview consumers.
    #[arg(long)]
    buffer_size: Option<usize>,
    /// Do not write the JSONL event log.
    #[arg(long)]
    no_log: bool,
    #[arg(long, default_value_t = 1000)]
    status_interval_ms: u64,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("camview=info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    init_tracing();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.capture.source = source;
    }
    if let Some(camera_id) = args.camera_id {
        config.capture.camera_id = camera_id;
    }
    if let Some(size) = args.buffer_size {
        config.pipeline.frame_buffer_size = size;
    }
    config.validate()?;

    info!("camview launching...");

    let (channel, events_rx) = ChannelSink::bounded(config.events.channel_capacity);
    let mut sinks = FanoutSink::new().with(Arc::new(channel));
    let log = if config.events.log_enabled && !args.no_log {
        let log = Arc::new(JsonlEventLog::open(
            &config.events.log_file,
            config.events.channel_capacity,
        )?);
        sinks = sinks.with(log.clone());
        Some(log)
    } else {
        None
    };

    let mut pipeline = Pipeline::from_config(&config, Arc::new(sinks))?;
    if config.analyzers.motion.enabled {
        pipeline.add_analyzer(Box::new(MotionAnalyzer::new(
            config.analyzers.motion.clone(),
        )))?;
    }

    let descriptor = config.source_descriptor()?;
    let source = pipeline.attach_source(&descriptor)?;
    info!(
        "Source: {} at {:.1} fps, analyzers: {:?}",
        source.description,
        source.fps,
        pipeline.analyzer_names()
    );
    pipeline.start()?;

    let status = pipeline.status_handle();
    let frames = pipeline.frame_buffer();
    let mut ticker = tokio::time::interval(Duration::from_millis(args.status_interval_ms.max(50)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping");
                break;
            }
            _ = ticker.tick() => {
                for event in events_rx.drain() {
                    if event.severity >= Severity::Warning {
                        warn!("{} {} on {} at {}", event.severity, event.kind, event.source_id, event.time_fmt());
                    }
                }
                let snapshot = status.snapshot();
                print_status(&snapshot, frames.take_newest().as_ref());
                if matches!(snapshot.state, EngineState::Completed | EngineState::Stopped) {
                    break;
                }
            }
        }
    }

    let outcome = tokio::task::block_in_place(|| pipeline.stop());
    info!("Stop: {:?}", outcome);

    let summary = status.snapshot();
    if let Some(log) = &log {
        log.close();
    }
    println!(
        "Processed {} frames in {:.1?}, {} events detected{}",
        summary.current_frame,
        summary.processing_time.unwrap_or(summary.elapsed),
        summary.events_detected,
        log.as_ref()
            .map(|log| format!(", {} logged to {}", log.written(), log.path().display()))
            .unwrap_or_default()
    );
    Ok(())
}

fn print_status(status: &Status, preview: Option<&Frame>) {
    let progress = status
        .progress()
        .map(|p| format!(" ({:.0}%)", p))
        .unwrap_or_default();
    let preview = preview
        .map(|f| format!(" | preview #{} {}x{}", f.sequence(), f.width(), f.height()))
        .unwrap_or_default();
    println!(
        "[{:?}] frame {}{}{} | {:.1}/{:.1} fps | events {} | failures {}/{}{}",
        status.state,
        status.current_frame,
        status
            .total_frames
            .map(|t| format!("/{}", t))
            .unwrap_or_default(),
        progress,
        status.effective_fps,
        status.fps,
        status.events_detected,
        status.analyzer_failures,
        status.callback_failures,
        preview,
    );
}
