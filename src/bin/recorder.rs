//! Record a synthetic RGB-D session through the full pipeline.
//!
//! Usage:
//!   scenerec [options]
//!
//! Options:
//!   --config <path>       JSON recorder config (all keys optional)
//!   --output-dir <dir>    Root for session directories
//!   --scene <name>        Scene name (default: scene)
//!   --frames <n>          Stop after n frames
//!   --duration <secs>     Stop after this many seconds (default: until Ctrl+C)
//!   --no-compress         Store depth frames uncompressed
//!
//! Output: <output-dir>/<scene>_<YYYYmmdd_HHMMSS>/{rgb.mp4, depth.bin, *.json}

use anyhow::Result;
use clap::Parser;
use scenerec::{
    CaptureResolution, FinalizeStatus, MotionFeed, Mp4SinkFactory, Recorder, RecorderConfig,
    RecorderService, Resolution, StartRequest, SyntheticConfig, SyntheticFrameSource,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "scenerec", about = "Record color, depth, pose and IMU streams to disk")]
struct Args {
    /// JSON recorder config
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root for session directories
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long, default_value = "scene")]
    scene: String,

    #[arg(long, default_value = "")]
    scene_type: String,

    /// Stop after this many frames
    #[arg(long)]
    frames: Option<u64>,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,

    #[arg(long)]
    fps: Option<u32>,

    /// Color resolution as WIDTHxHEIGHT
    #[arg(long, default_value = "640x480", value_parser = parse_resolution)]
    color: Resolution,

    /// Depth resolution as WIDTHxHEIGHT
    #[arg(long, default_value = "256x192", value_parser = parse_resolution)]
    depth: Resolution,

    /// Store depth frames without compression
    #[arg(long)]
    no_compress: bool,
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    let (w, h) = s
        .split_once('x')
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {:?}", s))?;
    let width = w.trim().parse().map_err(|e| format!("width: {}", e))?;
    let height = h.trim().parse().map_err(|e| format!("height: {}", e))?;
    Ok(Resolution::new(width, height))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scenerec=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(fps) = args.fps {
        config.fps = fps;
    }
    if args.no_compress {
        config.compress_depth = false;
    }
    config.validate()?;

    let stop = CancellationToken::new();

    // Ctrl+C handler
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        stop_clone.cancel();
    });

    // Duration timer
    if let Some(secs) = args.duration {
        let stop_clone = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            tracing::info!("Duration reached ({}s), stopping...", secs);
            stop_clone.cancel();
        });
    }

    println!();
    println!("========================================");
    println!("scenerec");
    println!("========================================");
    println!("Scene:      {} ({})", args.scene, args.scene_type);
    println!("Color:      {} @ {} fps", args.color, config.fps);
    println!("Depth:      {} ({})", args.depth, if config.compress_depth { "deflate" } else { "raw" });
    println!("Output dir: {}", config.output_dir.display());
    match (args.frames, args.duration) {
        (Some(n), _) => println!("Frames:     {}", n),
        (None, Some(d)) => println!("Duration:   {}s", d),
        (None, None) => println!("Duration:   until Ctrl+C"),
    }
    println!("========================================");
    println!();

    let source = Arc::new(SyntheticFrameSource::new(SyntheticConfig {
        resolution: CaptureResolution {
            color: args.color,
            depth: args.depth,
        },
        fps: config.fps,
        frame_limit: args.frames,
        depth_interval: 1,
    }));
    let (motion, publisher) = MotionFeed::new();

    let recorder = Recorder::new(
        config,
        source.clone(),
        Arc::new(motion),
        Arc::new(Mp4SinkFactory::openh264()),
    )?;
    let service_cancel = CancellationToken::new();
    let (handle, service) = RecorderService::spawn(recorder, service_cancel.clone());

    let dir = handle
        .start(StartRequest::new(args.scene.clone(), args.scene_type.clone()))
        .await?;
    tracing::info!("Recording to {}", dir.display());

    let emitted = source
        .spawn(handle.frame_sender(), Some(publisher), stop.clone())
        .await?;
    tracing::info!("Source finished after {} frames, stopping recording...", emitted);

    let summary = handle.stop().await?;
    service_cancel.cancel();
    service.await?;

    let Some(summary) = summary else {
        println!("Nothing was recorded.");
        return Ok(());
    };

    println!();
    println!("========================================");
    println!("Recording Complete");
    println!("========================================");
    println!("Directory:  {}", summary.dir.display());
    println!("Frames:     {} recorded, {} emitted", summary.stats.frames_recorded, emitted);
    println!(
        "Dropped:    {} (sink busy {}, depth {}, color size {})",
        summary.stats.dropped(),
        summary.stats.dropped_not_ready,
        summary.stats.dropped_depth,
        summary.stats.dropped_color_size
    );
    println!("Skipped:    {} frames without depth", summary.stats.non_qualifying);
    match &summary.depth {
        Some(depth) => println!(
            "Depth:      {} records, {:.1} MB",
            depth.records,
            depth.bytes as f64 / 1_048_576.0
        ),
        None => println!("Depth:      not synced"),
    }
    match &summary.finalize {
        FinalizeStatus::Completed(video) => println!(
            "Video:      {} frames, {} fragments, {:.1} MB, {:.2}s",
            video.frames,
            video.fragments,
            video.bytes as f64 / 1_048_576.0,
            video.duration_secs
        ),
        other => println!("Video:      {:?}", other),
    }
    println!(
        "Metadata:   {} written, {} failed",
        summary.metadata.written.len(),
        summary.metadata.failed.len()
    );
    println!("========================================");

    Ok(())
}
