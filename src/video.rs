//! Color video sink.
//!
//! Frames are handed to a dedicated encoder thread through a bounded queue.
//! The thread encodes to H.264 and muxes into a fragmented MP4 file. When the
//! queue is full the sink reports not-ready instead of blocking the caller;
//! the recorder then drops the whole frame.
//!
//! Finalization is asynchronous: [`VideoSink::finish`] closes the queue and
//! returns a [`FinalizeHandle`] that resolves once the last fragment and the
//! seek index are on disk.

use crate::frame::{ColorImage, Resolution};
use crate::mp4::{FragmentedMp4Writer, Mp4Config, MuxError};
use scenerec_codec::{Codec, CodecError, EncodedPacket, EncoderConfig, VideoEncoder, VideoFrame};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// A rational timestamp, `value / timescale` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationTime {
    pub value: u64,
    pub timescale: u32,
}

impl PresentationTime {
    pub fn new(value: u64, timescale: u32) -> Self {
        Self { value, timescale }
    }

    /// Time of frame `index` in a constant-rate stream: `index / fps`.
    pub fn from_frame(index: u64, fps: u32) -> Self {
        Self::new(index, fps)
    }

    /// Value expressed in another timescale, rounded down.
    pub fn rescale(&self, timescale: u32) -> u64 {
        (self.value as u128 * timescale as u128 / self.timescale.max(1) as u128) as u64
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.value as f64 / self.timescale.max(1) as f64
    }
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub resolution: Resolution,
    pub fps: u32,
    pub codec: Codec,
    pub bitrate: u32,
    pub fragment_duration_ms: u32,
    /// Frames allowed in flight before the sink reports not-ready.
    pub queue_depth: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to create {}: {source}", path.display())]
    Create { path: PathBuf, source: io::Error },
    #[error("{0:?} cannot be stored in the mp4 track")]
    UnsupportedCodec(Codec),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error("frame is {actual}, sink was started for {expected}")]
    FrameSize {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("presentation time {pts:.4}s does not follow {previous:.4}s")]
    NonMonotonic { pts: f64, previous: f64 },
    #[error("video sink is not accepting frames")]
    NotReady,
    #[error("video worker stopped: {0}")]
    Worker(String),
    #[error("video i/o: {0}")]
    Io(#[from] io::Error),
}

/// What the worker produced once finalization completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VideoSummary {
    pub frames: u64,
    pub fragments: u32,
    pub bytes: u64,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FinalizeStatus {
    Completed(VideoSummary),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl FinalizeStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, FinalizeStatus::Completed(_))
    }
}

/// Completion signal of an asynchronous finalization.
pub struct FinalizeHandle {
    rx: oneshot::Receiver<Result<VideoSummary, VideoError>>,
}

impl FinalizeHandle {
    pub fn new(rx: oneshot::Receiver<Result<VideoSummary, VideoError>>) -> Self {
        Self { rx }
    }

    /// A handle that is already resolved.
    pub fn resolved(result: Result<VideoSummary, VideoError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Wait for completion, bounded by `timeout` and `cancel`.
    pub async fn wait(self, timeout: Duration, cancel: &CancellationToken) -> FinalizeStatus {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => FinalizeStatus::Cancelled,
            result = tokio::time::timeout(timeout, self.rx) => match result {
                Err(_) => FinalizeStatus::TimedOut,
                Ok(received) => status_of(received),
            },
        }
    }

    /// Blocking wait for use outside the runtime.
    pub fn wait_blocking(self) -> FinalizeStatus {
        status_of(self.rx.blocking_recv())
    }
}

fn status_of(
    received: Result<Result<VideoSummary, VideoError>, oneshot::error::RecvError>,
) -> FinalizeStatus {
    match received {
        Ok(Ok(summary)) => FinalizeStatus::Completed(summary),
        Ok(Err(e)) => FinalizeStatus::Failed(e.to_string()),
        Err(_) => FinalizeStatus::Failed("video worker exited without reporting".to_string()),
    }
}

/// Sink for the color stream of one recording.
pub trait VideoSink: Send {
    /// False while the queue is saturated or after the worker failed.
    fn is_ready(&self) -> bool;

    /// Queue a frame. `pts` must be strictly increasing.
    fn push(&mut self, color: &ColorImage, pts: PresentationTime) -> Result<(), VideoError>;

    /// Frames accepted so far.
    fn frames_pushed(&self) -> u64;

    /// Close input and request finalization.
    fn finish(self: Box<Self>) -> FinalizeHandle;
}

/// Creates a sink per recording.
pub trait VideoSinkFactory: Send + Sync {
    fn start(&self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn VideoSink>, VideoError>;
}

pub type MakeEncoder =
    dyn Fn(EncoderConfig) -> Result<Box<dyn VideoEncoder>, CodecError> + Send + Sync;

/// Factory for [`Mp4VideoSink`] with a pluggable encoder backend.
#[derive(Clone)]
pub struct Mp4SinkFactory {
    make_encoder: Arc<MakeEncoder>,
}

impl Mp4SinkFactory {
    pub fn new<F>(make_encoder: F) -> Self
    where
        F: Fn(EncoderConfig) -> Result<Box<dyn VideoEncoder>, CodecError> + Send + Sync + 'static,
    {
        Self {
            make_encoder: Arc::new(make_encoder),
        }
    }

    /// Software H.264 through OpenH264.
    #[cfg(feature = "openh264")]
    pub fn openh264() -> Self {
        Self::new(|config| {
            Ok(Box::new(scenerec_codec::OpenH264Encoder::new(config)?) as Box<dyn VideoEncoder>)
        })
    }
}

impl VideoSinkFactory for Mp4SinkFactory {
    fn start(&self, path: &Path, settings: &VideoSettings) -> Result<Box<dyn VideoSink>, VideoError> {
        Ok(Box::new(Mp4VideoSink::start(
            path,
            settings,
            self.make_encoder.as_ref(),
        )?))
    }
}

struct Job {
    frame: VideoFrame,
    dts: u64,
}

pub struct Mp4VideoSink {
    jobs: SyncSender<Job>,
    done: oneshot::Receiver<Result<VideoSummary, VideoError>>,
    in_flight: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
    queue_depth: usize,
    resolution: Resolution,
    timescale: u32,
    last_pts: Option<PresentationTime>,
    frames_pushed: u64,
}

impl Mp4VideoSink {
    pub fn start(
        path: &Path,
        settings: &VideoSettings,
        make_encoder: &MakeEncoder,
    ) -> Result<Self, VideoError> {
        if settings.codec != Codec::H264 {
            return Err(VideoError::UnsupportedCodec(settings.codec));
        }
        let res = settings.resolution;
        let encoder_config = EncoderConfig::new(res.width, res.height)
            .codec(settings.codec)
            .framerate(settings.fps, 1)
            .bitrate(settings.bitrate);
        encoder_config.validate()?;
        let encoder = make_encoder(encoder_config)?;

        let file = File::create(path).map_err(|source| VideoError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        let mp4 = Mp4Config::for_frame_rate(
            res.width,
            res.height,
            settings.fps,
            settings.fragment_duration_ms,
        );
        let timescale = mp4.timescale;
        let muxer = FragmentedMp4Writer::new(BufWriter::new(file), mp4);

        let queue_depth = settings.queue_depth.max(1);
        let (jobs, rx) = mpsc::sync_channel(queue_depth);
        let (done_tx, done) = oneshot::channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicBool::new(false));

        let worker = EncodeWorker {
            encoder,
            muxer,
            in_flight: in_flight.clone(),
            failed: failed.clone(),
            pending_dts: VecDeque::new(),
            last_dts: None,
        };
        std::thread::Builder::new()
            .name("video-encode".to_string())
            .spawn(move || {
                let result = worker.run(rx);
                if let Err(e) = &result {
                    tracing::error!("Video worker failed: {}", e);
                }
                let _ = done_tx.send(result);
            })?;

        tracing::info!(
            "Video sink started: {:?} {}x{} @ {} fps -> {}",
            settings.codec,
            res.width,
            res.height,
            settings.fps,
            path.display()
        );

        Ok(Self {
            jobs,
            done,
            in_flight,
            failed,
            queue_depth,
            resolution: res,
            timescale,
            last_pts: None,
            frames_pushed: 0,
        })
    }
}

impl VideoSink for Mp4VideoSink {
    fn is_ready(&self) -> bool {
        !self.failed.load(Ordering::Acquire)
            && self.in_flight.load(Ordering::Acquire) < self.queue_depth
    }

    fn push(&mut self, color: &ColorImage, pts: PresentationTime) -> Result<(), VideoError> {
        if self.failed.load(Ordering::Acquire) {
            return Err(VideoError::Worker("encoder failed earlier".to_string()));
        }
        if color.resolution != self.resolution || !color.is_well_formed() {
            return Err(VideoError::FrameSize {
                expected: self.resolution,
                actual: color.resolution,
            });
        }
        let dts = pts.rescale(self.timescale);
        if let Some(previous) = self.last_pts {
            if dts <= previous.rescale(self.timescale) {
                return Err(VideoError::NonMonotonic {
                    pts: pts.as_secs_f64(),
                    previous: previous.as_secs_f64(),
                });
            }
        }

        let timestamp_us = pts.rescale(1_000_000);
        let job = Job {
            frame: color.to_video_frame(timestamp_us),
            dts,
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        match self.jobs.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(VideoError::NotReady);
            }
            Err(TrySendError::Disconnected(_)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                return Err(VideoError::Worker("encoder thread exited".to_string()));
            }
        }
        self.last_pts = Some(pts);
        self.frames_pushed += 1;
        Ok(())
    }

    fn frames_pushed(&self) -> u64 {
        self.frames_pushed
    }

    fn finish(self: Box<Self>) -> FinalizeHandle {
        let Mp4VideoSink { jobs, done, .. } = *self;
        // Dropping the sender lets the worker drain and finalize.
        drop(jobs);
        FinalizeHandle::new(done)
    }
}

struct EncodeWorker {
    encoder: Box<dyn VideoEncoder>,
    muxer: FragmentedMp4Writer<BufWriter<File>>,
    in_flight: Arc<AtomicUsize>,
    failed: Arc<AtomicBool>,
    /// Decode times of frames submitted but not yet emitted by the encoder.
    pending_dts: VecDeque<u64>,
    last_dts: Option<u64>,
}

impl EncodeWorker {
    fn run(mut self, rx: Receiver<Job>) -> Result<VideoSummary, VideoError> {
        while let Ok(job) = rx.recv() {
            let result = self.encode(job);
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = result {
                self.failed.store(true, Ordering::Release);
                return Err(e);
            }
        }

        for packet in self.encoder.flush()? {
            self.mux(packet)?;
        }

        let config = self.muxer.config().clone();
        let (writer, mp4) = self.muxer.finish()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        let end = self
            .last_dts
            .map_or(0, |dts| dts + config.default_duration as u64);
        let summary = VideoSummary {
            frames: mp4.samples,
            fragments: mp4.fragments,
            bytes: mp4.bytes,
            duration_secs: end as f64 / config.timescale as f64,
        };
        tracing::info!(
            "Video finalized: {} frames, {} fragments, {} bytes",
            summary.frames,
            summary.fragments,
            summary.bytes
        );
        Ok(summary)
    }

    fn encode(&mut self, job: Job) -> Result<(), VideoError> {
        self.pending_dts.push_back(job.dts);
        let packet = self.encoder.encode(&job.frame, false)?;
        self.mux(packet)
    }

    fn mux(&mut self, packet: EncodedPacket) -> Result<(), VideoError> {
        let Some(dts) = self.pending_dts.pop_front() else {
            tracing::warn!("Encoder produced more packets than frames, dropping packet");
            return Ok(());
        };
        if packet.is_empty() {
            tracing::debug!("Encoder skipped frame at {}", dts);
            return Ok(());
        }
        self.muxer.write_sample(&packet.data, dts)?;
        self.last_dts = Some(dts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mp4::inspect;
    use crate::test_support::{color_image, stub_sink_factory, video_settings};

    #[test]
    fn test_presentation_time() {
        let pts = PresentationTime::from_frame(4, 30);
        assert!((pts.as_secs_f64() - 4.0 / 30.0).abs() < 1e-12);
        assert_eq!(pts.rescale(30_000), 4000);
        assert_eq!(PresentationTime::from_frame(1, 60).rescale(1_000_000), 16_666);
    }

    #[tokio::test]
    async fn test_frames_are_muxed_at_frame_times() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.mp4");
        let settings = video_settings(30);
        let mut sink = stub_sink_factory().start(&path, &settings).unwrap();

        let color = color_image(settings.resolution);
        for i in 0..5 {
            while !sink.is_ready() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            sink.push(&color, PresentationTime::from_frame(i, 30)).unwrap();
        }
        assert_eq!(sink.frames_pushed(), 5);

        let status = sink
            .finish()
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await;
        let summary = match status {
            FinalizeStatus::Completed(summary) => summary,
            other => panic!("finalization failed: {:?}", other),
        };
        assert_eq!(summary.frames, 5);

        let info = inspect(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(info.timescale, 30_000);
        assert!(info.has_mfra);
        let times = info.sample_times();
        assert_eq!(times.len(), 5);
        for (i, t) in times.iter().enumerate() {
            assert!((t - i as f64 / 30.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_non_monotonic_push_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = video_settings(30);
        let mut sink = stub_sink_factory()
            .start(&dir.path().join("rgb.mp4"), &settings)
            .unwrap();
        let color = color_image(settings.resolution);

        sink.push(&color, PresentationTime::from_frame(2, 30)).unwrap();
        assert!(matches!(
            sink.push(&color, PresentationTime::from_frame(2, 30)),
            Err(VideoError::NonMonotonic { .. })
        ));
        assert!(matches!(
            sink.push(&color, PresentationTime::from_frame(1, 30)),
            Err(VideoError::NonMonotonic { .. })
        ));
        assert_eq!(sink.frames_pushed(), 1);
        assert!(sink.finish().wait_blocking().is_completed());
    }

    #[test]
    fn test_wrong_frame_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let settings = video_settings(30);
        let mut sink = stub_sink_factory()
            .start(&dir.path().join("rgb.mp4"), &settings)
            .unwrap();
        let other = color_image(Resolution::new(8, 8));
        assert!(matches!(
            sink.push(&other, PresentationTime::from_frame(0, 30)),
            Err(VideoError::FrameSize { .. })
        ));
    }

    #[test]
    fn test_start_failures() {
        let dir = tempfile::tempdir().unwrap();
        let factory = stub_sink_factory();

        let missing = dir.path().join("missing").join("rgb.mp4");
        assert!(matches!(
            factory.start(&missing, &video_settings(30)),
            Err(VideoError::Create { .. })
        ));

        let mut odd = video_settings(30);
        odd.resolution = Resolution::new(63, 48);
        assert!(matches!(
            factory.start(&dir.path().join("a.mp4"), &odd),
            Err(VideoError::Codec(_))
        ));

        let mut hevc = video_settings(30);
        hevc.codec = Codec::Hevc;
        assert!(matches!(
            factory.start(&dir.path().join("b.mp4"), &hevc),
            Err(VideoError::UnsupportedCodec(Codec::Hevc))
        ));
    }

    #[tokio::test]
    async fn test_finalize_wait_timeout_and_cancel() {
        let (_tx, rx) = oneshot::channel();
        let status = FinalizeHandle::new(rx)
            .wait(Duration::from_millis(10), &CancellationToken::new())
            .await;
        assert_eq!(status, FinalizeStatus::TimedOut);

        let (_tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let status = FinalizeHandle::new(rx)
            .wait(Duration::from_secs(5), &cancel)
            .await;
        assert_eq!(status, FinalizeStatus::Cancelled);

        let (tx, rx) = oneshot::channel::<Result<VideoSummary, VideoError>>();
        drop(tx);
        let status = FinalizeHandle::new(rx)
            .wait(Duration::from_secs(5), &CancellationToken::new())
            .await;
        assert!(matches!(status, FinalizeStatus::Failed(_)));
    }
}
