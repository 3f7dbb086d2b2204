//! Recording session controller.
//!
//! [`Recorder`] is the synchronous state machine (Idle, Recording,
//! Finalizing) that fans each qualifying frame out to the depth file, the
//! video sink and the metadata aggregator. [`RecorderService`] owns it on a
//! tokio task and feeds it from a single event queue, so a start or stop
//! command is only ever handled between two frames. [`RecorderHandle`] is
//! the cloneable front used by callers and capture sources.
//!
//! A frame is either written to all three sinks or to none of them: when the
//! video sink reports backpressure or the depth record cannot be committed,
//! the frame is dropped and counted, and the frame index does not advance.

use crate::config::{ConfigError, RecorderConfig};
use crate::depth::{DepthConverter, DepthError};
use crate::depth_file::{DepthFileSummary, DepthWriter, WriteOutcome};
use crate::frame::{FrameSample, LatestFrame};
use crate::metadata::{MetadataAggregator, MetadataReport, SessionInfo};
use crate::motion::MotionSource;
use crate::session::{self, SessionStats, DEPTH_FILE, VIDEO_FILE};
use crate::source::FrameSource;
use crate::video::{FinalizeStatus, PresentationTime, VideoError, VideoSink, VideoSinkFactory};
use chrono::Local;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
    /// Stopped, waiting for the video container to be finalized.
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub scene_name: String,
    pub scene_type: String,
}

impl StartRequest {
    pub fn new(scene_name: impl Into<String>, scene_type: impl Into<String>) -> Self {
        Self {
            scene_name: scene_name.into(),
            scene_type: scene_type.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("a recording is already in progress")]
    AlreadyRecording,
    #[error("previous recording is still being finalized")]
    Finalizing,
    #[error("invalid start request: {0}")]
    InvalidRequest(String),
    #[error("cannot create session directory under {}: {source}", root.display())]
    Directory { root: PathBuf, source: io::Error },
    #[error(transparent)]
    Depth(#[from] DepthError),
    #[error("video sink failed to start: {0}")]
    Video(#[from] VideoError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("recorder event queue is full")]
    QueueFull,
    #[error("recorder service has stopped")]
    ServiceStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The video sink was applying backpressure.
    SinkNotReady,
    /// The depth map could not be converted or its record not committed.
    Depth,
    /// The color frame did not match the negotiated resolution, or its
    /// planes were short for it.
    ColorSize,
}

/// What happened to one frame event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Not recording; only the preview was updated.
    NotRecording,
    /// Missing primary or smoothed depth.
    NonQualifying,
    Recorded { index: u64 },
    Dropped(DropReason),
}

struct ActiveSession {
    dir: PathBuf,
    info: SessionInfo,
    frame_index: u64,
    converter: DepthConverter,
    depth: DepthWriter,
    video: Box<dyn VideoSink>,
    metadata: MetadataAggregator,
    stats: SessionStats,
}

/// Everything known about a session at the moment it was stopped, before
/// the container finished finalizing.
#[derive(Debug)]
pub struct StoppedSession {
    pub dir: PathBuf,
    pub scene_name: String,
    pub stats: SessionStats,
    pub depth: Option<DepthFileSummary>,
    pub metadata: MetadataReport,
}

impl StoppedSession {
    pub fn into_summary(self, finalize: FinalizeStatus) -> SessionSummary {
        SessionSummary {
            dir: self.dir,
            scene_name: self.scene_name,
            stats: self.stats,
            depth: self.depth,
            metadata: self.metadata,
            finalize,
        }
    }
}

/// A stopped session plus the signal for its video finalization.
pub struct PendingStop {
    pub session: StoppedSession,
    pub finalize: crate::video::FinalizeHandle,
}

/// Reply to a stop command.
#[derive(Debug)]
pub struct SessionSummary {
    pub dir: PathBuf,
    pub scene_name: String,
    pub stats: SessionStats,
    /// `None` when the depth file could not be synced at stop.
    pub depth: Option<DepthFileSummary>,
    pub metadata: MetadataReport,
    pub finalize: FinalizeStatus,
}

impl SessionSummary {
    /// Frames the container reports as muxed, once finalization completed.
    pub fn muxed_frames(&self) -> Option<u64> {
        match &self.finalize {
            FinalizeStatus::Completed(video) => Some(video.frames),
            _ => None,
        }
    }
}

pub struct Recorder {
    config: RecorderConfig,
    source: Arc<dyn FrameSource>,
    motion: Arc<dyn MotionSource>,
    sinks: Arc<dyn VideoSinkFactory>,
    state: RecorderState,
    session: Option<ActiveSession>,
}

impl Recorder {
    pub fn new(
        config: RecorderConfig,
        source: Arc<dyn FrameSource>,
        motion: Arc<dyn MotionSource>,
        sinks: Arc<dyn VideoSinkFactory>,
    ) -> Result<Self, RecorderError> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            motion,
            sinks,
            state: RecorderState::Idle,
            session: None,
        })
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    /// Directory of the active session.
    pub fn session_dir(&self) -> Option<&PathBuf> {
        self.session.as_ref().map(|s| &s.dir)
    }

    pub fn stats(&self) -> Option<SessionStats> {
        self.session.as_ref().map(|s| s.stats)
    }

    pub fn start(&mut self, request: StartRequest) -> Result<PathBuf, RecorderError> {
        match self.state {
            RecorderState::Recording => return Err(RecorderError::AlreadyRecording),
            RecorderState::Finalizing => return Err(RecorderError::Finalizing),
            RecorderState::Idle => {}
        }
        if request.scene_name.trim().is_empty() {
            return Err(RecorderError::InvalidRequest(
                "scene name is empty".to_string(),
            ));
        }

        let resolution = self.source.resolution();
        let converter = DepthConverter::new(resolution.depth, self.config.depth_scale)?;
        let start_time = Local::now();
        let dir = session::create_session_dir(&self.config.output_dir, &request.scene_name, &start_time)
            .map_err(|source| RecorderError::Directory {
                root: self.config.output_dir.clone(),
                source,
            })?;

        let depth = DepthWriter::open(dir.join(DEPTH_FILE), self.config.compress_depth);
        let settings = self.config.video_settings(resolution.color);
        let video = match self.sinks.start(&dir.join(VIDEO_FILE), &settings) {
            Ok(video) => video,
            Err(e) => {
                drop(depth);
                if let Err(rm) = std::fs::remove_dir_all(&dir) {
                    tracing::warn!("Failed to remove {}: {}", dir.display(), rm);
                }
                return Err(RecorderError::Video(e));
            }
        };

        self.motion.start_updates();
        tracing::info!(
            "Recording started: {} (color {}, depth {}, {} fps)",
            dir.display(),
            resolution.color,
            resolution.depth,
            self.config.fps
        );

        self.session = Some(ActiveSession {
            dir: dir.clone(),
            info: SessionInfo {
                scene_name: request.scene_name,
                scene_type: request.scene_type,
                color: resolution.color,
                depth: resolution.depth,
                fps: self.config.fps,
                depth_scale: self.config.depth_scale,
                depth_compressed: self.config.compress_depth,
                start_time,
            },
            frame_index: 0,
            converter,
            depth,
            video,
            metadata: MetadataAggregator::new(),
            stats: SessionStats::default(),
        });
        self.state = RecorderState::Recording;
        Ok(dir)
    }

    pub fn on_frame(&mut self, frame: &FrameSample) -> FrameOutcome {
        let session = match (self.state, self.session.as_mut()) {
            (RecorderState::Recording, Some(session)) => session,
            _ => return FrameOutcome::NotRecording,
        };

        let (depth, _smoothed) = match (&frame.depth, &frame.smoothed_depth) {
            (Some(depth), Some(smoothed)) => (depth, smoothed),
            _ => {
                session.stats.non_qualifying += 1;
                return FrameOutcome::NonQualifying;
            }
        };

        if frame.color.resolution != session.info.color || !frame.color.is_well_formed() {
            tracing::error!(
                "Color frame is {} ({}+{} plane bytes), session was started for {}; frame skipped",
                frame.color.resolution,
                frame.color.luma.len(),
                frame.color.chroma.len(),
                session.info.color
            );
            session.stats.dropped_color_size += 1;
            return FrameOutcome::Dropped(DropReason::ColorSize);
        }
        if !session.video.is_ready() {
            tracing::warn!("Video sink not ready, dropping frame {}", session.frame_index);
            session.stats.dropped_not_ready += 1;
            return FrameOutcome::Dropped(DropReason::SinkNotReady);
        }

        let raw = match session.converter.convert_le_bytes(depth) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Depth conversion failed, frame skipped: {}", e);
                session.stats.dropped_depth += 1;
                return FrameOutcome::Dropped(DropReason::Depth);
            }
        };
        match session.depth.write_frame(raw) {
            Ok(WriteOutcome::Written { bytes }) => {
                session.stats.depth_records += 1;
                session.stats.depth_bytes += bytes as u64;
            }
            Ok(WriteOutcome::Detached) => {}
            Err(e) => {
                tracing::warn!("Depth record not written, dropping frame: {}", e);
                session.stats.dropped_depth += 1;
                return FrameOutcome::Dropped(DropReason::Depth);
            }
        }

        let index = session.frame_index;
        let pts = PresentationTime::from_frame(index, session.info.fps);
        match session.video.push(&frame.color, pts) {
            Ok(()) => session.stats.video_frames = session.video.frames_pushed(),
            // The depth record is already committed; keep the index moving so
            // depth records and telemetry keys stay aligned.
            Err(e) => tracing::warn!("Video push failed for frame {}: {}", index, e),
        }

        let motion = self.motion.latest();
        session.metadata.record(index, frame, motion.as_ref());
        session.frame_index += 1;
        session.stats.frames_recorded += 1;

        if session.frame_index % 300 == 0 {
            tracing::info!(
                "{} frames recorded, {:.1} MB depth",
                session.frame_index,
                session.stats.depth_bytes as f64 / 1_048_576.0
            );
        }
        FrameOutcome::Recorded { index }
    }

    /// Stop the active recording. Returns `None` when not recording.
    pub fn stop(&mut self) -> Option<PendingStop> {
        if self.state != RecorderState::Recording {
            return None;
        }
        let session = self.session.take()?;

        self.motion.stop_updates();
        self.source.pause();

        let metadata = session.metadata.flush(&session.dir, &session.info);
        let depth = match session.depth.finish() {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!("Depth file not synced at stop: {}", e);
                None
            }
        };
        let finalize = session.video.finish();
        self.state = RecorderState::Finalizing;

        tracing::info!(
            "Recording stopped: {} frames, {} dropped, finalizing {}",
            session.stats.frames_recorded,
            session.stats.dropped(),
            session.dir.display()
        );

        Some(PendingStop {
            session: StoppedSession {
                dir: session.dir,
                scene_name: session.info.scene_name,
                stats: session.stats,
                depth,
                metadata,
            },
            finalize,
        })
    }

    /// Leave Finalizing once the container is done (or given up on).
    pub fn complete_finalize(&mut self, status: &FinalizeStatus) -> bool {
        if self.state != RecorderState::Finalizing {
            return false;
        }
        match status {
            FinalizeStatus::Completed(video) => tracing::info!(
                "Video finalized: {} frames, {} fragments, {:.2}s",
                video.frames,
                video.fragments,
                video.duration_secs
            ),
            other => tracing::warn!("Video finalization ended with {:?}", other),
        }
        self.state = RecorderState::Idle;
        self.source.resume();
        true
    }
}

enum Command {
    Start {
        request: StartRequest,
        reply: oneshot::Sender<Result<PathBuf, RecorderError>>,
    },
    Stop {
        reply: oneshot::Sender<Option<SessionSummary>>,
    },
}

enum Event {
    Frame(FrameSample),
    Command(Command),
}

/// Producer side of the recorder's event queue, handed to capture sources.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Event>,
}

impl FrameSender {
    /// Queue a frame, waiting for room.
    pub async fn send(&self, frame: FrameSample) -> Result<(), RecorderError> {
        self.tx
            .send(Event::Frame(frame))
            .await
            .map_err(|_| RecorderError::ServiceStopped)
    }

    /// Queue a frame without waiting, for callers on a capture thread.
    pub fn try_send(&self, frame: FrameSample) -> Result<(), RecorderError> {
        self.tx.try_send(Event::Frame(frame)).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RecorderError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RecorderError::ServiceStopped,
        })
    }
}

#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Event>,
    state: watch::Receiver<RecorderState>,
    preview: watch::Receiver<Option<Arc<FrameSample>>>,
}

impl RecorderHandle {
    pub async fn start(&self, request: StartRequest) -> Result<PathBuf, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Start { request, reply }).await?;
        rx.await.map_err(|_| RecorderError::ServiceStopped)?
    }

    /// Stop and wait for finalization. `Ok(None)` when nothing was recording.
    pub async fn stop(&self) -> Result<Option<SessionSummary>, RecorderError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stop { reply }).await?;
        rx.await.map_err(|_| RecorderError::ServiceStopped)
    }

    pub fn state(&self) -> RecorderState {
        *self.state.borrow()
    }

    /// Wait until the recorder reaches `state`.
    pub async fn wait_for_state(&self, state: RecorderState) -> Result<(), RecorderError> {
        let mut rx = self.state.clone();
        rx.wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| RecorderError::ServiceStopped)
    }

    pub fn frame_sender(&self) -> FrameSender {
        FrameSender {
            tx: self.tx.clone(),
        }
    }

    /// Most recent frame seen, recording or not.
    pub fn preview(&self) -> Option<Arc<FrameSample>> {
        self.preview.borrow().clone()
    }

    pub fn subscribe_preview(&self) -> watch::Receiver<Option<Arc<FrameSample>>> {
        self.preview.clone()
    }

    async fn command(&self, command: Command) -> Result<(), RecorderError> {
        self.tx
            .send(Event::Command(command))
            .await
            .map_err(|_| RecorderError::ServiceStopped)
    }
}

type FinalizeWait = Pin<Box<dyn Future<Output = FinalizeStatus> + Send>>;

struct InFlight {
    session: StoppedSession,
    reply: Option<oneshot::Sender<Option<SessionSummary>>>,
    wait: FinalizeWait,
}

pub struct RecorderService {
    recorder: Recorder,
    rx: mpsc::Receiver<Event>,
    state: watch::Sender<RecorderState>,
    preview: LatestFrame,
    in_flight: Option<InFlight>,
    cancel: CancellationToken,
}

impl RecorderService {
    /// Run `recorder` on a new task. Cancelling `cancel` stops an active
    /// recording, waits for it to finalize and ends the task.
    pub fn spawn(recorder: Recorder, cancel: CancellationToken) -> (RecorderHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(recorder.config.event_queue_depth);
        let (state_tx, state_rx) = watch::channel(recorder.state());
        let preview = LatestFrame::new();
        let handle = RecorderHandle {
            tx,
            state: state_rx,
            preview: preview.subscribe(),
        };
        let service = Self {
            recorder,
            rx,
            state: state_tx,
            preview,
            in_flight: None,
            cancel,
        };
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                status = wait_in_flight(&mut self.in_flight) => self.finish_stop(status),
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
            }
        }

        if self.recorder.state() == RecorderState::Recording {
            tracing::info!("Recorder shutting down, stopping active recording");
            // The service token is already cancelled; bound the wait by time only.
            self.begin_stop(None, CancellationToken::new());
        }
        if self.in_flight.is_some() {
            let status = wait_in_flight(&mut self.in_flight).await;
            self.finish_stop(status);
        }
        tracing::debug!("Recorder service exited");
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Frame(frame) => {
                let frame = Arc::new(frame);
                self.preview.publish(frame.clone());
                if let FrameOutcome::Recorded { index } = self.recorder.on_frame(&frame) {
                    tracing::trace!("Recorded frame {}", index);
                }
            }
            Event::Command(Command::Start { request, reply }) => {
                let result = self.recorder.start(request);
                if let Err(e) = &result {
                    tracing::warn!("Start rejected: {}", e);
                }
                self.publish_state();
                let _ = reply.send(result);
            }
            Event::Command(Command::Stop { reply }) => {
                if self.recorder.state() != RecorderState::Recording {
                    let _ = reply.send(None);
                    return;
                }
                self.begin_stop(Some(reply), self.cancel.clone());
            }
        }
    }

    fn begin_stop(
        &mut self,
        reply: Option<oneshot::Sender<Option<SessionSummary>>>,
        cancel: CancellationToken,
    ) {
        let Some(pending) = self.recorder.stop() else {
            if let Some(reply) = reply {
                let _ = reply.send(None);
            }
            return;
        };
        let timeout = self.recorder.config.finalize_timeout();
        let handle = pending.finalize;
        self.in_flight = Some(InFlight {
            session: pending.session,
            reply,
            wait: Box::pin(async move { handle.wait(timeout, &cancel).await }),
        });
        self.publish_state();
    }

    fn finish_stop(&mut self, status: FinalizeStatus) {
        let Some(in_flight) = self.in_flight.take() else {
            return;
        };
        self.recorder.complete_finalize(&status);
        self.publish_state();
        let summary = in_flight.session.into_summary(status);
        if let Some(reply) = in_flight.reply {
            let _ = reply.send(Some(summary));
        }
    }

    fn publish_state(&self) {
        self.state.send_replace(self.recorder.state());
    }
}

/// Resolves when the in-flight finalization does; pending forever if none.
async fn wait_in_flight(in_flight: &mut Option<InFlight>) -> FinalizeStatus {
    match in_flight {
        Some(f) => f.wait.as_mut().await,
        None => std::future::pending().await,
    }
}
