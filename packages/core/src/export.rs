//! Export orchestration
//!
//! The export state machine is the only surface the surrounding UI code
//! touches: it drives loading, compositing, and finalization for one job
//! at a time and publishes progress snapshots over a watch channel.
//! Starting a new export is the only cancellation mechanism; it aborts the
//! in-flight job and releases its resources before the new one begins.

use crate::background::{self, BackgroundSpec, Paint};
use crate::capture::{CaptureFinalizer, CaptureSinkFactory, EncoderSupport, ExportArtifact};
use crate::compositor::{FrameCompositor, PreparedPaint, Tick};
use crate::error::{ExportFailure, ExportStage};
use crate::source::{self, MediaLoader, SourceRef};
use crate::{BackdropError, BackdropResult};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Lifecycle of one export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStatus {
    Idle,
    LoadingSource,
    Compositing,
    Finalizing,
    Done,
    Failed,
}

impl ExportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Done | ExportStatus::Failed)
    }
}

/// Published snapshot of the active export job.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub id: uuid::Uuid,
    pub status: ExportStatus,
    pub progress_percent: f32,
    /// Present iff `status == Failed`.
    pub error_detail: Option<ExportFailure>,
    /// Present iff `status == Done`.
    pub artifact: Option<ExportArtifact>,
}

impl ExportJob {
    fn idle(id: uuid::Uuid) -> Self {
        Self {
            id,
            status: ExportStatus::Idle,
            progress_percent: 0.0,
            error_detail: None,
            artifact: None,
        }
    }
}

/// Monotonic publisher over the job's watch channel.
struct JobPublisher {
    tx: watch::Sender<ExportJob>,
}

impl JobPublisher {
    fn set_status(&self, status: ExportStatus) {
        self.tx.send_modify(|job| job.status = status);
    }

    /// Progress never decreases within a job.
    fn set_progress(&self, percent: f32) {
        self.tx.send_modify(|job| {
            job.progress_percent = job.progress_percent.max(percent.clamp(0.0, 100.0));
        });
    }

    fn done(&self, artifact: ExportArtifact) {
        self.tx.send_modify(|job| {
            job.status = ExportStatus::Done;
            job.progress_percent = 100.0;
            job.artifact = Some(artifact);
        });
    }

    fn fail(&self, stage: ExportStage, error: BackdropError) {
        warn!("Export failed while {}: {}", stage, error);
        self.tx.send_modify(|job| {
            job.status = ExportStatus::Failed;
            job.error_detail = Some(ExportFailure::new(stage, &error));
        });
    }
}

/// Export service holding the injected pipeline capabilities and at most
/// one active job.
pub struct ExportService {
    loader: Arc<dyn MediaLoader>,
    support: Arc<dyn EncoderSupport>,
    sinks: Arc<dyn CaptureSinkFactory>,
    client: reqwest::Client,
    active: Option<tokio::task::JoinHandle<()>>,
}

impl ExportService {
    pub fn new(
        loader: Arc<dyn MediaLoader>,
        support: Arc<dyn EncoderSupport>,
        sinks: Arc<dyn CaptureSinkFactory>,
    ) -> Self {
        Self {
            loader,
            support,
            sinks,
            client: reqwest::Client::new(),
            active: None,
        }
    }

    /// Service backed by the real ffmpeg decoder and encoder.
    #[cfg(all(feature = "decoding", feature = "encoding"))]
    pub fn with_ffmpeg() -> BackdropResult<Self> {
        let support = crate::capture::ffmpeg::FfmpegEncoderSupport::detect()?;
        Ok(Self::new(
            Arc::new(source::create_loader()),
            Arc::new(support),
            Arc::new(crate::capture::ffmpeg::FfmpegSinkFactory),
        ))
    }

    /// Start a fresh export job, replacing any in-flight one.
    ///
    /// The prior job is aborted and its resources (source handle, capture
    /// process, accumulated chunks) are released before the new job begins;
    /// this is the only cancellation mechanism.
    pub async fn start_export(
        &mut self,
        spec: BackgroundSpec,
        source: SourceRef,
    ) -> watch::Receiver<ExportJob> {
        if let Some(prior) = self.active.take() {
            prior.abort();
            let _ = prior.await;
            info!("Discarded prior export job");
        }

        let id = uuid::Uuid::new_v4();
        let (tx, rx) = watch::channel(ExportJob::idle(id));
        info!("Starting export job {} with {:?}", id, spec);

        let loader = Arc::clone(&self.loader);
        let support = Arc::clone(&self.support);
        let sinks = Arc::clone(&self.sinks);
        let client = self.client.clone();

        self.active = Some(tokio::spawn(async move {
            run_job(
                spec,
                source,
                loader,
                support,
                sinks,
                client,
                JobPublisher { tx },
            )
            .await;
        }));

        rx
    }
}

async fn run_job(
    spec: BackgroundSpec,
    source: SourceRef,
    loader: Arc<dyn MediaLoader>,
    support: Arc<dyn EncoderSupport>,
    sinks: Arc<dyn CaptureSinkFactory>,
    client: reqwest::Client,
    publisher: JobPublisher,
) {
    publisher.set_status(ExportStatus::LoadingSource);
    let media = match loader.load(&source).await {
        Ok(media) => media,
        Err(e) => return publisher.fail(ExportStage::LoadingSource, e),
    };

    // Materialize the paint instruction before the draw loop, the way the
    // background still is prepared before recording starts.
    let prepared = match background::resolve(&spec) {
        Paint::None => PreparedPaint::None,
        Paint::Fill(color) => PreparedPaint::Fill(color),
        Paint::CoverImage(handle) => {
            match source::load_background_image(&client, &handle).await {
                Ok(image) => PreparedPaint::Image(image),
                Err(e) => return publisher.fail(ExportStage::Compositing, e),
            }
        }
    };

    // Capture runs concurrently with compositing from the first tick.
    let mut finalizer =
        match CaptureFinalizer::start(support.as_ref(), sinks.as_ref(), media.width, media.height)
            .await
        {
            Ok(finalizer) => finalizer,
            Err(e) => return publisher.fail(ExportStage::Compositing, e),
        };

    publisher.set_status(ExportStatus::Compositing);
    let mut compositor =
        FrameCompositor::new(media.width, media.height, prepared, media.duration);
    let mut frames = media.frames;

    loop {
        let pull = match frames.next_frame().await {
            Ok(pull) => pull,
            Err(e) => return publisher.fail(ExportStage::Compositing, e),
        };

        match compositor.composite(&pull) {
            Ok(Tick::Drawn {
                progress,
                timestamp,
            }) => {
                if let Err(e) = finalizer
                    .record_frame_at(compositor.canvas(), timestamp)
                    .await
                {
                    return publisher.fail(ExportStage::Compositing, e);
                }
                publisher.set_progress(progress);
            }
            Ok(Tick::Skipped) => continue,
            Ok(Tick::Finished) => break,
            Err(e) => return publisher.fail(ExportStage::Compositing, e),
        }
    }

    // End of stream: release the decode handle, then finalize the capture.
    drop(frames);
    publisher.set_status(ExportStatus::Finalizing);

    match finalizer.finalize().await {
        Ok(artifact) => {
            info!(
                "Export done: {} bytes as {}",
                artifact.data.len(),
                artifact.media_type
            );
            publisher.done(artifact);
        }
        Err(e) => publisher.fail(ExportStage::Finalizing, e),
    }
}

/// Wait until the job reaches `Done` or `Failed` and return the final
/// snapshot.
pub async fn wait_terminal(rx: &mut watch::Receiver<ExportJob>) -> ExportJob {
    loop {
        {
            let job = rx.borrow();
            if job.status.is_terminal() {
                return job.clone();
            }
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::stub::{FixedSupport, StubSinkFactory};
    use crate::source::stub::{FailingLoader, StubLoader, StubSourceConfig};
    use std::time::Duration;

    fn service_with(
        loader: Arc<dyn MediaLoader>,
        support: FixedSupport,
        factory: StubSinkFactory,
    ) -> ExportService {
        ExportService::new(loader, Arc::new(support), Arc::new(factory))
    }

    #[tokio::test]
    async fn successful_export_reaches_done_at_exactly_100() {
        let loader = Arc::new(StubLoader::new(StubSourceConfig {
            duration: Duration::from_secs(1),
            frame_rate: 10,
            ..Default::default()
        }));
        let mut service = service_with(loader, FixedSupport::all(), StubSinkFactory::new());

        let mut rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("stub".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.status, ExportStatus::Done);
        assert_eq!(job.progress_percent, 100.0);
        assert!(job.artifact.is_some());
        assert!(job.error_detail.is_none());
    }

    #[tokio::test]
    async fn artifact_tagged_with_negotiated_media_type() {
        let loader = Arc::new(StubLoader::new(StubSourceConfig::default()));
        let mut service = service_with(
            loader,
            FixedSupport::only(&["video/mp4"]),
            StubSinkFactory::new(),
        );

        let mut rx = service
            .start_export(BackgroundSpec::Original, SourceRef::Url("stub".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.artifact.unwrap().media_type, "video/mp4");
    }

    #[tokio::test]
    async fn fetch_failure_fails_before_capture_starts() {
        let loader = Arc::new(FailingLoader::http_status(502, "Bad Gateway"));
        let factory = StubSinkFactory::new();
        let stats = factory.stats();
        let mut service = service_with(loader, FixedSupport::all(), factory);

        let mut rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("gone".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.status, ExportStatus::Failed);
        let failure = job.error_detail.unwrap();
        assert_eq!(failure.kind, crate::error::ExportErrorKind::SourceFetch);
        assert_eq!(failure.stage, ExportStage::LoadingSource);
        assert!(failure.message.contains("502"));
        assert!(job.artifact.is_none());
        assert_eq!(stats.starts.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_supported_encoding_fails_without_artifact() {
        let loader = Arc::new(StubLoader::new(StubSourceConfig::default()));
        let mut service = service_with(loader, FixedSupport::none(), StubSinkFactory::new());

        let mut rx = service
            .start_export(BackgroundSpec::Blur, SourceRef::Url("stub".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.status, ExportStatus::Failed);
        assert_eq!(
            job.error_detail.unwrap().kind,
            crate::error::ExportErrorKind::NoSupportedEncoding
        );
        assert!(job.artifact.is_none());
    }

    #[tokio::test]
    async fn capture_start_failure_surfaces_as_failed() {
        let loader = Arc::new(StubLoader::new(StubSourceConfig::default()));
        let mut service =
            service_with(loader, FixedSupport::all(), StubSinkFactory::failing_start());

        let mut rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("stub".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.status, ExportStatus::Failed);
        assert_eq!(
            job.error_detail.unwrap().kind,
            crate::error::ExportErrorKind::CaptureStart
        );
    }

    #[tokio::test]
    async fn high_rate_source_is_resampled_to_capture_rate() {
        // 1 s at 60 fps must encode as 1 s of 30 fps capture, not 2 s.
        let loader = Arc::new(StubLoader::new(StubSourceConfig {
            duration: Duration::from_secs(1),
            frame_rate: 60,
            ..Default::default()
        }));
        let factory = StubSinkFactory::new();
        let stats = factory.stats();
        let mut service = service_with(loader, FixedSupport::all(), factory);

        let mut rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("stub".into()))
            .await;
        let job = wait_terminal(&mut rx).await;

        assert_eq!(job.status, ExportStatus::Done);
        assert_eq!(stats.frames.load(std::sync::atomic::Ordering::SeqCst), 30);
    }

    #[tokio::test]
    async fn progress_is_monotonic_across_snapshots() {
        let loader = Arc::new(StubLoader::new(StubSourceConfig {
            duration: Duration::from_secs(2),
            frame_rate: 30,
            warmup_ticks: 3,
            ..Default::default()
        }));
        let mut service = service_with(loader, FixedSupport::all(), StubSinkFactory::new());

        let mut rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("stub".into()))
            .await;

        let mut last = 0.0f32;
        loop {
            let (progress, terminal) = {
                let job = rx.borrow();
                (job.progress_percent, job.status.is_terminal())
            };
            assert!(progress >= last, "progress went backwards: {last} -> {progress}");
            last = progress;
            if terminal {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(last, 100.0);
    }

    #[tokio::test]
    async fn new_export_discards_prior_job() {
        // Long-running first job, quick second one.
        let loader = Arc::new(StubLoader::new(StubSourceConfig {
            duration: Duration::from_secs(60),
            frame_rate: 30,
            ..Default::default()
        }));
        let factory = StubSinkFactory::new();
        let stats = factory.stats();
        let mut service = service_with(loader, FixedSupport::all(), factory);

        let first_rx = service
            .start_export(BackgroundSpec::GreenScreen, SourceRef::Url("one".into()))
            .await;
        tokio::task::yield_now().await;

        let mut second_rx = service
            .start_export(BackgroundSpec::Blur, SourceRef::Url("two".into()))
            .await;

        let job = wait_terminal(&mut second_rx).await;

        assert_eq!(job.status, ExportStatus::Done);
        // First job never finalized: only the second produced an artifact.
        assert_eq!(stats.finishes.load(std::sync::atomic::Ordering::SeqCst), 1);
        // The first job's task is gone: the frame counter stays put once
        // the second job has finished.
        let total = stats.frames.load(std::sync::atomic::Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.frames.load(std::sync::atomic::Ordering::SeqCst), total);
        assert!(!first_rx.borrow().status.is_terminal());
    }
}
