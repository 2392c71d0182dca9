//! One clip request, start to finish.
//!
//! A run walks a fixed sequence of steps: acquire a capture file, trim its
//! tail, transcribe, generate metadata, optionally reformat for vertical
//! viewing, and publish. Capture, trim, reformat and publish failures end the
//! run with a classified [`PipelineError`]. Transcription and title generation
//! only ever degrade the output; they never end a run.
//!
//! Intermediate files are named from the run id inside the work directory,
//! so nothing a chat user types ends up in a path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::capture::{newest_matching, AcquisitionMethod, CaptureArtifact, ReplayControl, MEDIA_EXTENSIONS};
use crate::captions::write_srt;
use crate::chat::ChatAuthor;
use crate::config::{CaptureMode, Config};
use crate::media::MediaTool;
use crate::metadata::{with_shorts_tag, MetadataGenerator, MetadataSource, PublishMetadata};
use crate::publish::{PublishedVideo, Publisher};
use crate::runs::StepObserver;
use crate::transcribe::{Transcript, TranscriptionChain};
use crate::utilities::{is_non_empty_file, remove_if_exists};

/// A single accepted clip command.
#[derive(Debug, Clone)]
pub struct ClipRequest {
    pub id: Uuid,
    pub seconds: u32,
    /// Seed for titles when no generated title is available.
    pub context: String,
    pub requester: ChatAuthor,
    pub short_form: bool,
    pub requested_at: DateTime<Utc>,
}

/// Why a run ended without publishing.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail")]
pub enum PipelineError {
    #[error("no recording found: {0}")]
    NoRecordingFound(String),
    #[error("replay capture failed: {0}")]
    CaptureFailed(String),
    #[error("trim failed: {0}")]
    TrimFailed(String),
    #[error("reformat failed: {0}")]
    ReformatFailed(String),
    #[error("publish failed: {0}")]
    PublishFailed(String),
}

impl PipelineError {
    /// Short reason suitable for posting back to chat.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::NoRecordingFound(_) => "no recording found",
            Self::CaptureFailed(_) => "could not save the replay buffer",
            Self::TrimFailed(_) => "could not cut the clip",
            Self::ReformatFailed(_) => "could not reformat the clip",
            Self::PublishFailed(_) => "upload failed",
        }
    }
}

/// Reduced-fidelity outcomes that did not stop a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
    TranscriptionDegraded,
    MetadataFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Capture,
    Trim,
    Transcribe,
    Metadata,
    Reformat,
    Publish,
}

/// Terminal outcome of one run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub outcome: Result<PublishedVideo, PipelineError>,
    pub ai_title: Option<String>,
    pub transcript: Option<String>,
    pub degradations: Vec<Degradation>,
}

impl PipelineResult {
    pub fn new(request_id: Uuid, outcome: Result<PublishedVideo, PipelineError>) -> Self {
        Self {
            request_id,
            outcome,
            ai_title: None,
            transcript: None,
            degradations: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn video_id(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|v| v.id.as_str())
    }

    pub fn url(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(|v| v.url.as_str())
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.outcome.as_ref().err()
    }
}

/// Something that can carry a [`ClipRequest`] to a [`PipelineResult`].
#[async_trait]
pub trait ClipRunner: Send + Sync {
    async fn run(&self, request: &ClipRequest, observer: &dyn StepObserver) -> PipelineResult;
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub recording_dir: PathBuf,
    pub work_dir: PathBuf,
    pub capture_mode: CaptureMode,
    pub replay_settle: Duration,
    pub keep_artifacts: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recording_dir: config.recording_dir.clone().unwrap_or_default(),
            work_dir: config.work_dir.clone(),
            capture_mode: config.capture_mode,
            replay_settle: Duration::from_millis(config.replay_settle_ms),
            keep_artifacts: config.keep_artifacts,
        }
    }
}

/// Paths of every file a run may create.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    pub trimmed: PathBuf,
    pub audio: PathBuf,
    pub cropped: PathBuf,
    pub captions: PathBuf,
    pub captioned: PathBuf,
}

impl RunArtifacts {
    pub fn new(work_dir: &Path, id: Uuid) -> Self {
        Self {
            trimmed: work_dir.join(format!("clip_{}.mp4", id)),
            audio: work_dir.join(format!("audio_{}.wav", id)),
            cropped: work_dir.join(format!("short_{}.mp4", id)),
            captions: work_dir.join(format!("captions_{}.srt", id)),
            captioned: work_dir.join(format!("short_{}_captioned.mp4", id)),
        }
    }

    pub async fn cleanup(&self) {
        for path in [
            &self.trimmed,
            &self.audio,
            &self.cropped,
            &self.captions,
            &self.captioned,
        ] {
            remove_if_exists(path).await;
        }
    }
}

/// Values a run reports back even when it fails.
#[derive(Default)]
struct RunEcho {
    ai_title: Option<String>,
    transcript: Option<String>,
    degradations: Vec<Degradation>,
}

pub struct ClipPipeline {
    settings: PipelineSettings,
    replay: Arc<dyn ReplayControl>,
    media: Arc<dyn MediaTool>,
    transcriber: TranscriptionChain,
    metadata: MetadataGenerator,
    publisher: Arc<dyn Publisher>,
}

impl ClipPipeline {
    pub fn new(
        settings: PipelineSettings,
        replay: Arc<dyn ReplayControl>,
        media: Arc<dyn MediaTool>,
        transcriber: TranscriptionChain,
        metadata: MetadataGenerator,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            settings,
            replay,
            media,
            transcriber,
            metadata,
            publisher,
        }
    }

    async fn execute(
        &self,
        request: &ClipRequest,
        artifacts: &RunArtifacts,
        observer: &dyn StepObserver,
        echo: &mut RunEcho,
    ) -> Result<PublishedVideo, PipelineError> {
        let tag = format!("[run {}]", request.id);

        observer.on_step(request.id, PipelineStep::Capture);
        let capture = self.acquire().await?;
        info!("{} capturing from {} ({:?})", tag, capture.path.display(), capture.method);

        observer.on_step(request.id, PipelineStep::Trim);
        self.trim(&capture, artifacts, request.seconds).await?;
        info!("{} trimmed last {}s to {}", tag, request.seconds, artifacts.trimmed.display());

        observer.on_step(request.id, PipelineStep::Transcribe);
        let transcript = self.transcribe(&tag, artifacts, request.seconds).await;
        if transcript.is_none() {
            echo.degradations.push(Degradation::TranscriptionDegraded);
        }
        echo.transcript = transcript.as_ref().map(|t| t.text.clone());

        observer.on_step(request.id, PipelineStep::Metadata);
        let (mut metadata, source) = self
            .metadata
            .generate(transcript.as_ref(), &request.context, request.requested_at)
            .await;
        if source == MetadataSource::Fallback && transcript.is_some() {
            echo.degradations.push(Degradation::MetadataFallback);
        }
        echo.ai_title = Some(metadata.title.clone());

        let upload_path = if request.short_form {
            observer.on_step(request.id, PipelineStep::Reformat);
            let path = self
                .reformat(artifacts, transcript.as_ref(), request.seconds)
                .await?;
            info!("{} reformatted to {}", tag, path.display());
            metadata.title = with_shorts_tag(&metadata.title);
            path
        } else {
            artifacts.trimmed.clone()
        };

        observer.on_step(request.id, PipelineStep::Publish);
        self.publish(&upload_path, &metadata, request.short_form).await
    }

    async fn acquire(&self) -> Result<CaptureArtifact, PipelineError> {
        let method = match self.settings.capture_mode {
            CaptureMode::Replay => {
                self.replay
                    .save_replay()
                    .await
                    .map_err(|e| PipelineError::CaptureFailed(format!("{:#}", e)))?;
                // The save completes asynchronously on the OBS side.
                tokio::time::sleep(self.settings.replay_settle).await;
                AcquisitionMethod::ReplayBufferSave
            }
            CaptureMode::Recording => AcquisitionMethod::DirectRecording,
        };

        let dir = &self.settings.recording_dir;
        match newest_matching(dir, &MEDIA_EXTENSIONS).await {
            Ok(Some(path)) => Ok(CaptureArtifact { path, method }),
            Ok(None) => Err(PipelineError::NoRecordingFound(format!(
                "no media files in {}",
                dir.display()
            ))),
            Err(err) => Err(PipelineError::NoRecordingFound(format!("{:#}", err))),
        }
    }

    async fn trim(
        &self,
        capture: &CaptureArtifact,
        artifacts: &RunArtifacts,
        seconds: u32,
    ) -> Result<(), PipelineError> {
        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| PipelineError::TrimFailed(format!("creating work dir: {}", e)))?;
        self.media
            .trim_from_end(&capture.path, &artifacts.trimmed, seconds)
            .await
            .map_err(|e| PipelineError::TrimFailed(format!("{:#}", e)))?;
        if !is_non_empty_file(&artifacts.trimmed).await {
            return Err(PipelineError::TrimFailed("trim produced an empty file".to_string()));
        }
        Ok(())
    }

    async fn transcribe(&self, tag: &str, artifacts: &RunArtifacts, seconds: u32) -> Option<Transcript> {
        if self.transcriber.is_empty() {
            warn!("{} no transcription backend configured", tag);
            return None;
        }
        if let Err(err) = self
            .media
            .extract_audio(&artifacts.trimmed, &artifacts.audio)
            .await
        {
            warn!("{} audio extraction failed: {:#}", tag, err);
            return None;
        }
        let transcript = self.transcriber.transcribe(&artifacts.audio, seconds).await;
        if transcript.is_none() {
            warn!("{} every transcription backend failed; continuing without captions", tag);
        }
        transcript
    }

    /// Crops to vertical and burns captions when there are any. Partial outputs are removed on failure.
    async fn reformat(
        &self,
        artifacts: &RunArtifacts,
        transcript: Option<&Transcript>,
        seconds: u32,
    ) -> Result<PathBuf, PipelineError> {
        if !is_non_empty_file(&artifacts.trimmed).await {
            return Err(PipelineError::ReformatFailed(
                "trimmed clip is missing or empty".to_string(),
            ));
        }

        let cropped = self.media.crop_vertical(&artifacts.trimmed, &artifacts.cropped).await;
        if let Err(err) = cropped {
            remove_if_exists(&artifacts.cropped).await;
            return Err(PipelineError::ReformatFailed(format!("crop: {:#}", err)));
        }
        if !is_non_empty_file(&artifacts.cropped).await {
            remove_if_exists(&artifacts.cropped).await;
            return Err(PipelineError::ReformatFailed(
                "crop produced an empty file".to_string(),
            ));
        }

        let Some(transcript) = transcript.filter(|t| !t.cues.is_empty()) else {
            return Ok(artifacts.cropped.clone());
        };

        let written = match write_srt(&artifacts.captions, &transcript.cues, f64::from(seconds)).await {
            Ok(written) => written,
            Err(err) => {
                remove_if_exists(&artifacts.captions).await;
                remove_if_exists(&artifacts.cropped).await;
                return Err(PipelineError::ReformatFailed(format!("captions: {:#}", err)));
            }
        };
        if written == 0 {
            return Ok(artifacts.cropped.clone());
        }

        let burned = self
            .media
            .burn_captions(&artifacts.cropped, &artifacts.captions, &artifacts.captioned)
            .await;
        if burned.is_err() || !is_non_empty_file(&artifacts.captioned).await {
            remove_if_exists(&artifacts.captioned).await;
            remove_if_exists(&artifacts.cropped).await;
            let detail = match burned {
                Err(err) => format!("captions: {:#}", err),
                Ok(()) => "caption burn produced an empty file".to_string(),
            };
            return Err(PipelineError::ReformatFailed(detail));
        }
        Ok(artifacts.captioned.clone())
    }

    async fn publish(
        &self,
        path: &Path,
        metadata: &PublishMetadata,
        is_short: bool,
    ) -> Result<PublishedVideo, PipelineError> {
        self.publisher
            .publish(path, metadata, is_short)
            .await
            .map_err(|e| PipelineError::PublishFailed(format!("{:#}", e)))
    }
}

#[async_trait]
impl ClipRunner for ClipPipeline {
    async fn run(&self, request: &ClipRequest, observer: &dyn StepObserver) -> PipelineResult {
        let artifacts = RunArtifacts::new(&self.settings.work_dir, request.id);
        let mut echo = RunEcho::default();

        let outcome = self.execute(request, &artifacts, observer, &mut echo).await;
        match &outcome {
            Ok(video) => info!("[run {}] published {}", request.id, video.url),
            Err(err) => error!("[run {}] {}", request.id, err),
        }

        if !self.settings.keep_artifacts {
            artifacts.cleanup().await;
        }

        let mut result = PipelineResult::new(request.id, outcome);
        result.ai_title = echo.ai_title;
        result.transcript = echo.transcript;
        result.degradations = echo.degradations;
        result
    }
}
