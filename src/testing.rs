//! Fakes for the external collaborators, shared by the unit tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use uuid::Uuid;

use crate::capture::ReplayControl;
use crate::chat::{ChatAuthor, ChatBatch, ChatError, ChatMessage, ChatSession, ChatTransport};
use crate::media::MediaTool;
use crate::metadata::{GeneratedTitle, PublishMetadata, TitleBackend};
use crate::pipeline::{ClipRequest, ClipRunner, PipelineResult};
use crate::publish::{PublishedVideo, Publisher};
use crate::runs::StepObserver;
use crate::transcribe::{CaptionCue, Transcript, TranscriptionBackend};

pub fn author(name: &str, is_owner: bool, is_moderator: bool) -> ChatAuthor {
    ChatAuthor {
        display_name: name.to_string(),
        channel_id: format!("UC{}", name),
        is_owner,
        is_moderator,
    }
}

pub fn message(id: &str, author: ChatAuthor, text: &str) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        author,
        text: text.to_string(),
    }
}

pub fn request(seconds: u32, requester: ChatAuthor) -> ClipRequest {
    ClipRequest {
        id: Uuid::new_v4(),
        seconds,
        context: format!("Test stream - Clip by {}", requester.display_name),
        requester,
        short_form: true,
        requested_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
    }
}

pub fn session() -> ChatSession {
    ChatSession {
        live_chat_id: "chat-1".to_string(),
        stream_title: "Test stream".to_string(),
    }
}

#[derive(Default)]
pub struct FakeReplay {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl FakeReplay {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReplayControl for FakeReplay {
    async fn save_replay(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            bail!("obs unreachable");
        }
        Ok(())
    }
}

/// Writes placeholder files instead of running ffmpeg.
#[derive(Default)]
pub struct FakeMedia {
    trims: Mutex<Vec<(PathBuf, u32)>>,
    burns: Mutex<Vec<PathBuf>>,
    fail_trim: AtomicBool,
    empty_crop: AtomicBool,
    fail_burn: AtomicBool,
}

impl FakeMedia {
    pub fn fail_trim(&self) {
        self.fail_trim.store(true, Ordering::SeqCst);
    }

    pub fn empty_crop(&self) {
        self.empty_crop.store(true, Ordering::SeqCst);
    }

    /// Caption burns leave a partial file behind and fail.
    pub fn fail_burn(&self) {
        self.fail_burn.store(true, Ordering::SeqCst);
    }

    pub fn trims(&self) -> Vec<(PathBuf, u32)> {
        self.trims.lock().unwrap().clone()
    }

    pub fn burns(&self) -> Vec<PathBuf> {
        self.burns.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaTool for FakeMedia {
    async fn trim_from_end(&self, input: &Path, output: &Path, seconds: u32) -> Result<()> {
        self.trims.lock().unwrap().push((input.to_path_buf(), seconds));
        if self.fail_trim.load(Ordering::SeqCst) {
            bail!("ffmpeg exited with 1");
        }
        tokio::fs::write(output, b"trimmed").await?;
        Ok(())
    }

    async fn crop_vertical(&self, _input: &Path, output: &Path) -> Result<()> {
        if self.empty_crop.load(Ordering::SeqCst) {
            tokio::fs::write(output, b"").await?;
        } else {
            tokio::fs::write(output, b"cropped").await?;
        }
        Ok(())
    }

    async fn burn_captions(&self, _input: &Path, captions: &Path, output: &Path) -> Result<()> {
        self.burns.lock().unwrap().push(captions.to_path_buf());
        tokio::fs::write(output, b"captioned").await?;
        if self.fail_burn.load(Ordering::SeqCst) {
            bail!("subtitles filter failed");
        }
        Ok(())
    }

    async fn extract_audio(&self, _input: &Path, output: &Path) -> Result<()> {
        tokio::fs::write(output, b"RIFF").await?;
        Ok(())
    }
}

pub struct FakeTranscriber {
    name: &'static str,
    result: Option<Transcript>,
}

impl FakeTranscriber {
    pub fn failing(name: &'static str) -> Self {
        Self { name, result: None }
    }

    pub fn returning(name: &'static str, text: &str) -> Self {
        Self::with_cues(name, text, Vec::new())
    }

    pub fn with_cues(name: &'static str, text: &str, cues: Vec<CaptionCue>) -> Self {
        Self {
            name,
            result: Some(Transcript {
                text: text.to_string(),
                cues,
            }),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for FakeTranscriber {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn transcribe(&self, _audio: &Path, _clip_seconds: u32) -> Result<Transcript> {
        match &self.result {
            Some(transcript) => Ok(transcript.clone()),
            None => bail!("{} is down", self.name),
        }
    }
}

pub struct FakeTitles {
    result: Option<(String, String)>,
    calls: AtomicUsize,
}

impl FakeTitles {
    pub fn failing() -> Self {
        Self {
            result: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning(title: &str, hashtags: &str) -> Self {
        Self {
            result: Some((title.to_string(), hashtags.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TitleBackend for FakeTitles {
    fn name(&self) -> &'static str {
        "fake-titles"
    }

    async fn generate_title(&self, _transcript: &str) -> Result<GeneratedTitle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Some((title, hashtags)) => Ok(GeneratedTitle {
                title: title.clone(),
                hashtags: hashtags.clone(),
                description: "generated".to_string(),
            }),
            None => bail!("quota exceeded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishCall {
    pub file: PathBuf,
    pub metadata: PublishMetadata,
    pub is_short: bool,
}

#[derive(Default)]
pub struct FakePublisher {
    calls: Mutex<Vec<PublishCall>>,
    fail: AtomicBool,
}

impl FakePublisher {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<PublishCall> {
        self.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        file: &Path,
        metadata: &PublishMetadata,
        is_short: bool,
    ) -> Result<PublishedVideo> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("quotaExceeded");
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(PublishCall {
            file: file.to_path_buf(),
            metadata: metadata.clone(),
            is_short,
        });
        let id = format!("video-{}", calls.len());
        Ok(PublishedVideo {
            url: format!("https://youtu.be/{}", id),
            id,
        })
    }
}

/// Records requests and answers with a canned outcome.
#[derive(Default)]
pub struct FakeRunner {
    requests: Mutex<Vec<ClipRequest>>,
    fail: AtomicBool,
}

impl FakeRunner {
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ClipRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClipRunner for FakeRunner {
    async fn run(&self, request: &ClipRequest, _observer: &dyn StepObserver) -> PipelineResult {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return PipelineResult::new(
                request.id,
                Err(crate::pipeline::PipelineError::NoRecordingFound(
                    "empty".to_string(),
                )),
            );
        }
        let mut result = PipelineResult::new(
            request.id,
            Ok(PublishedVideo {
                id: "abc".to_string(),
                url: "https://youtu.be/abc".to_string(),
            }),
        );
        result.ai_title = Some("Great moment".to_string());
        result
    }
}

/// Scripted chat: each fetch pops the next queued response.
#[derive(Default)]
pub struct FakeChat {
    sessions: Mutex<VecDeque<Result<ChatSession, ChatError>>>,
    batches: Mutex<VecDeque<Result<ChatBatch, ChatError>>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    posted: Mutex<Vec<String>>,
}

impl FakeChat {
    pub fn push_session(&self, session: Result<ChatSession, ChatError>) {
        self.sessions.lock().unwrap().push_back(session);
    }

    pub fn push_batch(&self, batch: Result<ChatBatch, ChatError>) {
        self.batches.lock().unwrap().push_back(batch);
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().unwrap().clone()
    }

    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().unwrap().clone()
    }
}

pub fn batch(messages: Vec<ChatMessage>, next_token: &str, poll_interval_ms: u64) -> ChatBatch {
    ChatBatch {
        messages,
        next_token: Some(next_token.to_string()),
        poll_interval_ms,
    }
}

#[async_trait]
impl ChatTransport for FakeChat {
    async fn open_session(&self) -> Result<ChatSession, ChatError> {
        self.sessions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(session()))
    }

    async fn fetch_messages(
        &self,
        _session: &ChatSession,
        page_token: Option<&str>,
    ) -> Result<ChatBatch, ChatError> {
        self.tokens_seen
            .lock()
            .unwrap()
            .push(page_token.map(str::to_string));
        self.batches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(batch(Vec::new(), page_token.unwrap_or("end"), 0)))
    }

    async fn post_message(&self, _session: &ChatSession, text: &str) -> Result<(), ChatError> {
        self.posted.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
