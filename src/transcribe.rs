#![allow(clippy::result_large_err)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_transcribestreaming::types::{
    AudioEvent, AudioStream, LanguageCode, MediaEncoding, TranscriptResultStream,
};
use aws_sdk_transcribestreaming::{config::Region, Client};
use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::captions::{group_words, spread_words, TimedWord};
use crate::config::{Config, TranscriberKind};
use crate::utilities::run_tool;

const CHUNK_SIZE: usize = 8192;
const SAMPLE_RATE: u32 = 16_000;

/// One caption line with its on-screen window, in seconds from clip start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptionCue {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub cues: Vec<CaptionCue>,
}

impl Transcript {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// A speech-to-text service.
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transcribes a 16 kHz mono WAV. `clip_seconds` is the clip length, for
    /// backends that return text without timings.
    async fn transcribe(&self, audio: &Path, clip_seconds: u32) -> Result<Transcript>;
}

/// Tries each backend in order and returns the first usable transcript.
///
/// Never fails: when every backend errors (or none is configured) the result is `None`.
pub struct TranscriptionChain {
    backends: Vec<Arc<dyn TranscriptionBackend>>,
}

impl TranscriptionChain {
    pub fn new(backends: Vec<Arc<dyn TranscriptionBackend>>) -> Self {
        Self { backends }
    }

    /// Builds the configured backends in `TRANSCRIBERS` order, skipping any without credentials.
    pub async fn from_config(config: &Config) -> Self {
        let mut backends: Vec<Arc<dyn TranscriptionBackend>> = Vec::new();
        for kind in &config.transcribers {
            match kind {
                TranscriberKind::Whisper => backends.push(Arc::new(WhisperBackend::new(
                    &config.python_bin,
                    &config.whisper_model,
                ))),
                TranscriberKind::Elevenlabs => match &config.elevenlabs_api_key {
                    Some(key) if !key.is_empty() => {
                        backends.push(Arc::new(ElevenLabsBackend::new(key)))
                    }
                    _ => warn!("ElevenLabs transcription listed but ELEVENLABS_API_KEY is not set"),
                },
                TranscriberKind::Aws => backends.push(Arc::new(AwsTranscribeBackend::new().await)),
            }
        }
        info!(
            "Transcription chain: [{}]",
            backends.iter().map(|b| b.name()).collect::<Vec<_>>().join(" -> ")
        );
        Self::new(backends)
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn transcribe(&self, audio: &Path, clip_seconds: u32) -> Option<Transcript> {
        for backend in &self.backends {
            match backend.transcribe(audio, clip_seconds).await {
                Ok(transcript) if transcript.has_text() => {
                    info!(
                        "{} transcribed {} cues",
                        backend.name(),
                        transcript.cues.len()
                    );
                    return Some(transcript);
                }
                Ok(_) => warn!("{} returned an empty transcript", backend.name()),
                Err(err) => warn!("{} transcription failed: {:#}", backend.name(), err),
            }
        }
        None
    }
}

/// Local openai-whisper through a Python subprocess.
pub struct WhisperBackend {
    python: String,
    model: String,
}

/// Model and audio path arrive as argv, never spliced into the source.
const WHISPER_SCRIPT: &str = r#"
import json, sys
import whisper
model = whisper.load_model(sys.argv[1])
result = model.transcribe(sys.argv[2], verbose=False)
segments = [
    {"start": s["start"], "end": s["end"], "text": s["text"].strip()}
    for s in result["segments"]
]
print(json.dumps({"text": result["text"].strip(), "segments": segments}))
"#;

#[derive(Deserialize)]
struct WhisperOutput {
    text: String,
    segments: Vec<CaptionCue>,
}

impl WhisperBackend {
    pub fn new(python: &str, model: &str) -> Self {
        Self {
            python: python.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for WhisperBackend {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(&self, audio: &Path, _clip_seconds: u32) -> Result<Transcript> {
        let args = [
            "-c".into(),
            WHISPER_SCRIPT.into(),
            self.model.clone().into(),
            audio.as_os_str().to_os_string(),
        ];
        let stdout: Vec<u8> = run_tool::<std::ffi::OsString>(&self.python, &args).await?;
        parse_whisper_stdout(&String::from_utf8_lossy(&stdout))
    }
}

/// Whisper may print warnings before the JSON; the result is the last line.
fn parse_whisper_stdout(stdout: &str) -> Result<Transcript> {
    let line = stdout
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .context("whisper produced no JSON")?;
    let parsed: WhisperOutput = serde_json::from_str(line)?;
    Ok(Transcript {
        text: parsed.text,
        cues: parsed.segments,
    })
}

/// ElevenLabs speech-to-text HTTP API.
pub struct ElevenLabsBackend {
    api_key: String,
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ElevenLabsResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<ElevenLabsWord>,
}

#[derive(Deserialize)]
struct ElevenLabsWord {
    text: String,
    start: Option<f64>,
    end: Option<f64>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl ElevenLabsBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: "https://api.elevenlabs.io/v1/speech-to-text".to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for ElevenLabsBackend {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    async fn transcribe(&self, audio: &Path, clip_seconds: u32) -> Result<Transcript> {
        let data = tokio::fs::read(audio)
            .await
            .with_context(|| format!("reading {}", audio.display()))?;
        let part = reqwest::multipart::Part::bytes(data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .text("model_id", "scribe_v1")
            .part("file", part);

        let resp = self
            .http
            .post(&self.endpoint)
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("ElevenLabs API error {}: {}", status, body);
        }

        let parsed: ElevenLabsResponse = resp.json().await?;
        Ok(elevenlabs_transcript(parsed, clip_seconds))
    }
}

fn elevenlabs_transcript(resp: ElevenLabsResponse, clip_seconds: u32) -> Transcript {
    let timed: Vec<TimedWord> = resp
        .words
        .iter()
        .filter(|w| w.kind.as_deref().unwrap_or("word") == "word")
        .filter_map(|w| {
            Some(TimedWord {
                text: w.text.clone(),
                start: w.start?,
                end: w.end?,
            })
        })
        .collect();

    let words = if timed.is_empty() {
        spread_words(&resp.text, f64::from(clip_seconds))
    } else {
        timed
    };

    Transcript {
        text: resp.text.trim().to_string(),
        cues: group_words(&words),
    }
}

/// Amazon Transcribe streaming, fed from the extracted WAV.
pub struct AwsTranscribeBackend {
    client: Client,
}

impl AwsTranscribeBackend {
    pub async fn new() -> Self {
        let region_provider = RegionProviderChain::default_provider().or_else(Region::new("us-east-1"));
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;
        Self {
            client: Client::new(&shared_config),
        }
    }
}

#[async_trait]
impl TranscriptionBackend for AwsTranscribeBackend {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn transcribe(&self, audio: &Path, _clip_seconds: u32) -> Result<Transcript> {
        let wav_path: PathBuf = audio.to_path_buf();
        let pcm = tokio::task::spawn_blocking(move || read_pcm(&wav_path)).await??;
        debug!("Streaming {} bytes of PCM to Amazon Transcribe", pcm.len());

        let input_stream = async_stream::stream! {
            for chunk in pcm.chunks(CHUNK_SIZE) {
                tokio::time::sleep(Duration::from_millis(100)).await;
                yield Ok(AudioStream::AudioEvent(
                    AudioEvent::builder()
                        .audio_chunk(aws_sdk_transcribestreaming::primitives::Blob::new(chunk.to_vec()))
                        .build(),
                ));
            }
        };

        let mut output = self
            .client
            .start_stream_transcription()
            .language_code(LanguageCode::EnUs)
            .media_sample_rate_hertz(SAMPLE_RATE as i32)
            .media_encoding(MediaEncoding::Pcm)
            .audio_stream(input_stream.into())
            .send()
            .await?;

        let mut transcript = Transcript::default();
        while let Some(event) = output.transcript_result_stream.recv().await? {
            match event {
                TranscriptResultStream::TranscriptEvent(transcript_event) => {
                    let Some(results) = transcript_event.transcript.and_then(|t| t.results) else {
                        continue;
                    };
                    for result in results.into_iter().filter(|r| !r.is_partial) {
                        let Some(text) = result
                            .alternatives
                            .unwrap_or_default()
                            .into_iter()
                            .next()
                            .and_then(|a| a.transcript)
                        else {
                            continue;
                        };
                        if !transcript.text.is_empty() {
                            transcript.text.push(' ');
                        }
                        transcript.text.push_str(&text);
                        transcript.cues.push(CaptionCue {
                            start: result.start_time,
                            end: result.end_time,
                            text,
                        });
                    }
                }
                otherwise => bail!("unexpected transcribe event: {:?}", otherwise),
            }
        }
        Ok(transcript)
    }
}

/// Reads 16-bit mono WAV samples into little-endian PCM bytes.
fn read_pcm(path: &Path) -> Result<Vec<u8>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    ensure!(
        spec.channels == 1 && spec.sample_rate == SAMPLE_RATE && spec.bits_per_sample == 16,
        "expected 16 kHz mono 16-bit WAV, got {:?}",
        spec
    );

    let mut pcm = BytesMut::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        pcm.put_i16_le(sample?);
    }
    Ok(pcm.to_vec())
}
