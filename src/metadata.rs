use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::Config;
use crate::transcribe::Transcript;

/// Publishing limit for titles, in characters.
pub const MAX_TITLE_CHARS: usize = 60;
/// Appended to a title that had to be cut.
pub const TRUNCATION_MARK: char = '…';
/// Appended to reformatted uploads.
pub const SHORTS_TAG: &str = "#shorts";

const MAX_PROMPT_TRANSCRIPT_CHARS: usize = 2000;
const FALLBACK_TAGS: [&str; 3] = ["live", "clip", "shorts"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

/// Raw answer from a title backend.
#[derive(Debug, Clone, Deserialize)]
pub struct GeneratedTitle {
    pub title: String,
    #[serde(default)]
    pub hashtags: String,
    #[serde(default)]
    pub description: String,
}

/// A text-generation service that turns a transcript into a title.
#[async_trait]
pub trait TitleBackend: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate_title(&self, transcript: &str) -> Result<GeneratedTitle>;
}

/// Produces publish metadata for a clip. Never fails.
pub struct MetadataGenerator {
    backends: Vec<Arc<dyn TitleBackend>>,
}

/// Where a metadata record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    Generated,
    Fallback,
}

impl MetadataGenerator {
    pub fn new(backends: Vec<Arc<dyn TitleBackend>>) -> Self {
        Self { backends }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut backends: Vec<Arc<dyn TitleBackend>> = Vec::new();
        if let Some(key) = config.euri_api_key.as_deref().filter(|k| !k.is_empty()) {
            backends.push(Arc::new(EuriBackend::new(key)));
        }
        if let Some(key) = config.gemini_api_key.as_deref().filter(|k| !k.is_empty()) {
            backends.push(Arc::new(GeminiBackend::new(key)));
        }
        if backends.is_empty() {
            warn!("No title backend configured; every clip will use fallback metadata");
        }
        Self::new(backends)
    }

    /// Asks each backend in turn when there is transcript text, else falls back.
    pub async fn generate(
        &self,
        transcript: Option<&Transcript>,
        context: &str,
        now: DateTime<Utc>,
    ) -> (PublishMetadata, MetadataSource) {
        if let Some(text) = transcript.map(|t| t.text.trim()).filter(|t| !t.is_empty()) {
            let excerpt: String = text.chars().take(MAX_PROMPT_TRANSCRIPT_CHARS).collect();
            for backend in &self.backends {
                match backend.generate_title(&excerpt).await {
                    Ok(generated) if !generated.title.trim().is_empty() => {
                        info!("{} generated title {:?}", backend.name(), generated.title);
                        return (from_generated(generated), MetadataSource::Generated);
                    }
                    Ok(_) => warn!("{} returned an empty title", backend.name()),
                    Err(err) => warn!("{} title generation failed: {:#}", backend.name(), err),
                }
            }
        }
        (fallback_metadata(context, now), MetadataSource::Fallback)
    }
}

fn from_generated(generated: GeneratedTitle) -> PublishMetadata {
    let tags: Vec<String> = generated
        .hashtags
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(|t| t.trim_start_matches('#'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect();

    let mut description = generated.description.trim().to_string();
    let hashtags = generated.hashtags.trim();
    if !hashtags.is_empty() {
        if !description.is_empty() {
            description.push_str("\n\n");
        }
        description.push_str(hashtags);
    }

    PublishMetadata {
        title: truncate_title(generated.title.trim(), MAX_TITLE_CHARS),
        description,
        tags,
    }
}

/// Deterministic metadata from the request context and the time of the clip.
pub fn fallback_metadata(context: &str, now: DateTime<Utc>) -> PublishMetadata {
    let stamp = now.format("%Y-%m-%d %H:%M:%S").to_string();
    let context = context.trim();
    let title = if context.is_empty() {
        format!("Live Clip • {}", stamp)
    } else {
        format!("{} • {}", context, stamp)
    };
    PublishMetadata {
        title: truncate_title(&title, MAX_TITLE_CHARS),
        description: format!("Auto-uploaded short from live stream at {}", stamp),
        tags: FALLBACK_TAGS.iter().map(|t| t.to_string()).collect(),
    }
}

/// Cuts `title` to at most `max_chars` characters, ending with [`TRUNCATION_MARK`] when cut.
pub fn truncate_title(title: &str, max_chars: usize) -> String {
    if title.chars().count() <= max_chars {
        return title.to_string();
    }
    let mut cut: String = title.chars().take(max_chars.saturating_sub(1)).collect();
    let trimmed_len = cut.trim_end().len();
    cut.truncate(trimmed_len);
    cut.push(TRUNCATION_MARK);
    cut
}

/// Adds the shorts tag to a title that lacks it, keeping the whole within the limit.
pub fn with_shorts_tag(title: &str) -> String {
    if title.to_lowercase().contains(SHORTS_TAG) {
        return truncate_title(title, MAX_TITLE_CHARS);
    }
    let room = MAX_TITLE_CHARS - SHORTS_TAG.len() - 1;
    format!("{} {}", truncate_title(title, room), SHORTS_TAG)
}

/// Pulls the first JSON object out of a model reply (which may be fenced or wrapped in prose).
pub fn extract_json_object(reply: &str) -> Result<GeneratedTitle> {
    let start = reply.find('{').context("no JSON object in reply")?;
    let end = reply.rfind('}').context("no JSON object in reply")?;
    if end < start {
        bail!("malformed JSON object in reply");
    }
    Ok(serde_json::from_str(&reply[start..=end])?)
}

fn title_prompt(transcript: &str) -> String {
    format!(
        "Based on this video transcript, generate:\n\
         1. A catchy YouTube Shorts title (max {} characters)\n\
         2. 5-7 relevant hashtags\n\
         3. A brief description (max 150 characters)\n\n\
         Return ONLY JSON: {{\"title\": \"...\", \"hashtags\": \"#tag1 #tag2\", \"description\": \"...\"}}\n\n\
         Transcript: {}",
        MAX_TITLE_CHARS, transcript
    )
}

/// Euri, an OpenAI-compatible chat completions endpoint.
pub struct EuriBackend {
    api_key: String,
    endpoint: String,
    model: String,
    http: reqwest::Client,
}

impl EuriBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: "https://api.euron.one/api/v1/euri/chat/completions".to_string(),
            model: "gpt-4.1-nano".to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl TitleBackend for EuriBackend {
    fn name(&self) -> &'static str {
        "euri"
    }

    async fn generate_title(&self, transcript: &str) -> Result<GeneratedTitle> {
        let body = json!({
            "messages": [{"role": "user", "content": title_prompt(transcript)}],
            "model": self.model,
            "max_tokens": 500,
            "temperature": 0.7,
        });
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Euri API error {}", status);
        }
        let completion: ChatCompletion = resp.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .context("Euri returned no choices")?;
        extract_json_object(&content)
    }
}

/// Google Gemini `generateContent`.
pub struct GeminiBackend {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl GeminiBackend {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: "gemini-1.5-flash".to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl TitleBackend for GeminiBackend {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate_title(&self, transcript: &str) -> Result<GeneratedTitle> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let body = json!({
            "contents": [{"parts": [{"text": title_prompt(transcript)}]}],
        });
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!("Gemini API error {}", status);
        }
        let parsed: GeminiResponse = resp.json().await?;
        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .context("Gemini returned no candidates")?
            .content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect();
        extract_json_object(&text)
    }
}
