use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::google_auth::GoogleAuth;

/// YouTube rejects chat messages longer than this.
pub const MAX_CHAT_MESSAGE_CHARS: usize = 200;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

const API_BASE: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no active live broadcast")]
    NotLive,
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("authorization failed: {0}")]
    Auth(String),
}

impl ChatError {
    /// `error.errors[0].reason` of a Google API error body, e.g. `liveChatEnded`.
    pub fn api_reason(&self) -> Option<String> {
        let ChatError::Api { body, .. } = self else {
            return None;
        };
        let value: serde_json::Value = serde_json::from_str(body).ok()?;
        value["error"]["errors"][0]["reason"]
            .as_str()
            .map(str::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAuthor {
    pub display_name: String,
    pub channel_id: String,
    pub is_owner: bool,
    pub is_moderator: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub author: ChatAuthor,
    pub text: String,
}

/// One page of chat, in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ChatBatch {
    pub messages: Vec<ChatMessage>,
    pub next_token: Option<String>,
    pub poll_interval_ms: u64,
}

/// The live chat a bot is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSession {
    pub live_chat_id: String,
    pub stream_title: String,
}

/// Poll-based read and post access to a live chat.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Resolves the chat of the currently active broadcast.
    async fn open_session(&self) -> Result<ChatSession, ChatError>;

    async fn fetch_messages(
        &self,
        session: &ChatSession,
        page_token: Option<&str>,
    ) -> Result<ChatBatch, ChatError>;

    async fn post_message(&self, session: &ChatSession, text: &str) -> Result<(), ChatError>;
}

/// Cuts chat text to the platform limit.
pub fn clamp_chat_text(text: &str) -> String {
    if text.chars().count() <= MAX_CHAT_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(MAX_CHAT_MESSAGE_CHARS - 1).collect();
    cut.push('…');
    cut
}

/// YouTube Data API v3 live chat.
pub struct YouTubeLiveChat {
    auth: Arc<GoogleAuth>,
    http: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastList {
    #[serde(default)]
    items: Vec<Broadcast>,
}

#[derive(Deserialize)]
struct Broadcast {
    snippet: BroadcastSnippet,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BroadcastSnippet {
    #[serde(default)]
    title: String,
    live_chat_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    items: Vec<MessageItem>,
    next_page_token: Option<String>,
    polling_interval_millis: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageItem {
    id: String,
    snippet: MessageSnippet,
    author_details: AuthorDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageSnippet {
    #[serde(default)]
    display_message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDetails {
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    is_chat_owner: bool,
    #[serde(default)]
    is_chat_moderator: bool,
}

impl From<MessageItem> for ChatMessage {
    fn from(item: MessageItem) -> Self {
        ChatMessage {
            id: item.id,
            text: item.snippet.display_message,
            author: ChatAuthor {
                display_name: item.author_details.display_name,
                channel_id: item.author_details.channel_id,
                is_owner: item.author_details.is_chat_owner,
                is_moderator: item.author_details.is_chat_moderator,
            },
        }
    }
}

impl From<MessageList> for ChatBatch {
    fn from(list: MessageList) -> Self {
        ChatBatch {
            messages: list.items.into_iter().map(ChatMessage::from).collect(),
            next_token: list.next_page_token,
            poll_interval_ms: list
                .polling_interval_millis
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

impl YouTubeLiveChat {
    pub fn new(auth: Arc<GoogleAuth>) -> Self {
        Self {
            auth,
            http: reqwest::Client::new(),
        }
    }

    async fn bearer(&self) -> Result<String, ChatError> {
        self.auth
            .access_token()
            .await
            .map_err(|e| ChatError::Auth(format!("{:#}", e)))
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ChatError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ChatError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl ChatTransport for YouTubeLiveChat {
    async fn open_session(&self) -> Result<ChatSession, ChatError> {
        let token = self.bearer().await?;
        let resp = self
            .http
            .get(format!("{}/liveBroadcasts", API_BASE))
            .bearer_auth(token)
            .query(&[("part", "snippet,status"), ("broadcastStatus", "active")])
            .send()
            .await?;
        let list: BroadcastList = Self::check(resp).await?.json().await?;

        list.items
            .into_iter()
            .find_map(|b| {
                b.snippet.live_chat_id.map(|live_chat_id| ChatSession {
                    live_chat_id,
                    stream_title: b.snippet.title,
                })
            })
            .ok_or(ChatError::NotLive)
    }

    async fn fetch_messages(
        &self,
        session: &ChatSession,
        page_token: Option<&str>,
    ) -> Result<ChatBatch, ChatError> {
        let token = self.bearer().await?;
        let mut query = vec![
            ("liveChatId", session.live_chat_id.as_str()),
            ("part", "snippet,authorDetails"),
        ];
        if let Some(page) = page_token {
            query.push(("pageToken", page));
        }
        let resp = self
            .http
            .get(format!("{}/liveChat/messages", API_BASE))
            .bearer_auth(token)
            .query(&query)
            .send()
            .await?;
        let list: MessageList = Self::check(resp).await?.json().await?;
        debug!("Fetched {} chat messages", list.items.len());
        Ok(ChatBatch::from(list))
    }

    async fn post_message(&self, session: &ChatSession, text: &str) -> Result<(), ChatError> {
        let token = self.bearer().await?;
        let body = json!({
            "snippet": {
                "liveChatId": session.live_chat_id,
                "type": "textMessageEvent",
                "textMessageDetails": {"messageText": clamp_chat_text(text)},
            }
        });
        let resp = self
            .http
            .post(format!("{}/liveChat/messages", API_BASE))
            .bearer_auth(token)
            .query(&[("part", "snippet")])
            .json(&body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }
}
