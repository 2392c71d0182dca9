use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::info;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::google_auth::GoogleAuth;
use crate::metadata::PublishMetadata;

/// "People & Blogs", the category uploads land in.
const YOUTUBE_CATEGORY_ID: &str = "22";
const UPLOAD_ENDPOINT: &str =
    "https://www.googleapis.com/upload/youtube/v3/videos?uploadType=resumable&part=snippet,status";

/// Where a published clip can be found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedVideo {
    pub id: String,
    pub url: String,
}

/// A video host.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        file: &Path,
        metadata: &PublishMetadata,
        is_short: bool,
    ) -> Result<PublishedVideo>;
}

/// Canonical watch URL for a YouTube video id.
pub fn youtube_watch_url(id: &str, is_short: bool) -> String {
    if is_short {
        format!("https://youtube.com/shorts/{}", id)
    } else {
        format!("https://youtu.be/{}", id)
    }
}

/// YouTube Data API resumable upload.
pub struct YouTubePublisher {
    auth: Arc<GoogleAuth>,
    privacy_status: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct UploadedVideo {
    id: String,
}

impl YouTubePublisher {
    pub fn new(auth: Arc<GoogleAuth>, privacy_status: &str) -> Self {
        Self {
            auth,
            privacy_status: privacy_status.to_string(),
            http: reqwest::Client::new(),
        }
    }

    fn resource(&self, metadata: &PublishMetadata) -> serde_json::Value {
        json!({
            "snippet": {
                "title": metadata.title,
                "description": metadata.description,
                "tags": metadata.tags,
                "categoryId": YOUTUBE_CATEGORY_ID,
            },
            "status": {
                "privacyStatus": self.privacy_status,
                "selfDeclaredMadeForKids": false,
            }
        })
    }
}

#[async_trait]
impl Publisher for YouTubePublisher {
    async fn publish(
        &self,
        file: &Path,
        metadata: &PublishMetadata,
        is_short: bool,
    ) -> Result<PublishedVideo> {
        let len = tokio::fs::metadata(file)
            .await
            .with_context(|| format!("stat {}", file.display()))?
            .len();
        let token = self.auth.access_token().await?;

        let session = self
            .http
            .post(UPLOAD_ENDPOINT)
            .bearer_auth(&token)
            .header("X-Upload-Content-Type", "video/mp4")
            .header("X-Upload-Content-Length", len)
            .json(&self.resource(metadata))
            .send()
            .await?;
        if !session.status().is_success() {
            let status = session.status();
            let body = session.text().await.unwrap_or_default();
            bail!("upload session rejected ({}): {}", status, body);
        }
        let upload_url = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .context("upload session returned no Location")?
            .to_string();

        let body = tokio::fs::File::open(file)
            .await
            .with_context(|| format!("opening {}", file.display()))?;
        let resp = self
            .http
            .put(&upload_url)
            .bearer_auth(&token)
            .header(CONTENT_TYPE, "video/mp4")
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::from(body))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("upload failed ({}): {}", status, body);
        }
        let uploaded: UploadedVideo = resp.json().await?;
        let url = youtube_watch_url(&uploaded.id, is_short);
        info!("Uploaded {} bytes to {}", len, url);

        Ok(PublishedVideo {
            id: uploaded.id,
            url,
        })
    }
}
