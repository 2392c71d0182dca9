use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use aws_types::region::Region;
use log::info;

use crate::metadata::PublishMetadata;
use crate::publish::{PublishedVideo, Publisher};

/// Publishes clips as objects in an S3 bucket, with a JSON sidecar for the metadata.
pub struct S3Uploader {
    client: Client,
    bucket: String,
    /// Optional endpoint override (for example, "http://127.0.0.1:9000" for MinIO)
    endpoint: Option<String>,
}

impl S3Uploader {
    /// Creates a new S3Uploader.
    ///
    /// * `bucket` - The S3 bucket name.
    /// * `endpoint` - An optional endpoint override (pass, for example, Some("http://127.0.0.1:9000")
    ///   to use a local S3-compatible service like MinIO).
    pub async fn new(bucket: &str, endpoint: Option<&str>) -> Result<Self> {
        let shared_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let mut config = aws_sdk_s3::config::Builder::from(&shared_config);
        if shared_config.region().is_none() {
            config = config.region(Region::new("us-east-1"));
        }
        if let Some(ep) = endpoint {
            config = config.endpoint_url(ep).force_path_style(true);
        }

        Ok(S3Uploader {
            client: Client::from_conf(config.build()),
            bucket: bucket.to_string(),
            endpoint: endpoint.map(|s| s.to_string()),
        })
    }

    /// URL an object is reachable at.
    pub fn object_url(&self, object_key: &str) -> String {
        if let Some(ref ep) = self.endpoint {
            let trimmed = ep.trim_end_matches('/');
            format!("{}/{}/{}", trimmed, self.bucket, object_key)
        } else {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket, object_key)
        }
    }

    /// Streams the file at `file_path` into the bucket under `object_key`.
    pub async fn upload_file(&self, file_path: &Path, object_key: &str) -> Result<String> {
        let body = ByteStream::from_path(file_path).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .content_type("video/mp4")
            .body(body)
            .send()
            .await?;

        Ok(self.object_url(object_key))
    }
}

/// Object key for a clip: `<folder>/<file name>`, where the folder groups a clip with its sidecar.
pub fn clip_key(file: &Path) -> String {
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "clip.mp4".to_string());
    let stem = name.rsplit_once('.').map(|(s, _)| s).unwrap_or(&name);
    format!("{}/{}", stem, name)
}

#[async_trait]
impl Publisher for S3Uploader {
    async fn publish(
        &self,
        file: &Path,
        metadata: &PublishMetadata,
        is_short: bool,
    ) -> Result<PublishedVideo> {
        let key = clip_key(file);
        let url = self.upload_file(file, &key).await?;

        let sidecar = serde_json::json!({
            "title": metadata.title,
            "description": metadata.description,
            "tags": metadata.tags,
            "is_short": is_short,
        });
        let sidecar_key = format!("{}.json", key.trim_end_matches(".mp4"));
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&sidecar_key)
            .content_type("application/json")
            .body(ByteStream::from(serde_json::to_vec_pretty(&sidecar)?))
            .send()
            .await?;

        info!("Successfully uploaded clip to {}", url);
        Ok(PublishedVideo { id: key, url })
    }
}
