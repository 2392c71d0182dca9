use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use futures::SinkExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio_stream::StreamExt;
use tokio_tungstenite::tungstenite::Message;

/// Extensions OBS writes that we are willing to clip from.
pub const MEDIA_EXTENSIONS: [&str; 3] = ["mp4", "mkv", "mov"];

const OBS_TIMEOUT: Duration = Duration::from_secs(10);
const OBS_RPC_VERSION: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMethod {
    DirectRecording,
    ReplayBufferSave,
}

/// A local media file a pipeline run clips from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureArtifact {
    pub path: PathBuf,
    pub method: AcquisitionMethod,
}

/// Control over the capture tool's replay buffer.
#[async_trait]
pub trait ReplayControl: Send + Sync {
    /// Flushes the replay buffer to disk. Safe to call repeatedly.
    async fn save_replay(&self) -> Result<()>;
}

/// Newest file in `dir` whose extension is in `extensions`, by modification time.
pub async fn newest_matching(dir: &Path, extensions: &[&str]) -> Result<Option<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !has_extension(&path, extensions) {
            continue;
        }
        let meta = match entry.metadata().await {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };
        let modified = meta.modified()?;
        if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// OBS over obs-websocket v5.
pub struct ObsReplayControl {
    host: String,
    password: String,
}

#[derive(Deserialize)]
struct ObsEnvelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Deserialize)]
struct ObsAuthChallenge {
    challenge: String,
    salt: String,
}

impl ObsReplayControl {
    pub fn new(host: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            password: password.to_string(),
        }
    }

    async fn save(&self) -> Result<()> {
        let url = format!("ws://{}", self.host);
        debug!("Connecting to OBS at {}", url);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting to OBS at {}", url))?;

        let hello = next_envelope(&mut ws).await?;
        if hello.op != 0 {
            bail!("expected Hello from OBS, got op {}", hello.op);
        }
        let mut identify = json!({"rpcVersion": OBS_RPC_VERSION, "eventSubscriptions": 0});
        if let Some(auth) = hello.d.get("authentication") {
            let challenge: ObsAuthChallenge = serde_json::from_value(auth.clone())?;
            identify["authentication"] = json!(obs_auth_response(
                &self.password,
                &challenge.salt,
                &challenge.challenge
            ));
        }
        send_envelope(&mut ws, 1, identify).await?;
        let identified = next_envelope(&mut ws).await?;
        if identified.op != 2 {
            bail!("OBS rejected identification (op {})", identified.op);
        }

        // StartReplayBuffer fails when the buffer is already running; that is fine.
        if let Err(err) = request(&mut ws, "StartReplayBuffer").await {
            debug!("StartReplayBuffer: {:#}", err);
        }
        request(&mut ws, "SaveReplayBuffer").await?;
        info!("OBS SaveReplayBuffer accepted");

        let _ = ws.close(None).await;
        Ok(())
    }
}

#[async_trait]
impl ReplayControl for ObsReplayControl {
    async fn save_replay(&self) -> Result<()> {
        tokio::time::timeout(OBS_TIMEOUT, self.save())
            .await
            .map_err(|_| anyhow!("timed out talking to OBS"))?
    }
}

type ObsSocket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_envelope(ws: &mut ObsSocket) -> Result<ObsEnvelope> {
    while let Some(msg) = ws.next().await {
        match msg? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(frame) => bail!("OBS closed the connection: {:?}", frame),
            _ => continue,
        }
    }
    bail!("OBS connection ended")
}

async fn send_envelope(ws: &mut ObsSocket, op: u8, d: Value) -> Result<()> {
    let text = json!({"op": op, "d": d}).to_string();
    ws.send(Message::Text(text)).await?;
    Ok(())
}

async fn request(ws: &mut ObsSocket, request_type: &str) -> Result<()> {
    let request_id = uuid::Uuid::new_v4().to_string();
    send_envelope(
        ws,
        6,
        json!({"requestType": request_type, "requestId": request_id}),
    )
    .await?;

    loop {
        let envelope = next_envelope(ws).await?;
        if envelope.op != 7 || envelope.d["requestId"] != request_id.as_str() {
            continue;
        }
        let status = &envelope.d["requestStatus"];
        if status["result"].as_bool() == Some(true) {
            return Ok(());
        }
        bail!(
            "{} failed with code {}: {}",
            request_type,
            status["code"],
            status["comment"].as_str().unwrap_or("no comment")
        );
    }
}

/// `base64(sha256(base64(sha256(password + salt)) + challenge))`
pub fn obs_auth_response(password: &str, salt: &str, challenge: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    let secret = engine.encode(Sha256::digest(format!("{}{}", password, salt)));
    engine.encode(Sha256::digest(format!("{}{}", secret, challenge)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(dir: &Path, name: &str, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        let file = File::create(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[tokio::test]
    async fn picks_the_most_recently_modified_media_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "old.mkv", 300);
        let newest = touch(dir.path(), "Replay 2026-03-01.MP4", 10);
        touch(dir.path(), "middle.mov", 60);
        touch(dir.path(), "notes.txt", 0);

        let found = newest_matching(dir.path(), &MEDIA_EXTENSIONS).await.unwrap();
        assert_eq!(found, Some(newest));
    }

    #[tokio::test]
    async fn empty_or_missing_directories_have_no_match() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "thumbnail.png", 0);
        assert_eq!(
            newest_matching(dir.path(), &MEDIA_EXTENSIONS).await.unwrap(),
            None
        );
        assert_eq!(
            newest_matching(&dir.path().join("gone"), &MEDIA_EXTENSIONS)
                .await
                .unwrap(),
            None
        );
    }

    #[test]
    fn computes_obs_auth_response() {
        let response = obs_auth_response(
            "supersecret",
            "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=",
            "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=",
        );
        assert_eq!(response, "sQBlPUYd9mki/3XVFBp4Pt08FCMWdMVIqnFWdEitUME=");
    }
}
