use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Hard default used when neither the command nor `CLIP_SECONDS` names a duration.
pub const DEFAULT_CLIP_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CaptureMode {
    /// Ask OBS to flush its replay buffer, then clip the saved file.
    Replay,
    /// Clip the tail of the recording OBS is currently writing.
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TranscriberKind {
    Whisper,
    Elevenlabs,
    Aws,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PublishTarget {
    Youtube,
    S3,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Runs the Google consent flow once and writes the token file.
    Auth {
        /// Where the local callback server listens.
        #[arg(long, env = "AUTH_BIND", default_value = "127.0.0.1:3000")]
        bind: String,

        /// Must match a redirect URI registered for the OAuth client.
        #[arg(
            long,
            env = "REDIRECT_URI",
            default_value = "http://localhost:3000/oauth2callback"
        )]
        redirect_uri: String,
    },
}

/// Process-wide settings, read once at startup.
///
/// Every flag can also be supplied through the environment (or a `.env` file).
#[derive(Debug, Clone, Parser)]
#[command(
    name = "shorts_clipper",
    about = "Turns live chat commands into published shorts",
    subcommand_negates_reqs = true
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Directory OBS writes recordings and replay saves into.
    ///
    /// Required unless a subcommand runs, so always present when clipping.
    #[arg(long, env = "OBS_RECORDING_PATH", required = true)]
    pub recording_dir: Option<PathBuf>,

    /// Default clip length when the command carries no digits.
    #[arg(long, env = "CLIP_SECONDS")]
    pub clip_seconds: Option<u32>,

    /// Requested durations above this are clamped.
    #[arg(long, env = "MAX_CLIP_SECONDS", default_value_t = 180)]
    pub max_clip_seconds: u32,

    /// Chat users (display name or channel id) allowed besides owner and moderators.
    #[arg(long, env = "ALLOWED_USERS", value_delimiter = ',')]
    pub allowed_users: Vec<String>,

    #[arg(long, env = "TRIGGER_PREFIX", default_value = "!shorts")]
    pub trigger_prefix: String,

    #[arg(long, env = "CAPTURE_MODE", value_enum, default_value = "replay")]
    pub capture_mode: CaptureMode,

    /// Time given to OBS to finish writing a replay save.
    #[arg(long, env = "REPLAY_SETTLE_MS", default_value_t = 1500)]
    pub replay_settle_ms: u64,

    #[arg(long, env = "OBS_WEBSOCKET_HOST", default_value = "localhost:4455")]
    pub obs_host: String,

    #[arg(long, env = "OBS_WEBSOCKET_PASSWORD", default_value = "")]
    pub obs_password: String,

    /// Scratch directory for trimmed and reformatted clips.
    #[arg(long, env = "WORK_DIR", default_value = "tmp")]
    pub work_dir: PathBuf,

    /// Keep intermediate files after a run finishes.
    #[arg(long, env = "KEEP_ARTIFACTS", default_value_t = false)]
    pub keep_artifacts: bool,

    /// Crop to vertical and burn captions before publishing.
    #[arg(long, env = "SHORTS_FORMAT", default_value_t = true, action = clap::ArgAction::Set)]
    pub shorts_format: bool,

    /// Transcription backends, tried in order.
    #[arg(long, env = "TRANSCRIBERS", value_enum, value_delimiter = ',', default_value = "whisper,elevenlabs")]
    pub transcribers: Vec<TranscriberKind>,

    #[arg(long, env = "WHISPER_MODEL", default_value = "base")]
    pub whisper_model: String,

    #[arg(long, env = "PYTHON_BIN", default_value = "python3")]
    pub python_bin: String,

    #[arg(long, env = "FFMPEG_BIN", default_value = "ffmpeg")]
    pub ffmpeg_bin: String,

    #[arg(long, env = "ELEVENLABS_API_KEY")]
    pub elevenlabs_api_key: Option<String>,

    #[arg(long, env = "EURI_API_KEY")]
    pub euri_api_key: Option<String>,

    #[arg(long, env = "GEMINI_API_KEY")]
    pub gemini_api_key: Option<String>,

    #[arg(long, env = "PUBLISH_TARGET", value_enum, default_value = "youtube")]
    pub publish_target: PublishTarget,

    #[arg(long, env = "PRIVACY_STATUS", default_value = "public")]
    pub privacy_status: String,

    #[arg(long, env = "S3_BUCKET", default_value = "clips")]
    pub s3_bucket: String,

    /// Endpoint override for S3-compatible stores such as MinIO.
    #[arg(long, env = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "GOOGLE_CREDENTIALS", default_value = "credentials.json")]
    pub google_credentials: PathBuf,

    #[arg(long, env = "GOOGLE_TOKEN", default_value = "token.json")]
    pub google_token: PathBuf,

    /// Pipeline runs allowed at once; 0 means no cap.
    #[arg(long, env = "MAX_CONCURRENT_RUNS", default_value_t = 2)]
    pub max_concurrent_runs: usize,

    /// Ignore the chat history returned by the first fetch after connecting.
    #[arg(long, env = "SKIP_CHAT_BACKLOG", default_value_t = true, action = clap::ArgAction::Set)]
    pub skip_chat_backlog: bool,

    #[arg(long, env = "API_BIND", default_value = "0.0.0.0:8080")]
    pub api_bind: String,

    /// Consecutive failed chat lookups before giving up; 0 retries forever.
    #[arg(long, env = "MAX_INIT_ATTEMPTS", default_value_t = 0)]
    pub max_init_attempts: u32,
}

impl Config {
    /// Loads `.env` (if present) and parses flags and environment.
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Self::parse()
    }

    /// The allow-list with blank entries removed.
    pub fn allow_list(&self) -> Vec<String> {
        self.allowed_users
            .iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect()
    }
}
