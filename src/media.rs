use std::ffi::OsString;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use log::debug;

use crate::utilities::{os_args, run_tool};

/// Vertical target for short-form output.
pub const SHORTS_WIDTH: u32 = 1080;
pub const SHORTS_HEIGHT: u32 = 1920;
/// Audio bitrate every reformatted output is re-encoded to.
pub const AUDIO_BITRATE: &str = "128k";

/// `MarginV` for burned captions, in libass script units (SRT scripts are 288 high).
/// Bottom-aligned at a quarter of the height puts the text at the middle of the lower half.
const CAPTION_MARGIN_V: u32 = 72;

/// Trim, crop, caption and audio operations over files.
///
/// Each operation reads `input` and writes a new file at `output`; a non-zero exit is an error.
#[async_trait]
pub trait MediaTool: Send + Sync {
    /// Copies out the final `seconds` of `input`, seeking from the end of the file.
    async fn trim_from_end(&self, input: &Path, output: &Path, seconds: u32) -> Result<()>;

    /// Crops to 9:16 around the frame center and scales to the shorts size.
    async fn crop_vertical(&self, input: &Path, output: &Path) -> Result<()>;

    /// Burns an SRT file into the picture.
    async fn burn_captions(&self, input: &Path, captions: &Path, output: &Path) -> Result<()>;

    /// Extracts 16 kHz mono PCM WAV for speech-to-text.
    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()>;
}

/// [`MediaTool`] backed by the ffmpeg binary.
pub struct Ffmpeg {
    program: String,
}

impl Ffmpeg {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: Vec<OsString>) -> Result<()> {
        debug!("{} {:?}", self.program, args);
        run_tool(&self.program, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl MediaTool for Ffmpeg {
    async fn trim_from_end(&self, input: &Path, output: &Path, seconds: u32) -> Result<()> {
        self.run(trim_args(input, output, seconds)).await
    }

    async fn crop_vertical(&self, input: &Path, output: &Path) -> Result<()> {
        self.run(crop_args(input, output)).await
    }

    async fn burn_captions(&self, input: &Path, captions: &Path, output: &Path) -> Result<()> {
        self.run(burn_args(input, captions, output)).await
    }

    async fn extract_audio(&self, input: &Path, output: &Path) -> Result<()> {
        self.run(audio_args(input, output)).await
    }
}

/// `-sseof` is an input option, so it must precede `-i`.
pub fn trim_args(input: &Path, output: &Path, seconds: u32) -> Vec<OsString> {
    let mut args = os_args(["-y", "-sseof"]);
    args.push(format!("-{}", seconds).into());
    args.push("-i".into());
    args.push(input.into());
    args.extend(os_args(["-t".to_string(), seconds.to_string()]));
    args.extend(os_args(["-c", "copy", "-avoid_negative_ts", "make_zero"]));
    args.push(output.into());
    args
}

pub fn crop_filter() -> String {
    format!(
        "crop=w='min(iw,ih*9/16)':h='min(ih,iw*16/9)',scale={}:{},setsar=1",
        SHORTS_WIDTH, SHORTS_HEIGHT
    )
}

pub fn crop_args(input: &Path, output: &Path) -> Vec<OsString> {
    let mut args = os_args(["-y", "-i"]);
    args.push(input.into());
    args.push("-vf".into());
    args.push(crop_filter().into());
    args.extend(reencode_tail());
    args.push(output.into());
    args
}

pub fn burn_args(input: &Path, captions: &Path, output: &Path) -> Vec<OsString> {
    let mut args = os_args(["-y", "-i"]);
    args.push(input.into());
    args.push("-vf".into());
    args.push(subtitles_filter(captions).into());
    args.extend(reencode_tail());
    args.push(output.into());
    args
}

pub fn audio_args(input: &Path, output: &Path) -> Vec<OsString> {
    let mut args = os_args(["-y", "-i"]);
    args.push(input.into());
    args.extend(os_args([
        "-vn", "-acodec", "pcm_s16le", "-ar", "16000", "-ac", "1",
    ]));
    args.push(output.into());
    args
}

fn reencode_tail() -> Vec<OsString> {
    os_args([
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-crf",
        "23",
        "-c:a",
        "aac",
        "-b:a",
        AUDIO_BITRATE,
        "-movflags",
        "+faststart",
    ])
}

/// The subtitles filter parses its own option syntax, so the path is escaped for it.
pub fn subtitles_filter(captions: &Path) -> String {
    format!(
        "subtitles=filename='{}':force_style='Alignment=2,MarginV={},FontSize=16,Outline=2'",
        escape_filter_path(&captions.to_string_lossy()),
        CAPTION_MARGIN_V
    )
}

fn escape_filter_path(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\\' => escaped.push('/'),
            '\'' => escaped.push_str("'\\''"),
            ':' => escaped.push_str("\\:"),
            _ => escaped.push(c),
        }
    }
    escaped
}
