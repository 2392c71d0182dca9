mod api;
mod captions;
mod capture;
mod chat;
mod chat_loop;
mod config;
mod dispatcher;
mod google_auth;
mod media;
mod metadata;
mod pipeline;
mod publish;
mod runs;
mod s3_uploader;
mod transcribe;
mod utilities;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use crate::capture::ObsReplayControl;
use crate::chat::YouTubeLiveChat;
use crate::chat_loop::{ChatPollLoop, LoopTimings};
use crate::config::{Command, Config, PublishTarget};
use crate::dispatcher::{CommandDispatcher, DispatcherSettings};
use crate::google_auth::{ConsentFlow, GoogleAuth};
use crate::media::Ffmpeg;
use crate::metadata::MetadataGenerator;
use crate::pipeline::{ClipPipeline, PipelineSettings};
use crate::publish::{Publisher, YouTubePublisher};
use crate::runs::RunRegistry;
use crate::s3_uploader::S3Uploader;
use crate::transcribe::TranscriptionChain;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load());
    env_logger::init();

    if let Some(Command::Auth { bind, redirect_uri }) = &config.command {
        let flow = ConsentFlow::from_credentials(&config.google_credentials, redirect_uri).await?;
        api::run_consent_server(bind.clone(), flow, config.google_token.clone()).await?;
        return Ok(());
    }

    let auth = Arc::new(
        GoogleAuth::from_files(&config.google_credentials, &config.google_token)
            .await
            .context("loading Google OAuth credentials")?,
    );

    let publisher: Arc<dyn Publisher> = match config.publish_target {
        PublishTarget::Youtube => Arc::new(YouTubePublisher::new(auth.clone(), &config.privacy_status)),
        PublishTarget::S3 => Arc::new(
            S3Uploader::new(&config.s3_bucket, config.s3_endpoint.as_deref()).await?,
        ),
    };

    let transcriber = TranscriptionChain::from_config(&config).await;
    if transcriber.is_empty() {
        warn!("No transcription backend configured, clips will use fallback metadata");
    }

    let pipeline = Arc::new(ClipPipeline::new(
        PipelineSettings::from_config(&config),
        Arc::new(ObsReplayControl::new(&config.obs_host, &config.obs_password)),
        Arc::new(Ffmpeg::new(config.ffmpeg_bin.clone())),
        transcriber,
        MetadataGenerator::from_config(&config),
        publisher,
    ));

    let chat = Arc::new(YouTubeLiveChat::new(auth));
    let dispatcher = Arc::new(CommandDispatcher::new(
        DispatcherSettings::from_config(&config),
        pipeline,
        chat.clone(),
        Arc::new(RunRegistry::new()),
    ));

    let mut poll = ChatPollLoop::new(
        chat,
        dispatcher.clone(),
        LoopTimings::default(),
        config.skip_chat_backlog,
    );
    if config.max_init_attempts > 0 {
        poll = poll.with_max_init_attempts(config.max_init_attempts);
    }
    let stop = poll.stop_handle();
    let monitor = poll.monitor();

    let on_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down, in-flight clips will finish first");
            on_signal.stop();
        }
    });

    info!(
        "🎬 Watching chat for '{}', status API on {}",
        config.trigger_prefix, config.api_bind
    );
    let api_server = api::run_api_server(config.api_bind.clone(), dispatcher.clone(), monitor);

    // Run the poll loop and API server concurrently; either ending stops both.
    tokio::select! {
        result = api_server => {
            if let Err(e) = result {
                error!("Status API error: {:?}", e);
            }
            stop.stop();
        }
        _ = poll.run() => {}
    }

    dispatcher.drain().await;
    Ok(())
}
