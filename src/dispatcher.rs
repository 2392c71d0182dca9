//! Chat command parsing, authorization and run scheduling.
//!
//! `dispatch` only parses and authorizes; everything slow (the pipeline run,
//! chat replies) happens on tracked tasks so the poll loop keeps moving.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::chat::{ChatAuthor, ChatMessage, ChatSession, ChatTransport};
use crate::config::{Config, DEFAULT_CLIP_SECONDS};
use crate::pipeline::{ClipRequest, ClipRunner, PipelineResult};
use crate::runs::RunRegistry;

/// How many recent message ids are remembered for duplicate suppression.
const RECENT_MESSAGE_IDS: usize = 1000;

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub trigger_prefix: String,
    pub default_seconds: Option<u32>,
    pub max_seconds: u32,
    pub allow_list: Vec<String>,
    pub short_form: bool,
    /// 0 means unlimited.
    pub max_concurrent_runs: usize,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trigger_prefix: config.trigger_prefix.clone(),
            default_seconds: config.clip_seconds,
            max_seconds: config.max_clip_seconds,
            allow_list: config.allow_list(),
            short_form: config.shorts_format,
            max_concurrent_runs: config.max_concurrent_runs,
        }
    }
}

/// A recognized clip command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipCommand {
    pub seconds: u32,
    /// Free text after the trigger token, if any.
    pub seed: Option<String>,
}

/// Parses `text` as a clip command.
///
/// The duration is the run of digits right after the prefix (`!shorts45`,
/// `!shorts 45`); when missing or zero, `default_seconds` and then
/// [`DEFAULT_CLIP_SECONDS`] apply. Durations are clamped to `max_seconds`.
pub fn parse_command(
    text: &str,
    prefix: &str,
    default_seconds: Option<u32>,
    max_seconds: u32,
) -> Option<ClipCommand> {
    let rest = text.trim_start().strip_prefix(prefix)?;
    let rest = rest.trim_start();
    let digits_end = rest
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map_or(rest.len(), |(i, _)| i);
    let (digits, tail) = rest.split_at(digits_end);

    let requested = digits.parse::<u32>().ok().filter(|s| *s > 0);
    let seconds = requested
        .or(default_seconds.filter(|s| *s > 0))
        .unwrap_or(DEFAULT_CLIP_SECONDS);
    let seconds = if max_seconds > 0 {
        seconds.min(max_seconds)
    } else {
        seconds
    };

    let seed = tail.trim();
    Some(ClipCommand {
        seconds,
        seed: (!seed.is_empty()).then(|| seed.to_string()),
    })
}

/// Owner and moderators always; otherwise the allow-list by display name
/// (case-insensitive) or exact channel id.
pub fn is_authorized(author: &ChatAuthor, allow_list: &[String]) -> bool {
    if author.is_owner || author.is_moderator {
        return true;
    }
    allow_list.iter().any(|allowed| {
        allowed.eq_ignore_ascii_case(&author.display_name) || *allowed == author.channel_id
    })
}

pub fn denial_message(author: &ChatAuthor) -> String {
    format!(
        "❌ {}, you are not authorized to use this command.",
        author.display_name
    )
}

/// Chat reply for a finished run.
pub fn result_message(result: &PipelineResult) -> String {
    match (&result.outcome, &result.ai_title) {
        (Ok(video), Some(title)) => format!("🎬 {} - {}", title, video.url),
        (Ok(video), None) => format!("🎬 {}", video.url),
        (Err(err), _) => format!("❌ Failed to create clip: {}", err.summary()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Not a command.
    Ignored,
    /// Already seen this message id.
    Duplicate,
    Denied,
    Scheduled(Uuid),
}

#[derive(Default)]
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl RecentIds {
    /// Records `id`; false when it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > RECENT_MESSAGE_IDS {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

pub struct CommandDispatcher {
    settings: DispatcherSettings,
    runner: Arc<dyn ClipRunner>,
    chat: Arc<dyn ChatTransport>,
    registry: Arc<RunRegistry>,
    limiter: Option<Arc<Semaphore>>,
    tasks: Mutex<JoinSet<()>>,
    recent: Mutex<RecentIds>,
}

impl CommandDispatcher {
    pub fn new(
        settings: DispatcherSettings,
        runner: Arc<dyn ClipRunner>,
        chat: Arc<dyn ChatTransport>,
        registry: Arc<RunRegistry>,
    ) -> Self {
        let limiter = (settings.max_concurrent_runs > 0)
            .then(|| Arc::new(Semaphore::new(settings.max_concurrent_runs)));
        Self {
            settings,
            runner,
            chat,
            registry,
            limiter,
            tasks: Mutex::new(JoinSet::new()),
            recent: Mutex::new(RecentIds::default()),
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Handles one chat message. Returns as soon as any follow-up work is scheduled.
    pub fn dispatch(&self, message: &ChatMessage, session: &ChatSession) -> DispatchOutcome {
        let Some(command) = parse_command(
            &message.text,
            &self.settings.trigger_prefix,
            self.settings.default_seconds,
            self.settings.max_seconds,
        ) else {
            return DispatchOutcome::Ignored;
        };

        if !self.lock_recent().insert(&message.id) {
            debug!("Ignoring redelivered message {}", message.id);
            return DispatchOutcome::Duplicate;
        }

        let author = &message.author;
        if !is_authorized(author, &self.settings.allow_list) {
            info!("🚫 {} is not allowed to clip", author.display_name);
            self.post_later(session, denial_message(author));
            return DispatchOutcome::Denied;
        }

        let context = command
            .seed
            .clone()
            .unwrap_or_else(|| format!("{} - Clip by {}", session.stream_title, author.display_name));
        let request = ClipRequest {
            id: Uuid::new_v4(),
            seconds: command.seconds,
            context,
            requester: author.clone(),
            short_form: self.settings.short_form,
            requested_at: Utc::now(),
        };
        info!(
            "🚀 {} requested a {}s clip (run {})",
            author.display_name, request.seconds, request.id
        );
        let id = request.id;
        self.schedule(request, session.clone());
        DispatchOutcome::Scheduled(id)
    }

    fn schedule(&self, request: ClipRequest, session: ChatSession) {
        self.registry.enqueue(&request);
        let runner = self.runner.clone();
        let chat = self.chat.clone();
        let registry = self.registry.clone();
        let limiter = self.limiter.clone();

        self.spawn(async move {
            // Held for the whole run; queued runs wait here instead of being dropped.
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };
            registry.mark_running(request.id);
            let result = runner.run(&request, &*registry).await;
            registry.finish(&result);

            let reply = result_message(&result);
            if let Err(err) = chat.post_message(&session, &reply).await {
                warn!("[run {}] could not post result to chat: {}", request.id, err);
            }
        });
    }

    fn post_later(&self, session: &ChatSession, text: String) {
        let chat = self.chat.clone();
        let session = session.clone();
        self.spawn(async move {
            if let Err(err) = chat.post_message(&session, &text).await {
                warn!("Could not post to chat: {}", err);
            }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    /// Tasks scheduled and not yet finished.
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.lock_tasks();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    /// Waits for every scheduled task. Runs are never cancelled.
    pub async fn drain(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.lock_tasks());
            if pending.is_empty() {
                return;
            }
            info!("Waiting for {} in-flight task(s)", pending.len());
            while let Some(joined) = pending.join_next().await {
                if let Err(err) = joined {
                    warn!("Dispatcher task ended abnormally: {}", err);
                }
            }
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_recent(&self) -> std::sync::MutexGuard<'_, RecentIds> {
        self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
