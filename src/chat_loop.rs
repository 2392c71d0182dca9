//! The chat poll loop.
//!
//! `STOPPED -> INITIALIZING -> LISTENING <-> BACKOFF -> STOPPED`. Each call to
//! [`ChatPollLoop::step`] performs one transition and returns how long to wait
//! before the next one, so tests can drive the machine without sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Notify;

use crate::chat::{ChatError, ChatSession, ChatTransport, DEFAULT_POLL_INTERVAL_MS};
use crate::dispatcher::{CommandDispatcher, DispatchOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Stopped,
    Initializing,
    Listening,
    Backoff,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopTimings {
    /// Wait after a failed session lookup.
    pub init_retry: Duration,
    /// Wait after a failed fetch.
    pub fetch_retry: Duration,
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self {
            init_retry: Duration::from_secs(30),
            fetch_retry: Duration::from_secs(10),
        }
    }
}

/// Snapshot of the loop for the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStatus {
    pub state: LoopState,
    pub init_attempts: u32,
    pub consecutive_init_failures: u32,
    pub fetch_errors: u32,
    pub batches: u64,
    pub messages: u64,
    pub backlog_skipped: u64,
    pub scheduled: u64,
    pub denied: u64,
    pub duplicates: u64,
    pub live_chat_id: Option<String>,
    pub stream_title: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
}

/// Read side of the loop status, cheap to clone into the API server.
#[derive(Clone, Default)]
pub struct LoopMonitor {
    inner: Arc<RwLock<LoopStatus>>,
}

impl LoopMonitor {
    pub fn snapshot(&self) -> LoopStatus {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut LoopStatus)) {
        let mut status = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut status);
    }
}

/// Stops the loop from another task. In-flight runs are not affected.
#[derive(Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

pub struct ChatPollLoop {
    chat: Arc<dyn ChatTransport>,
    dispatcher: Arc<CommandDispatcher>,
    timings: LoopTimings,
    skip_backlog: bool,
    max_init_attempts: Option<u32>,
    session: Option<ChatSession>,
    page_token: Option<String>,
    backlog_pending: bool,
    connected_once: bool,
    monitor: LoopMonitor,
    stop: StopHandle,
}

impl ChatPollLoop {
    pub fn new(
        chat: Arc<dyn ChatTransport>,
        dispatcher: Arc<CommandDispatcher>,
        timings: LoopTimings,
        skip_backlog: bool,
    ) -> Self {
        Self {
            chat,
            dispatcher,
            timings,
            skip_backlog,
            max_init_attempts: None,
            session: None,
            page_token: None,
            backlog_pending: false,
            connected_once: false,
            monitor: LoopMonitor::default(),
            stop: StopHandle::default(),
        }
    }

    /// Gives up (and stops) after this many consecutive failed session lookups.
    pub fn with_max_init_attempts(mut self, attempts: u32) -> Self {
        self.max_init_attempts = Some(attempts);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn monitor(&self) -> LoopMonitor {
        self.monitor.clone()
    }

    #[cfg(test)]
    pub fn page_token(&self) -> Option<&str> {
        self.page_token.as_deref()
    }

    /// Runs until stopped.
    pub async fn run(mut self) {
        info!("💬 Chat poll loop starting");
        while let Some(delay) = self.step().await {
            if delay.is_zero() {
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.wake.notified() => {}
            }
        }
        info!("💬 Chat poll loop stopped");
    }

    /// One transition. `None` once the loop has stopped.
    pub async fn step(&mut self) -> Option<Duration> {
        if self.stop.is_stopped() {
            self.set_state(LoopState::Stopped);
            return None;
        }
        match self.session.clone() {
            None => self.initialize().await,
            Some(session) => Some(self.poll(&session).await),
        }
    }

    async fn initialize(&mut self) -> Option<Duration> {
        self.monitor.update(|s| {
            s.state = LoopState::Initializing;
            s.init_attempts += 1;
        });

        match self.chat.open_session().await {
            Ok(session) => {
                info!(
                    "💬 Listening to chat of '{}' ({})",
                    session.stream_title, session.live_chat_id
                );
                self.monitor.update(|s| {
                    s.state = LoopState::Listening;
                    s.consecutive_init_failures = 0;
                    s.live_chat_id = Some(session.live_chat_id.clone());
                    s.stream_title = Some(session.stream_title.clone());
                });
                self.session = Some(session);
                self.page_token = None;
                // Only the first connect's history counts as backlog.
                self.backlog_pending = self.skip_backlog && !self.connected_once;
                self.connected_once = true;
                Some(Duration::ZERO)
            }
            Err(err) => {
                let mut failures = 0;
                self.monitor.update(|s| {
                    s.state = LoopState::Backoff;
                    s.consecutive_init_failures += 1;
                    failures = s.consecutive_init_failures;
                });
                if self.max_init_attempts.is_some_and(|max| failures >= max) {
                    warn!("Giving up on chat after {} attempts: {}", failures, err);
                    self.stop.stop();
                    self.set_state(LoopState::Stopped);
                    return None;
                }
                warn!(
                    "No chat session yet ({}), retrying in {:?}",
                    err, self.timings.init_retry
                );
                Some(self.timings.init_retry)
            }
        }
    }

    async fn poll(&mut self, session: &ChatSession) -> Duration {
        let batch = match self
            .chat
            .fetch_messages(session, self.page_token.as_deref())
            .await
        {
            Ok(batch) => batch,
            Err(err) => {
                if needs_new_session(&err) {
                    warn!("Chat session lost ({}), re-initializing", err);
                    self.session = None;
                } else {
                    warn!(
                        "Chat fetch failed ({}), retrying in {:?}",
                        err, self.timings.fetch_retry
                    );
                }
                self.monitor.update(|s| {
                    s.state = LoopState::Backoff;
                    s.fetch_errors += 1;
                });
                return self.timings.fetch_retry;
            }
        };

        let count = batch.messages.len() as u64;
        if self.backlog_pending {
            self.backlog_pending = false;
            if count > 0 {
                info!("Skipping {} backlog chat message(s)", count);
            }
            self.monitor.update(|s| s.backlog_skipped += count);
        } else {
            for message in &batch.messages {
                let outcome = self.dispatcher.dispatch(message, session);
                debug!("{} -> {:?}", message.id, outcome);
                self.monitor.update(|s| match outcome {
                    DispatchOutcome::Scheduled(_) => s.scheduled += 1,
                    DispatchOutcome::Denied => s.denied += 1,
                    DispatchOutcome::Duplicate => s.duplicates += 1,
                    DispatchOutcome::Ignored => {}
                });
            }
        }

        // Committed only once the whole batch has been handed off.
        if batch.next_token.is_some() {
            self.page_token = batch.next_token;
        }
        self.monitor.update(|s| {
            s.state = LoopState::Listening;
            s.batches += 1;
            s.messages += count;
            s.last_poll_at = Some(Utc::now());
        });
        let interval = match batch.poll_interval_ms {
            0 => DEFAULT_POLL_INTERVAL_MS,
            ms => ms,
        };
        Duration::from_millis(interval)
    }

    fn set_state(&self, state: LoopState) {
        self.monitor.update(|s| s.state = state);
    }
}

/// Error reasons meaning the chat id will never work again.
const TERMINAL_CHAT_REASONS: [&str; 3] = ["liveChatEnded", "liveChatDisabled", "liveChatNotFound"];

/// The broadcast ended or the chat id went stale. Quota and rate-limit
/// rejections keep the session and token.
fn needs_new_session(err: &ChatError) -> bool {
    match err {
        ChatError::NotLive => true,
        ChatError::Api { .. } => err
            .api_reason()
            .is_some_and(|reason| TERMINAL_CHAT_REASONS.contains(&reason.as_str())),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherSettings;
    use crate::runs::RunRegistry;
    use crate::testing::{author, batch, message, FakeChat, FakeRunner};

    fn timings() -> LoopTimings {
        LoopTimings {
            init_retry: Duration::from_secs(30),
            fetch_retry: Duration::from_secs(10),
        }
    }

    fn setup(skip_backlog: bool) -> (ChatPollLoop, Arc<FakeChat>, Arc<FakeRunner>, Arc<CommandDispatcher>) {
        let chat = Arc::new(FakeChat::default());
        let runner = Arc::new(FakeRunner::default());
        let dispatcher = Arc::new(CommandDispatcher::new(
            DispatcherSettings {
                trigger_prefix: "!shorts".to_string(),
                default_seconds: None,
                max_seconds: 180,
                allow_list: Vec::new(),
                short_form: true,
                max_concurrent_runs: 0,
            },
            runner.clone(),
            chat.clone(),
            Arc::new(RunRegistry::new()),
        ));
        let poll = ChatPollLoop::new(chat.clone(), dispatcher.clone(), timings(), skip_backlog);
        (poll, chat, runner, dispatcher)
    }

    #[tokio::test]
    async fn retries_initialization_until_a_broadcast_is_live() {
        let (mut poll, chat, _runner, _dispatcher) = setup(false);
        chat.push_session(Err(ChatError::NotLive));

        assert_eq!(poll.step().await, Some(Duration::from_secs(30)));
        assert_eq!(poll.monitor().snapshot().state, LoopState::Backoff);

        assert_eq!(poll.step().await, Some(Duration::ZERO));
        let status = poll.monitor().snapshot();
        assert_eq!(status.state, LoopState::Listening);
        assert_eq!(status.init_attempts, 2);
        assert_eq!(status.consecutive_init_failures, 0);
        assert_eq!(status.stream_title.as_deref(), Some("Test stream"));
    }

    #[tokio::test]
    async fn bounded_init_attempts_stop_the_loop() {
        let (poll, chat, _runner, _dispatcher) = setup(false);
        let mut poll = poll.with_max_init_attempts(2);
        chat.push_session(Err(ChatError::NotLive));
        chat.push_session(Err(ChatError::NotLive));

        assert!(poll.step().await.is_some());
        assert_eq!(poll.step().await, None);
        assert!(poll.stop_handle().is_stopped());
        assert_eq!(poll.monitor().snapshot().state, LoopState::Stopped);
    }

    #[tokio::test]
    async fn skips_the_backlog_then_dispatches_new_commands() {
        let (mut poll, chat, runner, dispatcher) = setup(true);
        let moderator = author("mod", false, true);
        chat.push_batch(Ok(batch(
            vec![message("old", moderator.clone(), "!shorts45")],
            "t1",
            2000,
        )));
        chat.push_batch(Ok(batch(
            vec![
                message("new", moderator.clone(), "!shorts15"),
                message("chat", moderator, "nice"),
            ],
            "t2",
            1000,
        )));

        poll.step().await;
        assert_eq!(poll.step().await, Some(Duration::from_millis(2000)));
        assert_eq!(poll.step().await, Some(Duration::from_millis(1000)));
        dispatcher.drain().await;

        assert_eq!(chat.tokens_seen(), vec![None, Some("t1".to_string())]);
        assert_eq!(poll.page_token(), Some("t2"));
        let requests = runner.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].seconds, 15);

        let status = poll.monitor().snapshot();
        assert_eq!(status.backlog_skipped, 1);
        assert_eq!(status.scheduled, 1);
        assert_eq!(status.messages, 3);
    }

    #[tokio::test]
    async fn fetch_errors_back_off_and_reuse_the_last_token() {
        let (mut poll, chat, _runner, _dispatcher) = setup(false);
        chat.push_batch(Ok(batch(Vec::new(), "t1", 5000)));
        chat.push_batch(Err(ChatError::Api {
            status: 500,
            body: "backend error".to_string(),
        }));
        chat.push_batch(Ok(batch(Vec::new(), "t2", 5000)));

        poll.step().await;
        assert_eq!(poll.step().await, Some(Duration::from_millis(5000)));
        assert_eq!(poll.step().await, Some(Duration::from_secs(10)));
        assert_eq!(poll.monitor().snapshot().state, LoopState::Backoff);
        assert_eq!(poll.step().await, Some(Duration::from_millis(5000)));

        assert_eq!(
            chat.tokens_seen(),
            vec![None, Some("t1".to_string()), Some("t1".to_string())]
        );
        let status = poll.monitor().snapshot();
        assert_eq!(status.fetch_errors, 1);
        assert_eq!(status.state, LoopState::Listening);
    }

    #[tokio::test]
    async fn redelivered_commands_after_a_retry_run_once() {
        let (mut poll, chat, runner, dispatcher) = setup(false);
        let cmd = message("m1", author("mod", false, true), "!shorts");
        chat.push_batch(Ok(batch(vec![cmd.clone()], "t1", 0)));
        chat.push_batch(Ok(batch(vec![cmd], "t2", 0)));

        poll.step().await;
        poll.step().await;
        poll.step().await;
        dispatcher.drain().await;

        assert_eq!(runner.requests().len(), 1);
        assert_eq!(poll.monitor().snapshot().duplicates, 1);
    }

    fn api_error(status: u16, reason: &str) -> ChatError {
        ChatError::Api {
            status,
            body: format!(
                r#"{{"error":{{"code":{},"errors":[{{"reason":"{}"}}]}}}}"#,
                status, reason
            ),
        }
    }

    #[tokio::test]
    async fn lost_session_triggers_reinitialization() {
        let (mut poll, chat, _runner, _dispatcher) = setup(false);
        chat.push_batch(Err(api_error(404, "liveChatNotFound")));

        poll.step().await;
        assert_eq!(poll.step().await, Some(Duration::from_secs(10)));
        assert_eq!(poll.step().await, Some(Duration::ZERO));
        assert_eq!(poll.monitor().snapshot().init_attempts, 2);
    }

    #[tokio::test]
    async fn rate_limited_fetch_keeps_the_session_and_its_commands() {
        let (mut poll, chat, runner, dispatcher) = setup(true);
        chat.push_batch(Ok(batch(Vec::new(), "t1", 5000)));
        chat.push_batch(Err(api_error(403, "rateLimitExceeded")));
        chat.push_batch(Err(ChatError::Api {
            status: 403,
            body: "quotaExceeded".to_string(),
        }));
        chat.push_batch(Ok(batch(
            vec![message("m1", author("mod", false, true), "!shorts15")],
            "t2",
            5000,
        )));

        for _ in 0..5 {
            poll.step().await;
        }
        dispatcher.drain().await;

        let t1 = Some("t1".to_string());
        assert_eq!(chat.tokens_seen(), vec![None, t1.clone(), t1.clone(), t1]);
        assert_eq!(poll.monitor().snapshot().init_attempts, 1);
        assert_eq!(runner.requests().len(), 1);
        assert_eq!(runner.requests()[0].seconds, 15);
    }

    #[tokio::test]
    async fn reconnecting_does_not_skip_another_backlog() {
        let (mut poll, chat, runner, dispatcher) = setup(true);
        chat.push_batch(Ok(batch(Vec::new(), "t1", 5000)));
        chat.push_batch(Err(api_error(403, "liveChatEnded")));
        chat.push_batch(Ok(batch(
            vec![message("m1", author("mod", false, true), "!shorts")],
            "t2",
            5000,
        )));

        for _ in 0..5 {
            poll.step().await;
        }
        dispatcher.drain().await;

        assert_eq!(poll.monitor().snapshot().init_attempts, 2);
        assert_eq!(chat.tokens_seen(), vec![None, Some("t1".to_string()), None]);
        assert_eq!(runner.requests().len(), 1);
    }

    #[tokio::test]
    async fn zero_poll_interval_falls_back_to_the_default() {
        let (mut poll, chat, _runner, _dispatcher) = setup(false);
        chat.push_batch(Ok(batch(Vec::new(), "t1", 0)));

        poll.step().await;
        assert_eq!(
            poll.step().await,
            Some(Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
        );
    }

    #[tokio::test]
    async fn stopped_loop_exits_without_polling() {
        let (poll, chat, _runner, _dispatcher) = setup(false);
        let handle = poll.stop_handle();
        let monitor = poll.monitor();
        handle.stop();

        poll.run().await;
        assert!(chat.tokens_seen().is_empty());
        assert_eq!(monitor.snapshot().state, LoopState::Stopped);
    }

    #[tokio::test]
    async fn stop_interrupts_a_long_wait() {
        let (poll, chat, _runner, _dispatcher) = setup(false);
        chat.push_batch(Ok(batch(Vec::new(), "t1", 3_600_000)));
        let handle = poll.stop_handle();
        let task = tokio::spawn(poll.run());

        while chat.tokens_seen().is_empty() {
            tokio::task::yield_now().await;
        }
        handle.stop();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
