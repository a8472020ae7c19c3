//! Conversation session engine.
//!
//! One spawned task owns the [`MessageStore`] and [`SyncCursor`] for a
//! conversation and keeps them fresh: a full history load when the
//! session activates, then a cursor-bounded poll on a fixed cadence.
//! Observers receive immutable [`ChatSnapshot`]s over a watch channel;
//! commands (refresh, stop) arrive over an mpsc channel and always win
//! against an in-flight fetch.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};
use url::Url;

use crate::api::{ApiError, ChatBackend, MessageBatch};
use crate::model::{Conversation, ConversationId, Message, Role};
use crate::sync::{MessageStore, SyncCursor};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Immutable view of the conversation as the engine currently knows it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    /// True while the initial (or refresh) full load is in flight.
    pub loading: bool,
    /// Last sync failure, cleared by the next successful fetch.
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("chat session is no longer running")]
    Stopped,
    #[error("unrecognized conversation target '{target}'")]
    InvalidTarget { target: String },
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug)]
enum Command {
    Refresh,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Loading,
    WaitingInterval,
    Polling,
    Stopped,
}

impl LoopState {
    fn label(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Loading => "loading",
            LoopState::WaitingInterval => "waiting",
            LoopState::Polling => "polling",
            LoopState::Stopped => "stopped",
        }
    }
}

/// Handle to a running session engine. Dropping every handle closes the
/// command channel, which the engine treats as a stop request.
pub struct ChatSession {
    conversation: ConversationId,
    backend: Arc<dyn ChatBackend>,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<ChatSnapshot>,
    task: JoinHandle<()>,
}

impl ChatSession {
    pub fn spawn(
        backend: Arc<dyn ChatBackend>,
        conversation: ConversationId,
        config: SessionConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ChatSnapshot::default());
        let engine = PollLoop {
            backend: Arc::clone(&backend),
            conversation: conversation.clone(),
            poll_interval: config.poll_interval,
            commands: command_rx,
            snapshots: snapshot_tx,
            store: MessageStore::new(),
            cursor: SyncCursor::new(),
            loading: false,
            error: None,
        };
        let task = tokio::spawn(engine.run());
        Self {
            conversation,
            backend,
            commands: command_tx,
            snapshots: snapshot_rx,
            task,
        }
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChatSnapshot> {
        self.snapshots.clone()
    }

    /// Ask the engine to drop its cursor and reload the full history.
    /// Supersedes any fetch currently in flight.
    pub fn refresh(&self) -> Result<(), SessionError> {
        self.commands
            .send(Command::Refresh)
            .map_err(|_| SessionError::Stopped)
    }

    /// Submit one utterance and schedule a refresh so the stored
    /// transcript (with the translation) appears without waiting out the
    /// poll interval. Empty or whitespace-only text is rejected before
    /// any network traffic.
    pub async fn send(&self, role: Role, text: &str) -> Result<Message, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Api(ApiError::EmptyMessage));
        }
        let message = self.backend.send_message(&self.conversation, role, text).await?;
        // The message went through even if the engine stopped meanwhile.
        let _ = self.refresh();
        Ok(message)
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stop the engine and wait for its task to wind down.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Stop);
        let _ = self.task.await;
    }
}

struct PollLoop {
    backend: Arc<dyn ChatBackend>,
    conversation: ConversationId,
    poll_interval: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshots: watch::Sender<ChatSnapshot>,
    store: MessageStore,
    cursor: SyncCursor,
    loading: bool,
    error: Option<String>,
}

impl PollLoop {
    async fn run(mut self) {
        debug!(
            target = "session::poll",
            conversation = %self.conversation,
            interval_ms = self.poll_interval.as_millis() as u64,
            "session engine started"
        );
        let mut ticker = time::interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        // Ticks that elapse while a fetch or refresh is still being
        // processed are skipped, not made up later.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut state = LoopState::Idle;
        loop {
            let next = match state {
                LoopState::Idle => LoopState::Loading,
                LoopState::Loading => self.full_load().await,
                LoopState::WaitingInterval => self.wait_for_tick(&mut ticker).await,
                LoopState::Polling => self.poll_once().await,
                LoopState::Stopped => break,
            };
            if next != state {
                debug!(
                    target = "session::poll",
                    conversation = %self.conversation,
                    from = state.label(),
                    to = next.label(),
                    "state change"
                );
            }
            state = next;
        }
        debug!(
            target = "session::poll",
            conversation = %self.conversation,
            "session engine stopped"
        );
    }

    /// Full history load: replaces the store and re-seats the cursor. A
    /// refresh command restarts the load; stop abandons it.
    async fn full_load(&mut self) -> LoopState {
        self.set_loading(true);
        let next = tokio::select! {
            result = self.backend.fetch_messages(&self.conversation, None) => {
                match result {
                    Ok(batch) => {
                        self.store.replace_all(batch.messages);
                        self.cursor.advance(batch.last_message_id);
                        self.error = None;
                        debug!(
                            target = "session::sync",
                            conversation = %self.conversation,
                            messages = self.store.len(),
                            cursor = ?self.cursor.last_seen(),
                            "history loaded"
                        );
                    }
                    Err(err) => {
                        warn!(
                            target = "session::sync",
                            conversation = %self.conversation,
                            error = %err,
                            "history load failed"
                        );
                        self.error = Some(err.to_string());
                    }
                }
                LoopState::WaitingInterval
            }
            command = self.commands.recv() => self.handle_command(command),
        };
        if next != LoopState::Loading {
            self.set_loading(false);
        }
        next
    }

    async fn wait_for_tick(&mut self, ticker: &mut time::Interval) -> LoopState {
        tokio::select! {
            _ = ticker.tick() => LoopState::Polling,
            command = self.commands.recv() => self.handle_command(command),
        }
    }

    /// Cursor-bounded incremental fetch. Failures are recorded for the
    /// snapshot and retried on the next tick; the loop never stops over
    /// a transport error.
    async fn poll_once(&mut self) -> LoopState {
        tokio::select! {
            result = self.backend.fetch_messages(&self.conversation, self.cursor.last_seen()) => {
                match result {
                    Ok(batch) => self.apply_batch(batch),
                    Err(err) => {
                        warn!(
                            target = "session::sync",
                            conversation = %self.conversation,
                            cursor = ?self.cursor.last_seen(),
                            error = %err,
                            "poll failed"
                        );
                        self.error = Some(err.to_string());
                        self.publish();
                    }
                }
                LoopState::WaitingInterval
            }
            command = self.commands.recv() => self.handle_command(command),
        }
    }

    /// Commands win over whatever was racing them; the abandoned fetch
    /// future is dropped and its result never applied.
    fn handle_command(&mut self, command: Option<Command>) -> LoopState {
        match command {
            Some(Command::Refresh) => {
                debug!(
                    target = "session::poll",
                    conversation = %self.conversation,
                    "manual refresh"
                );
                self.cursor.reset();
                LoopState::Loading
            }
            // A closed channel means every handle is gone.
            Some(Command::Stop) | None => LoopState::Stopped,
        }
    }

    fn apply_batch(&mut self, batch: MessageBatch) {
        if !batch.messages.is_empty() {
            let appended = self.store.append_new(batch.messages);
            if appended > 0 {
                debug!(
                    target = "session::sync",
                    conversation = %self.conversation,
                    appended,
                    total = self.store.len(),
                    "new messages"
                );
            }
        }
        self.cursor.advance(batch.last_message_id);
        self.error = None;
        self.publish();
    }

    fn set_loading(&mut self, loading: bool) {
        if self.loading != loading {
            self.loading = loading;
            self.publish();
        }
    }

    fn publish(&self) {
        let next = ChatSnapshot {
            messages: self.store.snapshot(),
            loading: self.loading,
            error: self.error.clone(),
        };
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

/// Parse a share target: either a bare conversation id or any URL
/// carrying a `conversation` query parameter.
pub fn parse_share_target(target: &str) -> Option<ConversationId> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(trimmed) {
        return url
            .query_pairs()
            .find(|(key, _)| key == "conversation")
            .map(|(_, value)| ConversationId::from(value.into_owned()))
            .filter(|id| !id.as_str().is_empty());
    }
    if trimmed.contains('/') || trimmed.contains('?') {
        return None;
    }
    Some(ConversationId::from(trimmed))
}

/// Link a participant can hand to the other side to land in the same
/// conversation.
pub fn share_url(base: &Url, conversation: &ConversationId) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .append_pair("conversation", conversation.as_str());
    url
}

/// Resolve a share target against the backend, confirming the
/// conversation exists before an engine starts polling it. A missing
/// conversation surfaces as [`ApiError::NotFound`] so callers can fall
/// back to starting a fresh one.
pub async fn resolve_share_target(
    backend: &dyn ChatBackend,
    target: &str,
) -> Result<Conversation, SessionError> {
    let id = parse_share_target(target).ok_or_else(|| SessionError::InvalidTarget {
        target: target.to_string(),
    })?;
    Ok(backend.fetch_conversation(&id).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConversationSummary, HealthStatus, SearchResponse};
    use crate::model::{Language, MessageId, User};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn msg(id: &str) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: ConversationId::from("c1"),
            role: Role::Patient,
            original_text: format!("text {id}"),
            translated_text: format!("texto {id}"),
            source_language: Some("en".into()),
            target_language: Some("es".into()),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        }
    }

    fn batch(ids: &[&str], last: Option<&str>) -> MessageBatch {
        MessageBatch {
            messages: ids.iter().map(|id| msg(id)).collect(),
            last_message_id: last.map(MessageId::from),
        }
    }

    fn http_error(status: u16) -> ApiError {
        ApiError::Http {
            status: StatusCode::from_u16(status).unwrap(),
            detail: "scripted failure".into(),
        }
    }

    /// One scripted reply per fetch, consumed in order. A gate delays
    /// the reply until the test releases (or drops) its sender. When the
    /// script runs out the conversation goes quiet: empty batches.
    struct ScriptedFetch {
        gate: Option<oneshot::Receiver<()>>,
        result: Result<MessageBatch, ApiError>,
    }

    #[derive(Default)]
    struct ScriptedBackend {
        script: Mutex<VecDeque<ScriptedFetch>>,
        fetches: Mutex<Vec<Option<MessageId>>>,
        sends: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn reply(&self, result: Result<MessageBatch, ApiError>) {
            self.script
                .lock()
                .unwrap()
                .push_back(ScriptedFetch { gate: None, result });
        }

        fn gated_reply(&self, result: Result<MessageBatch, ApiError>) -> oneshot::Sender<()> {
            let (release, gate) = oneshot::channel();
            self.script.lock().unwrap().push_back(ScriptedFetch {
                gate: Some(gate),
                result,
            });
            release
        }

        fn fetches(&self) -> Vec<Option<MessageId>> {
            self.fetches.lock().unwrap().clone()
        }

        fn fetch_count(&self) -> usize {
            self.fetches.lock().unwrap().len()
        }

        fn sends(&self) -> Vec<String> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn fetch_messages(
            &self,
            _conversation: &ConversationId,
            after: Option<&MessageId>,
        ) -> Result<MessageBatch, ApiError> {
            self.fetches.lock().unwrap().push(after.cloned());
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(fetch) => {
                    if let Some(gate) = fetch.gate {
                        // A dropped sender also releases the gate.
                        let _ = gate.await;
                    }
                    fetch.result
                }
                None => Ok(MessageBatch::default()),
            }
        }

        async fn send_message(
            &self,
            conversation: &ConversationId,
            role: Role,
            text: &str,
        ) -> Result<Message, ApiError> {
            self.sends.lock().unwrap().push(text.to_string());
            Ok(Message {
                id: MessageId::from("sent"),
                conversation_id: conversation.clone(),
                role,
                original_text: text.to_string(),
                translated_text: format!("[es] {text}"),
                source_language: Some("en".into()),
                target_language: Some("es".into()),
                created_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            })
        }

        async fn fetch_conversation(&self, id: &ConversationId) -> Result<Conversation, ApiError> {
            if id.as_str() == "known" {
                Ok(Conversation {
                    id: id.clone(),
                    doctor_language: "en".into(),
                    patient_language: "es".into(),
                    summary: None,
                    created_at: None,
                })
            } else {
                Err(ApiError::NotFound(id.clone()))
            }
        }

        async fn create_conversation(
            &self,
            _doctor_language: &str,
            _patient_language: &str,
        ) -> Result<Conversation, ApiError> {
            unimplemented!("not scripted")
        }

        async fn list_languages(&self) -> Result<Vec<Language>, ApiError> {
            unimplemented!("not scripted")
        }

        async fn search_messages(
            &self,
            _query: &str,
            _conversation: Option<&ConversationId>,
        ) -> Result<SearchResponse, ApiError> {
            unimplemented!("not scripted")
        }

        async fn summarize(
            &self,
            _conversation: &ConversationId,
        ) -> Result<ConversationSummary, ApiError> {
            unimplemented!("not scripted")
        }

        async fn list_users(&self, _role: Option<Role>) -> Result<Vec<User>, ApiError> {
            unimplemented!("not scripted")
        }

        async fn create_user(
            &self,
            _name: &str,
            _role: Role,
            _language: &str,
        ) -> Result<User, ApiError> {
            unimplemented!("not scripted")
        }

        async fn health(&self) -> Result<HealthStatus, ApiError> {
            unimplemented!("not scripted")
        }
    }

    fn fast_session(backend: Arc<ScriptedBackend>) -> ChatSession {
        ChatSession::spawn(
            backend,
            ConversationId::from("c1"),
            SessionConfig {
                poll_interval: Duration::from_millis(5),
            },
        )
    }

    async fn wait_for(
        rx: &mut watch::Receiver<ChatSnapshot>,
        predicate: impl Fn(&ChatSnapshot) -> bool,
    ) -> ChatSnapshot {
        timeout(Duration::from_secs(5), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if predicate(&snapshot) {
                        return snapshot.clone();
                    }
                }
                rx.changed().await.expect("engine task ended unexpectedly");
            }
        })
        .await
        .expect("snapshot condition not reached in time")
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn id_list(snapshot: &ChatSnapshot) -> Vec<&str> {
        snapshot.messages.iter().map(|m| m.id.as_str()).collect()
    }

    #[tokio::test]
    async fn initial_load_then_cursor_bounded_polls() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1", "2"], Some("2"))));
        backend.reply(Ok(batch(&["3"], Some("3"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 3).await;
        assert_eq!(id_list(&snapshot), ["1", "2", "3"]);
        assert!(snapshot.error.is_none());

        wait_until(|| backend.fetch_count() >= 3).await;
        let fetches = backend.fetches();
        assert_eq!(fetches[0], None);
        assert_eq!(fetches[1], Some(MessageId::from("2")));
        assert_eq!(fetches[2], Some(MessageId::from("3")));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn empty_poll_keeps_cursor_position() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1"], Some("1"))));
        // Empty batches arrive in both server flavors: cursor echoed back,
        // and cursor omitted. Neither may move or clear the position.
        backend.reply(Ok(batch(&[], Some("1"))));
        backend.reply(Ok(batch(&[], None)));
        backend.reply(Ok(batch(&["2"], Some("2"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 2).await;
        assert_eq!(id_list(&snapshot), ["1", "2"]);

        let fetches = backend.fetches();
        assert_eq!(fetches[0], None);
        assert_eq!(fetches[1], Some(MessageId::from("1")));
        assert_eq!(fetches[2], Some(MessageId::from("1")));
        assert_eq!(fetches[3], Some(MessageId::from("1")));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn poll_failure_is_survivable_noise() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1"], Some("1"))));
        backend.reply(Err(http_error(500)));
        backend.reply(Ok(batch(&["2"], Some("2"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        let snapshot = wait_for(&mut rx, |s| s.error.is_some()).await;
        // The failed poll left the transcript untouched.
        assert_eq!(id_list(&snapshot), ["1"]);

        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 2).await;
        assert_eq!(id_list(&snapshot), ["1", "2"]);
        assert!(snapshot.error.is_none(), "success clears the error");

        let fetches = backend.fetches();
        // No cursor movement on failure: the retry repeats "after 1".
        assert_eq!(fetches[1], Some(MessageId::from("1")));
        assert_eq!(fetches[2], Some(MessageId::from("1")));

        session.shutdown().await;
    }

    #[tokio::test]
    async fn failed_initial_load_recovers_on_next_poll() {
        let backend = ScriptedBackend::new();
        backend.reply(Err(http_error(503)));
        backend.reply(Ok(batch(&["1", "2"], Some("2"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        let snapshot = wait_for(&mut rx, |s| s.error.is_some() && !s.loading).await;
        assert!(snapshot.messages.is_empty());

        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 2).await;
        assert_eq!(id_list(&snapshot), ["1", "2"]);
        assert!(snapshot.error.is_none());

        // Cursor never advanced, so the recovery poll asked for the full
        // history again.
        let fetches = backend.fetches();
        assert_eq!(fetches[0], None);
        assert_eq!(fetches[1], None);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_supersedes_in_flight_poll() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1"], Some("1"))));
        // This poll will hang until the gate is released; the refresh
        // must drop it and its result must never be applied.
        let _gate = backend.gated_reply(Ok(batch(&["99"], Some("99"))));
        backend.reply(Ok(batch(&["1", "2"], Some("2"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        wait_for(&mut rx, |s| s.messages.len() == 1).await;
        wait_until(|| backend.fetch_count() == 2).await;

        session.refresh().unwrap();
        let snapshot = wait_for(&mut rx, |s| s.messages.len() == 2 && !s.loading).await;
        assert_eq!(id_list(&snapshot), ["1", "2"]);

        let fetches = backend.fetches();
        assert_eq!(fetches[0], None);
        assert_eq!(fetches[1], Some(MessageId::from("1")));
        // The refresh restarted from a reset cursor.
        assert_eq!(fetches[2], None);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn failed_refresh_keeps_transcript_and_reset_cursor() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1"], Some("1"))));
        // In-flight poll the refresh will drop.
        let _gate = backend.gated_reply(Ok(batch(&[], None)));
        backend.reply(Err(http_error(500)));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        wait_for(&mut rx, |s| s.messages.len() == 1).await;
        wait_until(|| backend.fetch_count() == 2).await;

        session.refresh().unwrap();
        let snapshot = wait_for(&mut rx, |s| s.error.is_some() && !s.loading).await;
        // Failed reload leaves the old transcript in place.
        assert_eq!(id_list(&snapshot), ["1"]);

        // Cursor stays reset after the failure, so the following poll
        // asks for the full history.
        wait_until(|| backend.fetch_count() >= 4).await;
        let fetches = backend.fetches();
        assert_eq!(fetches[2], None);
        assert_eq!(fetches[3], None);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn send_trims_text_and_schedules_refresh() {
        let backend = ScriptedBackend::new();
        backend.reply(Ok(batch(&["1"], Some("1"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();
        // Once the initial load lands, steady polls carry the cursor, so
        // the only further full loads come from refreshes.
        wait_for(&mut rx, |s| s.messages.len() == 1).await;
        let full_loads = |backend: &ScriptedBackend| {
            backend
                .fetches()
                .iter()
                .filter(|after| after.is_none())
                .count()
        };
        assert_eq!(full_loads(&backend), 1);

        let message = session.send(Role::Doctor, "  does it hurt?  ").await.unwrap();
        assert_eq!(message.original_text, "does it hurt?");
        assert_eq!(backend.sends(), ["does it hurt?"]);

        wait_until(|| full_loads(&backend) > 1).await;

        session.shutdown().await;
    }

    #[tokio::test]
    async fn empty_send_is_rejected_without_network_traffic() {
        let backend = ScriptedBackend::new();
        let session = fast_session(backend.clone());
        assert_eq!(session.conversation(), &ConversationId::from("c1"));

        let err = session.send(Role::Patient, "   ").await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Api(ApiError::EmptyMessage)
        ));
        assert!(backend.sends().is_empty());
        assert!(session.snapshot().messages.is_empty());

        session.shutdown().await;
    }

    #[tokio::test]
    async fn loading_flag_tracks_initial_load() {
        let backend = ScriptedBackend::new();
        let release = backend.gated_reply(Ok(batch(&["1"], Some("1"))));

        let session = fast_session(backend.clone());
        let mut rx = session.subscribe();

        wait_for(&mut rx, |s| s.loading).await;
        release.send(()).unwrap();
        let snapshot = wait_for(&mut rx, |s| !s.loading).await;
        assert_eq!(id_list(&snapshot), ["1"]);

        session.shutdown().await;
    }

    #[tokio::test]
    async fn stop_wins_against_hung_fetch() {
        let backend = ScriptedBackend::new();
        let _gate = backend.gated_reply(Ok(batch(&["1"], Some("1"))));

        let session = fast_session(backend.clone());
        wait_until(|| backend.fetch_count() == 1).await;

        timeout(Duration::from_secs(1), session.shutdown())
            .await
            .expect("engine did not stop");
    }

    #[tokio::test]
    async fn stopped_session_rejects_refresh() {
        let backend = ScriptedBackend::new();
        let session = fast_session(backend.clone());
        session.stop();
        wait_until(|| session.is_stopped()).await;
        assert!(matches!(session.refresh(), Err(SessionError::Stopped)));
    }

    #[tokio::test]
    async fn resolves_bare_id_and_share_urls() {
        let backend = ScriptedBackend::new();
        let conversation = resolve_share_target(backend.as_ref(), "known").await.unwrap();
        assert_eq!(conversation.id, ConversationId::from("known"));

        let conversation = resolve_share_target(
            backend.as_ref(),
            "https://clinic.example.com/?conversation=known",
        )
        .await
        .unwrap();
        assert_eq!(conversation.id, ConversationId::from("known"));
    }

    #[tokio::test]
    async fn missing_conversation_resolves_to_not_found() {
        let backend = ScriptedBackend::new();
        let err = resolve_share_target(backend.as_ref(), "gone").await.unwrap_err();
        assert!(matches!(err, SessionError::Api(ref api) if api.is_not_found()));
    }

    #[tokio::test]
    async fn unparseable_target_is_invalid() {
        let backend = ScriptedBackend::new();
        let err = resolve_share_target(backend.as_ref(), "https://clinic.example.com/chat")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTarget { .. }));
    }

    #[test]
    fn share_target_parsing() {
        assert_eq!(
            parse_share_target("abc-123"),
            Some(ConversationId::from("abc-123"))
        );
        assert_eq!(
            parse_share_target("https://x.example/?lang=en&conversation=c9"),
            Some(ConversationId::from("c9"))
        );
        assert_eq!(parse_share_target("https://x.example/chat"), None);
        assert_eq!(parse_share_target(""), None);
        assert_eq!(parse_share_target("a/b"), None);
    }

    #[test]
    fn share_url_round_trips_through_parser() {
        let base = Url::parse("http://127.0.0.1:8000/").unwrap();
        let id = ConversationId::from("room-7");
        let url = share_url(&base, &id);
        assert_eq!(parse_share_target(url.as_str()), Some(id));
    }
}
