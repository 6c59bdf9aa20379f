//! One streaming generation for one user turn.
//!
//! A session moves through `Idle -> Starting -> Streaming` and ends in exactly
//! one of `Completed`, `Cancelled` or `Failed`. Starting creates (or reuses)
//! the user/assistant pair and registers a cancellation handle keyed by the
//! user turn id; streaming appends every fragment to the assistant turn and
//! republishes the updated turn. The registry entry is released on every
//! exit path, including the session future being dropped.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::cancellation::{CancellationRegistry, Registration};
use crate::core::conversation::ConversationStore;
use crate::core::error::ChatError;
use crate::core::generation::Generator;
use crate::core::message::{Role, Turn, TurnId};

/// Shared collaborators every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub store: ConversationStore,
    pub registry: CancellationRegistry,
    pub generator: Arc<dyn Generator>,
    /// Receives a copy of the assistant turn after every fragment. Sending
    /// never blocks: slow subscribers lose the oldest snapshots.
    pub updates: Option<broadcast::Sender<Turn>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub user_id: TurnId,
    pub assistant_id: TurnId,
    pub status: SessionStatus,
    /// Number of fragments applied to the assistant turn.
    pub fragments: usize,
}

pub struct StreamingSession {
    ctx: SessionContext,
    state: SessionState,
    user_id: TurnId,
    assistant_id: TurnId,
    registration: Option<Registration>,
    fragments: usize,
}

impl StreamingSession {
    /// Create the user turn and its empty reply, pair them and register a
    /// fresh cancellation handle for the exchange.
    pub fn start(
        ctx: SessionContext,
        prompt: impl Into<String>,
        parent: Option<&CancellationToken>,
    ) -> Result<Self, ChatError> {
        let mut session = Self::idle(ctx);
        session.transition(SessionState::Starting);

        let user = session.ctx.store.append(prompt, Role::User);
        let assistant = session.ctx.store.append("", Role::Assistant);
        session.user_id = user.id;
        session.assistant_id = assistant.id;
        if let Err(err) = session.ctx.store.set_associated_id(user.id, assistant.id) {
            session.transition(SessionState::Failed);
            return Err(err);
        }

        session.register(parent);
        Ok(session)
    }

    /// Regenerate the reply to an existing user turn.
    ///
    /// Any session still streaming for the same turn is cancelled first. The
    /// paired assistant turn is emptied and reused; an unpaired prompt gets a
    /// new assistant turn.
    pub fn restart(
        ctx: SessionContext,
        user_id: TurnId,
        parent: Option<&CancellationToken>,
    ) -> Result<Self, ChatError> {
        let mut session = Self::idle(ctx);
        session.transition(SessionState::Starting);
        session.user_id = user_id;

        let result = session.prepare_restart(parent);
        if let Err(err) = result {
            session.registration = None;
            session.transition(SessionState::Failed);
            return Err(err);
        }
        Ok(session)
    }

    fn prepare_restart(&mut self, parent: Option<&CancellationToken>) -> Result<(), ChatError> {
        let user = self
            .ctx
            .store
            .find_by_id(self.user_id)
            .ok_or(ChatError::TurnNotFound(self.user_id))?;
        if !user.is_user() {
            return Err(ChatError::InvalidState(format!(
                "{} is a {} turn, only user turns can be regenerated",
                user.id, user.role
            )));
        }

        match user.associated_id {
            Some(assistant_id) => {
                self.assistant_id = assistant_id;
                // Register before clearing: a superseded session checks its
                // token under the store lock, so it cannot append after this.
                self.register(parent);
                self.ctx
                    .store
                    .modify(assistant_id, |turn| turn.content.clear())?;
            }
            None => {
                let assistant = self.ctx.store.append("", Role::Assistant);
                self.assistant_id = assistant.id;
                self.ctx.store.set_associated_id(user.id, assistant.id)?;
                self.register(parent);
            }
        }
        Ok(())
    }

    fn idle(ctx: SessionContext) -> Self {
        Self {
            ctx,
            state: SessionState::Idle,
            user_id: TurnId(0),
            assistant_id: TurnId(0),
            registration: None,
            fragments: 0,
        }
    }

    fn register(&mut self, parent: Option<&CancellationToken>) {
        let token = parent.map_or_else(CancellationToken::new, CancellationToken::child_token);
        self.registration = Some(self.ctx.registry.register(self.user_id, token));
    }

    fn transition(&mut self, next: SessionState) {
        debug!(
            turn = %self.user_id,
            from = ?self.state,
            to = ?next,
            "Session state change"
        );
        self.state = next;
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn user_id(&self) -> TurnId {
        self.user_id
    }

    pub fn assistant_id(&self) -> TurnId {
        self.assistant_id
    }

    /// A token that aborts this session when cancelled, equivalent to
    /// `registry.cancel(user_id)` while the session is live.
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.registration
            .as_ref()
            .map(|registration| registration.token().clone())
    }

    /// Stream the reply into the assistant turn until the backend finishes,
    /// the session is cancelled, or something fails.
    ///
    /// A cancelled session is not an error: it returns
    /// [`SessionStatus::Cancelled`] and keeps whatever content arrived.
    pub async fn run(&mut self) -> Result<SessionOutcome, ChatError> {
        let Some(registration) = self.registration.take() else {
            return Err(ChatError::InvalidState(format!(
                "session for {} is {:?}, not ready to stream",
                self.user_id, self.state
            )));
        };
        self.transition(SessionState::Streaming);

        let token = registration.token().clone();
        let result = self.pump(&token).await;
        drop(registration);

        match result {
            Ok(status) => {
                self.transition(match status {
                    SessionStatus::Completed => SessionState::Completed,
                    SessionStatus::Cancelled => SessionState::Cancelled,
                });
                Ok(self.outcome(status))
            }
            Err(_) if token.is_cancelled() => {
                self.transition(SessionState::Cancelled);
                Ok(self.outcome(SessionStatus::Cancelled))
            }
            Err(err) => {
                debug!(turn = %self.user_id, error = %err, "Generation failed");
                self.transition(SessionState::Failed);
                Err(err)
            }
        }
    }

    async fn pump(&mut self, token: &CancellationToken) -> Result<SessionStatus, ChatError> {
        let history = self.ctx.store.history_through(self.user_id)?;
        let generator = Arc::clone(&self.ctx.generator);

        let mut fragments = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(SessionStatus::Cancelled),
            stream = generator.stream(history) => stream?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(SessionStatus::Cancelled),
                next = fragments.next() => next,
            };
            let Some(fragment) = next else {
                return Ok(SessionStatus::Completed);
            };
            let fragment = fragment?;

            let snapshot = self.ctx.store.modify(self.assistant_id, |turn| {
                if token.is_cancelled() {
                    return None;
                }
                turn.content.push_str(&fragment);
                Some(turn.clone())
            })?;
            let Some(turn) = snapshot else {
                return Ok(SessionStatus::Cancelled);
            };

            self.fragments += 1;
            if let Some(updates) = &self.ctx.updates {
                // Err only means nobody is subscribed right now.
                let _ = updates.send(turn);
            }
        }
    }

    fn outcome(&self, status: SessionStatus) -> SessionOutcome {
        SessionOutcome {
            user_id: self.user_id,
            assistant_id: self.assistant_id,
            status,
            fragments: self.fragments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::generation::GenerationError;
    use crate::utils::test_utils::{test_context, ManualGenerator, ScriptedGenerator};

    #[tokio::test]
    async fn completes_and_releases_registry() {
        let generator = Arc::new(ScriptedGenerator::new(["He", "llo", "!"]));
        let ctx = test_context(generator.clone(), None);

        let mut session = StreamingSession::start(ctx.clone(), "Hi", None).expect("start");
        assert_eq!(session.state(), SessionState::Starting);
        assert!(ctx.registry.is_registered(session.user_id()));

        let outcome = session.run().await.expect("run");
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.fragments, 3);
        assert_eq!(session.state(), SessionState::Completed);
        assert!(ctx.registry.is_empty());

        let assistant = ctx.store.find_by_id(outcome.assistant_id).expect("reply");
        assert_eq!(assistant.content, "Hello!");
        assert_eq!(assistant.associated_id, Some(outcome.user_id));

        let requests = generator.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].len(), 1, "empty placeholder is not sent");
        assert_eq!(requests[0][0].content, "Hi");
    }

    #[tokio::test]
    async fn observers_only_see_content_grow() {
        let generator = Arc::new(ScriptedGenerator::new(["a", "bc", "", "def"]));
        let (tx, mut rx) = broadcast::channel(16);
        let ctx = test_context(generator, Some(tx));

        let mut session = StreamingSession::start(ctx, "go", None).expect("start");
        session.run().await.expect("run");

        let mut previous = String::new();
        let mut seen = 0;
        while let Ok(turn) = rx.try_recv() {
            assert!(turn.content.starts_with(&previous));
            assert!(turn.content.len() >= previous.len());
            previous = turn.content;
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(previous, "abcdef");
    }

    #[tokio::test]
    async fn backend_failure_keeps_partial_content() {
        let generator = Arc::new(
            ScriptedGenerator::new(["partial "]).failing_with(GenerationError::Api("overloaded".into())),
        );
        let ctx = test_context(generator, None);

        let mut session = StreamingSession::start(ctx.clone(), "q", None).expect("start");
        let err = session.run().await.expect_err("failure");
        assert!(matches!(err, ChatError::Backend(GenerationError::Api(_))));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(ctx.registry.is_empty());
        assert_eq!(
            ctx.store
                .find_by_id(session.assistant_id())
                .expect("reply")
                .content,
            "partial "
        );
    }

    #[tokio::test]
    async fn cancellation_stops_at_fragment_boundary() {
        let generator = Arc::new(ManualGenerator::new());
        let feed = generator.feed();
        let (tx, mut rx) = broadcast::channel(16);
        let ctx = test_context(generator, Some(tx));

        let mut session = StreamingSession::start(ctx.clone(), "long story", None).expect("start");
        let user_id = session.user_id();
        let assistant_id = session.assistant_id();
        let task = tokio::spawn(async move { session.run().await });

        feed.send(Ok("Once".into())).expect("feed");
        let first = rx.recv().await.expect("first fragment");
        assert_eq!(first.content, "Once");

        assert!(ctx.registry.cancel(user_id));
        let _ = feed.send(Ok(" upon".into()));

        let outcome = task.await.expect("join").expect("cancel is not an error");
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(ctx.store.find_by_id(assistant_id).expect("reply").content, "Once");
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn parent_token_cancels_before_streaming() {
        let generator = Arc::new(ScriptedGenerator::new(["never"]));
        let ctx = test_context(generator, None);
        let parent = CancellationToken::new();

        let mut session = StreamingSession::start(ctx.clone(), "q", Some(&parent)).expect("start");
        parent.cancel();

        let outcome = session.run().await.expect("run");
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.fragments, 0);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn restart_supersedes_live_session() {
        let generator = Arc::new(ManualGenerator::new());
        let old_feed = generator.feed();
        let new_feed = generator.feed();
        let (tx, mut rx) = broadcast::channel(16);
        let ctx = test_context(generator, Some(tx));

        let mut first = StreamingSession::start(ctx.clone(), "q", None).expect("start");
        let user_id = first.user_id();
        let assistant_id = first.assistant_id();
        let old_token = first.cancel_token().expect("token");
        let first_task = tokio::spawn(async move { first.run().await });

        old_feed.send(Ok("stale".into())).expect("feed");
        rx.recv().await.expect("stale fragment");

        let mut second = StreamingSession::restart(ctx.clone(), user_id, None).expect("restart");
        assert!(old_token.is_cancelled());
        assert_eq!(second.assistant_id(), assistant_id);
        assert_eq!(ctx.store.find_by_id(assistant_id).expect("reply").content, "");

        let first_outcome = first_task.await.expect("join").expect("cancelled");
        assert_eq!(first_outcome.status, SessionStatus::Cancelled);
        assert!(ctx.registry.is_registered(user_id));

        new_feed.send(Ok("fresh".into())).expect("feed");
        drop(new_feed);
        let outcome = second.run().await.expect("run");
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(ctx.store.find_by_id(assistant_id).expect("reply").content, "fresh");
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn restart_rejects_non_user_turns() {
        let generator = Arc::new(ScriptedGenerator::new(["x"]));
        let ctx = test_context(generator, None);
        let system = ctx.store.append("rules", Role::System);

        assert!(matches!(
            StreamingSession::restart(ctx.clone(), system.id, None),
            Err(ChatError::InvalidState(_))
        ));
        assert!(matches!(
            StreamingSession::restart(ctx.clone(), TurnId(404), None),
            Err(ChatError::TurnNotFound(_))
        ));
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn restart_pairs_lone_prompt() {
        let generator = Arc::new(ScriptedGenerator::new(["answer"]));
        let ctx = test_context(generator, None);
        let lone = ctx.store.append("file contents", Role::User);

        let mut session = StreamingSession::restart(ctx.clone(), lone.id, None).expect("restart");
        let outcome = session.run().await.expect("run");
        let user = ctx.store.find_by_id(lone.id).expect("user");
        assert_eq!(user.associated_id, Some(outcome.assistant_id));
        assert_eq!(
            ctx.store.find_by_id(outcome.assistant_id).expect("reply").content,
            "answer"
        );
    }

    #[tokio::test]
    async fn slow_subscriber_never_blocks_streaming() {
        let fragments: Vec<String> = (0..100).map(|i| format!("{i},")).collect();
        let generator = Arc::new(ScriptedGenerator::new(fragments.clone()));
        let (tx, mut rx) = broadcast::channel(2);
        let ctx = test_context(generator, Some(tx));

        let mut session = StreamingSession::start(ctx, "count", None).expect("start");
        let outcome = session.run().await.expect("run");
        assert_eq!(outcome.fragments, 100);

        let expected = fragments.concat();
        let mut last = None;
        loop {
            match rx.try_recv() {
                Ok(turn) => last = Some(turn),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert_eq!(last.expect("latest snapshot").content, expected);
    }

    #[tokio::test]
    async fn deleted_reply_fails_the_session() {
        let generator = Arc::new(ManualGenerator::new());
        let feed = generator.feed();
        let ctx = test_context(generator, None);

        let mut session = StreamingSession::start(ctx.clone(), "q", None).expect("start");
        ctx.store.delete(session.assistant_id()).expect("delete");
        feed.send(Ok("orphan".into())).expect("feed");

        let err = session.run().await.expect_err("missing reply");
        assert!(matches!(err, ChatError::TurnNotFound(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let generator = Arc::new(ScriptedGenerator::new(["x"]));
        let ctx = test_context(generator, None);
        let mut session = StreamingSession::start(ctx, "q", None).expect("start");
        session.run().await.expect("first run");
        assert!(matches!(
            session.run().await,
            Err(ChatError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Completed);
    }
}
