//! Front door for driving conversations.
//!
//! The engine owns the store, the cancellation registry and the backend, and
//! runs each generation as its own tokio task. Callers get the turn ids back
//! immediately and can watch progress through [`ChatEngine::subscribe`].

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::cancellation::CancellationRegistry;
use crate::core::conversation::ConversationStore;
use crate::core::error::ChatError;
use crate::core::generation::Generator;
use crate::core::message::{Role, Turn, TurnId};
use crate::core::session::{SessionContext, SessionOutcome, StreamingSession};

/// A generation running in the background.
pub struct SpawnedSession {
    pub user_id: TurnId,
    pub assistant_id: TurnId,
    pub handle: JoinHandle<Result<SessionOutcome, ChatError>>,
}

impl SpawnedSession {
    /// Wait for the session to end.
    pub async fn wait(self) -> Result<SessionOutcome, ChatError> {
        self.handle
            .await
            .map_err(|err| ChatError::InvalidState(format!("session task failed: {err}")))?
    }
}

pub struct ChatEngine {
    ctx: SessionContext,
    updates: broadcast::Sender<Turn>,
    shutdown: CancellationToken,
}

impl ChatEngine {
    /// `update_buffer` is how many assistant snapshots a subscriber may fall
    /// behind before it starts losing the oldest ones.
    pub fn new(generator: Arc<dyn Generator>, update_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(update_buffer.max(1));
        Self {
            ctx: SessionContext {
                store: ConversationStore::new(),
                registry: CancellationRegistry::new(),
                generator,
                updates: Some(updates.clone()),
            },
            updates,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.ctx.store
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.ctx.registry
    }

    /// Receive a copy of the assistant turn after every streamed fragment.
    pub fn subscribe(&self) -> broadcast::Receiver<Turn> {
        self.updates.subscribe()
    }

    /// Add a prompt and stream its reply in the background.
    pub fn submit(&self, prompt: impl Into<String>) -> Result<SpawnedSession, ChatError> {
        let session = StreamingSession::start(self.ctx.clone(), prompt, Some(&self.shutdown))?;
        Ok(Self::spawn(session))
    }

    /// Regenerate the reply to `user_id`, superseding any generation still
    /// running for it.
    pub fn retry(&self, user_id: TurnId) -> Result<SpawnedSession, ChatError> {
        let session = StreamingSession::restart(self.ctx.clone(), user_id, Some(&self.shutdown))?;
        Ok(Self::spawn(session))
    }

    fn spawn(mut session: StreamingSession) -> SpawnedSession {
        let user_id = session.user_id();
        let assistant_id = session.assistant_id();
        debug!(user = %user_id, assistant = %assistant_id, "Spawning generation");
        let handle = tokio::spawn(async move { session.run().await });
        SpawnedSession {
            user_id,
            assistant_id,
            handle,
        }
    }

    /// Cancel the generation for `user_id`. Returns false if none was live.
    pub fn cancel(&self, user_id: TurnId) -> bool {
        self.ctx.registry.cancel(user_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.ctx.registry.cancel_all()
    }

    /// Cancel every generation and refuse to stream for sessions started
    /// from now on.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.ctx.registry.cancel_all();
    }

    /// Remove a turn, stopping any generation that is writing into it first.
    pub fn delete(&self, id: TurnId) -> Result<Turn, ChatError> {
        let turn = self
            .ctx
            .store
            .find_by_id(id)
            .ok_or(ChatError::TurnNotFound(id))?;
        let key = match turn.role {
            Role::Assistant => turn.associated_id.unwrap_or(id),
            _ => id,
        };
        if self.ctx.registry.cancel(key) {
            debug!(turn = %id, "Cancelled live generation before delete");
        }
        self.ctx.store.delete(id)
    }

    /// Inject instructions the backend should see before later prompts.
    pub fn add_system(&self, content: impl Into<String>) -> Turn {
        self.ctx.store.append(content, Role::System)
    }

    /// Inject a file's contents as an unpaired user turn. No reply is
    /// generated until the next prompt, which sees it as context.
    pub fn add_file(&self, content: impl Into<String>) -> Turn {
        self.ctx.store.append(content, Role::User)
    }
}
