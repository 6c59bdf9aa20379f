//! Per-turn cancellation handles for in-flight generations.
//!
//! Entries are keyed by the user turn id of the exchange being generated. At
//! most one entry exists per id: registering again cancels the previous
//! handle before the new one is stored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::message::TurnId;

struct Entry {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<TurnId, Entry>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `token` for `id`, cancelling whatever was registered before.
    ///
    /// The returned [`Registration`] releases the entry when dropped, unless a
    /// later registration for the same id has replaced it in the meantime.
    pub fn register(&self, id: TurnId, token: CancellationToken) -> Registration {
        let mut state = self.lock();
        let generation = state.next_generation;
        state.next_generation += 1;

        if let Some(previous) = state.entries.remove(&id) {
            debug!(turn = %id, superseded = previous.generation, "Superseding live generation");
            previous.token.cancel();
        }
        state.entries.insert(
            id,
            Entry {
                generation,
                token: token.clone(),
            },
        );

        Registration {
            registry: self.clone(),
            id,
            generation,
            token,
        }
    }

    /// Cancel and forget the handle for `id`. Returns whether one was live;
    /// cancelling an unknown id is a no-op.
    pub fn cancel(&self, id: TurnId) -> bool {
        let removed = self.lock().entries.remove(&id);
        match removed {
            Some(entry) => {
                debug!(turn = %id, "Cancelling generation");
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Forget the handle for `id` without cancelling it.
    pub fn release(&self, id: TurnId) -> bool {
        self.lock().entries.remove(&id).is_some()
    }

    /// Cancel every live handle, e.g. on shutdown.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().entries.drain().collect();
        for (_, entry) in &drained {
            entry.token.cancel();
        }
        drained.len()
    }

    pub fn is_registered(&self, id: TurnId) -> bool {
        self.lock().entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn release_generation(&self, id: TurnId, generation: u64) {
        let mut state = self.lock();
        if state
            .entries
            .get(&id)
            .is_some_and(|entry| entry.generation == generation)
        {
            state.entries.remove(&id);
        }
    }
}

/// Proof of a live registry entry, held by the session that owns it.
pub struct Registration {
    registry: CancellationRegistry,
    id: TurnId,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn id(&self) -> TurnId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release_generation(self.id, self.generation);
    }
}
