//! The shared, append-only conversation history.
//!
//! Every accessor goes through one mutex so the streaming task appending
//! fragments and the foreground reading or navigating the history never see
//! a half-applied change. Callers receive copies of turns; the stored values
//! change only through this type.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::api::ChatMessage;
use crate::core::error::{ChatError, Direction};
use crate::core::message::{Role, Turn, TurnId};

/// A unit of navigation: a user prompt with its reply, or a turn that stands
/// alone (system or file-injected content, or an unpaired prompt).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exchange {
    Pair { user: Turn, assistant: Turn },
    Lone(Turn),
}

impl Exchange {
    pub fn min_id(&self) -> TurnId {
        match self {
            Exchange::Pair { user, assistant } => user.id.min(assistant.id),
            Exchange::Lone(turn) => turn.id,
        }
    }

    pub fn max_id(&self) -> TurnId {
        match self {
            Exchange::Pair { user, assistant } => user.id.max(assistant.id),
            Exchange::Lone(turn) => turn.id,
        }
    }

    pub fn contains(&self, id: TurnId) -> bool {
        match self {
            Exchange::Pair { user, assistant } => user.id == id || assistant.id == id,
            Exchange::Lone(turn) => turn.id == id,
        }
    }
}

struct TurnLog {
    turns: Vec<Turn>,
    positions: HashMap<TurnId, usize>,
    next_id: u64,
}

impl TurnLog {
    fn new() -> Self {
        Self {
            turns: Vec::new(),
            positions: HashMap::new(),
            next_id: 1,
        }
    }

    fn get(&self, id: TurnId) -> Option<&Turn> {
        self.positions.get(&id).map(|&pos| &self.turns[pos])
    }

    fn get_mut(&mut self, id: TurnId) -> Option<&mut Turn> {
        match self.positions.get(&id) {
            Some(&pos) => Some(&mut self.turns[pos]),
            None => None,
        }
    }

    fn require(&self, id: TurnId) -> Result<&Turn, ChatError> {
        self.get(id).ok_or(ChatError::TurnNotFound(id))
    }

    fn reindex_from(&mut self, start: usize) {
        for (pos, turn) in self.turns.iter().enumerate().skip(start) {
            self.positions.insert(turn.id, pos);
        }
    }

    fn exchange_at(&self, pos: usize) -> Exchange {
        let turn = &self.turns[pos];
        let partner = turn.associated_id.and_then(|id| self.get(id));
        match (turn.role, partner) {
            (Role::User, Some(partner)) => Exchange::Pair {
                user: turn.clone(),
                assistant: partner.clone(),
            },
            (Role::Assistant, Some(partner)) => Exchange::Pair {
                user: partner.clone(),
                assistant: turn.clone(),
            },
            _ => Exchange::Lone(turn.clone()),
        }
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Mutex<TurnLog>>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TurnLog::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TurnLog> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a new, unpaired turn and return a copy of it.
    pub fn append(&self, content: impl Into<String>, role: Role) -> Turn {
        let mut log = self.lock();
        let id = TurnId(log.next_id);
        log.next_id += 1;
        let turn = Turn::new(id, role, content);
        let pos = log.turns.len();
        log.turns.push(turn.clone());
        log.positions.insert(id, pos);
        turn
    }

    /// Replace the stored turn carrying `turn.id` with `turn`.
    ///
    /// Role and pairing are owned by the store: an update that tries to change
    /// either is rejected, use [`set_associated_id`](Self::set_associated_id)
    /// or [`delete`](Self::delete) instead. The creation timestamp is kept.
    pub fn update(&self, mut turn: Turn) -> Result<(), ChatError> {
        let mut log = self.lock();
        let stored = log.get_mut(turn.id).ok_or(ChatError::TurnNotFound(turn.id))?;
        if stored.role != turn.role || stored.associated_id != turn.associated_id {
            return Err(ChatError::InvalidState(format!(
                "update of {} may only change its content",
                turn.id
            )));
        }
        turn.timestamp = stored.timestamp;
        *stored = turn;
        Ok(())
    }

    /// Run `f` against the stored turn while holding the store lock.
    ///
    /// Only the content is writable; identity, role, pairing and timestamp are
    /// restored after `f` returns.
    pub fn modify<T>(&self, id: TurnId, f: impl FnOnce(&mut Turn) -> T) -> Result<T, ChatError> {
        let mut log = self.lock();
        let stored = log.get_mut(id).ok_or(ChatError::TurnNotFound(id))?;
        let (role, associated_id, timestamp) = (stored.role, stored.associated_id, stored.timestamp);
        let result = f(stored);
        stored.id = id;
        stored.role = role;
        stored.associated_id = associated_id;
        stored.timestamp = timestamp;
        Ok(result)
    }

    pub fn find_by_id(&self, id: TurnId) -> Option<Turn> {
        self.lock().get(id).cloned()
    }

    /// Pair a user turn with an assistant turn, in either argument order.
    pub fn set_associated_id(&self, a: TurnId, b: TurnId) -> Result<(), ChatError> {
        let mut log = self.lock();
        let first = log.require(a)?;
        let second = log.require(b)?;

        if a == b {
            return Err(ChatError::InvalidState(format!("{a} cannot be paired with itself")));
        }
        if !first.role.can_pair_with(second.role) {
            return Err(ChatError::InvalidState(format!(
                "cannot pair a {} turn with a {} turn",
                first.role, second.role
            )));
        }
        for (turn, wanted) in [(first, b), (second, a)] {
            if let Some(existing) = turn.associated_id {
                if existing != wanted {
                    return Err(ChatError::InvalidState(format!(
                        "{} is already paired with {existing}",
                        turn.id
                    )));
                }
            }
        }

        if let Some(turn) = log.get_mut(a) {
            turn.associated_id = Some(b);
        }
        if let Some(turn) = log.get_mut(b) {
            turn.associated_id = Some(a);
        }
        Ok(())
    }

    /// Remove a turn, unlinking its partner if it had one.
    pub fn delete(&self, id: TurnId) -> Result<Turn, ChatError> {
        let mut log = self.lock();
        let pos = *log.positions.get(&id).ok_or(ChatError::TurnNotFound(id))?;
        let removed = log.turns.remove(pos);
        log.positions.remove(&id);
        log.reindex_from(pos);

        if let Some(partner) = removed.associated_id.and_then(|pid| log.get_mut(pid)) {
            partner.associated_id = None;
        }
        Ok(removed)
    }

    /// Turns with the given role, in insertion order.
    pub fn filter_by_role(&self, role: Role) -> Vec<Turn> {
        self.lock()
            .turns
            .iter()
            .filter(|turn| turn.role == role)
            .cloned()
            .collect()
    }

    /// The most recently appended turn with the given role.
    pub fn last_message(&self, role: Role) -> Option<Turn> {
        self.lock()
            .turns
            .iter()
            .rev()
            .find(|turn| turn.role == role)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().turns.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.lock().turns.clone()
    }

    /// Drop every turn. Ids handed out later still continue the sequence.
    pub fn clear(&self) {
        let mut log = self.lock();
        log.turns.clear();
        log.positions.clear();
    }

    /// The backend context for a reply to `id`: every turn up to and including
    /// it, in order, minus empty assistant placeholders still awaiting output.
    pub fn history_through(&self, id: TurnId) -> Result<Vec<ChatMessage>, ChatError> {
        let log = self.lock();
        log.require(id)?;
        Ok(log
            .turns
            .iter()
            .take_while(|turn| turn.id <= id)
            .filter(|turn| !(turn.is_assistant() && turn.content.is_empty()))
            .map(ChatMessage::from)
            .collect())
    }

    /// The exchange a given turn belongs to.
    pub fn exchange_for(&self, id: TurnId) -> Result<Exchange, ChatError> {
        let log = self.lock();
        let pos = *log.positions.get(&id).ok_or(ChatError::TurnNotFound(id))?;
        Ok(log.exchange_at(pos))
    }

    /// The exchange just before `current`, or the newest one when nothing is
    /// being displayed yet.
    pub fn previous_exchange(&self, current: Option<&Exchange>) -> Result<Exchange, ChatError> {
        let log = self.lock();
        let end = match current {
            Some(exchange) => {
                let min = exchange.min_id();
                log.turns.partition_point(|turn| turn.id < min)
            }
            None => log.turns.len(),
        };
        match end.checked_sub(1) {
            Some(pos) => Ok(log.exchange_at(pos)),
            None => Err(ChatError::NoAdjacentExchange(Direction::Previous)),
        }
    }

    /// The exchange just after `current`, or the oldest one when nothing is
    /// being displayed yet.
    pub fn next_exchange(&self, current: Option<&Exchange>) -> Result<Exchange, ChatError> {
        let log = self.lock();
        let start = match current {
            Some(exchange) => {
                let max = exchange.max_id();
                log.turns.partition_point(|turn| turn.id <= max)
            }
            None => 0,
        };
        if start < log.turns.len() {
            Ok(log.exchange_at(start))
        } else {
            Err(ChatError::NoAdjacentExchange(Direction::Next))
        }
    }
}
