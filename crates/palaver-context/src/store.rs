use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use palaver_core::config::WindowBudget;
use palaver_core::{ContextEntry, ConversationId, TurnId};
use tracing::{debug, error, instrument, warn};

use crate::error::{ContextError, Result};
use crate::kv::KeyValueStore;
use crate::window;

/// Key under which a conversation's committed history is persisted.
pub fn history_key(id: &ConversationId) -> String {
    format!("chat_history:{id}")
}

/// Writes made by the turn currently in flight, not yet committed.
struct OpenTurn {
    id: TurnId,
    staged: Vec<ContextEntry>,
}

#[derive(Default)]
struct ConversationState {
    /// Committed, budget-enforced history (never contains transient entries).
    entries: Vec<ContextEntry>,
    turn: Option<OpenTurn>,
    scratch: HashMap<String, serde_json::Value>,
    /// Set once the slot is dropped from the store; nothing commits into it
    /// afterwards.
    evicted: bool,
}

impl ConversationState {
    fn view(&self) -> impl Iterator<Item = &ContextEntry> {
        let staged = self.turn.iter().flat_map(|t| t.staged.iter());
        self.entries.iter().chain(staged)
    }

    fn owns(&self, turn: &TurnId) -> bool {
        !self.evicted && self.turn.as_ref().is_some_and(|t| &t.id == turn)
    }
}

struct Slot {
    state: Mutex<ConversationState>,
    /// Held across a persistence write so writes land in mutation order.
    write: tokio::sync::Mutex<()>,
}

impl Slot {
    fn new(entries: Vec<ContextEntry>) -> Self {
        Self {
            state: Mutex::new(ConversationState {
                entries,
                ..Default::default()
            }),
            write: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConversationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-conversation ordered history plus the per-turn scratch cache.
///
/// The state mutex of a slot is never held across an `.await`; persistence
/// runs on a copy of the history taken under the lock. Entries are never
/// reordered or edited after append; eviction only removes the oldest
/// unpinned entries.
///
/// A turn's writes go through its [`TurnGuard`] and stay staged until the
/// guard is committed. Dropping the guard without committing discards the
/// staged entries and the scratch cache, so a cancelled turn leaves nothing
/// behind. A guard whose conversation was evicted can no longer write.
pub struct ConversationContextStore {
    conversations: DashMap<ConversationId, Arc<Slot>>,
    budget: WindowBudget,
    kv: Option<Arc<dyn KeyValueStore>>,
}

impl ConversationContextStore {
    /// An in-memory store with no persistence.
    pub fn new(budget: WindowBudget) -> Self {
        Self {
            conversations: DashMap::new(),
            budget,
            kv: None,
        }
    }

    /// A store that restores history lazily from `kv` and writes it back on
    /// every commit.
    pub fn with_persistence(budget: WindowBudget, kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            conversations: DashMap::new(),
            budget,
            kv: Some(kv),
        }
    }

    pub fn budget(&self) -> &WindowBudget {
        &self.budget
    }

    /// Number of conversations currently held in memory.
    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Append an entry. Staged when a turn is open, committed otherwise.
    #[instrument(skip(self, entry), fields(conversation = %id, role = %entry.role))]
    pub async fn append(&self, id: &ConversationId, entry: ContextEntry) {
        let slot = self.load(id).await;
        let _write = slot.write.lock().await;
        let entries = {
            let mut state = slot.lock();
            if let Some(turn) = state.turn.as_mut() {
                turn.staged.push(entry);
                return;
            }
            if entry.transient {
                debug!("transient entry outside a turn ignored");
                return;
            }
            state.entries.push(entry);
            window::enforce(&mut state.entries, &self.budget);
            state.entries.clone()
        };
        self.persist(id, &entries).await;
    }

    /// The current window: committed history followed by any open turn's
    /// staged entries, trimmed to the budget.
    pub async fn snapshot(&self, id: &ConversationId) -> Vec<ContextEntry> {
        let slot = self.load(id).await;
        let state = slot.lock();
        self.window_of(&state)
    }

    /// Committed history only.
    pub async fn history(&self, id: &ConversationId) -> Vec<ContextEntry> {
        let slot = self.load(id).await;
        let state = slot.lock();
        state.entries.clone()
    }

    pub async fn scratch_get(&self, id: &ConversationId, key: &str) -> Option<serde_json::Value> {
        let slot = self.load(id).await;
        let state = slot.lock();
        state.scratch.get(key).cloned()
    }

    pub async fn scratch_put(&self, id: &ConversationId, key: &str, value: serde_json::Value) {
        let slot = self.load(id).await;
        let mut state = slot.lock();
        state.scratch.insert(key.to_string(), value);
    }

    /// Open a turn: clears the scratch cache and starts staging appends.
    #[instrument(skip(self), fields(conversation = %id))]
    pub async fn begin_turn(self: &Arc<Self>, id: &ConversationId) -> Result<TurnGuard> {
        let slot = self.load(id).await;
        let turn_id = TurnId::new();
        {
            let mut state = slot.lock();
            if state.turn.is_some() {
                return Err(ContextError::TurnInProgress {
                    conversation: id.to_string(),
                });
            }
            state.scratch.clear();
            state.turn = Some(OpenTurn {
                id: turn_id.clone(),
                staged: Vec::new(),
            });
        }
        debug!(turn = %turn_id, "turn opened");
        Ok(TurnGuard {
            store: Arc::clone(self),
            slot,
            conversation: id.clone(),
            turn_id,
            finished: false,
        })
    }

    /// Commit the turn held by `guard`. See [`TurnGuard::commit`].
    pub async fn end_turn(&self, guard: TurnGuard) -> Result<()> {
        guard.commit().await
    }

    /// Forget the conversation's history, staged entries and scratch cache,
    /// in persistence and in memory. Nothing changes if the persisted copy
    /// cannot be deleted.
    #[instrument(skip(self), fields(conversation = %id))]
    pub async fn clear(&self, id: &ConversationId) -> Result<()> {
        let slot = self.load(id).await;
        let _write = slot.write.lock().await;
        if let Some(kv) = &self.kv {
            kv.delete(&history_key(id)).await?;
        }
        let mut state = slot.lock();
        state.entries.clear();
        state.scratch.clear();
        if let Some(turn) = state.turn.as_mut() {
            turn.staged.clear();
        }
        Ok(())
    }

    /// Drop the in-memory copy (persistence is untouched) and void any open
    /// turn. Used when a conversation is torn down.
    pub fn evict(&self, id: &ConversationId) {
        let Some((_, slot)) = self.conversations.remove(id) else {
            return;
        };
        let mut state = slot.lock();
        state.evicted = true;
        state.scratch.clear();
        if let Some(turn) = state.turn.take() {
            debug!(conversation = %id, turn = %turn.id, discarded = turn.staged.len(), "open turn voided by eviction");
        }
    }

    fn window_of(&self, state: &ConversationState) -> Vec<ContextEntry> {
        let mut view: Vec<ContextEntry> = state.view().cloned().collect();
        window::enforce(&mut view, &self.budget);
        view
    }

    async fn load(&self, id: &ConversationId) -> Arc<Slot> {
        if let Some(slot) = self.conversations.get(id) {
            return Arc::clone(slot.value());
        }
        let restored = self.restore(id).await;
        let slot = self
            .conversations
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Slot::new(restored)));
        Arc::clone(slot.value())
    }

    async fn restore(&self, id: &ConversationId) -> Vec<ContextEntry> {
        let Some(kv) = &self.kv else {
            return Vec::new();
        };
        match kv.get(&history_key(id)).await {
            Ok(Some(json)) => match serde_json::from_str::<Vec<ContextEntry>>(&json) {
                Ok(mut entries) => {
                    window::enforce(&mut entries, &self.budget);
                    entries
                }
                Err(e) => {
                    warn!(conversation = %id, error = %e, "stored history is unreadable, starting empty");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(conversation = %id, error = %e, "history restore failed, starting empty");
                Vec::new()
            }
        }
    }

    /// Write the full history. A failure keeps the in-memory copy; the next
    /// successful write brings persistence back in line.
    async fn persist(&self, id: &ConversationId, entries: &[ContextEntry]) {
        let Some(kv) = &self.kv else {
            return;
        };
        let written = match serde_json::to_string(entries) {
            Ok(json) => kv.put(&history_key(id), &json).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            error!(conversation = %id, error = %e, "history not persisted, keeping it in memory");
        }
    }
}

/// Handle for an open turn. Every write of the turn goes through it.
/// Commit it to keep the writes; drop it to throw them away.
pub struct TurnGuard {
    store: Arc<ConversationContextStore>,
    slot: Arc<Slot>,
    conversation: ConversationId,
    turn_id: TurnId,
    finished: bool,
}

impl TurnGuard {
    pub fn turn_id(&self) -> &TurnId {
        &self.turn_id
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Stage an entry. Fails with `TurnClosed` once the turn was voided.
    pub fn append(&self, entry: ContextEntry) -> Result<()> {
        let mut state = self.slot.lock();
        if !state.owns(&self.turn_id) {
            return Err(self.closed());
        }
        if let Some(turn) = state.turn.as_mut() {
            turn.staged.push(entry);
        }
        Ok(())
    }

    /// Committed history plus this turn's staged entries, within budget.
    pub fn snapshot(&self) -> Vec<ContextEntry> {
        let state = self.slot.lock();
        self.store.window_of(&state)
    }

    pub fn scratch_get(&self, key: &str) -> Option<serde_json::Value> {
        self.slot.lock().scratch.get(key).cloned()
    }

    pub fn scratch_put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let mut state = self.slot.lock();
        if !state.owns(&self.turn_id) {
            return Err(self.closed());
        }
        state.scratch.insert(key.to_string(), value);
        Ok(())
    }

    /// Commit the turn: persistent staged entries join the history,
    /// transient ones are dropped, then the budget is enforced and the
    /// history written back. A persistence failure is logged and does not
    /// fail the commit.
    pub async fn commit(mut self) -> Result<()> {
        let _write = self.slot.write.lock().await;
        let entries = {
            let mut state = self.slot.lock();
            if !state.owns(&self.turn_id) {
                return Err(self.closed());
            }
            let Some(turn) = state.turn.take() else {
                return Err(self.closed());
            };
            self.finished = true;
            state.scratch.clear();
            let staged = turn.staged.len();
            state
                .entries
                .extend(turn.staged.into_iter().filter(|e| !e.transient));
            let evicted = window::enforce(&mut state.entries, &self.store.budget);
            debug!(conversation = %self.conversation, turn = %self.turn_id, staged, evicted, "turn committed");
            state.entries.clone()
        };
        self.store.persist(&self.conversation, &entries).await;
        Ok(())
    }

    pub fn abort(mut self) {
        self.finished = true;
        self.discard();
    }

    fn discard(&self) {
        let mut state = self.slot.lock();
        if !state.owns(&self.turn_id) {
            return;
        }
        if let Some(turn) = state.turn.take() {
            debug!(conversation = %self.conversation, turn = %turn.id, discarded = turn.staged.len(), "turn aborted");
        }
        state.scratch.clear();
    }

    fn closed(&self) -> ContextError {
        ContextError::TurnClosed {
            conversation: self.conversation.to_string(),
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(conversation = %self.conversation, turn = %self.turn_id, "turn dropped without commit, discarding writes");
            self.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use palaver_core::config::BudgetMode;

    use super::*;
    use crate::kv::MemoryKeyValueStore;

    fn store(max: usize) -> Arc<ConversationContextStore> {
        Arc::new(ConversationContextStore::new(WindowBudget {
            mode: BudgetMode::Count,
            max,
        }))
    }

    fn id() -> ConversationId {
        ConversationId::from("r1")
    }

    /// Reads work, every write fails.
    struct ReadOnlyKv(MemoryKeyValueStore);

    #[async_trait]
    impl KeyValueStore for ReadOnlyKv {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.0.get(key).await
        }

        async fn put(&self, _key: &str, _value: &str) -> Result<()> {
            Err(ContextError::Task("disk full".into()))
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(ContextError::Task("disk full".into()))
        }
    }

    #[tokio::test]
    async fn unknown_conversation_starts_empty() {
        let s = store(10);
        assert!(s.snapshot(&id()).await.is_empty());
    }

    #[tokio::test]
    async fn append_outside_turn_commits_immediately() {
        let s = store(10);
        s.append(&id(), ContextEntry::user("hi")).await;
        assert_eq!(s.history(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn staged_entries_visible_in_snapshot_until_commit() {
        let s = store(10);
        let turn = s.begin_turn(&id()).await.unwrap();
        turn.append(ContextEntry::user("hi")).unwrap();
        assert_eq!(turn.snapshot().len(), 1);
        assert_eq!(s.snapshot(&id()).await.len(), 1);
        assert!(s.history(&id()).await.is_empty());
        turn.commit().await.unwrap();
        assert_eq!(s.history(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn store_appends_during_a_turn_are_staged() {
        let s = store(10);
        let turn = s.begin_turn(&id()).await.unwrap();
        s.append(&id(), ContextEntry::user("hi")).await;
        assert!(s.history(&id()).await.is_empty());
        s.end_turn(turn).await.unwrap();
        assert_eq!(s.history(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn transient_entries_are_dropped_on_commit() {
        let s = store(10);
        let turn = s.begin_turn(&id()).await.unwrap();
        turn.append(ContextEntry::user("q")).unwrap();
        turn.append(ContextEntry::system("doc").transient()).unwrap();
        assert_eq!(turn.snapshot().len(), 2);
        turn.commit().await.unwrap();
        let history = s.history(&id()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "q");
    }

    #[tokio::test]
    async fn dropping_guard_discards_turn() {
        let s = store(10);
        s.append(&id(), ContextEntry::user("kept")).await;
        {
            let turn = s.begin_turn(&id()).await.unwrap();
            turn.append(ContextEntry::user("lost")).unwrap();
            turn.scratch_put("k", serde_json::json!(1)).unwrap();
        }
        let history = s.history(&id()).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "kept");
        assert!(s.scratch_get(&id(), "k").await.is_none());
        // A fresh turn can open after the abort.
        s.begin_turn(&id()).await.unwrap().commit().await.unwrap();
    }

    #[tokio::test]
    async fn second_open_turn_is_rejected() {
        let s = store(10);
        let _turn = s.begin_turn(&id()).await.unwrap();
        assert!(matches!(
            s.begin_turn(&id()).await,
            Err(ContextError::TurnInProgress { .. })
        ));
    }

    #[tokio::test]
    async fn scratch_is_cleared_at_turn_start() {
        let s = store(10);
        s.scratch_put(&id(), "rag", serde_json::json!(["x"])).await;
        let turn = s.begin_turn(&id()).await.unwrap();
        assert!(turn.scratch_get("rag").is_none());
        turn.scratch_put("rag", serde_json::json!(["y"])).unwrap();
        assert_eq!(turn.scratch_get("rag"), Some(serde_json::json!(["y"])));
        turn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_enforces_budget_and_keeps_pinned() {
        let s = store(3);
        s.append(&id(), ContextEntry::system("persona").pinned()).await;
        for i in 0..5 {
            let turn = s.begin_turn(&id()).await.unwrap();
            turn.append(ContextEntry::user(format!("u{i}"))).unwrap();
            turn.append(ContextEntry::assistant(format!("a{i}"))).unwrap();
            turn.commit().await.unwrap();
        }
        let contents: Vec<String> = s.history(&id()).await.into_iter().map(|e| e.content).collect();
        assert_eq!(contents, vec!["persona", "u4", "a4"]);
    }

    #[tokio::test]
    async fn conversations_are_independent() {
        let s = store(10);
        let a = ConversationId::from("a");
        let b = ConversationId::from("b");
        let turn = s.begin_turn(&a).await.unwrap();
        turn.append(ContextEntry::user("for a")).unwrap();
        s.append(&b, ContextEntry::user("for b")).await;
        assert_eq!(s.history(&b).await.len(), 1);
        assert!(s.history(&a).await.is_empty());
    }

    #[tokio::test]
    async fn evicted_turn_cannot_write_or_commit() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let s = Arc::new(ConversationContextStore::with_persistence(WindowBudget::default(), Arc::clone(&kv)));
        let turn = s.begin_turn(&id()).await.unwrap();
        turn.append(ContextEntry::user("hello")).unwrap();

        s.evict(&id());

        assert!(matches!(
            turn.append(ContextEntry::assistant("late")),
            Err(ContextError::TurnClosed { .. })
        ));
        assert!(turn.scratch_put("k", serde_json::json!(1)).is_err());
        assert!(matches!(turn.commit().await, Err(ContextError::TurnClosed { .. })));
        assert!(s.history(&id()).await.is_empty());
        assert!(!kv.has_key(&history_key(&id())).await.unwrap());

        // The recreated slot accepts a new turn.
        s.begin_turn(&id()).await.unwrap().commit().await.unwrap();
    }

    #[tokio::test]
    async fn failed_persist_still_commits_in_memory() {
        let s = Arc::new(ConversationContextStore::with_persistence(
            WindowBudget::default(),
            Arc::new(ReadOnlyKv(MemoryKeyValueStore::new())),
        ));
        let turn = s.begin_turn(&id()).await.unwrap();
        turn.append(ContextEntry::user("hi")).unwrap();
        turn.commit().await.unwrap();
        assert_eq!(s.history(&id()).await.len(), 1);
        s.begin_turn(&id()).await.unwrap().commit().await.unwrap();
    }

    #[tokio::test]
    async fn failed_delete_leaves_history_untouched() {
        let s = ConversationContextStore::with_persistence(
            WindowBudget::default(),
            Arc::new(ReadOnlyKv(MemoryKeyValueStore::new())),
        );
        s.append(&id(), ContextEntry::user("x")).await;
        assert!(s.clear(&id()).await.is_err());
        assert_eq!(s.history(&id()).await.len(), 1);
    }

    #[tokio::test]
    async fn history_round_trips_through_kv() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let budget = WindowBudget::default();
        let first = Arc::new(ConversationContextStore::with_persistence(budget, Arc::clone(&kv)));
        let turn = first.begin_turn(&id()).await.unwrap();
        turn.append(ContextEntry::user("remember me")).unwrap();
        turn.commit().await.unwrap();

        let second = ConversationContextStore::with_persistence(budget, kv);
        assert_eq!(second.history(&id()).await[0].content, "remember me");
    }

    #[tokio::test]
    async fn clear_removes_history_and_persisted_copy() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let s = ConversationContextStore::with_persistence(WindowBudget::default(), Arc::clone(&kv));
        s.append(&id(), ContextEntry::user("x")).await;
        assert!(kv.has_key(&history_key(&id())).await.unwrap());
        s.clear(&id()).await.unwrap();
        assert!(s.history(&id()).await.is_empty());
        assert!(!kv.has_key(&history_key(&id())).await.unwrap());
    }
}
