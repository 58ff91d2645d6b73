//! Per-user state.
//!
//! The core never owns user state directly; it talks to a [`SessionStore`].
//! [`MemorySessionStore`] is the default, [`NullSessionStore`] forgets
//! everything, and anything else (a cache, a database) can implement the
//! trait. [`UserSession`] and [`History`] are serde types so such stores can
//! persist them as JSON.
//!
//! ## Invariants
//!
//! - A value written with `set` is visible to the next `get` for the same
//!   user. The tag evaluator relies on this inside a single reply
//!   (`<set x=1> <get x>`).
//! - History is newest first and always exactly `size` long, padded with
//!   `"undefined"`.
//! - `MemorySessionStore` never holds its `users` and `frozen` locks at the
//!   same time.

use crate::document::DEFAULT_TOPIC;
use crate::error::SessionResult;
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Value reported for variables and history slots that were never set.
pub const UNDEFINED: &str = "undefined";

/// Default number of remembered input/reply pairs.
pub const HISTORY_SIZE: usize = 9;

/// Variable holding the user's current topic.
pub const TOPIC_VAR: &str = "topic";

/// Variable holding the text of the last matched trigger.
pub const LAST_MATCH_VAR: &str = "__last_match__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub input: Vec<String>,
    pub reply: Vec<String>,
}

impl History {
    pub fn new(size: usize) -> Self {
        Self { input: vec![UNDEFINED.to_string(); size], reply: vec![UNDEFINED.to_string(); size] }
    }

    pub fn push(&mut self, input: &str, reply: &str) {
        let size = self.input.len().max(1);
        self.input.insert(0, input.to_string());
        self.input.truncate(size);
        self.reply.insert(0, reply.to_string());
        self.reply.truncate(size);
    }

    /// 1-based: `input(1)` is the most recent message.
    pub fn input(&self, n: usize) -> &str {
        n.checked_sub(1).and_then(|i| self.input.get(i)).map_or(UNDEFINED, String::as_str)
    }

    pub fn reply(&self, n: usize) -> &str {
        n.checked_sub(1).and_then(|i| self.reply.get(i)).map_or(UNDEFINED, String::as_str)
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub vars: BTreeMap<String, String>,
    pub history: History,
}

impl UserSession {
    pub fn new(history_size: usize) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert(TOPIC_VAR.to_string(), DEFAULT_TOPIC.to_string());
        Self { vars, history: History::new(history_size) }
    }
}

/// What [`SessionStore::thaw`] does with the frozen snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThawAction {
    /// Restore the snapshot and delete it.
    Thaw,
    /// Delete the snapshot without restoring it.
    Discard,
    /// Restore the snapshot and keep it for later.
    Keep,
}

pub trait SessionStore: Send + Sync {
    /// `None` when the user or the variable doesn't exist.
    fn get(&self, user: &str, name: &str) -> SessionResult<Option<String>>;

    fn set(&self, user: &str, name: &str, value: &str) -> SessionResult<()>;

    fn remove(&self, user: &str, name: &str) -> SessionResult<()>;

    /// All variables of a user, `None` for an unknown user.
    fn get_any(&self, user: &str) -> SessionResult<Option<BTreeMap<String, String>>>;

    /// Set several variables at once (merged into the existing ones).
    fn set_many(&self, user: &str, vars: &BTreeMap<String, String>) -> SessionResult<()>;

    fn push_history(&self, user: &str, input: &str, reply: &str) -> SessionResult<()>;

    fn history(&self, user: &str) -> SessionResult<History>;

    fn all_user_ids(&self) -> SessionResult<Vec<String>>;

    fn reset(&self, user: &str) -> SessionResult<()>;

    fn reset_all(&self) -> SessionResult<()>;

    /// Snapshot a user's state.
    fn freeze(&self, user: &str) -> SessionResult<()>;

    fn thaw(&self, user: &str, action: ThawAction) -> SessionResult<()>;
}

// --- In-memory store ---------------------------------------------------------

/// Keeps everything in process memory.
#[derive(Debug)]
pub struct MemorySessionStore {
    users: RwLock<HashMap<String, UserSession>>,
    frozen: RwLock<HashMap<String, UserSession>>,
    history_size: usize,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_history_size(HISTORY_SIZE)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self { users: RwLock::new(HashMap::new()), frozen: RwLock::new(HashMap::new()), history_size }
    }

    /// Full snapshot of a user, for persistence.
    pub fn export(&self, user: &str) -> Option<UserSession> {
        self.users.read().get(user).cloned()
    }

    pub fn import(&self, user: &str, session: UserSession) {
        self.users.write().insert(user.to_string(), session);
    }

    fn with_user<R>(&self, user: &str, f: impl FnOnce(&mut UserSession) -> R) -> R {
        let mut users = self.users.write();
        let session = users.entry(user.to_string()).or_insert_with(|| UserSession::new(self.history_size));
        f(session)
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, user: &str, name: &str) -> SessionResult<Option<String>> {
        Ok(self.users.read().get(user).and_then(|s| s.vars.get(name).cloned()))
    }

    fn set(&self, user: &str, name: &str, value: &str) -> SessionResult<()> {
        self.with_user(user, |s| s.vars.insert(name.to_string(), value.to_string()));
        Ok(())
    }

    fn remove(&self, user: &str, name: &str) -> SessionResult<()> {
        if let Some(session) = self.users.write().get_mut(user) {
            session.vars.remove(name);
        }
        Ok(())
    }

    fn get_any(&self, user: &str) -> SessionResult<Option<BTreeMap<String, String>>> {
        Ok(self.users.read().get(user).map(|s| s.vars.clone()))
    }

    fn set_many(&self, user: &str, vars: &BTreeMap<String, String>) -> SessionResult<()> {
        self.with_user(user, |s| s.vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone()))));
        Ok(())
    }

    fn push_history(&self, user: &str, input: &str, reply: &str) -> SessionResult<()> {
        self.with_user(user, |s| s.history.push(input, reply));
        Ok(())
    }

    fn history(&self, user: &str) -> SessionResult<History> {
        Ok(self.users.read().get(user).map_or_else(|| History::new(self.history_size), |s| s.history.clone()))
    }

    fn all_user_ids(&self) -> SessionResult<Vec<String>> {
        let mut ids: Vec<String> = self.users.read().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn reset(&self, user: &str) -> SessionResult<()> {
        self.users.write().remove(user);
        Ok(())
    }

    fn reset_all(&self) -> SessionResult<()> {
        self.users.write().clear();
        Ok(())
    }

    fn freeze(&self, user: &str) -> SessionResult<()> {
        // Never hold both maps at once.
        let session = self.users.read().get(user).cloned();
        match session {
            Some(session) => {
                self.frozen.write().insert(user.to_string(), session);
            }
            None => warn!("Can't freeze vars for user {user}: not found"),
        }
        Ok(())
    }

    fn thaw(&self, user: &str, action: ThawAction) -> SessionResult<()> {
        let snapshot = {
            let mut frozen = self.frozen.write();
            match action {
                ThawAction::Keep => frozen.get(user).cloned(),
                ThawAction::Thaw | ThawAction::Discard => frozen.remove(user),
            }
        };
        match (snapshot, action) {
            (None, _) => warn!("Can't thaw vars for user {user}: not frozen"),
            (Some(_), ThawAction::Discard) => {}
            (Some(session), _) => {
                self.users.write().insert(user.to_string(), session);
            }
        }
        Ok(())
    }
}

// --- Null store --------------------------------------------------------------

/// Remembers nothing: every user is always new.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSessionStore;

impl SessionStore for NullSessionStore {
    fn get(&self, _user: &str, _name: &str) -> SessionResult<Option<String>> {
        Ok(None)
    }

    fn set(&self, _user: &str, _name: &str, _value: &str) -> SessionResult<()> {
        Ok(())
    }

    fn remove(&self, _user: &str, _name: &str) -> SessionResult<()> {
        Ok(())
    }

    fn get_any(&self, _user: &str) -> SessionResult<Option<BTreeMap<String, String>>> {
        Ok(None)
    }

    fn set_many(&self, _user: &str, _vars: &BTreeMap<String, String>) -> SessionResult<()> {
        Ok(())
    }

    fn push_history(&self, _user: &str, _input: &str, _reply: &str) -> SessionResult<()> {
        Ok(())
    }

    fn history(&self, _user: &str) -> SessionResult<History> {
        Ok(History::default())
    }

    fn all_user_ids(&self) -> SessionResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn reset(&self, _user: &str) -> SessionResult<()> {
        Ok(())
    }

    fn reset_all(&self) -> SessionResult<()> {
        Ok(())
    }

    fn freeze(&self, _user: &str) -> SessionResult<()> {
        Ok(())
    }

    fn thaw(&self, _user: &str, _action: ThawAction) -> SessionResult<()> {
        Ok(())
    }
}
