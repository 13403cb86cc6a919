use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::errors::StoreError;
use super::traits::{Store, StoreOp};

#[derive(Debug, Default)]
struct State {
    values: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    unreachable: bool,
}

/// In-process store with the same semantics as the Redis one. Clones share
/// state, so a server and any number of clients can run against one instance.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the network had gone away.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.state.lock().lists.get(key).map_or(0, VecDeque::len)
    }

    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.lock();
        state.values.contains_key(key) || state.lists.contains_key(key)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T, StoreError> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(StoreError::Unreachable("memory store is offline".to_string()));
        }
        Ok(f(&mut state))
    }
}

impl State {
    fn remove(&mut self, key: &str) {
        self.values.remove(key);
        self.lists.remove(key);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_state(|s| s.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.lists.remove(key);
            s.values.insert(key.to_string(), value);
        })
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>) -> Result<bool, StoreError> {
        self.with_state(|s| {
            if s.values.contains_key(key) || s.lists.contains_key(key) {
                return false;
            }
            s.values.insert(key.to_string(), value);
            true
        })
    }

    async fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        self.with_state(|s| keys.iter().map(|k| s.values.get(*k).cloned()).collect())
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        self.with_state(|s| {
            for op in ops {
                match op {
                    StoreOp::Set(key, value) => {
                        s.lists.remove(&key);
                        s.values.insert(key, value);
                    }
                    StoreOp::Delete(key) => s.remove(&key),
                }
            }
        })
    }

    async fn delete(&self, keys: &[&str]) -> Result<(), StoreError> {
        self.with_state(|s| {
            for key in keys {
                s.remove(key);
            }
        })
    }

    async fn push_trim(&self, key: &str, value: Vec<u8>, max_len: usize) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.values.remove(key);
            let list = s.lists.entry(key.to_string()).or_default();
            list.push_front(value);
            list.truncate(max_len.max(1));
        })
    }

    async fn pop_all(&self, key: &str) -> Result<Vec<Vec<u8>>, StoreError> {
        self.with_state(|s| {
            s.lists
                .remove(key)
                .map(|list| list.into_iter().rev().collect())
                .unwrap_or_default()
        })
    }

    async fn flush_all(&self) -> Result<(), StoreError> {
        self.with_state(|s| {
            s.values.clear();
            s.lists.clear();
        })
    }
}
