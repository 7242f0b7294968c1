//! Advisory in-process lock manager.
//!
//! Optional layer for composite operations that need multi-resource
//! ordering outside the database row locks (which stay the authority for
//! per-position state). Read locks share; Write and Exclusive admit no
//! other holder. A requested lock that would create a cycle in the
//! wait-for graph fails fast with `Deadlock` instead of hanging, and every
//! wait carries a timeout.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

impl LockMode {
    /// Read locks share with each other; Write/Exclusive share with nobody
    fn compatible_with(&self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Read, LockMode::Read))
    }
}

#[derive(Debug)]
struct HeldLock {
    mode: LockMode,
    /// owner -> re-entrant hold count
    owners: FxHashMap<String, u32>,
}

#[derive(Debug, Default)]
struct LockState {
    held: FxHashMap<String, HeldLock>,
    /// owner -> resource it is currently blocked on
    waiting: FxHashMap<String, String>,
}

impl LockState {
    /// Would `owner` waiting on `resource` close a cycle in the wait-for
    /// graph?
    fn creates_cycle(&self, owner: &str, resource: &str) -> bool {
        let mut visited: FxHashSet<&str> = FxHashSet::default();
        let mut frontier: Vec<&str> = match self.held.get(resource) {
            Some(held) => held.owners.keys().map(String::as_str).collect(),
            None => return false,
        };
        while let Some(holder) = frontier.pop() {
            if holder == owner {
                return true;
            }
            if !visited.insert(holder) {
                continue;
            }
            if let Some(waited) = self.waiting.get(holder) {
                if let Some(held) = self.held.get(waited) {
                    frontier.extend(held.owners.keys().map(String::as_str));
                }
            }
        }
        false
    }

    fn try_grant(&mut self, owner: &str, resource: &str, mode: LockMode) -> EngineResult<bool> {
        match self.held.get_mut(resource) {
            None => {
                let mut owners = FxHashMap::default();
                owners.insert(owner.to_string(), 1);
                self.held.insert(resource.to_string(), HeldLock { mode, owners });
                Ok(true)
            }
            Some(held) => {
                if let Some(count) = held.owners.get_mut(owner) {
                    if held.mode != mode {
                        // upgrades would self-deadlock; surface as such
                        return Err(EngineError::Deadlock(Some(format!(
                            "owner {owner} holds {resource} as {:?} and requested {mode:?}",
                            held.mode
                        ))));
                    }
                    *count += 1;
                    return Ok(true);
                }
                if mode.compatible_with(held.mode) {
                    held.owners.insert(owner.to_string(), 1);
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }
}

/// In-process advisory lock manager
pub struct LockManager {
    state: Mutex<LockState>,
    released: Notify,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LockState::default()),
            released: Notify::new(),
        })
    }

    /// Acquire `resource` in `mode` for `owner`, waiting at most
    /// `timeout`. Returns a guard that releases on drop.
    pub async fn acquire(
        self: &Arc<Self>,
        owner: &str,
        resource: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> EngineResult<LockGuard> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for release notifications while still holding the
            // state mutex, so a release between unlock and await cannot be
            // missed.
            let mut notified = Box::pin(self.released.notified());
            {
                let mut state = self.state.lock().expect("lock state poisoned");
                if state.try_grant(owner, resource, mode)? {
                    state.waiting.remove(owner);
                    return Ok(LockGuard {
                        manager: self.clone(),
                        owner: owner.to_string(),
                        resource: resource.to_string(),
                    });
                }
                if state.creates_cycle(owner, resource) {
                    state.waiting.remove(owner);
                    return Err(EngineError::Deadlock(Some(format!(
                        "wait-for cycle on {resource}"
                    ))));
                }
                state
                    .waiting
                    .insert(owner.to_string(), resource.to_string());
                notified.as_mut().enable();
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                let mut state = self.state.lock().expect("lock state poisoned");
                state.waiting.remove(owner);
                return Err(EngineError::Timeout(timeout.as_millis() as u64));
            }
        }
    }

    fn release(&self, owner: &str, resource: &str) {
        let mut state = self.state.lock().expect("lock state poisoned");
        if let Some(held) = state.held.get_mut(resource) {
            if let Some(count) = held.owners.get_mut(owner) {
                *count -= 1;
                if *count == 0 {
                    held.owners.remove(owner);
                }
            }
            if held.owners.is_empty() {
                state.held.remove(resource);
            }
        }
        drop(state);
        self.released.notify_waiters();
    }

    /// Owners currently holding the resource (diagnostics)
    pub fn holders(&self, resource: &str) -> Vec<String> {
        let state = self.state.lock().expect("lock state poisoned");
        state
            .held
            .get(resource)
            .map(|held| held.owners.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Releases its lock on drop
pub struct LockGuard {
    manager: Arc<LockManager>,
    owner: String,
    resource: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.owner, &self.resource);
    }
}
