use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use jwtproxy_keyserver::SigningKey;
use jwtproxy_slo::{errors, Result};

#[derive(Debug, Default)]
struct KeyState {
    active: Option<Arc<SigningKey>>,
    pending: Option<Arc<SigningKey>>,
    closed: bool,
}

/// The active key and at most one pending candidate.
///
/// Every operation takes the lock only for field assignment; keys are handed
/// out as `Arc`s so a reader holds either the old or the new key, never a mix.
#[derive(Debug, Default)]
pub struct KeyStore {
    state: Mutex<KeyState>,
}

impl KeyStore {
    pub fn new(active: Option<Arc<SigningKey>>) -> Self {
        Self {
            state: Mutex::new(KeyState {
                active,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active(&self) -> Result<Arc<SigningKey>> {
        self.lock().active.clone().ok_or_else(errors::no_active_key)
    }

    pub fn pending(&self) -> Option<Arc<SigningKey>> {
        self.lock().pending.clone()
    }

    /// Installs `key` as the pending candidate and returns the one it
    /// supersedes, which the caller must revoke. Refused once closed.
    pub fn set_pending(
        &self,
        key: Arc<SigningKey>,
    ) -> Result<Option<Arc<SigningKey>>> {
        let mut state = self.lock();
        if state.closed {
            return Err(errors::anyhow(anyhow::anyhow!(
                "key store is closed"
            )));
        }
        Ok(state.pending.replace(key))
    }

    /// Moves the pending key to active and returns it.
    pub fn promote(&self) -> Option<Arc<SigningKey>> {
        let mut state = self.lock();
        let promoted = state.pending.take()?;
        state.active = Some(Arc::clone(&promoted));
        Some(promoted)
    }

    pub fn take_pending(&self) -> Option<Arc<SigningKey>> {
        self.lock().pending.take()
    }

    /// Takes the pending key and refuses any later one.
    pub fn close(&self) -> Option<Arc<SigningKey>> {
        let mut state = self.lock();
        state.closed = true;
        state.pending.take()
    }

    /// Key ID prefixes of the (active, pending) keys, for log fields.
    pub fn short_ids(&self) -> (Option<String>, Option<String>) {
        let state = self.lock();
        (
            state.active.as_ref().map(|k| k.short_id().to_owned()),
            state.pending.as_ref().map(|k| k.short_id().to_owned()),
        )
    }
}
