//! Ephemeral credential cache.
//!
//! Flow Overview: a multi-request flow needs its in-flight credential draft
//! to survive a page reload and the forced sign-out that precedes two-factor
//! verification. One entry exists per flow instance, keyed by the flow id.
//!
//! Security boundaries:
//! - Passwords live here only under `secrecy` and only for the staleness
//!   window; entries are deleted on abandonment and on every terminal phase.
//! - Entries are never persisted and never leave the process.

use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::identity::IdentityToken;

/// In-flight credential draft bridging multi-step flows.
#[derive(Clone, Debug, Default)]
pub struct CredentialDraft {
    pub email: String,
    pub password: Option<SecretString>,
    /// Display name, present only while enrolling.
    pub display_name: Option<String>,
    /// Server-held continuation for the federated path, instead of a raw
    /// password.
    pub continuation: Option<IdentityToken>,
    /// Outstanding one-shot challenge, replaced on resend.
    pub challenge_id: Option<Uuid>,
}

struct CacheEntry {
    draft: CredentialDraft,
    created_at: Instant,
}

/// Session-scoped store for credential drafts with a fixed staleness ceiling.
#[derive(Clone)]
pub struct CredentialCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    ttl: Duration,
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl CredentialCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                ttl,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Store or replace the draft for a flow instance.
    pub fn put(&self, flow_id: Uuid, draft: CredentialDraft) {
        let mut entries = self.lock();
        // Opportunistic sweep keeps abandoned entries from outliving the ceiling.
        entries.retain(|_, entry| entry.created_at.elapsed() < self.inner.ttl);
        entries.insert(
            flow_id,
            CacheEntry {
                draft,
                created_at: Instant::now(),
            },
        );
    }

    /// Clone the draft for a flow, if present and not stale.
    ///
    /// Stale entries are removed on access; the caller sees them as missing
    /// and must return the user to the earliest recoverable phase.
    #[must_use]
    pub fn get(&self, flow_id: Uuid) -> Option<CredentialDraft> {
        let mut entries = self.lock();
        match entries.get(&flow_id) {
            Some(entry) if entry.created_at.elapsed() < self.inner.ttl => {
                Some(entry.draft.clone())
            }
            Some(_) => {
                entries.remove(&flow_id);
                None
            }
            None => None,
        }
    }

    /// Replace the outstanding challenge id without refreshing the staleness
    /// clock.
    pub fn set_challenge(&self, flow_id: Uuid, challenge_id: Uuid) {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&flow_id) {
            entry.draft.challenge_id = Some(challenge_id);
        }
    }

    pub fn remove(&self, flow_id: Uuid) {
        self.lock().remove(&flow_id);
    }

    /// Drop every stale entry.
    pub fn sweep(&self) {
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.created_at.elapsed() < self.inner.ttl);
    }

    #[must_use]
    pub fn contains(&self, flow_id: Uuid) -> bool {
        let entries = self.lock();
        entries
            .get(&flow_id)
            .is_some_and(|entry| entry.created_at.elapsed() < self.inner.ttl)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CacheEntry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
