use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use serde::{Deserialize, Serialize};

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::provider::{Clock, ConfigStore};
use crate::{b64_decode, b64_encode};

/// The config-store key the blacklist is persisted under.
pub const BLACK_LIST_KEY: &str = "black_list";

// Stored times count from 2000-01-01T00:00:00Z.
const STORED_TIME_BASE: i64 = 946_684_800;

/// A revocation of delegated credentials.
///
/// An empty `user_id` or `app_id` acts as a wildcard for that field; an
/// entry with both empty revokes every credential issued before its
/// revocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationEntry {
    /// The revoked user id, or empty for any user.
    pub user_id: Vec<u8>,
    /// The revoked application id, or empty for any application.
    pub app_id: Vec<u8>,
    /// Credentials issued before this instant are revoked.
    pub revocation: DateTime<Utc>,
    /// The entry itself may be dropped after this instant.
    pub expiration: DateTime<Utc>,
}

impl RevocationEntry {
    /// Returns whether the entry revokes a credential with the given ids
    /// issued at `issued_at`.
    #[must_use]
    pub fn matches(&self, user_id: &[u8], app_id: &[u8], issued_at: DateTime<Utc>) -> bool {
        (self.user_id.is_empty() || self.user_id == user_id)
            && (self.app_id.is_empty() || self.app_id == app_id)
            && self.revocation > issued_at
    }

    fn is_wildcard(&self) -> bool {
        self.user_id.is_empty() && self.app_id.is_empty()
    }
}

// The persisted form of an entry.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    app: String,
    expiration: i64,
    revocation: i64,
}

fn stored_time(time: DateTime<Utc>) -> i64 {
    time.timestamp() - STORED_TIME_BASE
}

fn entry_time(stored: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(stored + STORED_TIME_BASE, 0).single()
}

impl StoredEntry {
    fn from_entry(entry: &RevocationEntry) -> Self {
        Self {
            user: b64_encode(&entry.user_id),
            app: b64_encode(&entry.app_id),
            expiration: stored_time(entry.expiration),
            revocation: stored_time(entry.revocation),
        }
    }

    fn into_entry(self) -> Option<RevocationEntry> {
        Some(RevocationEntry {
            user_id: b64_decode(&self.user)?,
            app_id: b64_decode(&self.app)?,
            revocation: entry_time(self.revocation)?,
            expiration: entry_time(self.expiration)?,
        })
    }
}

fn to_json(entries: &[RevocationEntry]) -> Result<String> {
    let stored: Vec<StoredEntry> = entries.iter().map(StoredEntry::from_entry).collect();
    serde_json::to_string(&stored).map_err(|e| {
        Error::with_source(ErrorKind::InvalidState, "Failed to serialize the blacklist", e)
    })
}

/// The capacity-bounded, persistently stored blacklist of revoked local
/// credentials, consulted on every local authentication.
pub struct RevocationStore {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    capacity: usize,
    entries: Mutex<Vec<RevocationEntry>>,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl RevocationStore {
    /// Loads the blacklist from the config store, pruning entries that
    /// expired before now. When pruning or skipping malformed entries
    /// changed the set, the cleaned form is persisted right away.
    pub async fn load(
        store: Arc<dyn ConfigStore>,
        capacity: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let mut entries = Vec::new();
        let mut changed = false;
        if let Some(json) = store.load(BLACK_LIST_KEY) {
            match serde_json::from_str::<Vec<StoredEntry>>(&json) {
                Ok(stored) => {
                    for entry in stored {
                        match entry.into_entry() {
                            Some(entry) if entry.expiration > now => entries.push(entry),
                            _ => changed = true,
                        }
                    }
                }
                Err(e) => {
                    warn!("Discarding an unreadable blacklist: {e}");
                    changed = true;
                }
            }
        }

        let manager = Self {
            store,
            clock,
            capacity,
            entries: Mutex::new(entries),
            listeners: Mutex::new(Vec::new()),
        };
        if changed {
            if let Err(e) = manager.persist().await {
                warn!("Failed to persist the pruned blacklist: {e}");
            }
        }
        manager
    }

    /// Registers a listener fired after every successfully persisted change.
    pub fn add_entry_added_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().unwrap().push(Box::new(callback));
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn size(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Returns the entry capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns a copy of the live entries.
    #[must_use]
    pub fn entries(&self) -> Vec<RevocationEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Installs a revocation entry and persists the blacklist.
    ///
    /// At capacity, the soonest-expiring entry is evicted first; when that
    /// eviction would un-revoke a credential, the wildcard floor is raised
    /// to cover it. Over-revocation is accepted, un-revocation is not.
    ///
    /// # Errors
    ///
    /// Fails with `already_expired` when the entry expired before now, and
    /// propagates persistence failures.
    pub async fn block(&self, entry: RevocationEntry) -> Result<()> {
        let now = self.clock.now();
        if entry.expiration <= now {
            return Err(Error::new(
                ErrorKind::AlreadyExpired,
                "Revocation entry has already expired",
            ));
        }

        {
            let mut entries = self.entries.lock().unwrap();
            entries.retain(|e| e.expiration > now);
            let mut folded = false;
            while entries.len() >= self.capacity {
                let evicted = entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.is_wildcard())
                    .min_by_key(|(_, e)| (e.expiration, e.revocation))
                    .map(|(index, _)| index);
                let Some(index) = evicted else {
                    // Nothing left to evict but the wildcard itself: fold
                    // the new entry into the floor.
                    if let Some(wildcard) = entries.iter_mut().find(|e| e.is_wildcard()) {
                        wildcard.revocation = wildcard.revocation.max(entry.revocation);
                        wildcard.expiration = wildcard.expiration.max(entry.expiration);
                    }
                    folded = true;
                    break;
                };
                let evicted = entries.remove(index);
                match entries.iter_mut().find(|e| e.is_wildcard()) {
                    Some(wildcard) => {
                        wildcard.revocation = wildcard.revocation.max(evicted.revocation);
                        wildcard.expiration = wildcard.expiration.max(evicted.expiration);
                    }
                    None => entries.push(RevocationEntry {
                        user_id: Vec::new(),
                        app_id: Vec::new(),
                        revocation: evicted.revocation,
                        expiration: evicted.expiration,
                    }),
                }
            }
            if !folded {
                entries.push(entry);
            }
        }

        self.persist().await?;
        for listener in self.listeners.lock().unwrap().iter() {
            listener();
        }
        Ok(())
    }

    /// Returns whether a credential with the given ids, issued at
    /// `issued_at`, is revoked.
    #[must_use]
    pub fn is_blocked(&self, user_id: &[u8], app_id: &[u8], issued_at: DateTime<Utc>) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.matches(user_id, app_id, issued_at))
    }

    async fn persist(&self) -> Result<()> {
        let json = to_json(&self.entries.lock().unwrap())?;
        self.store.save(BLACK_LIST_KEY, json).await
    }
}
