use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// A stored value plus its optional expiry deadline.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: String,
    /// Expiry as milliseconds since UNIX epoch. None = no expiry.
    pub expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// The keyspace: string key to string value with per-key TTL.
///
/// Expired entries become unobservable at the deadline; physical removal
/// happens lazily on access and eventually via the sweep task.
#[derive(Debug, Default)]
pub struct Store {
    data: HashMap<String, Entry>,
}

pub type SharedStore = Arc<RwLock<Store>>;

impl Store {
    pub fn new() -> Self {
        Store {
            data: HashMap::new(),
        }
    }

    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Store::new()))
    }

    /// Store unconditionally. Any prior expiry for the key is cleared.
    pub fn set(&mut self, key: String, value: String) {
        self.data.insert(
            key,
            Entry {
                value,
                expires_at: None,
            },
        );
    }

    /// Store with a TTL of `ttl_ms` milliseconds from now.
    pub fn set_ex(&mut self, key: String, value: String, ttl_ms: u64) {
        self.data.insert(
            key,
            Entry {
                value,
                expires_at: Some(now_millis() + ttl_ms),
            },
        );
    }

    /// Fetch a live value. An entry past its deadline is hidden here and
    /// physically removed by the sweep, so reads stay on the read lock.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = now_millis();
        self.data
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of keys carrying an expiry.
    pub fn expires_count(&self) -> usize {
        self.data.values().filter(|e| e.expires_at.is_some()).count()
    }

    /// Remove every entry whose deadline has passed. Returns the number
    /// removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = now_millis();
        let dead: Vec<String> = self
            .data
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        let count = dead.len();
        for key in dead {
            self.data.remove(&key);
        }
        count
    }
}

/// Current time in milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as u64
}
