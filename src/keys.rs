/// API Key Pool
///
/// Round-robins credentials per provider and tracks a temporary backoff window
/// per key. Expired backoffs are cleared lazily on the next lookup. Pools are
/// plain owned values so the live ingester and the reconciler can each hold
/// their own rotation context.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

pub const DEFAULT_KEY_BACKOFF: Duration = Duration::from_secs(60);

/// A credential handed out by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub provider: String,
    pub secret: String,
}

impl ApiKey {
    /// Loggable form of the secret
    pub fn masked(&self) -> String {
        mask_key(&self.secret)
    }
}

/// Show only the last four characters of a secret
pub fn mask_key(secret: &str) -> String {
    let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        format!("****{}", tail)
    }
}

#[derive(Debug)]
struct KeySlot {
    secret: String,
    backoff_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct ProviderKeys {
    slots: Vec<KeySlot>,
    next_index: usize,
}

pub struct ApiKeyPool {
    providers: Mutex<HashMap<String, ProviderKeys>>,
    default_backoff: Duration,
    changed: Notify,
}

impl ApiKeyPool {
    pub fn new(default_backoff: Duration) -> Self {
        Self { providers: Mutex::new(HashMap::new()), default_backoff, changed: Notify::new() }
    }

    /// Build a pool pre-loaded with keys per provider
    pub fn with_keys(default_backoff: Duration, keys: &HashMap<String, Vec<String>>) -> Self {
        let pool = Self::new(default_backoff);
        for (provider, secrets) in keys {
            pool.replace_keys(provider, secrets.clone());
        }
        pool
    }

    /// Next non-backed-off key for `provider`, or `None` when all are cooling down
    pub fn next(&self, provider: &str) -> Option<ApiKey> {
        self.next_at(provider, Instant::now())
    }

    fn next_at(&self, provider: &str, now: Instant) -> Option<ApiKey> {
        let mut providers = self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = providers.get_mut(provider)?;
        let count = entry.slots.len();

        for offset in 0..count {
            let index = (entry.next_index + offset) % count;
            let slot = &mut entry.slots[index];

            if let Some(until) = slot.backoff_until {
                if until > now {
                    continue;
                }
                slot.backoff_until = None;
            }

            let key = ApiKey { provider: provider.to_string(), secret: slot.secret.clone() };
            entry.next_index = (index + 1) % count;
            return Some(key);
        }

        None
    }

    /// Put `key` into backoff for `duration` (pool default when `None`)
    ///
    /// An existing longer window is kept; a shorter one is extended.
    pub fn mark_failed(&self, key: &ApiKey, reason: &str, duration: Option<Duration>) {
        self.mark_failed_at(key, reason, duration, Instant::now());
    }

    fn mark_failed_at(&self, key: &ApiKey, reason: &str, duration: Option<Duration>, now: Instant) {
        let duration = duration.unwrap_or(self.default_backoff);
        let until = now + duration;

        let mut providers = self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(entry) = providers.get_mut(&key.provider) else {
            return;
        };

        if let Some(slot) = entry.slots.iter_mut().find(|s| s.secret == key.secret) {
            slot.backoff_until = Some(slot.backoff_until.map_or(until, |current| current.max(until)));
            tracing::warn!(
                provider = %key.provider,
                key = %key.masked(),
                backoff_secs = duration.as_secs(),
                "API key backed off: {}",
                reason
            );
        }
    }

    /// Swap in a fresh key list, keeping backoff windows of keys that survive
    pub fn replace_keys(&self, provider: &str, secrets: Vec<String>) {
        {
            let mut providers = self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let entry = providers.entry(provider.to_string()).or_default();

            let mut slots = Vec::with_capacity(secrets.len());
            for secret in secrets {
                if secret.is_empty() || slots.iter().any(|s: &KeySlot| s.secret == secret) {
                    continue;
                }
                let backoff_until =
                    entry.slots.iter().find(|s| s.secret == secret).and_then(|existing| existing.backoff_until);
                slots.push(KeySlot { secret, backoff_until });
            }

            entry.next_index = if slots.is_empty() { 0 } else { entry.next_index % slots.len() };
            entry.slots = slots;
        }
        self.changed.notify_waiters();
    }

    /// Number of configured keys for `provider`, backed off or not
    pub fn key_count(&self, provider: &str) -> usize {
        let providers = self.providers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        providers.get(provider).map(|p| p.slots.len()).unwrap_or(0)
    }

    /// Resolves the next time the key set is replaced
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

impl Default for ApiKeyPool {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_BACKOFF)
    }
}
