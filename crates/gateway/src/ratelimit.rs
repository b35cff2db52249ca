//! Token-bucket rate limiter for messages and tool calls.
//!
//! Buckets refill continuously at capacity-per-minute. With a store path
//! configured, every consume is a read-modify-write of the JSON state file
//! under both the process mutex and an advisory file lock, so concurrent
//! processes share the same budget and state survives crashes.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use courier_domain::config::RateLimitConfig;

const MAX_IDLE_SECONDS: f64 = 3600.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BucketRow {
    tokens: f64,
    last_refill: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: f64,
    capacity: f64,
    rate: f64,
}

impl Bucket {
    fn fresh(capacity: f64, rate: f64, now: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            capacity,
            rate,
        }
    }

    fn from_row(row: Option<BucketRow>, capacity: f64, rate: f64, now: f64) -> Self {
        match row {
            Some(row) => Self {
                tokens: row.tokens.clamp(0.0, capacity),
                last_refill: if row.last_refill > 0.0 {
                    row.last_refill
                } else {
                    now
                },
                capacity,
                rate,
            },
            None => Self::fresh(capacity, rate, now),
        }
    }

    fn to_row(self) -> BucketRow {
        BucketRow {
            tokens: self.tokens,
            last_refill: self.last_refill,
        }
    }

    /// Try to consume one token. Returns true when allowed.
    fn consume(&mut self, now: f64) -> bool {
        let elapsed = (now - self.last_refill).max(0.0);
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    #[serde(default)]
    user_buckets: HashMap<String, BucketRow>,
    #[serde(default)]
    tool_buckets: HashMap<String, BucketRow>,
}

pub struct RateLimiter {
    messages_per_minute: f64,
    tool_calls_per_minute: f64,
    store_path: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    user_buckets: Mutex<HashMap<String, Bucket>>,
    tool_buckets: Mutex<HashMap<String, Bucket>>,
    guard: Mutex<()>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let store_path = if config.store_path.is_empty() {
            None
        } else {
            let path = PathBuf::from(&config.store_path);
            if let Some(parent) = path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            Some(path)
        };
        let lock_path = store_path.as_ref().map(|p| {
            let mut name = p.file_name().unwrap_or_default().to_os_string();
            name.push(".lock");
            p.with_file_name(name)
        });
        Self {
            messages_per_minute: f64::from(config.messages_per_minute.max(1)),
            tool_calls_per_minute: f64::from(config.tool_calls_per_minute.max(1)),
            store_path,
            lock_path,
            user_buckets: Mutex::new(HashMap::new()),
            tool_buckets: Mutex::new(HashMap::new()),
            guard: Mutex::new(()),
        }
    }

    fn now() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Whether the user may send a message now.
    pub fn check_message(&self, user_key: &str) -> bool {
        self.consume(user_key, false)
    }

    /// Whether the user may make a tool call now.
    pub fn check_tool_call(&self, user_key: &str) -> bool {
        self.consume(user_key, true)
    }

    fn params(&self, tool: bool) -> (f64, f64) {
        let cap = if tool {
            self.tool_calls_per_minute
        } else {
            self.messages_per_minute
        };
        (cap, cap / 60.0)
    }

    fn consume(&self, user_key: &str, tool: bool) -> bool {
        if self.store_path.is_some() {
            return self.consume_persistent(user_key, tool);
        }
        let (cap, rate) = self.params(tool);
        let now = Self::now();
        let buckets = if tool {
            &self.tool_buckets
        } else {
            &self.user_buckets
        };
        let mut buckets = buckets.lock();
        buckets
            .entry(user_key.to_owned())
            .or_insert_with(|| Bucket::fresh(cap, rate, now))
            .consume(now)
    }

    fn consume_persistent(&self, user_key: &str, tool: bool) -> bool {
        let (cap, rate) = self.params(tool);
        let now = Self::now();
        let _guard = self.guard.lock();
        let _file_lock = self.file_lock();

        let mut state = self.load_state();
        let rows = if tool {
            &mut state.tool_buckets
        } else {
            &mut state.user_buckets
        };
        let mut bucket = Bucket::from_row(rows.get(user_key).copied(), cap, rate, now);
        let allowed = bucket.consume(now);
        rows.insert(user_key.to_owned(), bucket.to_row());
        Self::prune_rows(rows, now);
        self.save_state(&state);
        allowed
    }

    fn prune_rows(rows: &mut HashMap<String, BucketRow>, now: f64) {
        rows.retain(|_, row| now - row.last_refill <= MAX_IDLE_SECONDS);
    }

    fn load_state(&self) -> PersistedState {
        let path = match &self.store_path {
            Some(path) => path,
            None => return PersistedState::default(),
        };
        fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn save_state(&self, state: &PersistedState) {
        let path = match &self.store_path {
            Some(path) => path,
            None => return,
        };
        let payload = match serde_json::to_string_pretty(state) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize rate limiter state");
                return;
            }
        };
        let tmp = path.with_extension("json.tmp");
        let result = fs::write(&tmp, payload).and_then(|_| fs::rename(&tmp, path));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to persist rate limiter state");
            let _ = fs::remove_file(&tmp);
        }
    }

    /// Hold an advisory lock on the sidecar lock file for the duration of
    /// one read-modify-write.
    fn file_lock(&self) -> Option<fs::File> {
        let lock_path = self.lock_path.as_ref()?;
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(lock_path)
            .ok()?;
        if let Err(e) = file.lock_exclusive() {
            tracing::debug!(error = %e, "rate limiter file lock unavailable");
        }
        Some(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(messages: u32, tools: u32, store: Option<&std::path::Path>) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            messages_per_minute: messages,
            tool_calls_per_minute: tools,
            store_path: store
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }

    #[test]
    fn burst_of_capacity_plus_one_denies_last() {
        let limiter = RateLimiter::new(&config(5, 60, None));
        for _ in 0..5 {
            assert!(limiter.check_message("alice"));
        }
        assert!(!limiter.check_message("alice"));
    }

    #[test]
    fn users_have_independent_buckets() {
        let limiter = RateLimiter::new(&config(1, 60, None));
        assert!(limiter.check_message("alice"));
        assert!(!limiter.check_message("alice"));
        assert!(limiter.check_message("bob"));
    }

    #[test]
    fn message_and_tool_buckets_are_separate() {
        let limiter = RateLimiter::new(&config(1, 2, None));
        assert!(limiter.check_message("alice"));
        assert!(!limiter.check_message("alice"));
        assert!(limiter.check_tool_call("alice"));
        assert!(limiter.check_tool_call("alice"));
        assert!(!limiter.check_tool_call("alice"));
    }

    #[test]
    fn persistent_state_survives_reconstruction() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("ratelimit.json");

        let limiter = RateLimiter::new(&config(2, 60, Some(&store)));
        assert!(limiter.check_message("alice"));
        assert!(limiter.check_message("alice"));
        assert!(!limiter.check_message("alice"));

        // A fresh limiter over the same store sees the drained bucket.
        let limiter2 = RateLimiter::new(&config(2, 60, Some(&store)));
        assert!(!limiter2.check_message("alice"));
    }

    #[test]
    fn persistent_store_file_is_created() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("nested").join("ratelimit.json");
        let limiter = RateLimiter::new(&config(5, 60, Some(&store)));
        limiter.check_message("alice");
        assert!(store.exists());
        let raw = fs::read_to_string(&store).unwrap();
        assert!(raw.contains("user_buckets"));
    }

    #[test]
    fn corrupt_state_file_resets_buckets() {
        let dir = tempdir().unwrap();
        let store = dir.path().join("ratelimit.json");
        fs::write(&store, "{broken").unwrap();
        let limiter = RateLimiter::new(&config(1, 60, Some(&store)));
        assert!(limiter.check_message("alice"));
    }
}
