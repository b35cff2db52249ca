//! Token/cost usage ledger.
//!
//! Append-only JSONL of usage events with per-model pricing and windowed
//! aggregation. Purge removes matching events for compliance requests.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use courier_domain::config::{UsageConfig, UsagePrice};
use courier_domain::event::now_ts;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub ts_ms: i64,
    pub source: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub events: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelUsage {
    pub model: String,
    #[serde(flatten)]
    pub totals: UsageTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSummary {
    pub window: String,
    pub start_ms: Option<i64>,
    pub end_ms: i64,
    pub totals: UsageTotals,
    pub models: Vec<ModelUsage>,
}

pub struct UsageTracker {
    store_path: PathBuf,
    config: UsageConfig,
    guard: Mutex<()>,
}

impl UsageTracker {
    pub fn new(store_path: &Path, config: UsageConfig) -> Self {
        if let Some(parent) = store_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        Self {
            store_path: store_path.to_path_buf(),
            config,
            guard: Mutex::new(()),
        }
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        source: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
        run_id: &str,
        session_key: &str,
        user_id: &str,
        metadata: Map<String, Value>,
    ) -> UsageEvent {
        let total = if total_tokens > 0 {
            total_tokens
        } else {
            prompt_tokens + completion_tokens
        };
        let model = if model.trim().is_empty() {
            "unknown"
        } else {
            model.trim()
        };
        let event = UsageEvent {
            ts_ms: (now_ts() * 1000.0) as i64,
            source: if source.is_empty() { "unknown" } else { source }.to_owned(),
            model: model.to_owned(),
            prompt_tokens,
            completion_tokens,
            total_tokens: total,
            cost_usd: self.estimate_cost(model, prompt_tokens, completion_tokens),
            run_id: run_id.to_owned(),
            session_key: session_key.to_owned(),
            user_id: user_id.to_owned(),
            metadata,
        };
        self.append(&event);
        event
    }

    fn append(&self, event: &UsageEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize usage event");
                return;
            }
        };
        let _guard = self.guard.lock();
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.store_path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to append usage event");
        }
    }

    fn load_events(&self) -> Vec<UsageEvent> {
        let _guard = self.guard.lock();
        let raw = match fs::read_to_string(&self.store_path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Overall plus per-window aggregation.
    pub fn summary(&self, windows: Option<&[String]>) -> (WindowSummary, Vec<WindowSummary>) {
        let now_ms = (now_ts() * 1000.0) as i64;
        let events = self.load_events();
        let overall = Self::aggregate(&events, "all", None, now_ms);

        let selected: Vec<&String> = windows
            .unwrap_or(&self.config.aggregation_windows)
            .iter()
            .filter(|w| window_seconds(w).is_some())
            .collect();
        let windowed = selected
            .into_iter()
            .map(|window| {
                let seconds = window_seconds(window).unwrap();
                let start_ms = now_ms - (seconds as i64 * 1000);
                let scoped: Vec<UsageEvent> = events
                    .iter()
                    .filter(|e| e.ts_ms >= start_ms)
                    .cloned()
                    .collect();
                Self::aggregate(&scoped, window, Some(start_ms), now_ms)
            })
            .collect();
        (overall, windowed)
    }

    fn aggregate(
        events: &[UsageEvent],
        window: &str,
        start_ms: Option<i64>,
        end_ms: i64,
    ) -> WindowSummary {
        let mut totals = UsageTotals::default();
        let mut by_model: std::collections::HashMap<String, UsageTotals> =
            std::collections::HashMap::new();

        for event in events {
            totals.events += 1;
            totals.prompt_tokens += event.prompt_tokens;
            totals.completion_tokens += event.completion_tokens;
            totals.total_tokens += event.total_tokens;
            totals.cost_usd += event.cost_usd;

            let row = by_model.entry(event.model.clone()).or_default();
            row.events += 1;
            row.prompt_tokens += event.prompt_tokens;
            row.completion_tokens += event.completion_tokens;
            row.total_tokens += event.total_tokens;
            row.cost_usd += event.cost_usd;
        }

        let mut models: Vec<ModelUsage> = by_model
            .into_iter()
            .map(|(model, totals)| ModelUsage { model, totals })
            .collect();
        models.sort_by(|a, b| {
            b.totals
                .cost_usd
                .partial_cmp(&a.totals.cost_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        WindowSummary {
            window: window.to_owned(),
            start_ms,
            end_ms,
            totals,
            models,
        }
    }

    /// Delete matching usage events. Requires at least one filter; returns
    /// the number of removed events.
    pub fn purge(
        &self,
        session_key: Option<&str>,
        user_id: Option<&str>,
        before_ts_ms: Option<i64>,
    ) -> usize {
        if session_key.is_none() && user_id.is_none() && before_ts_ms.is_none() {
            return 0;
        }
        let _guard = self.guard.lock();
        let raw = match fs::read_to_string(&self.store_path) {
            Ok(raw) => raw,
            Err(_) => return 0,
        };

        let mut kept = Vec::new();
        let mut removed = 0;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let event: UsageEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(_) => {
                    kept.push(line.to_owned());
                    continue;
                }
            };
            if Self::matches_purge(&event, session_key, user_id, before_ts_ms) {
                removed += 1;
            } else {
                kept.push(line.to_owned());
            }
        }

        let payload = if kept.is_empty() {
            String::new()
        } else {
            format!("{}\n", kept.join("\n"))
        };
        if let Err(e) = fs::write(&self.store_path, payload) {
            tracing::warn!(error = %e, "usage purge rewrite failed");
            return 0;
        }
        removed
    }

    fn matches_purge(
        event: &UsageEvent,
        session_key: Option<&str>,
        user_id: Option<&str>,
        before_ts_ms: Option<i64>,
    ) -> bool {
        if let Some(sk) = session_key {
            if event.session_key != sk {
                return false;
            }
        }
        if let Some(user) = user_id {
            if event.user_id != user && !event.session_key.contains(user) {
                return false;
            }
        }
        if let Some(cutoff) = before_ts_ms {
            if event.ts_ms >= cutoff {
                return false;
            }
        }
        true
    }

    fn estimate_cost(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let price = match self.find_price(model) {
            Some(price) => price,
            None => return 0.0,
        };
        let cost = (prompt_tokens as f64 / 1_000_000.0) * price.input_per_1m_tokens_usd
            + (completion_tokens as f64 / 1_000_000.0) * price.output_per_1m_tokens_usd;
        (cost * 1e8).round() / 1e8
    }

    /// Pricing lookup: exact, case-insensitive, bare-suffix (after `/`),
    /// then longest `family/` prefix rule.
    fn find_price(&self, model: &str) -> Option<UsagePrice> {
        let pricing = &self.config.pricing;
        let model = model.trim();
        if model.is_empty() {
            return None;
        }
        if let Some(price) = pricing.get(model) {
            return Some(*price);
        }
        let lower = model.to_lowercase();
        for (key, price) in pricing {
            if key.to_lowercase() == lower {
                return Some(*price);
            }
        }
        if let Some((_, suffix)) = model.split_once('/') {
            if let Some(price) = pricing.get(suffix) {
                return Some(*price);
            }
        }
        pricing
            .iter()
            .filter(|(key, _)| key.ends_with('/') && model.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| *price)
    }
}

fn window_seconds(window: &str) -> Option<u64> {
    let raw = window.trim().to_lowercase();
    if raw.len() < 2 {
        return None;
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let amount: u64 = number.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(amount * 60),
        "h" => Some(amount * 3600),
        "d" => Some(amount * 86_400),
        _ => None,
    }
}
