//! Webhook signature verification with replay protection.
//!
//! Senders sign `"<ts>." || raw_body` with HMAC-SHA256 over the shared
//! secret. Any of the accepted signature headers may carry the hex digest;
//! the timestamp must fall within the replay window, and event ids are
//! deduplicated over a bounded window.

use std::collections::{HashSet, VecDeque};

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use courier_domain::event::now_ts;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADERS: &[&str] = &[
    "x-courier-signature",
    "x-webhook-signature",
    "x-hub-signature-256",
    "x-signature",
];

pub const TIMESTAMP_HEADERS: &[&str] =
    &["x-webhook-timestamp", "x-timestamp", "x-signature-timestamp"];

const MAX_DEDUPE: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRejection {
    MissingSignature,
    MissingTimestamp,
    OutsideReplayWindow,
    InvalidSignature,
    DuplicateEvent,
}

impl std::fmt::Display for WebhookRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::MissingSignature => "Missing webhook signature.",
            Self::MissingTimestamp => "Missing webhook timestamp.",
            Self::OutsideReplayWindow => "Webhook timestamp outside replay window.",
            Self::InvalidSignature => "Invalid webhook signature.",
            Self::DuplicateEvent => "Duplicate webhook event.",
        };
        f.write_str(text)
    }
}

pub struct WebhookVerifier {
    replay_window_s: f64,
    dedupe: Mutex<(HashSet<String>, VecDeque<String>)>,
}

impl WebhookVerifier {
    pub fn new(replay_window_s: u64) -> Self {
        Self {
            replay_window_s: replay_window_s.max(1) as f64,
            dedupe: Mutex::new((HashSet::new(), VecDeque::new())),
        }
    }

    /// Compute the expected hex signature for a timestamped body.
    pub fn sign(secret: &str, timestamp: f64, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Pull the signature out of the accepted header set, stripping an
    /// optional `sha256=` prefix.
    pub fn resolve_signature<'a>(
        headers: &'a [(String, String)],
    ) -> Option<&'a str> {
        for accepted in SIGNATURE_HEADERS {
            for (name, value) in headers {
                if name.eq_ignore_ascii_case(accepted) && !value.trim().is_empty() {
                    let value = value.trim();
                    return Some(value.strip_prefix("sha256=").unwrap_or(value));
                }
            }
        }
        None
    }

    pub fn resolve_timestamp(headers: &[(String, String)]) -> Option<f64> {
        for accepted in TIMESTAMP_HEADERS {
            for (name, value) in headers {
                if name.eq_ignore_ascii_case(accepted) {
                    if let Ok(ts) = value.trim().parse::<f64>() {
                        return Some(ts);
                    }
                }
            }
        }
        None
    }

    /// Verify one delivery. A successful verification records the event id
    /// in the dedup window.
    pub fn verify(
        &self,
        secret: &str,
        headers: &[(String, String)],
        body: &[u8],
        event_id: &str,
    ) -> Result<(), WebhookRejection> {
        if !event_id.is_empty() && self.dedupe.lock().0.contains(event_id) {
            return Err(WebhookRejection::DuplicateEvent);
        }

        let signature =
            Self::resolve_signature(headers).ok_or(WebhookRejection::MissingSignature)?;
        let timestamp =
            Self::resolve_timestamp(headers).ok_or(WebhookRejection::MissingTimestamp)?;

        if (now_ts() - timestamp).abs() > self.replay_window_s {
            return Err(WebhookRejection::OutsideReplayWindow);
        }

        let expected = Self::sign(secret, timestamp, body);
        let matches = expected
            .as_bytes()
            .ct_eq(signature.trim().as_bytes())
            .unwrap_u8()
            == 1;
        if !matches {
            return Err(WebhookRejection::InvalidSignature);
        }

        if !event_id.is_empty() {
            let mut dedupe = self.dedupe.lock();
            dedupe.0.insert(event_id.to_owned());
            dedupe.1.push_back(event_id.to_owned());
            while dedupe.1.len() > MAX_DEDUPE {
                if let Some(old) = dedupe.1.pop_front() {
                    dedupe.0.remove(&old);
                }
            }
        }
        Ok(())
    }
}
