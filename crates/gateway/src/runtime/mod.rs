//! The agent runtime: per-session run scheduling, the dialog loop, and
//! compaction.
//!
//! Entry point: [`AgentLoop`]. Inbound messages go through
//! [`AgentLoop::submit_inbound`], which applies the queue policy and spawns
//! one task per run; each run serializes on its session lock, drives the
//! dialog loop, and publishes its full lifecycle on the bus.

pub mod cancel;
mod compact;
mod dialog;
mod scheduler;

pub use scheduler::{AgentLoop, QueueSnapshot, SessionQueue};

/// Preview helper used for steer instructions and log lines.
pub(crate) fn preview(text: &str, max_len: usize) -> String {
    courier_domain::sanitize::truncate_with_marker(text, max_len)
}
