//! Workspace scoping and filesystem-safe names.
//!
//! Session files from every workspace share one global sessions directory;
//! a short hash of the absolute workspace path prefixes each file name so
//! workspaces never collide.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Short stable id for a workspace path (12 hex chars of SHA-256).
pub fn workspace_scope_id(workspace: &Path) -> String {
    let canonical = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(&digest[..6])
}

/// Replace filesystem-unsafe characters so a session key can be a file stem.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
