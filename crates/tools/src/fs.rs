//! File tools: read, write, edit, list — plus the workspace path
//! restriction shared with the patch tool.

use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use crate::Tool;

/// Resolve a user-supplied path. Relative paths resolve against
/// `allowed_dir` (or the process cwd when unrestricted); when `allowed_dir`
/// is set the resolved path must equal it or live beneath it.
pub fn resolve_path(raw: &str, allowed_dir: Option<&Path>) -> Result<PathBuf, String> {
    let candidate = Path::new(raw);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        match allowed_dir {
            Some(dir) => dir.join(candidate),
            None => std::env::current_dir()
                .map_err(|e| format!("cannot resolve cwd: {e}"))?
                .join(candidate),
        }
    };
    let normalized = normalize_lexical(&joined);

    if let Some(dir) = allowed_dir {
        let root = normalize_lexical(dir);
        if normalized != root && !normalized.starts_with(&root) {
            return Err(format!(
                "path '{raw}' is outside the allowed workspace directory"
            ));
        }
    }
    Ok(normalized)
}

/// Lexically normalize a path, collapsing `.` and `..` components. Works on
/// paths that do not exist yet.
pub(crate) fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// read_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReadFileTool {
    allowed_dir: Option<PathBuf>,
}

impl ReadFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Read a text file and return its contents."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to read"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value) -> String {
        let raw = params.get("path").and_then(Value::as_str).unwrap_or("");
        let path = match resolve_path(raw, self.allowed_dir.as_deref()) {
            Ok(path) => path,
            Err(e) => return format!("Error: {e}"),
        };
        match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => format!("Error reading {raw}: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// write_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WriteFileTool {
    allowed_dir: Option<PathBuf>,
}

impl WriteFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Write content to a file, creating parent directories as needed."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to write"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, params: Value) -> String {
        let raw = params.get("path").and_then(Value::as_str).unwrap_or("");
        let content = params.get("content").and_then(Value::as_str).unwrap_or("");
        let path = match resolve_path(raw, self.allowed_dir.as_deref()) {
            Ok(path) => path,
            Err(e) => return format!("Error: {e}"),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return format!("Error writing {raw}: {e}");
            }
        }
        match std::fs::write(&path, content) {
            Ok(()) => format!("Wrote {} bytes to {raw}", content.len()),
            Err(e) => format!("Error writing {raw}: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// edit_file
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace an exact, unique occurrence of `old_text` with `new_text`.
pub struct EditFileTool {
    allowed_dir: Option<PathBuf>,
}

impl EditFileTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait::async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replace an exact text occurrence in a file. The old text must match exactly once."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path to edit"},
                "old_text": {"type": "string", "description": "Exact text to replace"},
                "new_text": {"type": "string", "description": "Replacement text"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    async fn execute(&self, params: Value) -> String {
        let raw = params.get("path").and_then(Value::as_str).unwrap_or("");
        let old_text = params.get("old_text").and_then(Value::as_str).unwrap_or("");
        let new_text = params.get("new_text").and_then(Value::as_str).unwrap_or("");
        if old_text.is_empty() {
            return "Error: old_text must not be empty".into();
        }
        let path = match resolve_path(raw, self.allowed_dir.as_deref()) {
            Ok(path) => path,
            Err(e) => return format!("Error: {e}"),
        };
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => return format!("Error reading {raw}: {e}"),
        };

        let matches = content.matches(old_text).count();
        if matches == 0 {
            return format!("Error: old_text not found in {raw}");
        }
        if matches > 1 {
            return format!(
                "Error: old_text matches {matches} times in {raw}; add more context"
            );
        }
        let updated = content.replacen(old_text, new_text, 1);
        match std::fs::write(&path, updated) {
            Ok(()) => format!("Edited {raw}"),
            Err(e) => format!("Error writing {raw}: {e}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list_dir
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ListDirTool {
    allowed_dir: Option<PathBuf>,
}

impl ListDirTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }
}

#[async_trait::async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "List the entries of a directory."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path to list"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value) -> String {
        let raw = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let path = match resolve_path(raw, self.allowed_dir.as_deref()) {
            Ok(path) => path,
            Err(e) => return format!("Error: {e}"),
        };
        let entries = match std::fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) => return format!("Error listing {raw}: {e}"),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| {
                let mut name = entry.file_name().to_string_lossy().into_owned();
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    name.push('/');
                }
                name
            })
            .collect();
        names.sort();
        if names.is_empty() {
            "(empty)".into()
        } else {
            names.join("\n")
        }
    }
}
