//! Structured multi-file patch tool.
//!
//! Accepts one text block between `*** Begin Patch` and `*** End Patch`
//! containing Add/Delete/Update operations. Update hunks splice in at the
//! unique position where their context+removed lines match; zero or multiple
//! matches are errors.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::fs::resolve_path;
use crate::Tool;

const BEGIN_MARKER: &str = "*** Begin Patch";
const END_MARKER: &str = "*** End Patch";
const ADD_PREFIX: &str = "*** Add File: ";
const DELETE_PREFIX: &str = "*** Delete File: ";
const UPDATE_PREFIX: &str = "*** Update File: ";
const MOVE_PREFIX: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkKind {
    Context,
    Add,
    Remove,
}

#[derive(Debug, Clone)]
struct HunkLine {
    kind: HunkKind,
    text: String,
}

#[derive(Debug)]
enum PatchOp {
    Add {
        path: String,
        lines: Vec<String>,
    },
    Delete {
        path: String,
    },
    Update {
        path: String,
        move_to: Option<String>,
        hunks: Vec<Vec<HunkLine>>,
    },
}

pub struct ApplyPatchTool {
    allowed_dir: Option<PathBuf>,
}

impl ApplyPatchTool {
    pub fn new(allowed_dir: Option<PathBuf>) -> Self {
        Self { allowed_dir }
    }

    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        resolve_path(raw, self.allowed_dir.as_deref())
    }

    fn parse(patch: &str) -> Result<Vec<PatchOp>, String> {
        let normalized = patch.replace("\r\n", "\n").replace('\r', "\n");
        let lines: Vec<&str> = normalized.lines().collect();
        if lines.first() != Some(&BEGIN_MARKER) {
            return Err(format!("Patch must start with '{BEGIN_MARKER}'."));
        }
        if lines.last() != Some(&END_MARKER) {
            return Err(format!("Patch must end with '{END_MARKER}'."));
        }

        let mut ops = Vec::new();
        let end = lines.len() - 1;
        let mut index = 1;

        while index < end {
            let line = lines[index];
            if line.trim().is_empty() {
                index += 1;
                continue;
            }

            if let Some(path) = line.strip_prefix(ADD_PREFIX) {
                let path = path.trim().to_owned();
                if path.is_empty() {
                    return Err("Add operation requires a file path.".into());
                }
                index += 1;
                let mut add_lines = Vec::new();
                while index < end && !lines[index].starts_with("*** ") {
                    let raw = lines[index];
                    match raw.strip_prefix('+') {
                        Some(content) => add_lines.push(content.to_owned()),
                        None => {
                            return Err(format!(
                                "Add operation for '{path}' expects '+' lines, got: {raw:?}"
                            ));
                        }
                    }
                    index += 1;
                }
                if add_lines.is_empty() {
                    return Err(format!(
                        "Add operation for '{path}' must include at least one line."
                    ));
                }
                ops.push(PatchOp::Add {
                    path,
                    lines: add_lines,
                });
                continue;
            }

            if let Some(path) = line.strip_prefix(DELETE_PREFIX) {
                let path = path.trim().to_owned();
                if path.is_empty() {
                    return Err("Delete operation requires a file path.".into());
                }
                ops.push(PatchOp::Delete { path });
                index += 1;
                continue;
            }

            if let Some(path) = line.strip_prefix(UPDATE_PREFIX) {
                let path = path.trim().to_owned();
                if path.is_empty() {
                    return Err("Update operation requires a file path.".into());
                }
                index += 1;

                let mut move_to = None;
                if index < end {
                    if let Some(target) = lines[index].strip_prefix(MOVE_PREFIX) {
                        let target = target.trim().to_owned();
                        if target.is_empty() {
                            return Err(format!(
                                "Update operation for '{path}' has an empty move target."
                            ));
                        }
                        move_to = Some(target);
                        index += 1;
                    }
                }

                let mut hunks: Vec<Vec<HunkLine>> = Vec::new();
                let mut current: Vec<HunkLine> = Vec::new();
                let mut has_change = false;
                while index < end {
                    let raw = lines[index];
                    if raw == END_MARKER
                        || raw.starts_with(ADD_PREFIX)
                        || raw.starts_with(DELETE_PREFIX)
                        || raw.starts_with(UPDATE_PREFIX)
                    {
                        break;
                    }
                    if raw.starts_with("@@") {
                        if !current.is_empty() {
                            hunks.push(std::mem::take(&mut current));
                        }
                        index += 1;
                        continue;
                    }
                    if raw == EOF_MARKER {
                        index += 1;
                        continue;
                    }
                    let kind = match raw.chars().next() {
                        Some(' ') => HunkKind::Context,
                        Some('+') => HunkKind::Add,
                        Some('-') => HunkKind::Remove,
                        _ => {
                            return Err(format!(
                                "Update operation for '{path}' has invalid hunk line: {raw:?}"
                            ));
                        }
                    };
                    if kind != HunkKind::Context {
                        has_change = true;
                    }
                    current.push(HunkLine {
                        kind,
                        text: raw[1..].to_owned(),
                    });
                    index += 1;
                }
                if !current.is_empty() {
                    hunks.push(current);
                }
                if hunks.is_empty() && move_to.is_none() {
                    return Err(format!("Update operation for '{path}' has no hunks."));
                }
                if !hunks.is_empty() && !has_change {
                    return Err(format!("Update operation for '{path}' has no changes."));
                }
                ops.push(PatchOp::Update {
                    path,
                    move_to,
                    hunks,
                });
                continue;
            }

            return Err(format!("Unknown patch operation line: {line:?}"));
        }

        if ops.is_empty() {
            return Err("Patch contains no operations.".into());
        }
        Ok(ops)
    }

    fn apply_hunk(
        lines: Vec<String>,
        hunk: &[HunkLine],
        display_path: &str,
    ) -> Result<Vec<String>, String> {
        let old_lines: Vec<&str> = hunk
            .iter()
            .filter(|l| matches!(l.kind, HunkKind::Context | HunkKind::Remove))
            .map(|l| l.text.as_str())
            .collect();
        let new_lines: Vec<String> = hunk
            .iter()
            .filter(|l| matches!(l.kind, HunkKind::Context | HunkKind::Add))
            .map(|l| l.text.clone())
            .collect();
        let has_change = hunk
            .iter()
            .any(|l| matches!(l.kind, HunkKind::Add | HunkKind::Remove));

        if !has_change {
            return Err(format!("Hunk for '{display_path}' has no changes."));
        }
        if old_lines.is_empty() {
            return Err(format!(
                "Hunk for '{display_path}' has no match context; include context or removed lines."
            ));
        }

        let width = old_lines.len();
        let mut matches = Vec::new();
        if lines.len() >= width {
            for i in 0..=(lines.len() - width) {
                if lines[i..i + width]
                    .iter()
                    .map(String::as_str)
                    .eq(old_lines.iter().copied())
                {
                    matches.push(i);
                    if matches.len() > 1 {
                        break;
                    }
                }
            }
        }

        if matches.is_empty() {
            return Err(format!("Hunk did not match target file '{display_path}'."));
        }
        if matches.len() > 1 {
            return Err(format!(
                "Hunk matched multiple regions in '{display_path}'; add more context."
            ));
        }

        let idx = matches[0];
        let mut out = Vec::with_capacity(lines.len() - width + new_lines.len());
        out.extend_from_slice(&lines[..idx]);
        out.extend(new_lines);
        out.extend_from_slice(&lines[idx + width..]);
        Ok(out)
    }

    fn apply_ops(&self, ops: Vec<PatchOp>) -> Result<Vec<String>, String> {
        let mut changes = Vec::new();
        for op in ops {
            match op {
                PatchOp::Add { path, lines } => {
                    let target = self.resolve(&path)?;
                    if target.exists() {
                        return Err(format!("Cannot add '{path}': target already exists."));
                    }
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                    }
                    std::fs::write(&target, lines.join("\n")).map_err(|e| e.to_string())?;
                    changes.push(format!("Added {path}"));
                }
                PatchOp::Delete { path } => {
                    let target = self.resolve(&path)?;
                    if !target.exists() {
                        return Err(format!("Cannot delete '{path}': file does not exist."));
                    }
                    if !target.is_file() {
                        return Err(format!("Cannot delete '{path}': not a file."));
                    }
                    std::fs::remove_file(&target).map_err(|e| e.to_string())?;
                    changes.push(format!("Deleted {path}"));
                }
                PatchOp::Update {
                    path,
                    move_to,
                    hunks,
                } => {
                    let source = self.resolve(&path)?;
                    if !source.exists() {
                        return Err(format!("Cannot update '{path}': file does not exist."));
                    }
                    if !source.is_file() {
                        return Err(format!("Cannot update '{path}': not a file."));
                    }
                    let content = std::fs::read_to_string(&source).map_err(|e| e.to_string())?;
                    let trailing_newline = content.ends_with('\n');
                    let mut lines: Vec<String> =
                        content.lines().map(str::to_owned).collect();
                    for hunk in &hunks {
                        lines = Self::apply_hunk(lines, hunk, &path)?;
                    }
                    let mut updated = lines.join("\n");
                    if trailing_newline && !lines.is_empty() {
                        updated.push('\n');
                    }

                    let target = match &move_to {
                        Some(move_path) => {
                            let target = self.resolve(move_path)?;
                            if target != source && target.exists() {
                                return Err(format!(
                                    "Cannot move '{path}' to '{move_path}': target exists."
                                ));
                            }
                            if let Some(parent) = target.parent() {
                                std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
                            }
                            target
                        }
                        None => source.clone(),
                    };

                    std::fs::write(&target, updated).map_err(|e| e.to_string())?;
                    match move_to {
                        Some(move_path) if target != source => {
                            std::fs::remove_file(&source).map_err(|e| e.to_string())?;
                            changes.push(format!("Updated {path} -> {move_path}"));
                        }
                        _ => changes.push(format!("Updated {path}")),
                    }
                }
            }
        }
        Ok(changes)
    }
}

#[async_trait::async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_patch"
    }

    fn description(&self) -> &str {
        "Apply a structured patch with Add/Delete/Update file operations across multiple files."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "patch": {
                    "type": "string",
                    "description": "Patch text beginning with '*** Begin Patch' and ending with '*** End Patch'."
                }
            },
            "required": ["patch"]
        })
    }

    async fn execute(&self, params: Value) -> String {
        let patch = params.get("patch").and_then(Value::as_str).unwrap_or("");
        let ops = match Self::parse(patch) {
            Ok(ops) => ops,
            Err(e) => return format!("Error: {e}"),
        };
        match self.apply_ops(ops) {
            Ok(changes) => changes.join("\n"),
            Err(e) => format!("Error: {e}"),
        }
    }
}

/// Restrict construction to the workspace for tests.
impl ApplyPatchTool {
    #[cfg(test)]
    fn for_dir(dir: &Path) -> Self {
        Self::new(Some(dir.to_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn apply(tool: &ApplyPatchTool, patch: &str) -> String {
        tool.execute(json!({ "patch": patch })).await
    }

    #[tokio::test]
    async fn add_update_delete_in_one_patch() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("keep.txt"), "alpha\nbeta\n").unwrap();
        std::fs::write(dir.path().join("old.txt"), "legacy\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Add File: new.txt\n\
                     +hello\n\
                     +world\n\
                     *** Update File: keep.txt\n\
                     @@\n \
                     alpha\n\
                     -beta\n\
                     +beta2\n\
                     *** Delete File: old.txt\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;

        assert!(result.contains("Added new.txt"));
        assert!(result.contains("Updated keep.txt"));
        assert!(result.contains("Deleted old.txt"));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("new.txt")).unwrap(),
            "hello\nworld"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(),
            "alpha\nbeta2\n"
        );
        assert!(!dir.path().join("old.txt").exists());
    }

    #[tokio::test]
    async fn ambiguous_hunk_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "x\ny\nx\ny\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n \
                     x\n\
                     -y\n\
                     +z\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("matched multiple regions"));
        // File untouched.
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "x\ny\nx\ny\n"
        );
    }

    #[tokio::test]
    async fn unmatched_hunk_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n \
                     nope\n\
                     -b\n\
                     +c\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("did not match"));
    }

    #[tokio::test]
    async fn pure_context_hunk_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n \
                     a\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("no changes"));
    }

    #[tokio::test]
    async fn add_refuses_existing_target() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("exists.txt"), "x").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Add File: exists.txt\n\
                     +y\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("already exists"));
    }

    #[tokio::test]
    async fn add_then_delete_restores_filesystem() {
        let dir = tempdir().unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let add = "*** Begin Patch\n\
                   *** Add File: temp.txt\n\
                   +data\n\
                   *** End Patch";
        apply(&tool, add).await;
        assert!(dir.path().join("temp.txt").exists());

        let delete = "*** Begin Patch\n\
                      *** Delete File: temp.txt\n\
                      *** End Patch";
        apply(&tool, delete).await;
        assert!(!dir.path().join("temp.txt").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn move_renames_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Update File: a.txt\n\
                     *** Move to: b.txt\n\
                     @@\n\
                     -one\n\
                     +uno\n \
                     two\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("Updated a.txt -> b.txt"));
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.txt")).unwrap(),
            "uno\ntwo\n"
        );
    }

    #[tokio::test]
    async fn crlf_input_is_normalized() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "a\nb\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\r\n\
                     *** Update File: f.txt\r\n\
                     @@\r\n \
                     a\r\n\
                     -b\r\n\
                     +c\r\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert_eq!(result, "Updated f.txt");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "a\nc\n"
        );
    }

    #[tokio::test]
    async fn eof_marker_is_accepted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "last\n").unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Update File: f.txt\n\
                     @@\n\
                     -last\n\
                     +final\n\
                     *** End of File\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert_eq!(result, "Updated f.txt");
    }

    #[tokio::test]
    async fn escaping_workspace_is_rejected() {
        let dir = tempdir().unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());

        let patch = "*** Begin Patch\n\
                     *** Add File: ../escape.txt\n\
                     +x\n\
                     *** End Patch";
        let result = apply(&tool, patch).await;
        assert!(result.contains("outside the allowed workspace"));
    }

    #[tokio::test]
    async fn missing_envelope_is_rejected() {
        let dir = tempdir().unwrap();
        let tool = ApplyPatchTool::for_dir(dir.path());
        let result = apply(&tool, "*** Add File: x.txt\n+y").await;
        assert!(result.contains("must start with"));
    }
}
