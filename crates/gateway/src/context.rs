//! Prompt context assembly.
//!
//! The static system prompt (identity, workspace paths, bootstrap files,
//! memory, skills) is kept separate from the dynamic system message
//! (timestamp, channel, chat id) so providers can cache the static portion.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::Utc;

use courier_domain::tool::{ChatMessage, ContentPart, ImageUrl};

const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

/// One discovered workspace skill.
#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub always: bool,
}

pub struct ContextBuilder {
    workspace: PathBuf,
    supports_vision: bool,
}

impl ContextBuilder {
    pub fn new(workspace: &Path, supports_vision: bool) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            supports_vision,
        }
    }

    // ── Static system prompt (cacheable) ───────────────────────────

    pub fn build_system_prompt(&self) -> String {
        let mut parts = vec![self.static_identity()];

        if let Some(onboarding) = self.load_onboarding() {
            parts.push(onboarding);
        }
        if let Some(bootstrap) = self.load_bootstrap_files() {
            parts.push(bootstrap);
        }
        if let Some(memory) = self.memory_context() {
            parts.push(format!("# Memory\n\n{memory}"));
        }

        let skills = self.discover_skills();
        let always: Vec<&Skill> = skills.iter().filter(|s| s.always).collect();
        if !always.is_empty() {
            let mut section = String::from("# Active Skills\n");
            for skill in always {
                if let Ok(content) = fs::read_to_string(&skill.path) {
                    section.push_str(&format!("\n## {}\n\n{content}\n", skill.name));
                }
            }
            parts.push(section);
        }
        if let Some(summary) = self.skills_summary(&skills) {
            parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. To use a skill, read its \
                 SKILL.md file using the read_file tool.\n\n{summary}"
            ));
        }

        parts.join("\n\n---\n\n")
    }

    fn static_identity(&self) -> String {
        let workspace_path = self.workspace.display();
        format!(
            "# courier\n\n\
             You are courier, a helpful AI assistant. You have access to tools that allow you to:\n\
             - Read, write, and edit files\n\
             - Execute shell commands\n\
             - Apply structured patches across multiple files\n\
             - Send messages to users on chat channels\n\
             - Interpret image attachments when available\n\n\
             ## Workspace\n\
             Your workspace is at: {workspace_path}\n\
             - Memory files: {workspace_path}/memory/MEMORY.md\n\
             - Daily notes: {workspace_path}/memory/YYYY-MM-DD.md\n\
             - Custom skills: {workspace_path}/skills/{{skill-name}}/SKILL.md\n\n\
             IMPORTANT: When responding to direct questions or conversations, reply directly \
             with your text response.\n\
             Only use the 'message' tool when you need to send a message to a specific chat \
             channel. For normal conversation, just respond with text - do not call the \
             message tool.\n\n\
             Always be helpful, accurate, and concise. When using tools, explain what you're \
             doing.\n\
             When remembering something, write to {workspace_path}/memory/MEMORY.md"
        )
    }

    fn load_onboarding(&self) -> Option<String> {
        let path = self.workspace.join("BOOTSTRAP.md");
        let content = fs::read_to_string(path).ok()?;
        Some(format!(
            "## BOOTSTRAP.md (FIRST-RUN ONBOARDING — HIGH PRIORITY)\n\n{content}"
        ))
    }

    fn load_bootstrap_files(&self) -> Option<String> {
        let mut parts = Vec::new();
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if let Ok(content) = fs::read_to_string(&path) {
                parts.push(format!("## {filename}\n\n{content}"));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    /// MEMORY.md plus today's daily note, when present.
    fn memory_context(&self) -> Option<String> {
        let memory_dir = self.workspace.join("memory");
        let mut parts = Vec::new();
        if let Ok(content) = fs::read_to_string(memory_dir.join("MEMORY.md")) {
            if !content.trim().is_empty() {
                parts.push(content.trim().to_owned());
            }
        }
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if let Ok(content) = fs::read_to_string(memory_dir.join(format!("{today}.md"))) {
            if !content.trim().is_empty() {
                parts.push(format!("## Today ({today})\n\n{}", content.trim()));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    // ── Skills ─────────────────────────────────────────────────────

    pub fn discover_skills(&self) -> Vec<Skill> {
        let skills_dir = self.workspace.join("skills");
        let entries = match fs::read_dir(&skills_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut skills: Vec<Skill> = entries
            .flatten()
            .filter_map(|entry| {
                let dir = entry.path();
                if !dir.is_dir() {
                    return None;
                }
                let path = dir.join("SKILL.md");
                let content = fs::read_to_string(&path).ok()?;
                let name = dir.file_name()?.to_string_lossy().into_owned();
                let (description, always) = parse_skill_frontmatter(&content);
                Some(Skill {
                    name,
                    description,
                    path,
                    always,
                })
            })
            .collect();
        skills.sort_by(|a, b| a.name.cmp(&b.name));
        skills
    }

    fn skills_summary(&self, skills: &[Skill]) -> Option<String> {
        if skills.is_empty() {
            return None;
        }
        let lines: Vec<String> = skills
            .iter()
            .map(|skill| {
                let description = if skill.description.is_empty() {
                    "(no description)"
                } else {
                    &skill.description
                };
                format!("- {}: {} ({})", skill.name, description, skill.path.display())
            })
            .collect();
        Some(lines.join("\n"))
    }

    // ── Dynamic context ────────────────────────────────────────────

    fn dynamic_context(&self, channel: &str, chat_id: &str) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M (%A)");
        let mut parts = vec![format!("Current time: {now}")];
        if !channel.is_empty() && !chat_id.is_empty() {
            parts.push(format!("Channel: {channel}"));
            parts.push(format!("Chat ID: {chat_id}"));
        }
        parts.join("\n")
    }

    // ── Message assembly ───────────────────────────────────────────

    /// Build the full message list for one LLM call: static system prompt,
    /// dynamic system message, history, then the current user content.
    pub fn build_messages(
        &self,
        history: &[(String, String)],
        current_message: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 3);
        messages.push(ChatMessage::system(self.build_system_prompt()));
        messages.push(ChatMessage::system(self.dynamic_context(channel, chat_id)));

        for (role, content) in history {
            let msg = match role.as_str() {
                "assistant" => ChatMessage::assistant(content.clone()),
                "system" => ChatMessage::system(content.clone()),
                _ => ChatMessage::user(content.clone()),
            };
            messages.push(msg);
        }

        messages.push(self.user_content(current_message, media));
        messages
    }

    /// Current user content; image attachments become data-URL parts when
    /// the model supports vision.
    fn user_content(&self, text: &str, media: &[String]) -> ChatMessage {
        if media.is_empty() || !self.supports_vision {
            return ChatMessage::user(text);
        }

        let mut parts = Vec::new();
        for raw in media {
            let path = Path::new(raw);
            let mime = match image_mime(path) {
                Some(mime) => mime,
                None => continue,
            };
            let bytes = match fs::read(path) {
                Ok(bytes) => bytes,
                Err(_) => continue,
            };
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{mime};base64,{}", B64.encode(&bytes)),
                },
            });
        }
        if parts.is_empty() {
            return ChatMessage::user(text);
        }
        parts.push(ContentPart::Text { text: text.into() });
        ChatMessage::user_parts(parts)
    }
}

fn image_mime(path: &Path) -> Option<&'static str> {
    match path
        .extension()?
        .to_str()?
        .to_ascii_lowercase()
        .as_str()
    {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}

/// Minimal frontmatter scan: `description:` and `always:` keys between the
/// leading `---` fence.
fn parse_skill_frontmatter(content: &str) -> (String, bool) {
    let mut description = String::new();
    let mut always = false;
    let mut lines = content.lines();
    if lines.next().map(str::trim) != Some("---") {
        return (description, always);
    }
    for line in lines {
        let line = line.trim();
        if line == "---" {
            break;
        }
        if let Some(value) = line.strip_prefix("description:") {
            description = value.trim().to_owned();
        } else if let Some(value) = line.strip_prefix("always:") {
            always = matches!(value.trim(), "true" | "yes");
        }
    }
    (description, always)
}
