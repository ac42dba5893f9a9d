use chrono::{DateTime, Local, Locale};
use podserve_protocol::{ChatMessage, Role};

use crate::config::{PromptConfig, TemplatesConfig};

pub const DATE_MARKER: &str = "{DATE}";
pub const SYSTEM_MARKER: &str = "{SYSTEM}";
pub const USER_MARKER: &str = "{USER}";
pub const ASSISTANT_MARKER: &str = "{ASSISTANT}";

const DEFAULT_LOCALE: &str = "en_US";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptTemplate {
    pub id: String,
    pub locale: String,
    pub system: String,
    pub templates: TemplatesConfig,
}

impl PromptTemplate {
    pub fn from_config(id: &str, cfg: &PromptConfig) -> Self {
        Self {
            id: id.to_string(),
            locale: cfg.locale.clone(),
            system: cfg.system.clone(),
            templates: cfg.templates.clone(),
        }
    }

    /// Lower-cased "weekday day month year" in the template's locale.
    pub fn date_text(&self, now: DateTime<Local>) -> String {
        format_date(now, &self.locale)
    }

    /// System template wrapped around `system`, with `{DATE}` filled in.
    pub fn system_block(&self, system: &str, date: &str) -> String {
        let block = fill_or_append(&self.templates.system, SYSTEM_MARKER, system);
        block.replacen(DATE_MARKER, date, 1)
    }

    pub fn user_block(&self, content: &str) -> String {
        fill_or_append(&self.templates.user, USER_MARKER, content)
    }

    pub fn assistant_block(&self, content: &str) -> String {
        fill_or_append(&self.templates.assistant, ASSISTANT_MARKER, content)
    }

    /// Text the model sees right before it starts answering.
    pub fn assistant_prefix(&self) -> &str {
        match self.templates.assistant.find(ASSISTANT_MARKER) {
            Some(cut) => &self.templates.assistant[..cut],
            None => &self.templates.assistant,
        }
    }

    /// Closing marker of an assistant turn, e.g. `<|im_end|>`.
    pub fn assistant_suffix(&self) -> &str {
        match self.templates.assistant.find(ASSISTANT_MARKER) {
            Some(cut) => &self.templates.assistant[cut + ASSISTANT_MARKER.len()..],
            None => "",
        }
    }

    /// Full engine input for a plain job. Existing history replaces the system block.
    pub fn assemble(&self, prompt: &str, history: Option<&str>, date: &str) -> String {
        let head = match history {
            Some(history) if !history.is_empty() => history.to_string(),
            _ => self.system_block(&self.system, date),
        };
        format!("{}{}{}", head, self.user_block(prompt), self.assistant_prefix())
    }

    /// Formats an OpenAI-style message list into a ready-to-run history.
    ///
    /// The last `system` message wins; without one the template's own system text is used.
    /// Messages with unknown roles are skipped.
    pub fn chat_history(&self, messages: &[ChatMessage], date: &str) -> String {
        let mut system: Option<&str> = None;
        let mut turns = String::new();

        for message in messages {
            match message.role {
                Role::System => system = Some(&message.content),
                Role::User => turns.push_str(&self.user_block(&message.content)),
                Role::Assistant => turns.push_str(&self.assistant_block(&message.content)),
                Role::Unknown => {}
            }
        }

        let system = system.unwrap_or(&self.system);
        format!(
            "{}{}{}",
            self.system_block(system, date),
            turns,
            self.assistant_prefix()
        )
    }
}

fn fill_or_append(template: &str, marker: &str, content: &str) -> String {
    if template.contains(marker) {
        template.replacen(marker, content, 1)
    } else {
        format!("{}{}", template, content)
    }
}

pub fn format_date(now: DateTime<Local>, locale: &str) -> String {
    let name = if locale.trim().is_empty() {
        DEFAULT_LOCALE
    } else {
        locale.trim()
    };
    let locale = Locale::try_from(name).unwrap_or_else(|_| {
        tracing::warn!(locale = name, "unknown prompt locale, falling back to en_US");
        Locale::en_US
    });
    now.format_localized("%A %-d %B %Y", locale)
        .to_string()
        .to_lowercase()
}

/// Tokenizers may prepend a space the prompt never had; drop exactly one.
pub fn strip_engine_space(mut raw: String, full_prompt: &str) -> String {
    if !full_prompt.is_empty() && !full_prompt.starts_with(' ') && raw.starts_with(' ') {
        raw.remove(0);
    }
    raw
}

/// The part of `raw` the engine produced beyond the echoed prompt.
///
/// Returns an empty string when nothing new was produced or when the echo does not line up with
/// a character boundary, so callers never see a half-cut prompt.
pub fn visible_output(raw: &str, full_prompt: &str) -> String {
    if raw.len() <= full_prompt.len() {
        return String::new();
    }
    match raw.get(full_prompt.len()..) {
        Some(tail) => tail.trim().to_string(),
        None => String::new(),
    }
}

/// Removes the assistant closing marker from a visible answer.
pub fn strip_marker(visible: String, suffix: &str) -> String {
    let trimmed_suffix = suffix.trim();
    if trimmed_suffix.is_empty() {
        return visible;
    }
    let stripped = visible
        .strip_suffix(suffix)
        .or_else(|| visible.strip_suffix(trimmed_suffix));
    match stripped {
        Some(rest) => rest.trim_end().to_string(),
        None => visible,
    }
}
