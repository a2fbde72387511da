use serde::{Deserialize, Serialize};

/// Maximum length of the commit message kept for labeling.
pub const MESSAGE_LIMIT: usize = 80;

/// Provenance of the acquired application source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Branch, tag or commit the build was made from.
    pub git_ref: String,
    pub commit_id: String,
    pub date: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
    /// First [`MESSAGE_LIMIT`] characters of the commit message.
    pub message: String,
    pub location: String,
    pub context_dir: String,
}

impl SourceInfo {
    /// Provenance for a source without version-control metadata.
    pub fn local(location: &str, context_dir: &str) -> Self {
        Self {
            location: location.to_owned(),
            context_dir: context_dir.to_owned(),
            ..Self::default()
        }
    }

    /// `Name <email>`, or whichever half is known.
    pub fn author(&self) -> String {
        match (self.author_name.is_empty(), self.author_email.is_empty()) {
            (false, false) => format!("{} <{}>", self.author_name, self.author_email),
            (false, true) => self.author_name.clone(),
            (true, false) => format!("<{}>", self.author_email),
            (true, true) => String::new(),
        }
    }

    pub fn set_message(&mut self, message: &str) {
        self.message = truncate_message(message);
    }
}

fn truncate_message(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default().trim();
    first_line.chars().take(MESSAGE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_truncated_to_limit() {
        let mut info = SourceInfo::default();
        info.set_message(&"x".repeat(200));
        assert_eq!(info.message.chars().count(), MESSAGE_LIMIT);
    }

    #[test]
    fn message_keeps_first_line_only() {
        let mut info = SourceInfo::default();
        info.set_message("Fix parser\n\nLonger body here");
        assert_eq!(info.message, "Fix parser");
    }

    #[test]
    fn message_truncation_respects_char_boundaries() {
        let mut info = SourceInfo::default();
        info.set_message(&"é".repeat(100));
        assert_eq!(info.message.chars().count(), MESSAGE_LIMIT);
    }

    #[test]
    fn author_formats() {
        let mut info = SourceInfo {
            author_name: "Ada".to_owned(),
            author_email: "ada@example.com".to_owned(),
            ..SourceInfo::default()
        };
        assert_eq!(info.author(), "Ada <ada@example.com>");
        info.author_email.clear();
        assert_eq!(info.author(), "Ada");
        info.author_name.clear();
        assert_eq!(info.author(), "");
    }

    #[test]
    fn local_info_has_only_location() {
        let info = SourceInfo::local("/src/app", "web");
        assert_eq!(info.location, "/src/app");
        assert_eq!(info.context_dir, "web");
        assert!(info.commit_id.is_empty());
    }
}
