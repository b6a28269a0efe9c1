//! Attachments the model hands back to the user.
//!
//! The model declares deliverables inside an `<attachments>` block, one per
//! line. Lines that look like URLs become [`Attachment::Url`], everything else
//! is treated as a container file path.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Attachment {
    /// A file inside the agent's container (e.g. `/shared/report.pdf`).
    File { path: String },
    /// A remote resource.
    Url { url: String },
}

impl Attachment {
    /// Parse one line of an `<attachments>` block.
    ///
    /// Leading list markers (`-`, `*`) are stripped. Returns `None` for blank
    /// lines.
    pub fn from_line(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        let trimmed = trimmed
            .strip_prefix(['-', '*'])
            .map(str::trim)
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return None;
        }
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Some(Self::Url {
                url: trimmed.to_string(),
            })
        } else {
            Some(Self::File {
                path: trimmed.to_string(),
            })
        }
    }

    /// The path or URL this attachment refers to.
    pub fn target(&self) -> &str {
        match self {
            Self::File { path } => path,
            Self::Url { url } => url,
        }
    }
}
