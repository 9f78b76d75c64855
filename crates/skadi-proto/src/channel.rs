use serde::{Deserialize, Serialize};
use std::fmt;

/// A tracked live-stream channel.  Identity is the channel name; two channels
/// with the same name are the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel {
    name: String,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name as the remote platform API expects it in paths.
    pub fn api_name(&self) -> String {
        self.name.to_lowercase()
    }

    /// Canonical channel page URL, handed to the external player.
    pub fn build_url(&self, base: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), self.name)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One playable rendition of a stream.
///
/// `label` is what a user sees ("720p60", "1080p60 (source)"), `quality` is the
/// token passed to the external player on its command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamQuality {
    pub label: String,
    pub quality: String,
    /// Variant playlist URI, when parsed from a master playlist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

impl StreamQuality {
    pub fn new(label: impl Into<String>, quality: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            quality: quality.into(),
            uri: None,
        }
    }

    /// A quality chosen by the user by its player token alone ("best", "720p").
    pub fn from_token(token: &str) -> Self {
        Self::new(token, token)
    }

    /// The player's symbolic selector for the highest available rendition.
    pub fn best() -> Self {
        Self::from_token("best")
    }

    /// The player's symbolic selector for the lowest available rendition.
    pub fn worst() -> Self {
        Self::from_token("worst")
    }
}

impl fmt::Display for StreamQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
