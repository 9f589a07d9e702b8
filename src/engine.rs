//! Extraction engine adapter.
//!
//! The engine is an external collaborator: it resolves a page URL into
//! metadata or a playable stream, and performs download + transcode into the
//! scratch directory. Handlers only ever talk to it through [`Engine`].

mod ytdlp;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use ytdlp::YtDlp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Accepts `audio` / `video` in any case; an empty value means video.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Attachment name used when serving a finished download.
    pub fn download_name(self) -> &'static str {
        match self {
            Self::Video => "download.mp4",
            Self::Audio => "download.mp3",
        }
    }
}

/// Height ceiling used to pick a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    MaxHeight(u32),
}

impl Quality {
    /// Parses `best`, `720` or `720p`. Zero and non-numeric values are rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        if value == "best" {
            return Some(Self::Best);
        }

        let digits = value.strip_suffix('p').unwrap_or(&value);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Some(Self::MaxHeight(height)),
            _ => None,
        }
    }

    /// yt-dlp format selector. The trailing `/best` falls back to the best
    /// overall stream when nothing fits under the ceiling.
    pub fn format_selector(self) -> String {
        match self {
            Self::Best => "bestvideo+bestaudio/best".to_string(),
            Self::MaxHeight(height) => {
                format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]/best")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMetadata {
    pub title: String,
    pub thumbnail: String,
    /// Seconds, passed through as the engine reported it (integer or float).
    pub duration: serde_json::Number,
    pub platform: String,
    pub uploader: String,
    pub view_count: u64,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0} is not installed on this system")]
    NotInstalled(String),
    #[error("failed to run the extraction engine: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("extraction engine timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
    #[error("could not parse extraction engine output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no stream URL available for this media")]
    MissingStreamUrl,
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, EngineError>;

    async fn resolve_stream_url(&self, url: &str, quality: Quality) -> Result<String, EngineError>;

    /// Downloads into `output_template` (a path ending in `.%(ext)s`) and
    /// returns the final path when the engine reports one. The extension is
    /// chosen by the engine, so callers locate the file by prefix.
    async fn download_and_transcode(
        &self,
        url: &str,
        kind: MediaKind,
        quality: Quality,
        output_template: &Path,
    ) -> Result<Option<PathBuf>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_accepts_heights_and_best() {
        assert_eq!(Quality::parse("best"), Some(Quality::Best));
        assert_eq!(Quality::parse(" BEST "), Some(Quality::Best));
        assert_eq!(Quality::parse("720"), Some(Quality::MaxHeight(720)));
        assert_eq!(Quality::parse("1080p"), Some(Quality::MaxHeight(1080)));
    }

    #[test]
    fn quality_rejects_malformed_values() {
        assert_eq!(Quality::parse("0"), None);
        assert_eq!(Quality::parse("-240"), None);
        assert_eq!(Quality::parse("hd"), None);
        assert_eq!(Quality::parse("480]+worst"), None);
        assert_eq!(Quality::parse(""), None);
    }

    #[test]
    fn low_ceiling_still_falls_back_to_best_overall() {
        let selector = Quality::MaxHeight(240).format_selector();
        assert_eq!(
            selector,
            "bestvideo[height<=240]+bestaudio/best[height<=240]/best"
        );
        assert!(selector.ends_with("/best"));
    }

    #[test]
    fn media_kind_parsing_and_names() {
        assert_eq!(MediaKind::parse(""), Some(MediaKind::Video));
        assert_eq!(MediaKind::parse("Audio"), Some(MediaKind::Audio));
        assert_eq!(MediaKind::parse("gif"), None);
        assert_eq!(MediaKind::Audio.download_name(), "download.mp3");
        assert_eq!(MediaKind::Video.download_name(), "download.mp4");
    }
}
