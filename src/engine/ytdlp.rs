use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};
use tracing::debug;

use super::{Engine, EngineError, MediaKind, MediaMetadata, Quality};

/// Runs the `yt-dlp` executable for every operation.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    duration: Option<serde_json::Number>,
    extractor: Option<String>,
    uploader: Option<String>,
    view_count: Option<u64>,
    url: Option<String>,
    #[serde(default)]
    requested_formats: Vec<YtDlpRequestedFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpRequestedFormat {
    url: Option<String>,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, EngineError> {
        debug!("Running {} {:?}", self.program, args);

        let command_future = Command::new(&self.program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = timeout(self.timeout, command_future)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    EngineError::NotInstalled(self.program.clone())
                } else {
                    EngineError::Spawn(error)
                }
            })?;

        if !output.status.success() {
            return Err(EngineError::Failed(run_error_message(&output.stderr)));
        }

        Ok(output)
    }

    async fn dump_json(&self, args: Vec<String>) -> Result<YtDlpInfo, EngineError> {
        let output = self.run(args).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

#[async_trait]
impl Engine for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata, EngineError> {
        let info = self.dump_json(metadata_args(url)).await?;
        Ok(into_metadata(info))
    }

    async fn resolve_stream_url(
        &self,
        url: &str,
        quality: Quality,
    ) -> Result<String, EngineError> {
        let info = self.dump_json(stream_args(url, quality)).await?;
        stream_url(&info).ok_or(EngineError::MissingStreamUrl)
    }

    async fn download_and_transcode(
        &self,
        url: &str,
        kind: MediaKind,
        quality: Quality,
        output_template: &Path,
    ) -> Result<Option<PathBuf>, EngineError> {
        let output = self
            .run(download_args(url, kind, quality, output_template))
            .await?;
        Ok(extract_printed_path(&output.stdout).map(PathBuf::from))
    }
}

fn base_args() -> Vec<String> {
    vec!["--no-playlist".to_string(), "--no-warnings".to_string()]
}

// `--` ends option parsing, so a url starting with `-` is never read as a flag.
fn push_url(args: &mut Vec<String>, url: &str) {
    args.push("--".to_string());
    args.push(url.to_string());
}

fn metadata_args(url: &str) -> Vec<String> {
    let mut args = base_args();
    args.push("-J".to_string());
    push_url(&mut args, url);
    args
}

fn stream_args(url: &str, quality: Quality) -> Vec<String> {
    let mut args = base_args();
    args.push("-J".to_string());
    args.push("-f".to_string());
    args.push(quality.format_selector());
    push_url(&mut args, url);
    args
}

fn download_args(
    url: &str,
    kind: MediaKind,
    quality: Quality,
    output_template: &Path,
) -> Vec<String> {
    let mut args = base_args();
    args.extend([
        "--newline".to_string(),
        "--no-mtime".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        output_template.to_string_lossy().into_owned(),
    ]);

    match kind {
        MediaKind::Video => {
            args.push("-f".to_string());
            args.push(quality.format_selector());
            args.push("--merge-output-format".to_string());
            args.push("mp4".to_string());
        }
        MediaKind::Audio => {
            args.push("-f".to_string());
            args.push("bestaudio/best".to_string());
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push("192K".to_string());
        }
    }

    push_url(&mut args, url);
    args
}

fn into_metadata(info: YtDlpInfo) -> MediaMetadata {
    MediaMetadata {
        title: info.title.unwrap_or_else(|| "Unknown".to_string()),
        thumbnail: info.thumbnail.unwrap_or_default(),
        duration: info.duration.unwrap_or_else(|| serde_json::Number::from(0u64)),
        platform: info.extractor.unwrap_or_else(|| "Unknown".to_string()),
        uploader: info.uploader.unwrap_or_else(|| "Unknown".to_string()),
        view_count: info.view_count.unwrap_or(0),
    }
}

// A merged video+audio selection has no top-level url; the video leg comes first.
fn stream_url(info: &YtDlpInfo) -> Option<String> {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    non_empty(&info.url).or_else(|| {
        info.requested_formats
            .iter()
            .find_map(|format| non_empty(&format.url))
    })
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

fn extract_printed_path(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_defaults_fill_missing_fields() {
        let info: YtDlpInfo =
            serde_json::from_str(r#"{"title": "Clip", "view_count": null}"#).unwrap();
        let metadata = into_metadata(info);

        assert_eq!(metadata.title, "Clip");
        assert_eq!(metadata.thumbnail, "");
        assert_eq!(metadata.duration, serde_json::Number::from(0u64));
        assert_eq!(metadata.platform, "Unknown");
        assert_eq!(metadata.uploader, "Unknown");
        assert_eq!(metadata.view_count, 0);
    }

    #[test]
    fn metadata_maps_extractor_to_platform() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{
                "title": "Talk",
                "thumbnail": "https://i.ytimg.com/vi/x/hq.jpg",
                "duration": 212.5,
                "extractor": "youtube",
                "uploader": "Someone",
                "view_count": 1234,
                "formats": []
            }"#,
        )
        .unwrap();
        let metadata = into_metadata(info);

        assert_eq!(metadata.platform, "youtube");
        assert_eq!(metadata.duration.as_f64(), Some(212.5));
        assert_eq!(metadata.view_count, 1234);
    }

    #[test]
    fn stream_url_prefers_top_level_url() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{
                "url": "https://cdn/single",
                "requested_formats": [{"url": "https://cdn/video"}]
            }"#,
        )
        .unwrap();
        assert_eq!(stream_url(&info).as_deref(), Some("https://cdn/single"));
    }

    #[test]
    fn stream_url_uses_first_leg_of_merged_selection() {
        let info: YtDlpInfo = serde_json::from_str(
            r#"{
                "requested_formats": [
                    {"url": "https://cdn/video"},
                    {"url": "https://cdn/audio"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(stream_url(&info).as_deref(), Some("https://cdn/video"));
    }

    #[test]
    fn stream_url_missing_everywhere() {
        let info: YtDlpInfo = serde_json::from_str(r#"{"url": "  "}"#).unwrap();
        assert_eq!(stream_url(&info), None);
    }

    #[test]
    fn audio_download_transcodes_to_mp3() {
        let args = download_args(
            "https://youtu.be/x",
            MediaKind::Audio,
            Quality::Best,
            Path::new("/tmp/audio_1_ab.%(ext)s"),
        );

        assert!(args.windows(2).any(|pair| pair == ["--audio-format", "mp3"]));
        assert!(args.windows(2).any(|pair| pair == ["-o", "/tmp/audio_1_ab.%(ext)s"]));
        assert!(args.windows(2).any(|pair| pair == ["-f", "bestaudio/best"]));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/x"));
    }

    #[test]
    fn video_download_merges_into_mp4_with_ceiling() {
        let args = download_args(
            "https://youtu.be/x",
            MediaKind::Video,
            Quality::MaxHeight(720),
            Path::new("/tmp/video_1_ab.%(ext)s"),
        );

        assert!(args.windows(2).any(|pair| pair == ["--merge-output-format", "mp4"]));
        assert!(args.windows(2).any(|pair| {
            pair == ["-f", "bestvideo[height<=720]+bestaudio/best[height<=720]/best"]
        }));
        assert!(!args.iter().any(|arg| arg == "-x"));
    }

    #[test]
    fn stream_args_use_selector() {
        let args = stream_args("https://youtu.be/x", Quality::MaxHeight(480));
        assert!(args.contains(&"-J".to_string()));
        assert!(
            args.contains(&"bestvideo[height<=480]+bestaudio/best[height<=480]/best".to_string())
        );
    }

    #[test]
    fn url_always_follows_end_of_options() {
        let url = "--exec=rm -rf ~";
        let all_args = [
            metadata_args(url),
            stream_args(url, Quality::Best),
            download_args(url, MediaKind::Video, Quality::Best, Path::new("/tmp/x.%(ext)s")),
        ];

        for args in all_args {
            assert_eq!(&args[args.len() - 2..], ["--", url]);
        }
    }

    #[test]
    fn downloads_keep_local_modification_time() {
        for kind in [MediaKind::Audio, MediaKind::Video] {
            let args = download_args(
                "https://youtu.be/x",
                kind,
                Quality::Best,
                Path::new("/tmp/x.%(ext)s"),
            );
            assert!(args.contains(&"--no-mtime".to_string()));
        }
    }

    #[test]
    fn integer_duration_stays_an_integer() {
        let info: YtDlpInfo = serde_json::from_str(r#"{"duration": 596}"#).unwrap();
        let metadata = into_metadata(info);

        assert_eq!(metadata.duration.as_u64(), Some(596));
        assert_eq!(serde_json::to_string(&metadata.duration).unwrap(), "596");
    }

    #[test]
    fn error_message_is_last_stderr_line() {
        let stderr = b"WARNING: something\nERROR: [generic] Unsupported URL: https://x\n\n";
        assert_eq!(
            run_error_message(stderr),
            "ERROR: [generic] Unsupported URL: https://x"
        );
        assert_eq!(run_error_message(b""), "yt-dlp could not complete the operation");
    }

    #[test]
    fn printed_path_is_last_stdout_line() {
        let stdout = b"[download] 100%\n/tmp/video_1_ab.mp4\n";
        assert_eq!(
            extract_printed_path(stdout).as_deref(),
            Some("/tmp/video_1_ab.mp4")
        );
        assert_eq!(extract_printed_path(b"\n"), None);
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_not_installed() {
        let engine = YtDlp::new("vidget-test-missing-yt-dlp", Duration::from_secs(5));
        let error = engine.fetch_metadata("https://youtu.be/x").await.unwrap_err();
        assert!(matches!(error, EngineError::NotInstalled(_)));
    }
}
