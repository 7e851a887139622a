use crate::{error::AppError, formats::FormatSpec};
use async_trait::async_trait;
use serde::Deserialize;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::Mutex,
};
use tracing::{debug, error, info, trace};

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0";
const PROGRESS_LINES: usize = 6;

/// Metadata reported by a `-J` dry run with the format selector applied.
#[derive(Debug, Default, Deserialize)]
pub struct ProbeInfo {
    pub title: Option<String>,
    pub ext: Option<String>,
    pub duration: Option<f64>,
    pub tbr: Option<f64>,
    pub filesize: Option<u64>,
    pub filesize_approx: Option<u64>,
    #[serde(default)]
    pub requested_formats: Vec<RequestedFormat>,
}

#[derive(Debug, Deserialize)]
pub struct RequestedFormat {
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub tbr: Option<f64>,
}

/// Rolling window over the downloader's progress output, rendered into the
/// single status message.
#[derive(Clone)]
pub struct ProgressState {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(PROGRESS_LINES))),
        }
    }

    pub async fn push_line(&self, line: String) {
        let mut lines = self.lines.lock().await;
        if lines.len() == PROGRESS_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub async fn build_text(&self, title: &Option<String>) -> String {
        let mut text = String::new();
        if let Some(title) = title {
            text.push_str(&format!("Downloading: {title}\n"));
        } else {
            text.push_str("Downloading…\n");
        }

        let lines = self.lines.lock().await;
        for line in lines.iter() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if text.len() + trimmed.len() + 1 > 3800 {
                break;
            }
            text.push_str(trimmed);
            text.push('\n');
        }
        text
    }
}

#[derive(Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub spec: &'static FormatSpec,
    /// Absolute path prefix of this attempt; the output template is
    /// `<prefix>.%(ext)s` and every artifact shares the prefix.
    pub output_prefix: PathBuf,
    pub progress: ProgressState,
}

#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn probe(&self, url: &str, selector: &str) -> Result<ProbeInfo, AppError>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, req: DownloadRequest) -> Result<(), AppError>;
}

/// Shells out to the `yt-dlp` binary.
#[derive(Clone, Default)]
pub struct YtDlpClient {
    cookie_file: Option<PathBuf>,
}

impl YtDlpClient {
    pub fn new(cookie_file: Option<PathBuf>) -> Self {
        Self { cookie_file }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new("yt-dlp");
        cmd.arg("--no-playlist").arg("--user-agent").arg(USER_AGENT);
        if let Some(cookie_file) = &self.cookie_file {
            cmd.arg("--cookies").arg(cookie_file);
        }
        debug!(event = "yt_dlp_command_ready");
        cmd
    }
}

#[async_trait]
impl MediaProvider for YtDlpClient {
    async fn probe(&self, url: &str, selector: &str) -> Result<ProbeInfo, AppError> {
        info!(event = "probe_start", url = %url, selector = %selector);
        let mut cmd = self.base_command();
        cmd.arg("-J").arg("-f").arg(selector).arg(url);
        let output = cmd.output().await.map_err(AppError::Io)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                event = "probe_failed",
                status = %output.status,
                stderr = %stderr.trim()
            );
            return Err(AppError::YtDlp(stderr.trim().to_string()));
        }

        let info: ProbeInfo = serde_json::from_slice(&output.stdout).map_err(AppError::Json)?;
        info!(event = "probe_success", title = ?info.title);
        Ok(info)
    }
}

#[async_trait]
impl Downloader for YtDlpClient {
    async fn download(&self, req: DownloadRequest) -> Result<(), AppError> {
        info!(
            event = "download_start",
            url = %req.url,
            format = %req.spec.key
        );
        let template = output_template(&req.output_prefix);
        let mut cmd = self.base_command();
        cmd.arg("-f")
            .arg(req.spec.selector)
            .arg("-o")
            .arg(&template)
            .arg("--newline")
            .arg("--continue")
            .arg("--http-chunk-size")
            .arg("1M")
            .arg("--buffer-size")
            .arg("16M");
        if req.spec.postprocess {
            cmd.arg("-x").arg("--audio-format").arg(req.spec.container);
        } else {
            cmd.arg("--merge-output-format").arg(req.spec.container);
        }
        cmd.arg(&req.url);

        let mut child = cmd
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(AppError::Io)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Internal("yt-dlp stdout missing".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Internal("yt-dlp stderr missing".into()))?;

        let progress = req.progress.clone();
        let stdout_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                trace!(event = "yt_dlp_progress_line", line = line.as_str());
                progress.push_line(line).await;
            }
        });

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = reader.next_line().await {
                trace!(event = "yt_dlp_stderr_line", line = line.as_str());
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let status = child.wait().await.map_err(AppError::Io)?;
        let _ = stdout_task.await;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            error!(event = "download_failed", status = %status);
            return Err(AppError::YtDlp(stderr_text.trim().to_string()));
        }

        info!(event = "download_complete", format = %req.spec.key);
        Ok(())
    }
}

pub fn output_template(prefix: &Path) -> String {
    format!("{}.%(ext)s", prefix.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_template_appends_ext_placeholder() {
        let template = output_template(Path::new("/tmp/temp_1_20240101"));
        assert_eq!(template, "/tmp/temp_1_20240101.%(ext)s");
    }

    #[test]
    fn probe_info_parses_requested_formats() {
        let raw = r#"{
            "title": "clip",
            "ext": "mp4",
            "duration": 60.0,
            "requested_formats": [
                {"ext": "mp4", "filesize": 1000, "tbr": 900.0},
                {"ext": "m4a", "filesize": 200, "tbr": 128.0}
            ]
        }"#;
        let info: ProbeInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.requested_formats.len(), 2);
        assert_eq!(info.requested_formats[0].filesize, Some(1000));
        assert_eq!(info.duration, Some(60.0));
    }

    #[tokio::test]
    async fn progress_state_keeps_a_rolling_window() {
        let progress = ProgressState::new();
        for i in 0..10 {
            progress.push_line(format!("line {i}")).await;
        }
        let text = progress.build_text(&Some("video".into())).await;
        assert!(text.starts_with("Downloading: video\n"));
        assert!(!text.contains("line 3"));
        assert!(text.contains("line 9"));
    }
}
