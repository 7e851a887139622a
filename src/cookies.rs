use crate::error::AppError;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

const REFRESH_EVERY: Duration = Duration::from_secs(12 * 60 * 60);

/// Regenerates the Netscape cookie jar that yt-dlp reads for authenticated
/// requests, by running a deployment-provided command (typically an export
/// from a logged-in browser profile on the host).
#[derive(Clone)]
pub struct CookieRefresher {
    command: Option<String>,
}

impl CookieRefresher {
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }

    pub async fn refresh(&self) -> Result<(), AppError> {
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| AppError::Config("COOKIE_REFRESH_COMMAND is not set".into()))?;

        info!(event = "cookie_refresh_start");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(AppError::Io)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(event = "cookie_refresh_failed", stderr = %stderr.trim());
            return Err(AppError::Internal(format!(
                "cookie refresh exited with {}",
                output.status
            )));
        }
        info!(event = "cookie_refresh_done");
        Ok(())
    }

    /// Spawns the 12-hour refresh loop. No-op handle when unconfigured.
    pub fn spawn_periodic(&self) -> tokio::task::JoinHandle<()> {
        let refresher = self.clone();
        tokio::spawn(async move {
            if !refresher.is_configured() {
                return;
            }
            let mut ticker = tokio::time::interval(REFRESH_EVERY);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(err) = refresher.refresh().await {
                    error!(event = "scheduled_cookie_refresh_failed", error = %err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refresh_without_a_command_is_a_config_error() {
        let refresher = CookieRefresher::new(None);
        assert!(matches!(refresher.refresh().await, Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn refresh_runs_the_configured_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("cookies.txt");
        let refresher =
            CookieRefresher::new(Some(format!("touch {}", marker.display())));
        refresher.refresh().await.unwrap();
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn failing_command_surfaces_an_error() {
        let refresher = CookieRefresher::new(Some("exit 3".into()));
        assert!(refresher.refresh().await.is_err());
    }
}
