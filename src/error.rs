use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Teloxide request error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Lock store error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("yt-dlp execution failed: {0}")]
    YtDlp(String),

    #[error("File not found after download: {0}")]
    FileNotFound(String),

    #[error("Upload to storage failed: {0}")]
    Upload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Maps known yt-dlp failure text to a user-facing hint. Generic failures get none.
pub fn hint_for_ytdlp_error(stderr: &str) -> Option<&'static str> {
    let lower = stderr.to_lowercase();
    if lower.contains("private video") {
        Some("This video is private and cannot be downloaded.")
    } else if lower.contains("members-only") || lower.contains("join this channel") {
        Some("This video is members-only and cannot be downloaded.")
    } else if lower.contains("copyright") {
        Some("This video is unavailable due to a copyright claim.")
    } else if lower.contains("unable to download webpage") || lower.contains("failed to resolve") {
        Some("The video page could not be reached. Check the link and try again.")
    } else {
        None
    }
}
