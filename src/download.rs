use crate::{
    error::AppError,
    formats::{self, FormatSpec},
    lock::LockStore,
};
use chrono::Utc;
use regex::Regex;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
    time::Duration,
};
use tracing::{info, warn};

const LOCATE_POLL_ATTEMPTS: u32 = 20;
const LOCATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn video_url_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^https?://(www\.)?(youtube\.com/watch\?v=|youtu\.be/)[\w-]+").unwrap()
    })
}

pub fn is_video_url(text: &str) -> bool {
    video_url_regex().is_match(text.trim())
}

/// Why a format request was refused before any resource was touched.
#[derive(Debug, Eq, PartialEq)]
pub enum GateRefusal {
    NoPendingUrl,
    BadUrl,
    UnknownFormat,
}

impl GateRefusal {
    pub fn user_message(&self) -> &'static str {
        match self {
            GateRefusal::NoPendingUrl => "Send a video link first.",
            GateRefusal::BadUrl => "That link does not look like a supported video URL.",
            GateRefusal::UnknownFormat => "Unsupported format.",
        }
    }
}

/// Validates a format request against the session and the catalog. No lock is
/// taken and no file is created before this passes.
pub fn gate_request(
    pending_url: Option<String>,
    format_key: &str,
) -> Result<(String, &'static FormatSpec), GateRefusal> {
    let spec = formats::lookup(format_key).ok_or(GateRefusal::UnknownFormat)?;
    let url = pending_url.ok_or(GateRefusal::NoPendingUrl)?;
    if !is_video_url(&url) {
        return Err(GateRefusal::BadUrl);
    }
    Ok((url, spec))
}

/// Outcome of gating plus lock acquisition, the first two orchestrator states.
pub enum BeginOutcome {
    Ready {
        attempt: Attempt,
        url: String,
        spec: &'static FormatSpec,
    },
    Contended,
    Refused(GateRefusal),
}

/// Runs Gated → Locked. A refusal or contention leaves no side effects at all:
/// no lock record, no temp files, no downloader call.
pub async fn begin_gated(
    locks: Arc<dyn LockStore>,
    pending_url: Option<String>,
    format_key: &str,
    user_id: u64,
    ttl: Duration,
    workdir: PathBuf,
) -> Result<BeginOutcome, AppError> {
    let (url, spec) = match gate_request(pending_url, format_key) {
        Ok(parts) => parts,
        Err(refusal) => return Ok(BeginOutcome::Refused(refusal)),
    };
    match Attempt::begin(locks, user_id, ttl, workdir).await? {
        Some(attempt) => Ok(BeginOutcome::Ready { attempt, url, spec }),
        None => Ok(BeginOutcome::Contended),
    }
}

/// One download attempt by one user. Holds the per-user lock from `begin` until
/// `finish`, which also sweeps every artifact sharing the attempt's prefix.
pub struct Attempt {
    locks: Arc<dyn LockStore>,
    pub user_id: u64,
    workdir: PathBuf,
    prefix: String,
}

impl Attempt {
    /// Acquires the user's lock and namespaces the attempt in the shared
    /// working directory. `Ok(None)` means another download is running.
    pub async fn begin(
        locks: Arc<dyn LockStore>,
        user_id: u64,
        ttl: Duration,
        workdir: PathBuf,
    ) -> Result<Option<Self>, AppError> {
        if !locks.acquire(user_id, ttl).await? {
            return Ok(None);
        }
        let timestamp = Utc::now().format("%Y%m%d%H%M%S");
        let prefix = format!("temp_{user_id}_{timestamp}");
        info!(event = "attempt_begin", user_id, prefix = %prefix);
        Ok(Some(Self { locks, user_id, workdir, prefix }))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn output_prefix(&self) -> PathBuf {
        self.workdir.join(&self.prefix)
    }

    /// Finds the final output of a completed download.
    ///
    /// Postprocessed formats write `<prefix>.<container>` once the pipeline
    /// finishes, which can lag the downloader exiting, so the path is polled
    /// for a bounded time. Other formats expect the container extension too,
    /// falling back to a prefix scan that skips partial and per-stream
    /// fragment files and picks the newest whole candidate.
    pub async fn locate(&self, spec: &FormatSpec) -> Result<PathBuf, AppError> {
        let expected = self.workdir.join(format!("{}.{}", self.prefix, spec.container));

        if spec.postprocess {
            for _ in 0..LOCATE_POLL_ATTEMPTS {
                if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
                    return Ok(expected);
                }
                tokio::time::sleep(LOCATE_POLL_INTERVAL).await;
            }
            return Err(AppError::FileNotFound(expected.display().to_string()));
        }

        if tokio::fs::try_exists(&expected).await.unwrap_or(false) {
            return Ok(expected);
        }

        let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
        let mut entries = tokio::fs::read_dir(&self.workdir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_whole_artifact(&name, &self.prefix) {
                continue;
            }
            let modified = entry.metadata().await?.modified()?;
            if newest.as_ref().map_or(true, |(when, _)| modified > *when) {
                newest = Some((modified, entry.path()));
            }
        }

        newest
            .map(|(_, path)| path)
            .ok_or_else(|| AppError::FileNotFound(expected.display().to_string()))
    }

    /// The single always-run finalizer: releases the lock and removes every
    /// file sharing the attempt's prefix, whatever state the attempt died in.
    /// Never fails; problems are logged.
    pub async fn finish(self) {
        if let Err(err) = self.locks.release(self.user_id).await {
            warn!(event = "lock_release_failed", user_id = self.user_id, error = %err);
        }

        let entries = match tokio::fs::read_dir(&self.workdir).await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(event = "cleanup_scan_failed", error = %err);
                return;
            }
        };
        let mut entries = entries;
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with(&self.prefix) {
                        continue;
                    }
                    if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                        warn!(event = "cleanup_remove_failed", file = %name, error = %err);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(event = "cleanup_scan_failed", error = %err);
                    break;
                }
            }
        }
        info!(event = "attempt_finished", user_id = self.user_id, prefix = %self.prefix);
    }
}

/// Whether a directory entry is a finished artifact of this attempt, as
/// opposed to a partial download or a per-stream fragment.
pub fn is_whole_artifact(file_name: &str, prefix: &str) -> bool {
    if !file_name.starts_with(prefix) {
        return false;
    }
    if file_name.ends_with(".part") || file_name.ends_with(".ytdl") {
        return false;
    }
    // Per-stream fragments look like `<prefix>.f140.m4a`.
    let rest = &file_name[prefix.len()..];
    let is_fragment = rest.split('.').any(|segment| {
        segment.len() > 1
            && segment.starts_with('f')
            && segment[1..].chars().all(|c| c.is_ascii_digit())
    });
    !is_fragment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::testing::MemoryLockStore;
    use crate::lock::LockStore;

    #[test]
    fn recognizes_video_urls() {
        assert!(is_video_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ"));
        assert!(is_video_url("https://youtu.be/dQw4w9WgXcQ"));
        assert!(is_video_url("http://youtube.com/watch?v=abc_-123"));
        assert!(!is_video_url("https://example.com/watch?v=abc"));
        assert!(!is_video_url("just some text"));
    }

    #[test]
    fn gate_refuses_without_a_session_url() {
        assert_eq!(
            gate_request(None, "720").unwrap_err(),
            GateRefusal::NoPendingUrl
        );
    }

    #[test]
    fn gate_refuses_unknown_format_before_checking_url() {
        assert_eq!(
            gate_request(None, "4320").unwrap_err(),
            GateRefusal::UnknownFormat
        );
    }

    #[test]
    fn gate_passes_a_valid_request() {
        let (url, spec) =
            gate_request(Some("https://youtu.be/abc123".into()), "mp3").unwrap();
        assert_eq!(url, "https://youtu.be/abc123");
        assert_eq!(spec.key, "mp3");
    }

    #[test]
    fn whole_artifact_filter_excludes_partials_and_fragments() {
        assert!(!is_whole_artifact("temp_1.f140.m4a", "temp_1"));
        assert!(!is_whole_artifact("temp_1.part", "temp_1"));
        assert!(!is_whole_artifact("temp_1.mp4.ytdl", "temp_1"));
        assert!(!is_whole_artifact("other_file.mp4", "temp_1"));
        assert!(is_whole_artifact("temp_1.mp4", "temp_1"));
        // an "f" segment that is not a fragment marker stays eligible
        assert!(is_whole_artifact("temp_1.final.mp4", "temp_1"));
    }

    #[tokio::test]
    async fn locate_picks_the_only_whole_candidate() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["temp_probe.f140.m4a", "temp_probe.part", "temp_probe.webm"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let locks = Arc::new(MemoryLockStore::new());
        let attempt = Attempt {
            locks,
            user_id: 1,
            workdir: dir.path().to_path_buf(),
            prefix: "temp_probe".into(),
        };
        let spec = crate::formats::lookup("720").unwrap();
        // no temp_probe.mp4, so the scan must land on the webm
        let found = attempt.locate(spec).await.unwrap();
        assert_eq!(found.file_name().unwrap().to_str().unwrap(), "temp_probe.webm");
    }

    #[tokio::test]
    async fn locate_prefers_the_expected_container_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("temp_probe.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("temp_probe.webm"), b"x").unwrap();

        let attempt = Attempt {
            locks: Arc::new(MemoryLockStore::new()),
            user_id: 1,
            workdir: dir.path().to_path_buf(),
            prefix: "temp_probe".into(),
        };
        let spec = crate::formats::lookup("720").unwrap();
        let found = attempt.locate(spec).await.unwrap();
        assert_eq!(found.file_name().unwrap().to_str().unwrap(), "temp_probe.mp4");
    }

    #[tokio::test]
    async fn begin_respects_the_user_lock() {
        let dir = tempfile::tempdir().unwrap();
        let locks: Arc<MemoryLockStore> = Arc::new(MemoryLockStore::new());
        let ttl = Duration::from_secs(600);

        let first = Attempt::begin(locks.clone(), 5, ttl, dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(first.is_some());
        let second = Attempt::begin(locks.clone(), 5, ttl, dir.path().to_path_buf())
            .await
            .unwrap();
        assert!(second.is_none());

        first.unwrap().finish().await;
        assert!(!locks.is_locked(5).await.unwrap());
    }

    #[tokio::test]
    async fn finish_sweeps_every_prefixed_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let attempt = Attempt::begin(locks.clone(), 9, Duration::from_secs(600), dir.path().to_path_buf())
            .await
            .unwrap()
            .unwrap();

        let prefix = attempt.prefix().to_string();
        for suffix in [".mp4", ".f140.m4a", ".part", ".mp3"] {
            std::fs::write(dir.path().join(format!("{prefix}{suffix}")), b"x").unwrap();
        }
        std::fs::write(dir.path().join("unrelated.mp4"), b"x").unwrap();

        attempt.finish().await;

        let leftovers: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(&prefix))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
        assert!(dir.path().join("unrelated.mp4").exists());
        assert!(!locks.is_locked(9).await.unwrap());
    }

    #[tokio::test]
    async fn refused_request_takes_no_lock_and_leaves_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let locks: Arc<MemoryLockStore> = Arc::new(MemoryLockStore::new());

        let outcome = begin_gated(
            locks.clone(),
            None,
            "720",
            11,
            Duration::from_secs(600),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            BeginOutcome::Refused(GateRefusal::NoPendingUrl)
        ));
        assert!(locks.list_active().await.unwrap().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn contended_begin_reports_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let locks: Arc<MemoryLockStore> = Arc::new(MemoryLockStore::new());
        assert!(locks.acquire(11, Duration::from_secs(600)).await.unwrap());

        let outcome = begin_gated(
            locks.clone(),
            Some("https://youtu.be/abc".into()),
            "720",
            11,
            Duration::from_secs(600),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();

        assert!(matches!(outcome, BeginOutcome::Contended));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn finish_sweeps_even_when_the_download_failed() {
        let dir = tempfile::tempdir().unwrap();
        let locks = Arc::new(MemoryLockStore::new());
        let attempt = Attempt::begin(locks.clone(), 3, Duration::from_secs(600), dir.path().to_path_buf())
            .await
            .unwrap()
            .unwrap();
        let prefix = attempt.prefix().to_string();
        // simulate a failed attempt that left only a partial file behind
        std::fs::write(dir.path().join(format!("{prefix}.mp4.part")), b"x").unwrap();

        attempt.finish().await;

        assert!(!dir.path().join(format!("{prefix}.mp4.part")).exists());
        assert!(!locks.is_locked(3).await.unwrap());
    }
}
