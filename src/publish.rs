use crate::{config::StorageConfig, error::AppError};
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use rand::{distributions::Alphanumeric, Rng};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{process::Command, sync::oneshot, task::JoinHandle};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

/// A published file: a public URL plus whatever must be torn down once the
/// recipient has been handed the URL.
pub struct Published {
    pub url: String,
    handle: Option<ServeHandle>,
}

impl Published {
    pub async fn finish(self) {
        if let Some(handle) = self.handle {
            handle.teardown().await;
        }
    }
}

struct ServeHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    served_path: PathBuf,
    _serving: tokio::sync::OwnedMutexGuard<()>,
}

impl ServeHandle {
    async fn teardown(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            warn!(event = "serve_task_join_failed", error = %err);
        }
        if let Err(err) = tokio::fs::remove_file(&self.served_path).await {
            warn!(event = "served_file_remove_failed", error = %err);
        }
        info!(event = "file_server_stopped");
    }
}

/// Out-of-band delivery for files too large to send inline. Both strategies
/// consume the local artifact: after `publish` succeeds the original path no
/// longer exists, so the attempt's cleanup never double-deletes.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, path: &Path) -> Result<Published, AppError>;
}

/// Copies the file to a remote host over SFTP/scp and composes a public URL
/// under the configured prefix. Supports concurrent uploads.
pub struct SftpPublisher {
    config: StorageConfig,
    copy_program: String,
    shell_program: String,
}

impl SftpPublisher {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            config,
            copy_program: "scp".into(),
            shell_program: "ssh".into(),
        }
    }

    #[cfg(test)]
    fn with_programs(mut self, copy: &str, shell: &str) -> Self {
        self.copy_program = copy.into();
        self.shell_program = shell.into();
        self
    }

    fn remote_command(&self, program: &str) -> Command {
        match &self.config.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-p").arg(password).arg(program);
                cmd
            }
            None => Command::new(program),
        }
    }
}

#[async_trait]
impl Publisher for SftpPublisher {
    async fn publish(&self, path: &Path) -> Result<Published, AppError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(AppError::Upload(format!("local file not found: {}", path.display())));
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AppError::Upload("file has no usable name".into()))?
            .to_string();
        let remote_file = format!(
            "{}/{}",
            self.config.remote_path.trim_end_matches('/'),
            file_name
        );

        info!(
            event = "storage_upload_start",
            host = %self.config.host,
            remote = %remote_file
        );

        let mut scp = self.remote_command(&self.copy_program);
        scp.arg("-P")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no");
        if let Some(key) = &self.config.private_key_path {
            scp.arg("-i").arg(key);
        }
        scp.arg(path)
            .arg(format!("{}@{}:{}", self.config.user, self.config.host, remote_file));
        run_remote_step(scp, "copy").await?;

        // World-readable so the web server in front of the storage can serve it.
        let mut chmod = self.remote_command(&self.shell_program);
        chmod
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-o")
            .arg("StrictHostKeyChecking=no");
        if let Some(key) = &self.config.private_key_path {
            chmod.arg("-i").arg(key);
        }
        chmod
            .arg(format!("{}@{}", self.config.user, self.config.host))
            .arg(format!("chmod 644 {remote_file}"));
        run_remote_step(chmod, "chmod").await?;

        tokio::fs::remove_file(path).await.map_err(|err| {
            AppError::Upload(format!("uploaded but failed to remove local copy: {err}"))
        })?;

        let url = join_public_url(&self.config.public_url_prefix, &file_name)?;
        info!(event = "storage_upload_done", url = %url);
        Ok(Published { url, handle: None })
    }
}

async fn run_remote_step(mut cmd: Command, step: &str) -> Result<(), AppError> {
    let output = cmd
        .output()
        .await
        .map_err(|err| AppError::Upload(format!("{step} failed to start: {err}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Upload(format!("{step} failed: {}", stderr.trim())));
    }
    Ok(())
}

pub fn join_public_url(prefix: &str, file_name: &str) -> Result<String, AppError> {
    let mut base = prefix.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    let base = url::Url::parse(&base)
        .map_err(|err| AppError::Upload(format!("bad public URL prefix: {err}")))?;
    let joined = base
        .join(file_name)
        .map_err(|err| AppError::Upload(format!("bad public URL: {err}")))?;
    Ok(joined.to_string())
}

/// Stands up a short-lived HTTP server on the local public IP and serves the
/// artifact under a random path until `finish`. Only one server can be bound
/// at a time; concurrent large-file deliveries serialize on it.
pub struct HttpPublisher {
    port: u16,
    serve_dir: PathBuf,
    serving: Arc<tokio::sync::Mutex<()>>,
    http: reqwest::Client,
}

impl HttpPublisher {
    pub fn new(port: u16, serve_dir: PathBuf) -> Self {
        Self {
            port,
            serve_dir,
            serving: Arc::new(tokio::sync::Mutex::new(())),
            http: reqwest::Client::new(),
        }
    }

    async fn public_ip(&self) -> Result<String, AppError> {
        let ip = self
            .http
            .get("https://api.ipify.org")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(ip.trim().to_string())
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, path: &Path) -> Result<Published, AppError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(AppError::Upload(format!("local file not found: {}", path.display())));
        }

        let serving = self.serving.clone().lock_owned().await;
        let public_ip = self.public_ip().await?;

        // Everything that can fail happens before the rename, so an aborted
        // publish leaves the artifact under its attempt prefix where the
        // cleanup sweep can still find it.
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await.map_err(AppError::Io)?;
        let port = listener.local_addr().map_err(AppError::Io)?.port();

        tokio::fs::create_dir_all(&self.serve_dir).await?;
        let serve_name = random_serve_name(path);
        let served_path = self.serve_dir.join(&serve_name);
        tokio::fs::rename(path, &served_path).await?;

        let file_path = served_path.clone();
        let app = Router::new().route(
            &format!("/{serve_name}"),
            get(move || {
                let path = file_path.clone();
                async move { serve_file(path).await }
            }),
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = server.await {
                warn!(event = "file_server_error", error = %err);
            }
        });

        let url = format!("http://{public_ip}:{port}/{serve_name}");
        info!(event = "file_server_started", url = %url);

        Ok(Published {
            url,
            handle: Some(ServeHandle {
                shutdown: shutdown_tx,
                task,
                served_path,
                _serving: serving,
            }),
        })
    }
}

async fn serve_file(path: PathBuf) -> Response {
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(event = "serve_open_failed", error = %err);
            return StatusCode::NOT_FOUND.into_response();
        }
    };
    let len = file.metadata().await.ok().map(|m| m.len());
    let stream = ReaderStream::new(file);
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    if let Some(len) = len {
        response = response.header(header::CONTENT_LENGTH, len);
    }
    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Unguessable serving name so third parties cannot fetch the file by
/// guessing the path; the original basename is kept for the recipient.
fn random_serve_name(path: &Path) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    format!("{token}_{base}")
}
