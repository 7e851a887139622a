use crate::error::AppError;
use std::{env, path::PathBuf, time::Duration};

/// Which large-file publish strategy this deployment uses. The two are
/// mutually exclusive; there is no runtime fallback chain between them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PublishStrategy {
    Sftp,
    Http,
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub remote_path: String,
    pub public_url_prefix: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub admin_user_id: u64,
    pub admin_chat_id: i64,
    pub required_channels: Vec<String>,
    pub db_dsn: String,
    pub redis_url: String,
    pub http_port: u16,
    pub publish_strategy: PublishStrategy,
    pub storage: Option<StorageConfig>,
    pub cookie_file: Option<PathBuf>,
    pub cookie_refresh_command: Option<String>,
    pub work_dir: PathBuf,
    pub lock_ttl: Duration,
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Config(format!("{key} is not set")))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse<T: std::str::FromStr>(key: &str, value: String) -> Result<T, AppError> {
    value
        .parse()
        .map_err(|_| AppError::Config(format!("{key} has an invalid value: {value}")))
}

impl Config {
    /// Reads configuration from the environment. The bot token itself stays in
    /// `TELOXIDE_TOKEN` and is consumed by `Bot::from_env_with_client`.
    pub fn from_env() -> Result<Self, AppError> {
        let publish_strategy = match optional("PUBLISH_STRATEGY").as_deref() {
            None | Some("sftp") => PublishStrategy::Sftp,
            Some("http") => PublishStrategy::Http,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "PUBLISH_STRATEGY must be \"sftp\" or \"http\", got {other}"
                )))
            }
        };

        let storage = match optional("STORAGE_HOST") {
            Some(host) => {
                let password = optional("STORAGE_PASSWORD");
                let private_key_path = optional("STORAGE_PRIVATE_KEY_PATH");
                if password.is_none() && private_key_path.is_none() {
                    return Err(AppError::Config(
                        "storage auth requires STORAGE_PASSWORD or STORAGE_PRIVATE_KEY_PATH".into(),
                    ));
                }
                Some(StorageConfig {
                    host,
                    port: match optional("STORAGE_PORT") {
                        Some(v) => parse("STORAGE_PORT", v)?,
                        None => 22,
                    },
                    user: required("STORAGE_USER")?,
                    password,
                    private_key_path,
                    remote_path: required("STORAGE_PATH")?,
                    public_url_prefix: required("STORAGE_PUBLIC_URL_PREFIX")?,
                })
            }
            None => None,
        };

        if publish_strategy == PublishStrategy::Sftp && storage.is_none() {
            return Err(AppError::Config(
                "PUBLISH_STRATEGY=sftp requires STORAGE_HOST and related settings".into(),
            ));
        }

        let required_channels = optional("REQUIRED_CHANNELS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|ch| !ch.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            admin_user_id: parse("ADMIN_USER_ID", required("ADMIN_USER_ID")?)?,
            admin_chat_id: parse("ADMIN_CHAT_ID", required("ADMIN_CHAT_ID")?)?,
            required_channels,
            db_dsn: required("DB_DSN")?,
            redis_url: optional("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".into()),
            http_port: match optional("HTTP_PORT") {
                Some(v) => parse("HTTP_PORT", v)?,
                None => 8080,
            },
            publish_strategy,
            storage,
            cookie_file: optional("COOKIE_FILE").map(PathBuf::from),
            cookie_refresh_command: optional("COOKIE_REFRESH_COMMAND"),
            work_dir: optional("WORK_DIR").map(PathBuf::from).unwrap_or_else(|| ".".into()),
            lock_ttl: Duration::from_secs(match optional("LOCK_TTL_SECS") {
                Some(v) => parse("LOCK_TTL_SECS", v)?,
                None => 600,
            }),
        })
    }
}
