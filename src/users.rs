use crate::error::AppError;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::time::Duration;
use tracing::{info, warn};

const CREATE_QUERY: &str = "
    CREATE TABLE IF NOT EXISTS users (
        user_id bigint PRIMARY KEY,
        username text,
        chat_id bigint NOT NULL,
        last_updated_date bigint NOT NULL
    );
";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UserRecord {
    pub user_id: i64,
    pub username: Option<String>,
    pub chat_id: i64,
    pub last_updated_date: i64,
}

/// Thin query wrapper around the `users` table. The directory is the only
/// component that touches user rows.
#[derive(Clone)]
pub struct UserDirectory {
    pool: PgPool,
}

impl UserDirectory {
    /// Connects with bounded retries; the process must not serve traffic
    /// without the database, so the caller treats a final failure as fatal.
    pub async fn connect(dsn: &str) -> Result<Self, AppError> {
        const RETRIES: u32 = 5;
        let mut delay = Duration::from_secs(1);
        let mut last_err = None;
        for attempt in 1..=RETRIES {
            match PgPoolOptions::new().max_connections(5).connect(dsn).await {
                Ok(pool) => {
                    info!(event = "db_connected", attempt);
                    let directory = Self { pool };
                    directory.ensure_schema().await?;
                    return Ok(directory);
                }
                Err(err) => {
                    warn!(event = "db_connect_failed", attempt, error = %err);
                    last_err = Some(err);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(last_err.map(AppError::Sqlx).unwrap_or_else(|| {
            AppError::Internal("database connection retries exhausted".into())
        }))
    }

    pub async fn ensure_schema(&self) -> Result<(), AppError> {
        sqlx::query(CREATE_QUERY).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, user_id: u64) -> Result<Option<UserRecord>, AppError> {
        let row = sqlx::query(
            "SELECT user_id, username, chat_id, last_updated_date FROM users WHERE user_id = $1",
        )
        .bind(user_id as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| UserRecord {
            user_id: row.get("user_id"),
            username: row.get("username"),
            chat_id: row.get("chat_id"),
            last_updated_date: row.get("last_updated_date"),
        }))
    }

    pub async fn create(
        &self,
        user_id: u64,
        username: Option<&str>,
        chat_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        info!(event = "user_create", user_id);
        sqlx::query(
            "INSERT INTO users (user_id, username, chat_id, last_updated_date)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id as i64)
        .bind(username)
        .bind(chat_id)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn touch(&self, user_id: u64, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE users SET last_updated_date = $1 WHERE user_id = $2")
            .bind(now.timestamp())
            .bind(user_id as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Best-effort timestamp update used mid-download: a transient database
    /// error must not abort the user's attempt.
    pub async fn touch_best_effort(&self, user_id: u64) {
        if let Err(err) = self.touch(user_id, Utc::now()).await {
            warn!(event = "user_touch_failed", user_id, error = %err);
        }
    }
}
