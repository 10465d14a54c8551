use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use tracing::info;

use crate::shared::config::DatabaseConfig;
use crate::shared::error::Result;

pub type DbPool = Pool<Sqlite>;

pub struct Database;

impl Database {
    /// Opens the pool and applies migrations. A failure here is fatal to the
    /// engine: running without durable storage would break at-least-once
    /// delivery, so the error propagates to the application startup path.
    pub async fn initialize(config: &DatabaseConfig) -> Result<DbPool> {
        if let Some(path) = config.url.strip_prefix("sqlite:") {
            let path = path.split('?').next().unwrap_or(path);
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| crate::shared::error::AppError::Storage(e.to_string()))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        info!(url = %config.url, "database connected");

        Self::run_migrations(&pool).await?;

        Ok(pool)
    }

    async fn run_migrations(pool: &DbPool) -> Result<()> {
        sqlx::migrate!("./migrations").run(pool).await?;
        info!("database migrations completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initialize_creates_database_file() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let config = DatabaseConfig {
            url: format!("sqlite:{}?mode=rwc", db_path.display()),
            max_connections: 1,
        };

        let pool = Database::initialize(&config).await.unwrap();
        assert!(db_path.exists());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sync_queue")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        pool.close().await;
    }
}
