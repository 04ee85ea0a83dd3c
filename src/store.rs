//! Connection pool and schema bootstrap for the MySQL-backed persistence layer.

use std::path::Path;
use std::sync::Arc;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::error::CoreError;

/// Lazily-initialized connection pool, guarded so concurrent callers share
/// one `connect()` even if they race on first use.
#[derive(Clone)]
pub struct Store {
    pool: Arc<OnceCell<MySqlPool>>,
    database_url: String,
    min_connections: u32,
    max_connections: u32,
}

impl Store {
    pub fn new(config: &Config) -> Self {
        let password = config.db_password.clone().unwrap_or_default();
        let database_url = format!(
            "mysql://{}:{}@{}:{}/{}",
            config.db_user, password, config.db_host, config.db_port, config.db_name
        );
        Store {
            pool: Arc::new(OnceCell::new()),
            database_url,
            min_connections: config.db_pool_minsize,
            max_connections: config.db_pool_maxsize,
        }
    }

    async fn connect(&self) -> Result<&MySqlPool, CoreError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = MySqlPoolOptions::new()
                    .min_connections(self.min_connections)
                    .max_connections(self.max_connections)
                    .connect(&self.database_url)
                    .await
                    .map_err(CoreError::Store)?;
                tracing::info!(
                    min = self.min_connections,
                    max = self.max_connections,
                    "database pool created"
                );
                Ok(pool)
            })
            .await
    }

    pub async fn pool(&self) -> Result<&MySqlPool, CoreError> {
        self.connect().await
    }

    /// Applies `schema_path` against the database, splitting on statement
    /// terminators and skipping blank lines and `--` comments, the same way
    /// the collector's one-shot schema bootstrap does.
    pub async fn ensure_schema(&self, schema_path: &Path) -> Result<(), CoreError> {
        let contents = tokio::fs::read_to_string(schema_path).await.map_err(|e| {
            CoreError::SchemaMissing(format!("{}: {e}", schema_path.display()))
        })?;

        let pool = self.connect().await?;
        let mut buffer = String::new();
        for line in contents.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            buffer.push_str(line);
            buffer.push('\n');
            if trimmed.ends_with(';') {
                let statement = buffer.trim();
                if !statement.is_empty() {
                    sqlx::query(statement).execute(pool).await?;
                }
                buffer.clear();
            }
        }
        let remainder = buffer.trim();
        if !remainder.is_empty() {
            sqlx::query(remainder).execute(pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}
