use sqlx::{migrate::MigrateDatabase, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;
use crate::platform::AppPaths;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        user_id TEXT PRIMARY KEY,
        credit_balance INTEGER NOT NULL DEFAULT 0 CHECK (credit_balance >= 0),
        role TEXT NOT NULL DEFAULT 'member',
        created_at INTEGER NOT NULL DEFAULT (unixepoch()),
        updated_at INTEGER NOT NULL DEFAULT (unixepoch())
    )",
    "CREATE TABLE IF NOT EXISTS usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id TEXT NOT NULL,
        request_id TEXT NOT NULL,
        feature TEXT NOT NULL,
        model TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT (unixepoch())
    )",
    "CREATE INDEX IF NOT EXISTS idx_usage_events_user
        ON usage_events(user_id, created_at)",
];

/// SQLite connection manager for the account store.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        let db_path = paths.database_file();

        info!("Initializing database at: {:?}", db_path);

        if !db_path.exists() {
            debug!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&format!("sqlite:{}", db_path.display())).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Self { pool };
        db.apply_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn get_pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}
