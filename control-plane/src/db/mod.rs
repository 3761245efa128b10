use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

pub mod models;

/// Schema migrations, applied in order on every start.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial.sql",
    include_str!("../../migrations/001_initial.sql"),
)];

static MEMORY_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Database-related errors
#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Corrupt stored record: {0}")]
    Corrupt(String),

    #[error("Database configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Corrupt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Database connection pool
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Database {
    /// Create a new database connection pool
    pub fn new(database_path: &str) -> Result<Self> {
        tracing::info!(path = %database_path, "Connecting to database");

        let is_memory = database_path == ":memory:" || database_path.contains("mode=memory");

        if !is_memory {
            if let Some(parent) = std::path::Path::new(database_path).parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Config(format!("Failed to create database directory: {}", e))
                })?;
            }
        }

        // Plain :memory: would give every pooled connection its own database.
        let connection_string = if database_path == ":memory:" {
            "file::memory:?cache=shared"
        } else {
            database_path
        };

        let manager = SqliteConnectionManager::file(connection_string).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            if !is_memory {
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            }
            Ok(())
        });

        let pool = Pool::builder().max_size(10).build(manager)?;

        tracing::info!("Database connected successfully");

        Ok(Self { pool })
    }

    /// Open a fresh, isolated in-memory database with migrations applied.
    ///
    /// Every call yields a distinct database, so tests and embedded setups
    /// never share state.
    pub fn open_in_memory() -> Result<Self> {
        let id = MEMORY_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "file:infermesh-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            id
        );
        let db = Database::new(&name)?;
        db.migrate()?;
        Ok(db)
    }

    /// Run database migrations
    pub fn migrate(&self) -> Result<()> {
        let conn = self.pool.get()?;

        for (name, sql) in MIGRATIONS {
            tracing::debug!(migration = %name, "Applying migration");
            conn.execute_batch(sql)?;
        }

        tracing::info!(count = MIGRATIONS.len(), "Migrations completed");
        Ok(())
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Default database path: `~/.infermesh/manager.db`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| DbError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".infermesh").join("manager.db"))
    }
}

#[cfg(test)]
pub(crate) fn create_test_db() -> Database {
    Database::open_in_memory().expect("Failed to create test database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_in_memory_db() {
        let db = Database::new(":memory:").expect("Failed to create in-memory database");

        let conn = db.get_conn().expect("Failed to get connection");
        let result: i64 = conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .expect("Failed to execute query");

        assert_eq!(result, 1);
    }

    #[test]
    fn test_run_migrations() {
        let db = create_test_db();

        let conn = db.get_conn().expect("Failed to get connection");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("Failed to prepare statement");

        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("Failed to query tables")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("Failed to collect results");

        assert!(tables.contains(&"models".to_string()));
        assert!(tables.contains(&"api_keys".to_string()));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = create_test_db();
        db.migrate().expect("Second migration run should succeed");
    }

    #[test]
    fn test_in_memory_databases_are_isolated() {
        let a = create_test_db();
        let b = create_test_db();

        a.get_conn()
            .unwrap()
            .execute(
                "INSERT INTO models (model_id, version, stage, publish_seq, published_at, manifest)
                 VALUES ('m', 'v1', 'dev', 1, '2024-01-01T00:00:00Z', '{}')",
                [],
            )
            .unwrap();

        let count: i64 = b
            .get_conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_default_path() {
        let path = Database::default_path().expect("Failed to get default path");
        assert!(path.to_string_lossy().contains(".infermesh"));
        assert!(path.to_string_lossy().ends_with("manager.db"));
    }
}
