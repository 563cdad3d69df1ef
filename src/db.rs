//! SQLite-backed custom domain store
//!
//! The platform's domain verification flow writes `custom_domains`; the
//! dispatcher only reads it. Writes are exposed for tooling and tests.

use crate::domains::{CustomDomainRecord, DomainStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Database connection wrapper with thread-safe access
#[derive(Clone)]
pub struct SqliteDomainStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDomainStore {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open domain database")?;

        // WAL lets the verification flow write while we read
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;

        info!("Domain database opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            debug!("Applying migration v1: custom domains");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS custom_domains (
                    host TEXT PRIMARY KEY,
                    target TEXT NOT NULL,
                    verified INTEGER NOT NULL DEFAULT 0,
                    active INTEGER NOT NULL DEFAULT 1,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_custom_domains_target ON custom_domains(target);

                INSERT INTO schema_migrations (version) VALUES (1);
                "#,
            )?;
        }

        debug!(version = SCHEMA_VERSION, "Domain database schema up to date");
        Ok(())
    }

    /// Insert or replace a record
    pub fn upsert_domain(&self, record: &CustomDomainRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO custom_domains (host, target, verified, active, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(host) DO UPDATE SET
                target = excluded.target,
                verified = excluded.verified,
                active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                record.host,
                record.target,
                record.verified,
                record.active,
                record.updated_at.to_rfc3339(),
            ],
        )
        .context("Failed to upsert domain")?;
        Ok(())
    }

    /// Mark a domain inactive without deleting it
    pub fn deactivate_domain(&self, host: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE custom_domains SET active = 0, updated_at = ?2 WHERE host = ?1",
            params![host, Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// Get a domain by host
    pub fn get_domain(&self, host: &str) -> Result<Option<CustomDomainRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT host, target, verified, active, updated_at
                 FROM custom_domains WHERE host = ?1",
                params![host],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("Failed to get domain")?;

        row.map(|(host, target, verified, active, updated_at)| {
            let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                .with_context(|| format!("Invalid updated_at for domain {}", host))?
                .with_timezone(&Utc);
            Ok(CustomDomainRecord {
                host,
                target,
                verified,
                active,
                updated_at,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl DomainStore for SqliteDomainStore {
    async fn lookup_custom_domain(&self, host: &str) -> Result<Option<CustomDomainRecord>> {
        let store = self.clone();
        let host = host.to_string();
        tokio::task::spawn_blocking(move || store.get_domain(&host))
            .await
            .context("Domain lookup task failed")?
    }
}
