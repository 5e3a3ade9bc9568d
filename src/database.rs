//! SQLite-backed endpoint storage

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::proxy::models::{Endpoint, Status};
use crate::Result;

const ALL_COLUMNS: &str = "id, ip, port, username, password, added_at, last_check_at, \
     status, socks4, socks5, http, https, latency";

/// Database wrapper for endpoint records
#[derive(Debug, Clone)]
pub struct ProxyDatabase {
    pool: SqlitePool,
}

impl ProxyDatabase {
    /// Open (creating if necessary) the database at `path` and ensure the
    /// schema exists
    pub async fn new(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    /// In-memory database, mainly for tests. A single connection keeps every
    /// query on the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_schema().await?;
        Ok(db)
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                added_at TEXT NOT NULL,
                last_check_at TEXT,
                status TEXT,
                socks4 BOOLEAN NOT NULL DEFAULT FALSE,
                socks5 BOOLEAN NOT NULL DEFAULT FALSE,
                http BOOLEAN NOT NULL DEFAULT FALSE,
                https BOOLEAN NOT NULL DEFAULT FALSE,
                latency REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_proxy_identity \
             ON proxies (ip, port, username, password)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxy_ip ON proxies (ip)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Idempotent insert keyed on the (ip, port, username, password) identity
    /// tuple; returns the stored record, existing or fresh
    pub async fn insert(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        sqlx::query(
            r#"
            INSERT INTO proxies (ip, port, username, password, added_at, status,
                                 socks4, socks5, http, https, latency)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ip, port, username, password) DO NOTHING
            "#,
        )
        .bind(&endpoint.ip)
        .bind(endpoint.port)
        .bind(&endpoint.username)
        .bind(&endpoint.password)
        .bind(endpoint.added_at)
        .bind(endpoint.status)
        .bind(endpoint.socks4)
        .bind(endpoint.socks5)
        .bind(endpoint.http)
        .bind(endpoint.https)
        .bind(endpoint.latency)
        .execute(&self.pool)
        .await?;

        let stored = self
            .get_by_identity(
                &endpoint.ip,
                endpoint.port,
                &endpoint.username,
                &endpoint.password,
            )
            .await?
            .ok_or_else(|| anyhow::anyhow!("endpoint vanished right after insert"))?;

        Ok(stored)
    }

    /// Fetch by primary key
    pub async fn get(&self, id: i64) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ALL_COLUMNS} FROM proxies WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Fetch by the unique identity tuple
    pub async fn get_by_identity(
        &self,
        ip: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ALL_COLUMNS} FROM proxies \
             WHERE ip = ? AND port = ? AND username = ? AND password = ?"
        ))
        .bind(ip)
        .bind(port)
        .bind(username)
        .bind(password)
        .fetch_optional(&self.pool)
        .await?;

        Ok(endpoint)
    }

    /// Persist a checked record and stamp `last_check_at`
    pub async fn update_with_check_timestamp(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        let now = chrono::Utc::now();
        sqlx::query(
            r#"
            UPDATE proxies
            SET status = ?, socks4 = ?, socks5 = ?, http = ?, https = ?,
                latency = ?, last_check_at = ?
            WHERE id = ?
            "#,
        )
        .bind(endpoint.status)
        .bind(endpoint.socks4)
        .bind(endpoint.socks5)
        .bind(endpoint.http)
        .bind(endpoint.https)
        .bind(endpoint.latency)
        .bind(now)
        .bind(endpoint.id)
        .execute(&self.pool)
        .await?;

        let mut updated = endpoint.clone();
        updated.last_check_at = Some(now);
        Ok(updated)
    }

    /// All endpoints with the given status; `None` selects never-checked
    /// records
    pub async fn list_by_status(&self, status: Option<Status>) -> Result<Vec<Endpoint>> {
        let endpoints = match status {
            Some(status) => {
                sqlx::query_as::<_, Endpoint>(&format!(
                    "SELECT {ALL_COLUMNS} FROM proxies WHERE status = ? ORDER BY id"
                ))
                .bind(status)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Endpoint>(&format!(
                    "SELECT {ALL_COLUMNS} FROM proxies WHERE status IS NULL ORDER BY id"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(endpoints)
    }

    pub async fn get_alive(&self) -> Result<Vec<Endpoint>> {
        self.list_by_status(Some(Status::Alive)).await
    }

    pub async fn get_unchecked(&self) -> Result<Vec<Endpoint>> {
        self.list_by_status(None).await
    }

    /// Every endpoint, alive first (re-run checks prioritize them)
    pub async fn get_all(&self) -> Result<Vec<Endpoint>> {
        let endpoints = sqlx::query_as::<_, Endpoint>(&format!(
            "SELECT {ALL_COLUMNS} FROM proxies ORDER BY status, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(endpoints)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(id) FROM proxies")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Delete every record
    pub async fn purge_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM proxies").execute(&self.pool).await?;
        Ok(())
    }

    /// Delete dead and never-checked records
    pub async fn purge_dead(&self) -> Result<()> {
        sqlx::query("DELETE FROM proxies WHERE status = ? OR status IS NULL")
            .bind(Status::Dead)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
