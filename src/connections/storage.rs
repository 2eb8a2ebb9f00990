//! SQLite-backed connection store.

use super::{ConnectionFields, OAuthConnection, Provider};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SELECT_COLUMNS: &str = r#"
    SELECT id, user_id, provider,
           access_token, refresh_token, expires_at, subject_id,
           last_sync_at, created_at, updated_at
    FROM oauth_connections
"#;

/// Connection rows backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_connections (
///     id TEXT PRIMARY KEY,              -- UUID v7
///     user_id TEXT NOT NULL,
///     provider TEXT NOT NULL,           -- providerA | providerB
///     access_token TEXT NOT NULL,       -- Encrypted
///     refresh_token TEXT,               -- Encrypted (optional)
///     expires_at TEXT,                  -- RFC 3339 (optional)
///     subject_id TEXT,                  -- Encrypted (optional)
///     last_sync_at TEXT,                -- RFC 3339
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     UNIQUE(user_id, provider)
/// );
/// ```
///
/// Concurrent upserts for the same pair serialize on the connection mutex and
/// the unique constraint; the last write wins.
pub struct ConnectionStore {
    conn: Mutex<Connection>,
}

impl ConnectionStore {
    /// Creates or opens a connection store.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path).context("Failed to open database")?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_connections (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT,
                expires_at TEXT,
                subject_id TEXT,
                last_sync_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(user_id, provider)
            )
            "#,
            [],
        )
        .context("Failed to create oauth_connections table")?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_connections_user ON oauth_connections(user_id)",
            [],
        )
        .context("Failed to create index")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Connection store mutex poisoned"))
    }

    /// Creates or updates the row for (user, provider) and returns it.
    ///
    /// `id` and `created_at` are kept on update; every other field is overwritten.
    pub fn upsert(
        &self,
        user_id: &str,
        provider: Provider,
        fields: &ConnectionFields,
    ) -> Result<OAuthConnection> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO oauth_connections (
                id, user_id, provider,
                access_token, refresh_token, expires_at, subject_id,
                last_sync_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(user_id, provider) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                subject_id = excluded.subject_id,
                last_sync_at = excluded.last_sync_at,
                updated_at = excluded.updated_at
            "#,
            params![
                Uuid::now_v7().to_string(),
                user_id,
                provider.as_str(),
                fields.access_token,
                fields.refresh_token,
                fields.expires_at.map(|dt| dt.to_rfc3339()),
                fields.subject_id,
                fields.last_sync_at.to_rfc3339(),
                now,
                now,
            ],
        )
        .context("Failed to upsert connection")?;

        find_locked(&conn, user_id, provider)?
            .ok_or_else(|| anyhow!("Connection missing right after upsert"))
    }

    /// Reads the row for (user, provider).
    pub fn find(&self, user_id: &str, provider: Provider) -> Result<Option<OAuthConnection>> {
        let conn = self.lock()?;
        find_locked(&conn, user_id, provider)
    }

    /// Lists every connection of a user, ordered by provider.
    pub fn find_many(&self, user_id: &str) -> Result<Vec<OAuthConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE user_id = ?1 ORDER BY provider", SELECT_COLUMNS))
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map(params![user_id], read_row)
            .context("Failed to execute query")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to read results")?;

        rows.into_iter().collect()
    }

    /// Deletes the row for (user, provider).
    ///
    /// # Returns
    /// * `Ok(true)` - Row deleted
    /// * `Ok(false)` - No row found
    pub fn delete(&self, user_id: &str, provider: Provider) -> Result<bool> {
        let rows_affected = self
            .lock()?
            .execute(
                "DELETE FROM oauth_connections WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider.as_str()],
            )
            .context("Failed to delete connection")?;

        Ok(rows_affected > 0)
    }

    /// Number of rows across all users.
    pub fn count(&self) -> Result<usize> {
        let count: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM oauth_connections", [], |row| row.get(0))
            .context("Failed to count connections")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn find_locked(
    conn: &Connection,
    user_id: &str,
    provider: Provider,
) -> Result<Option<OAuthConnection>> {
    conn.query_row(
        &format!("{} WHERE user_id = ?1 AND provider = ?2", SELECT_COLUMNS),
        params![user_id, provider.as_str()],
        read_row,
    )
    .optional()
    .context("Failed to read connection")?
    .transpose()
}

/// Column values as stored, before timestamps and tags are parsed.
struct RawRow {
    id: String,
    user_id: String,
    provider: String,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<String>,
    subject_id: Option<String>,
    last_sync_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn into_connection(self) -> Result<OAuthConnection> {
        let provider = Provider::parse(&self.provider)
            .ok_or_else(|| anyhow!("Unknown provider '{}' in store", self.provider))?;

        Ok(OAuthConnection {
            id: self.id,
            user_id: self.user_id,
            provider,
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self.expires_at.as_deref().map(parse_timestamp).transpose()?,
            subject_id: self.subject_id,
            last_sync_at: self.last_sync_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// Parsing happens outside rusqlite's error type so failures keep their context
fn read_row(row: &Row<'_>) -> rusqlite::Result<Result<OAuthConnection>> {
    let raw = RawRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        access_token: row.get(3)?,
        refresh_token: row.get(4)?,
        expires_at: row.get(5)?,
        subject_id: row.get(6)?,
        last_sync_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    };
    Ok(raw.into_connection())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp '{}'", value))
}
