use crate::core::error::StoreError;
use crate::core::model::{Download, DownloadId, DownloadPatch, DownloadStatus, Metrics, Settings};
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const SETTINGS_KEY: &str = "settings";

/// Durable download records and key/value settings.
///
/// The store does no locking of its own: callers serialize every mutation
/// through the engine's `downloads` / `settings` sections.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first open
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let opts = SqliteConnectOptions::from_str(&url)
            .with_context(|| format!("parse sqlite url={}", url))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS downloads (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              id TEXT NOT NULL UNIQUE,
              url TEXT NOT NULL,
              format_id TEXT NULL,
              options TEXT NOT NULL,
              status TEXT NOT NULL,
              progress INTEGER NOT NULL DEFAULT 0,
              speed_text TEXT NULL,
              speed_value REAL NULL,
              eta TEXT NULL,
              total_size INTEGER NULL,
              file_path TEXT NULL,
              error TEXT NULL,
              queue_ticket INTEGER NOT NULL,
              created_at INTEGER NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_downloads_ticket
            ON downloads(queue_ticket);
            "#,
        )
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub async fn load_all(&self) -> Result<Vec<Download>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, format_id, options, status, progress, speed_text, speed_value,
                   eta, total_size, file_path, error, queue_ticket, created_at, updated_at
            FROM downloads
            ORDER BY queue_ticket ASC, seq ASC;
            "#,
        )
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            match row_to_download(&row) {
                Ok(d) if d.status == DownloadStatus::Deleted => {}
                Ok(d) => out.push(d),
                Err(e) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    tracing::warn!(id = %id, "skipping unreadable download row: {}", e);
                }
            }
        }
        Ok(out)
    }

    pub async fn insert(&self, d: &Download) -> Result<(), StoreError> {
        let options = serde_json::to_string(&d.options)?;
        let error = d.error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO downloads
              (id, url, format_id, options, status, progress, speed_text, speed_value,
               eta, total_size, file_path, error, queue_ticket, created_at, updated_at)
            VALUES
              (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
            .bind(d.id.to_string())
            .bind(&d.url)
            .bind(d.format_id.as_deref())
            .bind(options)
            .bind(d.status.as_str())
            .bind(d.progress as i64)
            .bind(d.metrics.speed_text.as_deref())
            .bind(d.metrics.speed_value)
            .bind(d.metrics.eta.as_deref())
            .bind(d.metrics.total_size.map(|v| v as i64))
            .bind(d.file_path.as_ref().map(|p| p.to_string_lossy().to_string()))
            .bind(error)
            .bind(d.queue_ticket)
            .bind(d.created_at.timestamp_millis())
            .bind(d.updated_at.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies `patch` in a single statement, so a failed write leaves the row as it was.
    pub async fn update(&self, id: DownloadId, patch: &DownloadPatch) -> Result<(), StoreError> {
        let mut qb = patch_query(patch)?;
        qb.push(" WHERE id = ").push_bind(id.to_string());

        let done = qb.build().execute(&self.pool).await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Applies the same patch to several rows in one transaction: all rows change or none do.
    pub async fn update_many(&self, patches: &[(DownloadId, DownloadPatch)]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (id, patch) in patches {
            let mut qb = patch_query(patch)?;
            qb.push(" WHERE id = ").push_bind(id.to_string());
            let done = qb.build().execute(&mut *tx).await?;
            if done.rows_affected() == 0 {
                return Err(StoreError::NotFound(*id));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, id: DownloadId) -> Result<(), StoreError> {
        let done = sqlx::query(r#"DELETE FROM downloads WHERE id = ?"#)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub async fn max_queue_ticket(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(r#"SELECT COALESCE(MAX(queue_ticket), 0) AS t FROM downloads"#)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("t"))
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(r#"SELECT value FROM kv WHERE key = ?"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn put_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv(key, value, updated_at) VALUES(?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at;
            "#,
        )
            .bind(key)
            .bind(value)
            .bind(Self::now_millis())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_settings(&self) -> Result<Option<Settings>, StoreError> {
        match self.get_value(SETTINGS_KEY).await? {
            Some(raw) => Ok(Some(serde_json::from_str::<Settings>(&raw)?.normalized())),
            None => Ok(None),
        }
    }

    pub async fn put_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let raw = serde_json::to_string(settings)?;
        self.put_value(SETTINGS_KEY, &raw).await
    }
}

fn patch_query(patch: &DownloadPatch) -> Result<QueryBuilder<'static, Sqlite>, StoreError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE downloads SET updated_at = ");
    qb.push_bind(patch.updated_at.timestamp_millis());

    if let Some(status) = patch.status {
        qb.push(", status = ").push_bind(status.as_str());
    }
    if let Some(progress) = patch.progress {
        qb.push(", progress = ").push_bind(progress.min(100) as i64);
    }
    if let Some(m) = &patch.metrics {
        qb.push(", speed_text = ").push_bind(m.speed_text.clone());
        qb.push(", speed_value = ").push_bind(m.speed_value);
        qb.push(", eta = ").push_bind(m.eta.clone());
        qb.push(", total_size = ").push_bind(m.total_size.map(|v| v as i64));
    }
    if let Some(file_path) = &patch.file_path {
        qb.push(", file_path = ")
            .push_bind(file_path.as_ref().map(|p| p.to_string_lossy().to_string()));
    }
    if let Some(error) = &patch.error {
        let raw = error.as_ref().map(serde_json::to_string).transpose()?;
        qb.push(", error = ").push_bind(raw);
    }
    if let Some(ticket) = patch.queue_ticket {
        qb.push(", queue_ticket = ").push_bind(ticket);
    }
    Ok(qb)
}

fn millis_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_download(r: &SqliteRow) -> anyhow::Result<Download> {
    let id: String = r.try_get("id")?;
    let status: String = r.try_get("status")?;
    let options: String = r.try_get("options")?;
    let error: Option<String> = r.try_get("error")?;

    Ok(Download {
        id: id.parse().with_context(|| format!("bad id {}", id))?,
        url: r.try_get("url")?,
        format_id: r.try_get("format_id")?,
        options: serde_json::from_str(&options).context("bad options json")?,
        status: status.parse::<DownloadStatus>().map_err(anyhow::Error::msg)?,
        progress: r.try_get::<i64, _>("progress")?.clamp(0, 100) as u8,
        metrics: Metrics {
            speed_text: r.try_get("speed_text")?,
            speed_value: r.try_get("speed_value")?,
            eta: r.try_get("eta")?,
            total_size: r.try_get::<Option<i64>, _>("total_size")?.map(|v| v.max(0) as u64),
        },
        file_path: r.try_get::<Option<String>, _>("file_path")?.map(PathBuf::from),
        error: error.map(|e| serde_json::from_str(&e)).transpose().context("bad error json")?,
        created_at: millis_to_utc(r.try_get("created_at")?),
        updated_at: millis_to_utc(r.try_get("updated_at")?),
        queue_ticket: r.try_get("queue_ticket")?,
    })
}
