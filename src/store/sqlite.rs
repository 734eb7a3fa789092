use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};

use crate::config::AppConfig;
use crate::error::StoreError;
use crate::store::{AtomicStore, UpdateFn};

/// SQLx-backed store. Single `entries` table keyed by path, with a version
/// column checked on every optimistic commit (per-row CAS).
///
/// Deleted-and-recreated rows restart at version 1; deletions only happen
/// through admin operations, never concurrently with counter updates on the
/// same key.
pub struct SqlxStore {
    pool: AnyPool,
    max_attempts: u32,
}

impl SqlxStore {
    pub fn new(pool: AnyPool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn connect(cfg: &AppConfig) -> anyhow::Result<Self> {
        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .connect(&cfg.database_url)
            .await?;

        Ok(Self::new(pool, cfg.store_max_attempts))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
CREATE TABLE IF NOT EXISTS entries (
  path TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  version BIGINT NOT NULL
);
"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn read_versioned(&self, path: &str) -> Result<Option<(Value, i64)>, StoreError> {
        let row = sqlx::query("SELECT value, version FROM entries WHERE path = ?;")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .context("versioned read failed")?;

        match row {
            Some(r) => {
                let raw: String = r.get("value");
                let version: i64 = r.get("version");
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("malformed stored value at {path}"))?;
                Ok(Some((value, version)))
            }
            None => Ok(None),
        }
    }
}

/// Make a path segment safe inside a LIKE pattern so that `%` and `_`
/// in location or region names match literally.
fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[async_trait]
impl AtomicStore for SqlxStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_versioned(path).await?.map(|(v, _)| v))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO entries (path, value, version) VALUES (?, ?, 1)
ON CONFLICT(path) DO UPDATE SET value = excluded.value, version = entries.version + 1;
"#,
        )
        .bind(path)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .context("overwrite failed")?;

        Ok(())
    }

    async fn atomic_update(
        &self,
        path: &str,
        apply: UpdateFn<'_>,
    ) -> Result<Option<Value>, StoreError> {
        for _ in 0..self.max_attempts {
            let observed = self.read_versioned(path).await?;
            let next = apply(observed.as_ref().map(|(v, _)| v.clone()));

            match (observed, next) {
                (None, None) => return Ok(None),
                (None, Some(value)) => {
                    let res =
                        sqlx::query("INSERT INTO entries (path, value, version) VALUES (?, ?, 1);")
                            .bind(path)
                            .bind(value.to_string())
                            .execute(&self.pool)
                            .await;

                    match res {
                        Ok(_) => return Ok(Some(value)),
                        Err(e) => {
                            // Only a unique violation means another writer
                            // created the key between our read and insert;
                            // anything else is a hard backend failure.
                            let lost_race = e.as_database_error().is_some_and(|d| {
                                d.kind() == sqlx::error::ErrorKind::UniqueViolation
                            });
                            if lost_race {
                                continue;
                            }
                            return Err(anyhow::Error::from(e)
                                .context("insert during atomic update failed")
                                .into());
                        }
                    }
                }
                (Some((_, version)), Some(value)) => {
                    let res = sqlx::query(
                        "UPDATE entries SET value = ?, version = version + 1 \
                         WHERE path = ? AND version = ?;",
                    )
                    .bind(value.to_string())
                    .bind(path)
                    .bind(version)
                    .execute(&self.pool)
                    .await
                    .context("update during atomic update failed")?;

                    if res.rows_affected() == 1 {
                        return Ok(Some(value));
                    }
                }
                (Some((_, version)), None) => {
                    let res = sqlx::query("DELETE FROM entries WHERE path = ? AND version = ?;")
                        .bind(path)
                        .bind(version)
                        .execute(&self.pool)
                        .await
                        .context("delete during atomic update failed")?;

                    if res.rows_affected() == 1 {
                        return Ok(None);
                    }
                }
            }
        }

        Err(StoreError::Contention {
            path: path.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn multi_path_update(
        &self,
        changes: HashMap<String, Option<Value>>,
    ) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("begin multi-path update failed")?;

        for (path, change) in changes {
            match change {
                Some(value) => {
                    sqlx::query(
                        r#"
INSERT INTO entries (path, value, version) VALUES (?, ?, 1)
ON CONFLICT(path) DO UPDATE SET value = excluded.value, version = entries.version + 1;
"#,
                    )
                    .bind(&path)
                    .bind(value.to_string())
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("multi-path write failed at {path}"))?;
                }
                None => {
                    sqlx::query("DELETE FROM entries WHERE path = ?;")
                        .bind(&path)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("multi-path delete failed at {path}"))?;
                }
            }
        }

        tx.commit().await.context("commit multi-path update failed")?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, value FROM entries WHERE path LIKE ? ESCAPE '\\' ORDER BY path;",
        )
        .bind(format!("{}%", escape_like(prefix)))
        .fetch_all(&self.pool)
        .await
        .context("prefix scan failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let path: String = r.get("path");
            let raw: String = r.get("value");
            match serde_json::from_str(&raw) {
                Ok(value) => out.push((path, value)),
                Err(e) => {
                    // poison-row resilience: skip but don't fail the scan
                    tracing::warn!(path = %path, error = %e, "skipping malformed entry");
                }
            }
        }

        Ok(out)
    }
}
