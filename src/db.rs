// src/db.rs

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

use crate::config::settings::GroupConfigOverride;
use crate::error::{AppError, Result};
use crate::models::{ApiKey, Group, HeaderRule, KeyStatus, Upstream};

/// Durable relational store: groups, api_keys, system_settings, request_logs.
///
/// The database is the source of truth; the hot cache is a derived projection
/// rebuilt from here at startup.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Insert payload for a new key; ids are assigned by the database.
pub struct NewKey {
    pub group_id: i64,
    pub key_value: String,
    pub key_hash: String,
    pub weight: i64,
}

impl Database {
    pub async fn connect(dsn: &str) -> Result<Self> {
        // In-memory SQLite gives every connection its own database, so the
        // pool must be capped at a single connection there.
        let max_connections = if dsn.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(dsn)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;
        info!(dsn, "Database connected and schema verified");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn init_schema(&self) -> Result<()> {
        const SCHEMA: &str = r#"
        CREATE TABLE IF NOT EXISTS groups (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            channel_type TEXT NOT NULL,
            upstreams TEXT NOT NULL,
            validation_endpoint TEXT NOT NULL DEFAULT '',
            test_model TEXT NOT NULL DEFAULT '',
            header_rules TEXT NOT NULL DEFAULT '[]',
            proxy_keys TEXT NOT NULL DEFAULT '',
            config_override TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            group_id INTEGER NOT NULL REFERENCES groups(id) ON DELETE CASCADE,
            key_value TEXT NOT NULL,
            key_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            base_weight INTEGER NOT NULL DEFAULT 500,
            weight INTEGER NOT NULL DEFAULT 500,
            failure_count INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            last_used_at TEXT,
            created_at TEXT NOT NULL,
            notes TEXT,
            UNIQUE(group_id, key_hash)
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_group_status ON api_keys(group_id, status);
        CREATE TABLE IF NOT EXISTS system_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS async_tasks (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            group_id INTEGER NOT NULL,
            total INTEGER NOT NULL,
            processed INTEGER NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            error TEXT,
            result TEXT
        );
        CREATE TABLE IF NOT EXISTS request_logs (
            id TEXT PRIMARY KEY,
            group_name TEXT NOT NULL,
            key_id INTEGER,
            model TEXT,
            method TEXT NOT NULL,
            path TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            success INTEGER NOT NULL,
            attempts INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            error TEXT,
            request_body TEXT,
            created_at TEXT NOT NULL
        );
        "#;

        for stmt in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    // --- System settings ---

    pub async fn load_system_settings(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT key, value FROM system_settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }

    pub async fn upsert_system_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Groups ---

    pub async fn create_group(&self, group: &Group) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO groups
             (name, channel_type, upstreams, validation_endpoint, test_model,
              header_rules, proxy_keys, config_override, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&group.name)
        .bind(&group.channel_type)
        .bind(serde_json::to_string(&group.upstreams)?)
        .bind(&group.validation_endpoint)
        .bind(&group.test_model)
        .bind(serde_json::to_string(&group.header_rules)?)
        .bind(&group.proxy_keys)
        .bind(serde_json::to_string(&group.config_override)?)
        .bind(group.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_group_by_name(&self, name: &str) -> Result<Group> {
        sqlx::query("SELECT * FROM groups WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_group(&row))
            .transpose()?
            .ok_or_else(|| AppError::not_found(format!("group '{name}'")))
    }

    pub async fn find_group_by_id(&self, id: i64) -> Result<Group> {
        sqlx::query("SELECT * FROM groups WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_group(&row))
            .transpose()?
            .ok_or_else(|| AppError::not_found(format!("group {id}")))
    }

    pub async fn list_groups(&self) -> Result<Vec<Group>> {
        let rows = sqlx::query("SELECT * FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_group).collect()
    }

    pub async fn update_group(&self, group: &Group) -> Result<()> {
        let result = sqlx::query(
            "UPDATE groups SET
             channel_type = ?2, upstreams = ?3, validation_endpoint = ?4,
             test_model = ?5, header_rules = ?6, proxy_keys = ?7, config_override = ?8
             WHERE id = ?1",
        )
        .bind(group.id)
        .bind(&group.channel_type)
        .bind(serde_json::to_string(&group.upstreams)?)
        .bind(&group.validation_endpoint)
        .bind(&group.test_model)
        .bind(serde_json::to_string(&group.header_rules)?)
        .bind(&group.proxy_keys)
        .bind(serde_json::to_string(&group.config_override)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("group {}", group.id)));
        }
        Ok(())
    }

    pub async fn delete_group(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM api_keys WHERE group_id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM groups WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found(format!("group {id}")));
        }
        Ok(())
    }

    // --- Keys ---

    pub async fn insert_keys(&self, keys: &[NewKey]) -> Result<Vec<ApiKey>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut inserted = Vec::with_capacity(keys.len());
        for key in keys {
            let result = sqlx::query(
                "INSERT INTO api_keys
                 (group_id, key_value, key_hash, status, base_weight, weight,
                  failure_count, request_count, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?4, 0, 0, ?5)",
            )
            .bind(key.group_id)
            .bind(&key.key_value)
            .bind(&key.key_hash)
            .bind(key.weight)
            .bind(now.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            inserted.push(ApiKey {
                id: result.last_insert_rowid(),
                group_id: key.group_id,
                key_value: key.key_value.clone(),
                key_hash: key.key_hash.clone(),
                status: KeyStatus::Active,
                base_weight: key.weight,
                weight: key.weight,
                failure_count: 0,
                request_count: 0,
                last_used_at: None,
                created_at: now,
                notes: None,
            });
        }
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn find_key(&self, id: i64) -> Result<ApiKey> {
        sqlx::query("SELECT * FROM api_keys WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row_to_key(&row))
            .transpose()?
            .ok_or_else(|| AppError::not_found(format!("key {id}")))
    }

    pub async fn keys_by_group(&self, group_id: i64, status: Option<KeyStatus>) -> Result<Vec<ApiKey>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM api_keys WHERE group_id = ?1 AND status = ?2 ORDER BY id")
                    .bind(group_id)
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM api_keys WHERE group_id = ?1 ORDER BY id")
                    .bind(group_id)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_key).collect()
    }

    /// All keys across all groups; used by the startup load.
    pub async fn all_keys(&self) -> Result<Vec<ApiKey>> {
        let rows = sqlx::query("SELECT * FROM api_keys ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_key).collect()
    }

    pub async fn keys_by_hashes(
        &self,
        group_id: i64,
        hashes: &[String],
        status: Option<KeyStatus>,
    ) -> Result<Vec<ApiKey>> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (0..hashes.len()).map(|i| format!("?{}", i + 2)).collect();
        let mut sql = format!(
            "SELECT * FROM api_keys WHERE group_id = ?1 AND key_hash IN ({})",
            placeholders.join(", ")
        );
        if let Some(status) = status {
            sql.push_str(&format!(" AND status = '{}'", status.as_str()));
        }
        let mut query = sqlx::query(&sql).bind(group_id);
        for hash in hashes {
            query = query.bind(hash);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_key).collect()
    }

    pub async fn existing_hashes(&self, group_id: i64) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key_hash FROM api_keys WHERE group_id = ?1")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>("key_hash")).collect())
    }

    pub async fn count_keys(&self, group_id: i64) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM api_keys WHERE group_id = ?1")
            .bind(group_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn delete_keys_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 1)).collect();
        let sql = format!(
            "DELETE FROM api_keys WHERE id IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Zeroes counters and reactivates the given keys.
    pub async fn restore_keys_by_ids(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 1)).collect();
        let sql = format!(
            "UPDATE api_keys SET status = 'active', failure_count = 0 WHERE id IN ({})",
            placeholders.join(", ")
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    /// Weight sync support: every key's id and persisted runtime weight.
    pub async fn all_key_weights(&self) -> Result<Vec<(i64, i64)>> {
        let rows = sqlx::query("SELECT id, weight FROM api_keys")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("id"), r.get::<i64, _>("weight")))
            .collect())
    }

    pub async fn persist_key_weight(&self, id: i64, weight: i64) -> Result<()> {
        sqlx::query("UPDATE api_keys SET weight = ?2 WHERE id = ?1")
            .bind(id)
            .bind(weight)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Usage accounting on a successful attempt; runs outside the status
    /// transaction.
    pub async fn bump_key_usage(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE api_keys SET request_count = request_count + 1, last_used_at = ?2 WHERE id = ?1",
        )
        .bind(id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_key_stats(&self, group_id: i64) -> Result<u64> {
        let result =
            sqlx::query("UPDATE api_keys SET request_count = 0, failure_count = 0 WHERE group_id = ?1")
                .bind(group_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Paged scan of (id, key_value) rows, used by the migrate-keys command.
    pub async fn key_values_page(&self, after_id: i64, limit: i64) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query(
            "SELECT id, key_value FROM api_keys WHERE id > ?1 ORDER BY id LIMIT ?2",
        )
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("id"), r.get::<String, _>("key_value")))
            .collect())
    }

    pub async fn update_key_value(&self, id: i64, key_value: &str) -> Result<()> {
        sqlx::query("UPDATE api_keys SET key_value = ?2 WHERE id = ?1")
            .bind(id)
            .bind(key_value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Async tasks ---

    /// Persists the final summary of a finished background task.
    pub async fn insert_task_summary(&self, task: &crate::tasks::TaskState) -> Result<()> {
        sqlx::query(
            "INSERT INTO async_tasks
             (id, kind, group_id, total, processed, started_at, finished_at, error, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
               processed = excluded.processed,
               finished_at = excluded.finished_at,
               error = excluded.error,
               result = excluded.result",
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(task.group_id)
        .bind(task.total as i64)
        .bind(task.processed as i64)
        .bind(task.started_at.to_rfc3339())
        .bind(task.finished_at.map(|t| t.to_rfc3339()))
        .bind(&task.error)
        .bind(task.result.as_ref().map(|r| r.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // --- Request logs ---

    pub async fn insert_request_logs(&self, entries: &[crate::request_log::RequestLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                "INSERT INTO request_logs
                 (id, group_name, key_id, model, method, path, status_code,
                  success, attempts, duration_ms, error, request_body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )
            .bind(entry.id.to_string())
            .bind(&entry.group_name)
            .bind(entry.key_id)
            .bind(&entry.model)
            .bind(&entry.method)
            .bind(&entry.path)
            .bind(entry.status_code as i64)
            .bind(entry.success)
            .bind(entry.attempts as i64)
            .bind(entry.duration_ms as i64)
            .bind(&entry.error)
            .bind(&entry.request_body)
            .bind(entry.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn recent_request_logs(&self, limit: i64) -> Result<Vec<serde_json::Value>> {
        let rows = sqlx::query(
            "SELECT id, group_name, key_id, model, method, path, status_code,
                    success, attempts, duration_ms, error, created_at
             FROM request_logs ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.get::<String, _>("id"),
                    "group_name": r.get::<String, _>("group_name"),
                    "key_id": r.get::<Option<i64>, _>("key_id"),
                    "model": r.get::<Option<String>, _>("model"),
                    "method": r.get::<String, _>("method"),
                    "path": r.get::<String, _>("path"),
                    "status_code": r.get::<i64, _>("status_code"),
                    "success": r.get::<bool, _>("success"),
                    "attempts": r.get::<i64, _>("attempts"),
                    "duration_ms": r.get::<i64, _>("duration_ms"),
                    "error": r.get::<Option<String>, _>("error"),
                    "created_at": r.get::<String, _>("created_at"),
                })
            })
            .collect())
    }
}

fn row_to_group(row: &SqliteRow) -> Result<Group> {
    let upstreams: Vec<Upstream> = serde_json::from_str(&row.get::<String, _>("upstreams"))?;
    let header_rules: Vec<HeaderRule> =
        serde_json::from_str(&row.get::<String, _>("header_rules"))?;
    let config_override: GroupConfigOverride =
        serde_json::from_str(&row.get::<String, _>("config_override"))?;
    Ok(Group {
        id: row.get("id"),
        name: row.get("name"),
        channel_type: row.get("channel_type"),
        upstreams,
        validation_endpoint: row.get("validation_endpoint"),
        test_model: row.get("test_model"),
        header_rules,
        proxy_keys: row.get("proxy_keys"),
        config_override,
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    })
}

fn row_to_key(row: &SqliteRow) -> Result<ApiKey> {
    let status_raw: String = row.get("status");
    let status = KeyStatus::parse(&status_raw).ok_or_else(|| {
        AppError::database(format!("unknown key status '{status_raw}' in database"))
    })?;
    Ok(ApiKey {
        id: row.get("id"),
        group_id: row.get("group_id"),
        key_value: row.get("key_value"),
        key_hash: row.get("key_hash"),
        status,
        base_weight: row.get("base_weight"),
        weight: row.get("weight"),
        failure_count: row.get("failure_count"),
        request_count: row.get("request_count"),
        last_used_at: row
            .get::<Option<String>, _>("last_used_at")
            .map(|s| parse_timestamp(&s)),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
        notes: row.get("notes"),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
