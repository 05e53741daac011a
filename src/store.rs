//! Gallery Store - 桌子和生成图片的 SQLite 存储
//!
//! 提供 Adaptive Feed 需要的两个读接口（增量变化、工作区列表），
//! 以及触发广播的两个写操作（记录图片、锁定桌子）。

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::config::{ConnectionMode, StoreConfig};
use crate::error::{Error, Result};
use crate::feed::{ChangeSource, WorkspaceSource};
use crate::protocol::{
    current_time_ms, ChangeKind, ChangeQuery, ChangeRecord, GalleryRef, WorkspaceSnapshot,
};
use crate::schema;

/// 存储句柄（可 Clone，共享同一个连接）
#[derive(Clone)]
pub struct GalleryStore {
    conn: Arc<Mutex<Connection>>,
    /// 最近一次写入使用的时间戳，保证 updated_at 严格递增
    last_ts: Arc<AtomicI64>,
}

impl GalleryStore {
    /// 连接数据库
    pub fn connect(config: StoreConfig) -> Result<Self> {
        let conn = match config.mode {
            ConnectionMode::Local => Self::open_local(&config)?,
            ConnectionMode::Memory => Connection::open_in_memory()?,
        };

        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        let last_ts: i64 = conn.query_row(
            "SELECT MAX(COALESCE((SELECT MAX(updated_at) FROM gallery_tables), 0),
                        COALESCE((SELECT MAX(updated_at) FROM images), 0))",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            last_ts: Arc::new(AtomicI64::new(last_ts)),
        })
    }

    fn open_local(config: &StoreConfig) -> Result<Connection> {
        let path = Path::new(&config.url);

        // 确保目录存在
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

        tracing::info!("数据库已连接: {:?}", path);
        Ok(conn)
    }

    /// 下一个写入时间戳；调用方必须持有连接锁
    fn next_timestamp(&self) -> i64 {
        let ts = current_time_ms().max(self.last_ts.load(Ordering::Relaxed) + 1);
        self.last_ts.store(ts, Ordering::Relaxed);
        ts
    }

    // ==================== 桌子 ====================

    /// 创建桌子
    pub fn create_table(&self, name: &str) -> Result<WorkspaceSnapshot> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("table name must not be empty".into()));
        }

        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        let ts = self.next_timestamp();
        conn.execute(
            "INSERT INTO gallery_tables (id, name, is_locked, created_at, updated_at) VALUES (?1, ?2, 0, ?3, ?3)",
            params![id, name, ts],
        )?;

        Ok(WorkspaceSnapshot {
            id,
            name: name.to_string(),
            is_locked: false,
            gallery: None,
        })
    }

    /// 获取单张桌子
    pub fn get_table(&self, id: &str) -> Result<Option<WorkspaceSnapshot>> {
        let conn = self.conn.lock();
        Self::query_table(&conn, id)
    }

    fn query_table(conn: &Connection, id: &str) -> Result<Option<WorkspaceSnapshot>> {
        conn.query_row(
            r#"
            SELECT t.id, t.name, t.is_locked, i.url
            FROM gallery_tables t
            LEFT JOIN images i ON i.id = t.current_image_id
            WHERE t.id = ?1
            "#,
            params![id],
            row_to_snapshot,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 列出所有桌子（按创建时间）
    pub fn list_workspaces(&self) -> Result<Vec<WorkspaceSnapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT t.id, t.name, t.is_locked, i.url
            FROM gallery_tables t
            LEFT JOIN images i ON i.id = t.current_image_id
            ORDER BY t.created_at ASC
            "#,
        )?;

        let rows = stmt.query_map([], row_to_snapshot)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 锁定桌子，返回桌子的变化记录
    pub fn lock_table(&self, id: &str) -> Result<ChangeRecord> {
        let conn = self.conn.lock();
        let ts = self.next_timestamp();
        let updated = conn.execute(
            "UPDATE gallery_tables SET is_locked = 1, updated_at = ?2 WHERE id = ?1",
            params![id, ts],
        )?;
        if updated == 0 {
            return Err(Error::NotFound(format!("table {}", id)));
        }

        let snapshot = Self::query_table(&conn, id)?
            .ok_or_else(|| Error::NotFound(format!("table {}", id)))?;
        table_record(snapshot, ts)
    }

    // ==================== 图片 ====================

    /// 记录一张生成图片，并设为该桌子的当前展示图
    ///
    /// 桌子不存在返回 NotFound，已锁定返回 Validation。
    pub fn record_image(
        &self,
        table_id: &str,
        persona_id: &str,
        prompt: &str,
        url: &str,
    ) -> Result<ChangeRecord> {
        if url.trim().is_empty() {
            return Err(Error::Validation("image url must not be empty".into()));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let is_locked: Option<bool> = tx
            .query_row(
                "SELECT is_locked FROM gallery_tables WHERE id = ?1",
                params![table_id],
                |row| row.get(0),
            )
            .optional()?;
        match is_locked {
            None => return Err(Error::NotFound(format!("table {}", table_id))),
            Some(true) => {
                return Err(Error::Validation(format!("table {} is locked", table_id)));
            }
            Some(false) => {}
        }

        let id = Uuid::new_v4().to_string();
        let ts = self.next_timestamp();
        tx.execute(
            r#"
            INSERT INTO images (id, table_id, persona_id, prompt, url, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![id, table_id, persona_id, prompt, url, ts],
        )?;
        // 桌子的变化单独占一个时间戳，分页时不会和图片挤在同一毫秒
        let table_ts = self.next_timestamp();
        tx.execute(
            "UPDATE gallery_tables SET current_image_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![table_id, id, table_ts],
        )?;
        tx.commit()?;

        Ok(ChangeRecord {
            id: id.clone(),
            kind: ChangeKind::Image,
            table_id: table_id.to_string(),
            updated_at: ts,
            data: json!({
                "id": id,
                "tableId": table_id,
                "personaId": persona_id,
                "prompt": prompt,
                "url": url,
                "createdAt": ts,
            }),
        })
    }

    // ==================== 增量读取 ====================

    /// 返回 `updated_at > since` 的变化记录，按 updated_at 升序，最多 limit 条
    pub fn changes_since(&self, query: &ChangeQuery) -> Result<Vec<ChangeRecord>> {
        let limit = query.clamped_limit();
        let conn = self.conn.lock();

        let mut changes = Vec::new();

        {
            let mut stmt = conn.prepare(
                r#"
                SELECT id, table_id, persona_id, prompt, url, created_at, updated_at
                FROM images
                WHERE updated_at > ?1 AND (?2 IS NULL OR table_id = ?2)
                ORDER BY updated_at ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(params![query.since, query.scope, limit as i64], |row| {
                let id: String = row.get(0)?;
                let table_id: String = row.get(1)?;
                let updated_at: i64 = row.get(6)?;
                Ok(ChangeRecord {
                    id: id.clone(),
                    kind: ChangeKind::Image,
                    table_id: table_id.clone(),
                    updated_at,
                    data: json!({
                        "id": id,
                        "tableId": table_id,
                        "personaId": row.get::<_, String>(2)?,
                        "prompt": row.get::<_, String>(3)?,
                        "url": row.get::<_, String>(4)?,
                        "createdAt": row.get::<_, i64>(5)?,
                    }),
                })
            })?;
            for row in rows {
                changes.push(row?);
            }
        }

        {
            let mut stmt = conn.prepare(
                r#"
                SELECT t.id, t.name, t.is_locked, i.url, t.updated_at
                FROM gallery_tables t
                LEFT JOIN images i ON i.id = t.current_image_id
                WHERE t.updated_at > ?1 AND (?2 IS NULL OR t.id = ?2)
                ORDER BY t.updated_at ASC
                LIMIT ?3
                "#,
            )?;
            let rows = stmt.query_map(params![query.since, query.scope, limit as i64], |row| {
                Ok((row_to_snapshot(row)?, row.get::<_, i64>(4)?))
            })?;
            for row in rows {
                let (snapshot, updated_at) = row?;
                changes.push(table_record(snapshot, updated_at)?);
            }
        }

        // 同一时间戳下图片在前，桌子在后
        changes.sort_by_key(|c| (c.updated_at, c.kind == ChangeKind::Table));
        changes.truncate(limit);
        Ok(changes)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceSnapshot> {
    let url: Option<String> = row.get(3)?;
    Ok(WorkspaceSnapshot {
        id: row.get(0)?,
        name: row.get(1)?,
        is_locked: row.get(2)?,
        gallery: url.map(|current_url| GalleryRef { current_url }),
    })
}

fn table_record(snapshot: WorkspaceSnapshot, updated_at: i64) -> Result<ChangeRecord> {
    Ok(ChangeRecord {
        id: snapshot.id.clone(),
        kind: ChangeKind::Table,
        table_id: snapshot.id.clone(),
        updated_at,
        data: serde_json::to_value(&snapshot)?,
    })
}

#[async_trait]
impl ChangeSource for GalleryStore {
    async fn changes_since(&self, query: ChangeQuery) -> Result<Vec<ChangeRecord>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || GalleryStore::changes_since(&store, &query))
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?
    }
}

#[async_trait]
impl WorkspaceSource for GalleryStore {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSnapshot>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || GalleryStore::list_workspaces(&store))
            .await
            .map_err(|e| Error::Fetch(e.to_string()))?
    }
}
