//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- 桌子（工作区）表
CREATE TABLE IF NOT EXISTS gallery_tables (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    is_locked INTEGER NOT NULL DEFAULT 0,
    current_image_id TEXT,          -- 当前展示图
    created_at INTEGER NOT NULL,    -- 毫秒时间戳
    updated_at INTEGER NOT NULL     -- 增量读取的比较字段
);

-- 生成图片表
CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    table_id TEXT NOT NULL REFERENCES gallery_tables(id),
    persona_id TEXT NOT NULL,
    prompt TEXT NOT NULL,
    url TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_tables_updated ON gallery_tables(updated_at);
CREATE INDEX IF NOT EXISTS idx_images_updated ON images(updated_at);
CREATE INDEX IF NOT EXISTS idx_images_table ON images(table_id, updated_at);
"#;
