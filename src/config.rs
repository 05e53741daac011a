//! 存储配置

use std::path::PathBuf;

/// 存储连接配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 数据库路径（内存模式下忽略）
    pub url: String,

    /// 连接模式
    pub mode: ConnectionMode,
}

/// 连接模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    /// 本地 SQLite 文件
    Local,
    /// 内存数据库（测试 / 临时演示）
    Memory,
}

impl StoreConfig {
    /// 创建本地 SQLite 配置
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        Self {
            url: path.display().to_string(),
            mode: ConnectionMode::Local,
        }
    }

    /// 创建内存数据库配置
    pub fn memory() -> Self {
        Self {
            url: ":memory:".to_string(),
            mode: ConnectionMode::Memory,
        }
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(url) = std::env::var("GALLERY_LIVE_DB") {
            if url == ":memory:" {
                return Self::memory();
            }
            return Self::local(url);
        }

        // 默认路径: ~/.gallery-live/db/gallery.db
        let default_path = default_data_dir().join("db").join("gallery.db");
        Self::local(default_path)
    }

    /// 获取数据库文件路径 (仅本地模式)
    pub fn path(&self) -> Option<PathBuf> {
        match self.mode {
            ConnectionMode::Local => Some(PathBuf::from(&self.url)),
            ConnectionMode::Memory => None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// 默认数据目录 ~/.gallery-live
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gallery-live")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_config_path() {
        let config = StoreConfig::local("/tmp/gallery/test.db");
        assert_eq!(config.mode, ConnectionMode::Local);
        assert_eq!(config.path(), Some(PathBuf::from("/tmp/gallery/test.db")));
    }

    #[test]
    fn test_memory_config_has_no_path() {
        let config = StoreConfig::memory();
        assert_eq!(config.mode, ConnectionMode::Memory);
        assert!(config.path().is_none());
    }

    #[test]
    fn test_default_data_dir() {
        assert!(default_data_dir().ends_with(".gallery-live"));
    }
}
