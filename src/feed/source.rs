//! Adaptive Feed 的数据源能力

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{ChangeQuery, ChangeRecord, WorkspaceSnapshot};

/// "列出 since 之后变化的记录"
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changes_since(&self, query: ChangeQuery) -> Result<Vec<ChangeRecord>>;
}

/// "列出所有工作区"，只用于完成判定和退避分级
#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSnapshot>>;
}
