//! 基于 HTTP 的 ChangeSource / WorkspaceSource

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::WatchConfig;
use crate::error::{Error, Result};
use crate::feed::{ChangeSource, WorkspaceSource};
use crate::protocol::{ChangeQuery, ChangeRecord, WorkspaceSnapshot};

/// 远程数据源
#[derive(Clone)]
pub struct HttpFeedClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFeedClient {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// 发送请求并解析 JSON；非 2xx 视为拉取失败
    async fn fetch_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Fetch(format!("HTTP {}: {}", status, text)));
        }

        response.json::<T>().await.map_err(Into::into)
    }
}

#[async_trait]
impl ChangeSource for HttpFeedClient {
    async fn changes_since(&self, query: ChangeQuery) -> Result<Vec<ChangeRecord>> {
        let mut params = vec![
            ("since", query.since.to_string()),
            ("limit", query.clamped_limit().to_string()),
        ];
        if let Some(scope) = query.scope {
            params.push(("scope", scope));
        }

        let request = self.client.get(self.url("/api/changes")).query(&params);
        self.fetch_json(request).await
    }
}

#[async_trait]
impl WorkspaceSource for HttpFeedClient {
    async fn list_workspaces(&self) -> Result<Vec<WorkspaceSnapshot>> {
        let request = self.client.get(self.url("/api/tables"));
        self.fetch_json(request).await
    }
}
