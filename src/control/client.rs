// 控制服务器 HTTP 客户端
// 负责与桌面应用的本地服务器交互，自动在首选端口和备用端口之间发现可用端口

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::ControlApi;
use crate::models::{
    ContentCheckRequest, ContentCheckResponse, EngineConfig, NsfwCacheResponse,
    PunishmentRecord, SitesResponse, StatusResponse, UsageReport,
};

/// 控制服务器客户端
pub struct ControlClient {
    client: Client,
    host: String,
    ports: Vec<u16>,
    /// 最近一次探测成功的端口，连接失败时清空以便重新发现
    active_port: Mutex<Option<u16>>,
}

impl ControlClient {
    /// 创建新的客户端
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// 使用共享的 HTTP 客户端（复用连接池）
    pub fn with_client(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            host: config.server_host.clone(),
            ports: config.candidate_ports(),
            active_port: Mutex::new(None),
        }
    }

    fn base_url(&self, port: u16) -> String {
        format!("http://{}:{}", self.host, port)
    }

    fn remembered_port(&self) -> Option<u16> {
        self.active_port.lock().ok().and_then(|p| *p)
    }

    fn remember_port(&self, port: Option<u16>) {
        if let Ok(mut active) = self.active_port.lock() {
            *active = port;
        }
    }

    /// 依次探测候选端口，返回第一个响应 /ping 的端口
    async fn discover_port(&self) -> Result<u16> {
        if let Some(port) = self.remembered_port() {
            return Ok(port);
        }

        for port in &self.ports {
            let url = format!("{}/ping", self.base_url(*port));
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("已连接控制服务器: {}", self.base_url(*port));
                    self.remember_port(Some(*port));
                    return Ok(*port);
                }
                Ok(response) => {
                    debug!("端口 {} 响应异常: {}", port, response.status());
                }
                Err(e) => {
                    debug!("端口 {} 不可用: {}", port, e);
                }
            }
        }

        Err(anyhow!("控制服务器不可达（已尝试端口 {:?}）", self.ports))
    }

    /// 发送请求并检查状态码；连接失败时忘记当前端口
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                if e.is_connect() || e.is_timeout() {
                    self.remember_port(None);
                }
                return Err(e.into());
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("控制服务器返回 {}: {}", status, error_text));
        }

        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let port = self.discover_port().await?;
        let url = format!("{}{}", self.base_url(port), path);
        let response = self.send(self.client.get(&url)).await?;
        Ok(response.json::<T>().await?)
    }

    async fn post_json<B, T>(&self, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let port = self.discover_port().await?;
        let url = format!("{}{}", self.base_url(port), path);
        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = self.send(request).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ControlApi for ControlClient {
    async fn status(&self) -> Result<StatusResponse> {
        self.get_json("/status").await
    }

    async fn punishment_status(&self) -> Result<PunishmentRecord> {
        self.get_json("/punishment-status").await
    }

    async fn sites(&self) -> Result<SitesResponse> {
        self.get_json("/sites").await
    }

    async fn report_strike(&self) -> Result<PunishmentRecord> {
        self.post_json::<(), _>("/adult-strike", None).await
    }

    async fn nsfw_cache(&self) -> Result<NsfwCacheResponse> {
        self.get_json("/nsfw-cache").await
    }

    async fn check_content(&self, request: &ContentCheckRequest) -> Result<ContentCheckResponse> {
        self.post_json("/check-content", Some(request)).await
    }

    async fn report_usage(&self, report: &UsageReport) -> Result<()> {
        let port = self.discover_port().await?;
        let url = format!("{}/usage/website", self.base_url(port));
        self.send(self.client.post(&url).json(report)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        // 强制重新探测，确认服务器确实在线
        self.remember_port(None);
        self.discover_port().await.map(|_| ())
    }
}
