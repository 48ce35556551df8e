// 控制服务器模块 - 本地桌面应用提供的 HTTP 接口
//
// 同步引擎、内容检测和使用统计都只依赖 ControlApi trait，
// 生产环境使用 reqwest 实现的 ControlClient

pub mod client;

pub use client::ControlClient;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ContentCheckRequest, ContentCheckResponse, NsfwCacheResponse, PunishmentRecord,
    SitesResponse, StatusResponse, UsageReport,
};

/// 控制服务器接口
///
/// 网络错误、非 2xx 状态码和无法解析的响应体一律以 Err 返回，
/// 调用方不区分这几种情况
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// GET /status
    async fn status(&self) -> Result<StatusResponse>;

    /// GET /punishment-status
    async fn punishment_status(&self) -> Result<PunishmentRecord>;

    /// GET /sites
    async fn sites(&self) -> Result<SitesResponse>;

    /// POST /adult-strike
    async fn report_strike(&self) -> Result<PunishmentRecord>;

    /// GET /nsfw-cache
    async fn nsfw_cache(&self) -> Result<NsfwCacheResponse>;

    /// POST /check-content
    async fn check_content(&self, request: &ContentCheckRequest) -> Result<ContentCheckResponse>;

    /// POST /usage/website
    async fn report_usage(&self, report: &UsageReport) -> Result<()>;

    /// GET /ping
    async fn ping(&self) -> Result<()>;
}
