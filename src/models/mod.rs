// 数据模型模块 - 控制服务器协议、引擎配置与对外状态

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ==================== 控制服务器协议 ====================

/// `/status` 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_blocking: bool,
    #[serde(default)]
    pub block_count: Option<u64>,
    #[serde(default)]
    pub sites_count: Option<usize>,
    #[serde(default)]
    pub app_running: Option<bool>,
}

/// 惩罚锁定记录（`/punishment-status` 与 `/adult-strike` 共用）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub is_locked: bool,
    /// 剩余锁定秒数
    #[serde(default)]
    pub lock_time_remaining: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strikes_remaining: Option<u32>,
}

/// 本地缓存的惩罚记录，带获取时间以便离线推算剩余时长
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedPunishment {
    pub record: PunishmentRecord,
    pub fetched_at: DateTime<Utc>,
}

impl CachedPunishment {
    pub fn new(record: PunishmentRecord) -> Self {
        Self::new_at(record, Utc::now())
    }

    pub fn new_at(record: PunishmentRecord, fetched_at: DateTime<Utc>) -> Self {
        Self { record, fetched_at }
    }

    /// 推算的剩余锁定秒数（不要求精确，仅用于离线兜底）
    pub fn remaining_at(&self, now: DateTime<Utc>) -> i64 {
        let elapsed = (now - self.fetched_at).num_seconds().max(0);
        (self.record.lock_time_remaining - elapsed).max(0)
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.record.is_locked && self.remaining_at(now) > 0
    }
}

/// `/sites` 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitesResponse {
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default, rename = "alwaysBlocked")]
    pub always_blocked: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// `/nsfw-cache` 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NsfwCacheResponse {
    #[serde(default)]
    pub checked_domains: Vec<String>,
}

/// `/check-content` 请求体
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentCheckRequest {
    pub url: String,
    pub domain: String,
    pub title: String,
    pub meta_description: String,
    pub body_text: String,
}

/// `/check-content` 响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentCheckResponse {
    pub is_nsfw: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub cached: bool,
}

/// 服务器端检测未启用或缺少密钥时返回的 method
const UNCONFIGURED_METHODS: [&str; 2] = ["disabled", "no_api_key"];

impl ContentCheckResponse {
    /// 结果是否为"软失败"：不写入缓存，服务器配置好后自动重试
    pub fn is_unconfigured(&self) -> bool {
        UNCONFIGURED_METHODS.contains(&self.method.as_str())
    }
}

/// `/usage/website` 请求体
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub domain: String,
    pub seconds: i64,
}

// ==================== 引擎状态 ====================

/// 同步状态，由最近一次轮询（或离线兜底）推导
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_blocking: bool,
    pub app_connected: bool,
    pub punishment_locked: bool,
    /// 断开连接时由弹窗手动开启的会话拦截
    #[serde(default)]
    pub manual_blocking: bool,
}

/// 弹窗展示用的完整状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub is_blocking: bool,
    pub app_connected: bool,
    pub punishment_locked: bool,
    pub manual_blocking: bool,
    pub block_count: u64,
    pub sites_count: usize,
    pub always_blocked_count: usize,
    pub whitelist_count: usize,
    pub checked_domains_count: usize,
    pub lock_time_remaining: i64,
    pub queued_usage_reports: usize,
}

// ==================== 引擎配置 ====================

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 控制服务器主机
    #[serde(default = "default_server_host")]
    pub server_host: String,
    /// 首选端口
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// 首选端口被占用时服务器会依次尝试的备用端口
    #[serde(default = "default_backup_ports")]
    pub backup_ports: Vec<u16>,
    /// 请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// 状态轮询间隔（秒）
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// 使用时长刷新间隔（秒）
    #[serde(default = "default_usage_flush_interval")]
    pub usage_flush_interval_secs: u64,
    /// 会话累计达到该秒数才在定时刷新时上报
    #[serde(default = "default_usage_min_flush")]
    pub usage_min_flush_secs: i64,
    /// 离线队列重试间隔（秒）
    #[serde(default = "default_queue_drain_interval")]
    pub queue_drain_interval_secs: u64,
    /// 扩展自身页面的源，例如 chrome-extension://<id>
    #[serde(default = "default_extension_origin")]
    pub extension_origin: String,
    /// 拦截页路径
    #[serde(default = "default_blocked_page")]
    pub blocked_page: String,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    52525
}

fn default_backup_ports() -> Vec<u16> {
    vec![52526, 52527, 52528, 52529]
}

fn default_request_timeout() -> u64 {
    5
}

fn default_poll_interval() -> u64 {
    2
}

fn default_usage_flush_interval() -> u64 {
    15
}

fn default_usage_min_flush() -> i64 {
    10
}

fn default_queue_drain_interval() -> u64 {
    30
}

fn default_extension_origin() -> String {
    "chrome-extension://focus-guard".to_string()
}

fn default_blocked_page() -> String {
    "blocked.html".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_host: default_server_host(),
            server_port: default_server_port(),
            backup_ports: default_backup_ports(),
            request_timeout_secs: default_request_timeout(),
            poll_interval_secs: default_poll_interval(),
            usage_flush_interval_secs: default_usage_flush_interval(),
            usage_min_flush_secs: default_usage_min_flush(),
            queue_drain_interval_secs: default_queue_drain_interval(),
            extension_origin: default_extension_origin(),
            blocked_page: default_blocked_page(),
        }
    }
}

impl EngineConfig {
    /// 按尝试顺序排列的端口
    pub fn candidate_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.server_port];
        for port in &self.backup_ports {
            if !ports.contains(port) {
                ports.push(*port);
            }
        }
        ports
    }
}

/// 配置的部分更新
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfigPatch {
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub backup_ports: Option<Vec<u16>>,
    pub request_timeout_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub usage_flush_interval_secs: Option<u64>,
    pub usage_min_flush_secs: Option<i64>,
    pub queue_drain_interval_secs: Option<u64>,
    pub extension_origin: Option<String>,
    pub blocked_page: Option<String>,
}
