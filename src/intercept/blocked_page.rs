// 拦截页地址构造

use reqwest::Url;

use super::BlockReason;
use crate::models::EngineConfig;

/// 扩展自带的拦截页
#[derive(Debug, Clone)]
pub struct BlockedPage {
    origin: String,
    page_url: String,
}

impl BlockedPage {
    pub fn new(extension_origin: &str, page: &str) -> Self {
        let origin = extension_origin.trim_end_matches('/').to_string();
        let page_url = format!("{}/{}", origin, page.trim_start_matches('/'));
        Self { origin, page_url }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.extension_origin, &config.blocked_page)
    }

    /// 拦截页地址：`<page>?url=<原地址>&reason=<标记>`
    pub fn redirect_url(&self, original: &str, reason: BlockReason) -> String {
        match Url::parse_with_params(
            &self.page_url,
            &[("url", original), ("reason", reason.as_str())],
        ) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}?reason={}", self.page_url, reason.as_str()),
        }
    }

    /// URL 是否为扩展自身的页面
    pub fn is_extension_url(&self, url: &str) -> bool {
        let origin = self.origin.to_lowercase();
        let url = url.trim().to_lowercase();
        url == origin || url.starts_with(&format!("{}/", origin))
    }
}
