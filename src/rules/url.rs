//! URL 与域名工具函数
//!
//! 所有规则条目和访问记录都以"去掉协议、去掉 www. 前缀、小写"的形式保存

use reqwest::Url;

/// 规范化域名条目：去掉协议、`www.` 前缀和路径部分
pub fn normalize_domain(entry: &str) -> String {
    let lowered = entry.trim().to_lowercase();
    let without_scheme = strip_scheme(&lowered);
    let host = without_scheme
        .split(|c| c == '/' || c == '?' || c == '#')
        .next()
        .unwrap_or("");
    strip_www(host).trim_end_matches('.').to_string()
}

/// 去掉 http:// 或 https:// 前缀（调用方负责先转小写）
pub(crate) fn strip_scheme(value: &str) -> &str {
    value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(value)
}

pub(crate) fn strip_www(value: &str) -> &str {
    value.strip_prefix("www.").unwrap_or(value)
}

/// 从 URL 中提取用于统计和分类的域名
///
/// 只接受 http/https，其余（浏览器内部页、扩展页、file 等）返回 None
pub fn extract_domain(url: &str) -> Option<String> {
    let host = url_host(url)?;
    let domain = strip_www(&host);
    if domain.is_empty() {
        return None;
    }
    Some(domain.to_string())
}

/// 解析 http/https URL 的主机名：小写，去掉 IPv6 方括号和末尾的 "."
///
/// 用户信息、端口和路径都被丢弃
pub fn url_host(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed
        .host_str()?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_lowercase();
    if host.is_empty() {
        return None;
    }
    Some(host)
}

/// 浏览器内部页面（chrome://、about:、扩展页等）不参与统计和检测
pub fn is_internal_url(url: &str) -> bool {
    let lowered = url.trim_start().to_lowercase();
    !(lowered.starts_with("http://") || lowered.starts_with("https://"))
}

/// 本机回环地址
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_lowercase();
    if host == "localhost" || host.ends_with(".localhost") || host == "::1" {
        return true;
    }
    // 127.0.0.0/8
    let octets: Vec<&str> = host.split('.').collect();
    octets.len() == 4
        && octets[0] == "127"
        && octets.iter().all(|o| o.parse::<u8>().is_ok())
}

/// 本地网络域名（回环或 mDNS 的 .local），不送去内容检测
pub fn is_local_domain(domain: &str) -> bool {
    is_loopback_host(domain) || domain.to_lowercase().ends_with(".local")
}

/// URL 的主机部分是否为回环地址
pub fn url_targets_loopback(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(is_loopback_host))
        .unwrap_or(false)
}
