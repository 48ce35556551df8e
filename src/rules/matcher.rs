// 域名匹配器 - 将域名列表编译为单个正则表达式
//
// 匹配规则：http/https 协议，解析出的主机为该域名本身或其任意子域名。
// 正则只作用于主机名并首尾锚定，用户信息、端口、路径都不参与匹配，
// 因此 youtube.com 不会匹配 youtube-downloader.com，也不会匹配 youtube.com.evil.com

use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::url::{normalize_domain, strip_scheme, strip_www, url_host};

/// 编译后的域名匹配器
#[derive(Debug, Clone)]
pub struct DomainMatcher {
    regex: Regex,
    domain_count: usize,
}

impl DomainMatcher {
    /// URL 是否命中任一域名
    pub fn matches(&self, url: &str) -> bool {
        url_host(url).map_or(false, |host| self.matches_host(&host))
    }

    /// 主机名（已小写）是否命中任一域名
    pub fn matches_host(&self, host: &str) -> bool {
        self.regex.is_match(host)
    }

    /// 规则包含的域名数量
    pub fn len(&self) -> usize {
        self.domain_count
    }

    pub fn is_empty(&self) -> bool {
        self.domain_count == 0
    }
}

/// 编译域名列表
///
/// 空列表返回 None，表示该策略未启用
pub fn build_matcher<I, S>(domains: I) -> Option<DomainMatcher>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = domains
        .into_iter()
        .map(|d| normalize_domain(d.as_ref()))
        .filter(|d| !d.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();

    if normalized.is_empty() {
        return None;
    }

    let alternatives = normalized
        .iter()
        .map(|d| regex::escape(d))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(
        r"^(?:[a-z0-9_-]+\.)*(?:{})$",
        alternatives
    );

    match RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .size_limit(64 * 1024 * 1024)
        .build()
    {
        Ok(regex) => Some(DomainMatcher {
            regex,
            domain_count: normalized.len(),
        }),
        Err(e) => {
            warn!("域名规则编译失败（{} 个域名）: {}", normalized.len(), e);
            None
        }
    }
}

/// 白名单检查
///
/// URL 和白名单条目都会转小写、去掉协议和 `www.` 前缀，
/// 条目与 URL 完全相同或是 URL 的字面前缀即视为放行
pub fn is_whitelisted(url: &str, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return false;
    }

    let target = strip_for_whitelist(url);
    whitelist.iter().any(|entry| {
        let entry = strip_for_whitelist(entry);
        !entry.is_empty() && (target == entry || target.starts_with(&entry))
    })
}

fn strip_for_whitelist(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    strip_www(strip_scheme(&lowered)).to_string()
}
