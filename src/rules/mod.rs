// 规则模块 - 域名列表、白名单与匹配器

pub mod matcher;
pub mod url;

pub use matcher::{build_matcher, is_whitelisted, DomainMatcher};
pub use url::{
    extract_domain, is_internal_url, is_local_domain, is_loopback_host, normalize_domain,
    url_host, url_targets_loopback,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::SitesResponse;

/// 拦截规则集
///
/// 每次从控制服务器拉取到新副本时整体替换，并持久化以便无服务器时重启仍可用。
/// `permanent_domains`（成人内容列表）在运行期只增不减
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    /// 专注会话期间拦截的域名
    #[serde(default)]
    session_domains: BTreeSet<String>,
    /// 始终拦截的域名
    #[serde(default)]
    permanent_domains: BTreeSet<String>,
    /// 白名单（保持服务器给出的顺序）
    #[serde(default)]
    whitelist: Vec<String>,
}

impl RuleSet {
    pub fn new<S, P, W>(session: S, permanent: P, whitelist: W) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
        W: IntoIterator,
        W::Item: AsRef<str>,
    {
        Self {
            session_domains: normalize_set(session),
            permanent_domains: normalize_set(permanent),
            whitelist: whitelist
                .into_iter()
                .map(|w| w.as_ref().trim().to_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// 由 `/sites` 响应构建
    pub fn from_sites(sites: SitesResponse) -> Self {
        Self::new(sites.sites, sites.always_blocked, sites.whitelist)
    }

    /// 用服务器副本替换，但保留本地检测新增的永久域名
    pub fn merged_with_remote(&self, remote: RuleSet) -> RuleSet {
        let mut merged = remote;
        merged
            .permanent_domains
            .extend(self.permanent_domains.iter().cloned());
        merged
    }

    /// 追加一个永久拦截域名，返回是否为新增
    pub fn add_permanent(&mut self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        if domain.is_empty() {
            return false;
        }
        self.permanent_domains.insert(domain)
    }

    pub fn session_domains(&self) -> &BTreeSet<String> {
        &self.session_domains
    }

    pub fn permanent_domains(&self) -> &BTreeSet<String> {
        &self.permanent_domains
    }

    pub fn whitelist(&self) -> &[String] {
        &self.whitelist
    }

    /// 编译为可直接用于拦截判断的形式
    pub fn compile(&self) -> CompiledRules {
        CompiledRules {
            session: build_matcher(&self.session_domains),
            permanent: build_matcher(&self.permanent_domains),
            whitelist: self.whitelist.clone(),
        }
    }
}

fn normalize_set<I>(domains: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    domains
        .into_iter()
        .map(|d| normalize_domain(d.as_ref()))
        .filter(|d| !d.is_empty())
        .collect()
}

/// 编译后的规则集
#[derive(Debug, Clone, Default)]
pub struct CompiledRules {
    pub session: Option<DomainMatcher>,
    pub permanent: Option<DomainMatcher>,
    pub whitelist: Vec<String>,
}

impl CompiledRules {
    pub fn matches_session(&self, url: &str) -> bool {
        self.session.as_ref().is_some_and(|m| m.matches(url))
    }

    pub fn matches_permanent(&self, url: &str) -> bool {
        self.permanent.as_ref().is_some_and(|m| m.matches(url))
    }

    pub fn is_whitelisted(&self, url: &str) -> bool {
        is_whitelisted(url, &self.whitelist)
    }
}
