// 内容检测流水线 - 将新访问域名的页面信号交给服务器判定
//
// 所有失败（网络、提取、非 2xx）都只在本地记录，域名保持未检测状态，
// 下次访问时自动重试；从不影响当前导航

pub mod cache;

pub use cache::{ClassificationCache, InProgressToken};

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control::ControlApi;
use crate::event_bus::{AppEvent, EventBus};
use crate::host::{BrowserHost, PageSignals, TabId};
use crate::intercept::{BlockReason, InterceptionGuard};
use crate::models::{ContentCheckRequest, ContentCheckResponse};
use crate::rules::is_local_domain;
use crate::state::EngineState;
use crate::storage::{self, keys, KeyValueStore};

/// 正文最多提交的字符数
const MAX_BODY_CHARS: usize = 2000;

/// 一次检测的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifyOutcome {
    /// 未检测：已检测过、正在检测、本机域名、已被列表覆盖或服务器不可达
    Skipped,
    /// 检测请求失败，等待下次访问重试
    Failed,
    /// 服务器未配置检测，结果不缓存
    Unconfigured,
    /// 判定为正常内容
    Clean,
    /// 判定为违规内容，已拦截
    Flagged,
}

pub struct ClassificationPipeline {
    control: Arc<dyn ControlApi>,
    host: Arc<dyn BrowserHost>,
    state: Arc<EngineState>,
    guard: Arc<InterceptionGuard>,
    store: Arc<dyn KeyValueStore>,
    event_bus: Arc<EventBus>,
}

impl ClassificationPipeline {
    pub fn new(
        control: Arc<dyn ControlApi>,
        host: Arc<dyn BrowserHost>,
        state: Arc<EngineState>,
        guard: Arc<InterceptionGuard>,
        store: Arc<dyn KeyValueStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            control,
            host,
            state,
            guard,
            store,
            event_bus,
        }
    }

    /// 恢复持久化的已检测域名
    pub async fn restore(&self) {
        if let Some(domains) =
            storage::load::<Vec<String>>(&*self.store, keys::CHECKED_DOMAINS).await
        {
            let count = self.state.classification().merge_checked(&domains);
            debug!("已恢复 {} 个已检测域名", count);
        }
    }

    /// 域名是否需要检测
    pub fn should_check(&self, domain: &str) -> bool {
        let cache = self.state.classification();
        if domain.is_empty() || cache.is_checked(domain) || cache.is_in_progress(domain) {
            return false;
        }
        if is_local_domain(domain) {
            return false;
        }
        // 已被列表覆盖的域名由拦截规则处理
        !self.guard.is_listed(&format!("https://{}/", domain))
    }

    /// 检测一个已加载完成的页面
    pub async fn classify(&self, tab_id: TabId, url: &str, domain: &str) -> ClassifyOutcome {
        if !self.state.sync().await.app_connected {
            // 连接状态可能已过期，先探测一次
            if let Err(e) = self.control.ping().await {
                debug!("控制服务器不可达，跳过检测 {}: {}", domain, e);
                return ClassifyOutcome::Skipped;
            }
        }

        if !self.should_check(domain) {
            return ClassifyOutcome::Skipped;
        }
        let Some(_token) = self.state.classification().begin(domain) else {
            return ClassifyOutcome::Skipped;
        };

        let signals = match self.host.extract_page_signals(tab_id).await {
            Ok(signals) => signals,
            Err(e) => {
                warn!("提取页面内容失败 {}，使用空内容继续检测: {}", domain, e);
                PageSignals::default()
            }
        };

        let request = ContentCheckRequest {
            url: url.to_string(),
            domain: domain.to_string(),
            title: signals.title,
            meta_description: signals.meta_description,
            body_text: truncate_chars(&signals.body_text, MAX_BODY_CHARS),
        };

        match self.control.check_content(&request).await {
            Ok(response) => self.apply_verdict(tab_id, url, domain, response).await,
            Err(e) => {
                debug!("内容检测请求失败 {}: {}", domain, e);
                ClassifyOutcome::Failed
            }
        }
    }

    async fn apply_verdict(
        &self,
        tab_id: TabId,
        url: &str,
        domain: &str,
        response: ContentCheckResponse,
    ) -> ClassifyOutcome {
        if response.is_unconfigured() {
            debug!("服务器未启用内容检测 ({})，{} 保持未检测", response.method, domain);
            return ClassifyOutcome::Unconfigured;
        }

        let cache = self.state.classification();
        cache.mark_checked(domain);
        storage::save_best_effort(&*self.store, keys::CHECKED_DOMAINS, &cache.checked_domains())
            .await;

        if !response.is_nsfw {
            debug!(
                "内容检测通过 {} (method={}, confidence={:.2})",
                domain, response.method, response.confidence
            );
            return ClassifyOutcome::Clean;
        }

        info!(
            "内容检测判定违规 {} (method={}, confidence={:.2})",
            domain, response.method, response.confidence
        );

        let (added, rules) = self.state.update_rules(|r| r.add_permanent(domain)).await;
        if added {
            storage::save_best_effort(&*self.store, keys::RULE_SET, &rules).await;
        }
        self.guard.set_rules(&rules);

        self.guard.record_block(url, BlockReason::Nsfw);
        let target = self.guard.blocked_page_url(url, BlockReason::Nsfw);
        if let Err(e) = self.host.navigate(tab_id, &target).await {
            warn!("跳转拦截页失败 (tab {}): {}", tab_id, e);
        }
        self.guard.signal_strike(url, BlockReason::Nsfw);

        self.event_bus.publish(AppEvent::DomainFlagged {
            domain: domain.to_string(),
            confidence: response.confidence,
            method: response.method,
        });
        ClassifyOutcome::Flagged
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
