// 拦截模块 - 三条独立的导航拦截规则
//
// | 规则       | 启用条件                 | 判断                           |
// |------------|--------------------------|--------------------------------|
// | 始终拦截   | 进程启动后一直启用       | 永久域名（不受白名单影响）     |
// | 会话拦截   | is_blocking == true      | 先白名单放行，再匹配会话域名   |
// | 惩罚锁定   | punishment_locked == true| 只放行扩展页面和本机回环地址   |
//
// 惩罚锁定启用时优先于其余两条规则。判断是同步的，宿主在导航发生时直接调用

pub mod blocked_page;

pub use blocked_page::BlockedPage;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::event_bus::{AppEvent, EventBus};
use crate::rules::{extract_domain, url_targets_loopback, CompiledRules, RuleSet};

/// 拦截规则种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    AlwaysBlock,
    SessionBlock,
    Punishment,
}

/// 拦截原因，作为拦截页的 reason 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// 专注会话拦截
    Session,
    /// 永久列表中的成人网站
    Adult,
    /// 惩罚锁定
    Punishment,
    /// 内容检测判定
    Nsfw,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Adult => "adult",
            Self::Punishment => "punishment",
            Self::Nsfw => "nsfw",
        }
    }
}

/// 请求资源类型，只拦截主文档导航
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    Other,
}

/// 待判断的导航请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationRequest {
    pub url: String,
    pub resource_type: ResourceType,
}

impl NavigationRequest {
    pub fn main_frame(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            resource_type: ResourceType::MainFrame,
        }
    }
}

/// 拦截判断结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Redirect { url: String, reason: BlockReason },
}

impl Decision {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Decision::Redirect { .. })
    }
}

/// 拦截产生的后台信号，由后台任务异步处理（结果不影响拦截判断）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardSignal {
    /// 拦截计数变化，需要持久化
    BlockCountChanged { count: u64 },
    /// 需要向服务器上报违规
    Strike { domain: String, reason: BlockReason },
}

pub type SignalSender = mpsc::UnboundedSender<GuardSignal>;
pub type SignalReceiver = mpsc::UnboundedReceiver<GuardSignal>;

#[derive(Debug, Default, Clone, Copy)]
struct ArmedFilters {
    always_block: bool,
    session_block: bool,
    punishment: bool,
}

impl ArmedFilters {
    fn slot(&mut self, kind: FilterKind) -> &mut bool {
        match kind {
            FilterKind::AlwaysBlock => &mut self.always_block,
            FilterKind::SessionBlock => &mut self.session_block,
            FilterKind::Punishment => &mut self.punishment,
        }
    }

    fn get(&self, kind: FilterKind) -> bool {
        match kind {
            FilterKind::AlwaysBlock => self.always_block,
            FilterKind::SessionBlock => self.session_block,
            FilterKind::Punishment => self.punishment,
        }
    }
}

#[derive(Default)]
struct GuardState {
    rules: CompiledRules,
    armed: ArmedFilters,
}

/// 导航拦截器
pub struct InterceptionGuard {
    state: RwLock<GuardState>,
    block_count: AtomicU64,
    page: BlockedPage,
    signals: SignalSender,
    event_bus: Arc<EventBus>,
}

impl InterceptionGuard {
    /// 创建拦截器，返回后台信号的接收端
    pub fn new(page: BlockedPage, event_bus: Arc<EventBus>) -> (Self, SignalReceiver) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let guard = Self {
            state: RwLock::new(GuardState::default()),
            block_count: AtomicU64::new(0),
            page,
            signals,
            event_bus,
        };
        (guard, receiver)
    }

    fn read(&self) -> RwLockReadGuard<'_, GuardState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, GuardState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 启用规则，已启用时为空操作；返回状态是否发生变化
    pub fn arm(&self, kind: FilterKind) -> bool {
        let changed = {
            let mut state = self.write();
            let slot = state.armed.slot(kind);
            let changed = !*slot;
            *slot = true;
            changed
        };
        if changed {
            info!("拦截规则已启用: {:?}", kind);
            self.event_bus.publish(AppEvent::FilterArmed { kind });
        }
        changed
    }

    /// 停用规则，未启用时为空操作；返回状态是否发生变化
    pub fn disarm(&self, kind: FilterKind) -> bool {
        let changed = {
            let mut state = self.write();
            let slot = state.armed.slot(kind);
            let changed = *slot;
            *slot = false;
            changed
        };
        if changed {
            info!("拦截规则已停用: {:?}", kind);
            self.event_bus.publish(AppEvent::FilterDisarmed { kind });
        }
        changed
    }

    /// 按期望状态启用或停用
    pub fn set_armed(&self, kind: FilterKind, armed: bool) -> bool {
        if armed {
            self.arm(kind)
        } else {
            self.disarm(kind)
        }
    }

    pub fn is_armed(&self, kind: FilterKind) -> bool {
        self.read().armed.get(kind)
    }

    /// 替换规则集（重新编译匹配器）
    pub fn set_rules(&self, rules: &RuleSet) {
        let compiled = rules.compile();
        self.write().rules = compiled;
        debug!(
            "拦截规则已更新: 会话 {} 个, 永久 {} 个, 白名单 {} 条",
            rules.session_domains().len(),
            rules.permanent_domains().len(),
            rules.whitelist().len()
        );
    }

    /// URL 是否已被永久列表或会话列表覆盖（不论规则是否启用）
    pub fn is_listed(&self, url: &str) -> bool {
        let state = self.read();
        state.rules.matches_permanent(url) || state.rules.matches_session(url)
    }

    /// 判断一次导航
    pub fn decide(&self, request: &NavigationRequest) -> Decision {
        if request.resource_type != ResourceType::MainFrame {
            return Decision::Allow;
        }
        let url = request.url.as_str();

        let (armed, permanent_hit, session_hit, whitelisted) = {
            let state = self.read();
            let armed = state.armed;
            (
                armed,
                armed.always_block && state.rules.matches_permanent(url),
                armed.session_block && state.rules.matches_session(url),
                armed.session_block && state.rules.is_whitelisted(url),
            )
        };

        // 惩罚锁定：除扩展页面和本机地址外一律拦截
        if armed.punishment {
            if self.page.is_extension_url(url) || url_targets_loopback(url) {
                return Decision::Allow;
            }
            trace_block(url, BlockReason::Punishment);
            return self.redirect(url, BlockReason::Punishment);
        }

        // 成人网站：不经过白名单
        if permanent_hit {
            self.record_block(url, BlockReason::Adult);
            self.signal_strike(url, BlockReason::Adult);
            return self.redirect(url, BlockReason::Adult);
        }

        if armed.session_block {
            if whitelisted {
                return Decision::Allow;
            }
            if session_hit {
                self.record_block(url, BlockReason::Session);
                return self.redirect(url, BlockReason::Session);
            }
        }

        Decision::Allow
    }

    fn redirect(&self, url: &str, reason: BlockReason) -> Decision {
        Decision::Redirect {
            url: self.page.redirect_url(url, reason),
            reason,
        }
    }

    /// 拦截页地址
    pub fn blocked_page_url(&self, original: &str, reason: BlockReason) -> String {
        self.page.redirect_url(original, reason)
    }

    /// 记录一次拦截：计数加一并通知后台持久化
    pub fn record_block(&self, url: &str, reason: BlockReason) -> u64 {
        let count = self.block_count.fetch_add(1, Ordering::SeqCst) + 1;
        trace_block(url, reason);
        let _ = self.signals.send(GuardSignal::BlockCountChanged { count });
        self.event_bus.publish(AppEvent::SiteBlocked {
            url: url.to_string(),
            reason,
        });
        count
    }

    /// 违规上报（后台执行，结果不影响当前判断）
    pub fn signal_strike(&self, url: &str, reason: BlockReason) {
        let domain = extract_domain(url).unwrap_or_else(|| url.to_string());
        let _ = self.signals.send(GuardSignal::Strike { domain, reason });
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::SeqCst)
    }

    /// 恢复持久化的计数
    pub fn restore_block_count(&self, count: u64) {
        self.block_count.store(count, Ordering::SeqCst);
    }

    pub fn reset_block_count(&self) {
        self.block_count.store(0, Ordering::SeqCst);
        let _ = self.signals.send(GuardSignal::BlockCountChanged { count: 0 });
    }
}

fn trace_block(url: &str, reason: BlockReason) {
    debug!("拦截导航 [{}]: {}", reason.as_str(), url);
}
