// 事件总线 - 用于模块间解耦通信
//
// 实现发布/订阅模式,拦截、同步、检测各模块只发布事件,不关心谁在监听
// 使用 tokio::sync::broadcast 实现高效的事件分发

use tokio::sync::broadcast;

use crate::intercept::{BlockReason, FilterKind};
use crate::models::SyncState;

/// 应用事件枚举 - 定义所有可能的引擎事件
#[derive(Debug, Clone)]
pub enum AppEvent {
    // --- 同步事件 ---

    /// 同步状态变化
    SyncStateChanged {
        state: SyncState,
    },

    /// 规则集已从服务器刷新
    RulesRefreshed {
        session_domains: usize,
        permanent_domains: usize,
        whitelist: usize,
    },

    /// 惩罚记录更新
    PunishmentUpdated {
        is_locked: bool,
        lock_time_remaining: i64,
    },

    // --- 拦截事件 ---

    /// 拦截规则启用
    FilterArmed {
        kind: FilterKind,
    },

    /// 拦截规则停用
    FilterDisarmed {
        kind: FilterKind,
    },

    /// 页面被拦截
    SiteBlocked {
        url: String,
        reason: BlockReason,
    },

    // --- 检测事件 ---

    /// 检测判定为违规内容
    DomainFlagged {
        domain: String,
        confidence: f64,
        method: String,
    },

    // --- 使用统计事件 ---

    /// 上报失败，已放入离线队列
    UsageQueued {
        domain: String,
        seconds: i64,
    },
}

/// 事件总线 - 用于模块间解耦通信
///
/// 使用 broadcast channel 实现发布/订阅模式
/// 支持多个订阅者同时接收事件
pub struct EventBus {
    sender: broadcast::Sender<AppEvent>,
}

impl EventBus {
    /// 创建新的事件总线
    ///
    /// # 参数
    /// - `capacity`: 事件缓冲区大小,建议 100-1000
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发布事件
    ///
    /// 如果没有订阅者,事件会被丢弃(这是正常的)
    pub fn publish(&self, event: AppEvent) {
        match self.sender.send(event) {
            Ok(receiver_count) => {
                tracing::trace!("事件已发布，订阅者数量: {}", receiver_count);
            }
            Err(_) => {
                tracing::trace!("事件已发布但无订阅者");
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }

    /// 获取当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
