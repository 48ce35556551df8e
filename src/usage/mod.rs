// 使用时长统计 - 记录当前活动域名的停留时间并上报
//
// 同一时刻最多一个打开的会话。活动目标变化时结算上一个会话；
// 定时刷新让长时间停留的会话分段上报

pub mod queue;

pub use queue::OfflineQueue;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, trace};

use crate::control::ControlApi;
use crate::event_bus::{AppEvent, EventBus};
use crate::models::UsageReport;
use crate::rules::{extract_domain, is_internal_url};
use crate::storage::KeyValueStore;

#[derive(Debug, Clone, PartialEq, Eq)]
struct UsageSession {
    domain: String,
    started_at: DateTime<Utc>,
}

pub struct UsageTracker {
    control: Arc<dyn ControlApi>,
    event_bus: Arc<EventBus>,
    session: Mutex<Option<UsageSession>>,
    queue: OfflineQueue,
    /// 定时刷新的最小累计秒数
    min_flush_secs: i64,
    /// 队列重试单飞锁
    drain_gate: AsyncMutex<()>,
}

impl UsageTracker {
    pub fn new(
        control: Arc<dyn ControlApi>,
        store: Arc<dyn KeyValueStore>,
        event_bus: Arc<EventBus>,
        min_flush_secs: i64,
    ) -> Self {
        Self {
            control,
            event_bus,
            session: Mutex::new(None),
            queue: OfflineQueue::new(store),
            min_flush_secs,
            drain_gate: AsyncMutex::new(()),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<UsageSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 恢复持久化的离线队列
    pub async fn restore(&self) {
        let count = self.queue.restore().await;
        if count > 0 {
            info!("已恢复 {} 条待上报的使用记录", count);
        }
    }

    /// 当前会话的域名
    pub fn active_domain(&self) -> Option<String> {
        self.session().as_ref().map(|s| s.domain.clone())
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    /// 活动目标变化：切换标签页、活动标签页 URL 变化、窗口焦点变化
    ///
    /// `url` 为 None 表示失去焦点或没有可统计的目标
    pub async fn on_active_target(&self, url: Option<&str>) {
        self.on_active_target_at(url, Utc::now()).await;
    }

    pub async fn on_active_target_at(&self, url: Option<&str>, now: DateTime<Utc>) {
        let domain = url
            .filter(|u| !is_internal_url(u))
            .and_then(extract_domain);

        let previous = {
            let mut session = self.session();
            if session.as_ref().map(|s| &s.domain) == domain.as_ref() {
                // 同一域名内的跳转不结算
                return;
            }
            let previous = session.take();
            *session = domain.map(|domain| UsageSession {
                domain,
                started_at: now,
            });
            previous
        };

        if let Some(previous) = previous {
            let seconds = (now - previous.started_at).num_seconds();
            self.report_usage(&previous.domain, seconds).await;
        }
    }

    /// 定时刷新：打开的会话累计足够时长时先上报，会话继续计时
    pub async fn flush_open_session(&self) {
        self.flush_open_session_at(Utc::now()).await;
    }

    pub async fn flush_open_session_at(&self, now: DateTime<Utc>) {
        let flushed = {
            let mut session = self.session();
            match session.as_mut() {
                Some(open) => {
                    let seconds = (now - open.started_at).num_seconds();
                    if seconds >= self.min_flush_secs {
                        open.started_at = now;
                        Some((open.domain.clone(), seconds))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        if let Some((domain, seconds)) = flushed {
            self.report_usage(&domain, seconds).await;
        }
    }

    /// 上报一条使用记录；失败时放入离线队列
    pub async fn report_usage(&self, domain: &str, seconds: i64) {
        if seconds <= 0 {
            return;
        }
        let report = UsageReport {
            domain: domain.to_string(),
            seconds,
        };

        match self.control.report_usage(&report).await {
            Ok(()) => {
                trace!("使用时长已上报: {} {}秒", domain, seconds);
                if !self.queue.is_empty() {
                    self.drain_queue().await;
                }
            }
            Err(e) => {
                debug!("使用时长上报失败，放入离线队列: {} {}秒: {}", domain, seconds, e);
                self.queue.push(report).await;
                self.event_bus.publish(AppEvent::UsageQueued {
                    domain: domain.to_string(),
                    seconds,
                });
            }
        }
    }

    /// 按顺序重试离线队列，遇到第一次失败即停止；返回本次送达的条数
    pub async fn drain_queue(&self) -> usize {
        let Ok(_gate) = self.drain_gate.try_lock() else {
            return 0;
        };

        let mut delivered = 0;
        while let Some(report) = self.queue.front() {
            match self.control.report_usage(&report).await {
                Ok(()) => {
                    self.queue.pop_front();
                    delivered += 1;
                }
                Err(e) => {
                    debug!("离线队列重试失败，等待下次: {}", e);
                    break;
                }
            }
        }

        if delivered > 0 {
            self.queue.persist().await;
            info!(
                "离线队列已送达 {} 条，剩余 {} 条",
                delivered,
                self.queue.len()
            );
        }
        delivered
    }
}
