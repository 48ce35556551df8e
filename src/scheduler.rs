// 定时任务调度器 - 状态轮询、使用时长刷新、离线队列重试

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, trace};

use crate::models::EngineConfig;
use crate::sync::PolicySyncEngine;
use crate::usage::UsageTracker;

/// 调度间隔
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleIntervals {
    pub poll: Duration,
    pub usage_flush: Duration,
    pub queue_drain: Duration,
}

impl ScheduleIntervals {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            poll: Duration::from_secs(config.poll_interval_secs.max(1)),
            usage_flush: Duration::from_secs(config.usage_flush_interval_secs.max(1)),
            queue_drain: Duration::from_secs(config.queue_drain_interval_secs.max(1)),
        }
    }
}

/// 后台任务句柄，stop 或 Drop 时全部中止
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        intervals: ScheduleIntervals,
        sync: Arc<PolicySyncEngine>,
        usage: Arc<UsageTracker>,
    ) -> Self {
        info!(
            "启动定时任务: 轮询 {:?}, 使用时长刷新 {:?}, 离线队列重试 {:?}",
            intervals.poll, intervals.usage_flush, intervals.queue_drain
        );

        let handles = vec![
            Self::start_poll_task(intervals.poll, sync),
            Self::start_usage_flush_task(intervals.usage_flush, usage.clone()),
            Self::start_queue_drain_task(intervals.queue_drain, usage),
        ];
        Self { handles }
    }

    /// 状态轮询：立即执行一次，之后按间隔执行
    ///
    /// 周期在轮询任务内执行，stop 中止任务时进行中的周期一并取消；
    /// 慢周期错过的 tick 直接跳过，手动同步占用时本次也跳过
    fn start_poll_task(period: Duration, sync: Arc<PolicySyncEngine>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if sync.try_run_cycle().await.is_none() {
                    trace!("轮询周期被跳过");
                }
            }
        })
    }

    fn start_usage_flush_task(period: Duration, usage: Arc<UsageTracker>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次 tick 立即返回，会话刚开始没有可刷新的时长
            ticker.tick().await;

            loop {
                ticker.tick().await;
                usage.flush_open_session().await;
            }
        })
    }

    fn start_queue_drain_task(period: Duration, usage: Arc<UsageTracker>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if usage.queued_len() > 0 {
                    usage.drain_queue().await;
                }
            }
        })
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("定时任务已停止");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::FilterKind;
    use crate::test_support::Fixture;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_intervals_from_config() {
        let config = EngineConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        let intervals = ScheduleIntervals::from_config(&config);
        assert_eq!(intervals.poll, Duration::from_secs(1));
        assert_eq!(intervals.usage_flush, Duration::from_secs(15));
        assert_eq!(intervals.queue_drain, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_poll_runs_immediately_and_stops() {
        let fx = Fixture::new();
        fx.control.set_blocking(true);
        let sync = Arc::new(PolicySyncEngine::new(
            fx.control.clone(),
            fx.store.clone(),
            fx.state.clone(),
            fx.guard.clone(),
            fx.event_bus.clone(),
        ));
        let usage = Arc::new(UsageTracker::new(
            fx.control.clone(),
            fx.store.clone(),
            fx.event_bus.clone(),
            10,
        ));

        let mut scheduler = Scheduler::start(
            ScheduleIntervals {
                poll: Duration::from_secs(60),
                usage_flush: Duration::from_secs(60),
                queue_drain: Duration::from_secs(60),
            },
            sync,
            usage,
        );

        for _ in 0..50 {
            if fx.state.sync().await.app_connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(fx.state.sync().await.is_blocking);
        assert_eq!(fx.control.sites_calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_running());

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_cycle() {
        let fx = Fixture::new();
        fx.control.set_blocking(true);
        fx.control.hold_status.store(true, Ordering::SeqCst);
        let sync = Arc::new(PolicySyncEngine::new(
            fx.control.clone(),
            fx.store.clone(),
            fx.state.clone(),
            fx.guard.clone(),
            fx.event_bus.clone(),
        ));
        let usage = Arc::new(UsageTracker::new(
            fx.control.clone(),
            fx.store.clone(),
            fx.event_bus.clone(),
            10,
        ));

        let mut scheduler = Scheduler::start(
            ScheduleIntervals {
                poll: Duration::from_secs(60),
                usage_flush: Duration::from_secs(60),
                queue_drain: Duration::from_secs(60),
            },
            sync.clone(),
            usage,
        );

        // 等待第一个周期卡在 /status 上
        for _ in 0..50 {
            if fx.control.status_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.control.status_calls.load(Ordering::SeqCst), 1);

        scheduler.stop();
        fx.control.hold_status.store(false, Ordering::SeqCst);
        fx.control.status_release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // 被取消的周期没有写入任何状态
        let state = fx.state.sync().await;
        assert!(!state.app_connected);
        assert!(!state.is_blocking);
        assert_eq!(fx.control.sites_calls.load(Ordering::SeqCst), 0);
        assert!(!fx.guard.is_armed(FilterKind::SessionBlock));

        // 周期锁随任务一起释放
        assert!(sync.try_run_cycle().await.is_some());
        assert!(fx.state.sync().await.is_blocking);
    }
}
