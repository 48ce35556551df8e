// 策略同步引擎 - 与控制服务器对账的主循环
//
// 每个周期并发发起三个独立请求：/status、/punishment-status、/nsfw-cache，
// 任一失败都不影响其余两个。周期是单飞的：同一时刻只有一个周期在执行

pub mod worker;

pub use worker::SignalWorker;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::control::ControlApi;
use crate::event_bus::{AppEvent, EventBus};
use crate::intercept::{BlockReason, FilterKind, InterceptionGuard};
use crate::models::{
    CachedPunishment, NsfwCacheResponse, PunishmentRecord, StatusResponse, SyncState,
};
use crate::rules::RuleSet;
use crate::state::EngineState;
use crate::storage::{self, keys, KeyValueStore};

/// 策略同步引擎
pub struct PolicySyncEngine {
    control: Arc<dyn ControlApi>,
    store: Arc<dyn KeyValueStore>,
    state: Arc<EngineState>,
    guard: Arc<InterceptionGuard>,
    event_bus: Arc<EventBus>,
    /// 周期单飞锁
    cycle_gate: Mutex<()>,
}

impl PolicySyncEngine {
    pub fn new(
        control: Arc<dyn ControlApi>,
        store: Arc<dyn KeyValueStore>,
        state: Arc<EngineState>,
        guard: Arc<InterceptionGuard>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            control,
            store,
            state,
            guard,
            event_bus,
            cycle_gate: Mutex::new(()),
        }
    }

    /// 启动时恢复持久化状态并启用始终拦截规则
    pub async fn initialize(&self) {
        let store = &*self.store;

        if let Some(rules) = storage::load::<RuleSet>(store, keys::RULE_SET).await {
            self.state.replace_rules(rules).await;
        }
        let rules = self.state.rules().await;
        self.guard.set_rules(&rules);

        if let Some(count) = storage::load::<u64>(store, keys::BLOCK_COUNT).await {
            self.guard.restore_block_count(count);
        }

        if let Some(cached) = storage::load::<CachedPunishment>(store, keys::PUNISHMENT_RECORD).await
        {
            self.state.set_punishment(cached).await;
        }

        // 只恢复手动开启的会话拦截；远端会话必须由下一次轮询重新确认
        if let Some(saved) = storage::load::<SyncState>(store, keys::SYNC_STATE).await {
            if saved.manual_blocking {
                self.state
                    .update_sync(|s| {
                        s.is_blocking = true;
                        s.manual_blocking = true;
                    })
                    .await;
                self.guard.arm(FilterKind::SessionBlock);
            }
        }

        self.guard.arm(FilterKind::AlwaysBlock);
        self.apply_cached_punishment().await;

        info!(
            "同步引擎已初始化: 会话域名 {} 个, 永久域名 {} 个, 白名单 {} 条",
            rules.session_domains().len(),
            rules.permanent_domains().len(),
            rules.whitelist().len()
        );
    }

    /// 执行一个同步周期；已有周期在执行时等待其完成后再执行
    pub async fn run_cycle(&self) -> SyncState {
        let _gate = self.cycle_gate.lock().await;
        self.cycle().await
    }

    /// 定时调度使用：已有周期在执行时直接跳过
    pub async fn try_run_cycle(&self) -> Option<SyncState> {
        let Ok(_gate) = self.cycle_gate.try_lock() else {
            trace!("上一个同步周期尚未结束，跳过本次");
            return None;
        };
        Some(self.cycle().await)
    }

    async fn cycle(&self) -> SyncState {
        let (status, punishment, cache) = tokio::join!(
            self.control.status(),
            self.control.punishment_status(),
            self.control.nsfw_cache(),
        );

        self.apply_status(status).await;
        self.apply_punishment(punishment).await;
        self.apply_cache_listing(cache).await;

        let state = self.state.sync().await;
        storage::save_best_effort(&*self.store, keys::SYNC_STATE, &state).await;
        state
    }

    async fn apply_status(&self, result: Result<StatusResponse>) {
        match result {
            Ok(status) => {
                let previous = self.state.sync().await;
                // 开启会话前先拉取最新规则；重新连上服务器时也刷新一次
                if (status.is_blocking && !previous.is_blocking) || !previous.app_connected {
                    self.refresh_rules().await;
                }

                let (before, after) = self
                    .state
                    .update_sync(|s| {
                        s.app_connected = true;
                        s.is_blocking = status.is_blocking;
                        s.manual_blocking = false;
                    })
                    .await;

                if !before.app_connected {
                    info!("已连接桌面应用");
                }
                if before.is_blocking != after.is_blocking {
                    info!(
                        "会话拦截状态变化: {} -> {}",
                        before.is_blocking, after.is_blocking
                    );
                }
                self.guard
                    .set_armed(FilterKind::SessionBlock, after.is_blocking);
                self.publish_if_changed(before, after);
            }
            Err(e) => {
                debug!("状态轮询失败: {}", e);
                let (before, after) = self
                    .state
                    .update_sync(|s| {
                        s.app_connected = false;
                        // 无法确认远端会话仍在进行时不能继续拦截
                        if !s.manual_blocking {
                            s.is_blocking = false;
                        }
                    })
                    .await;

                if before.app_connected {
                    warn!("与桌面应用断开连接: {}", e);
                }
                if before.is_blocking && !after.is_blocking {
                    info!("无法确认专注会话，停止会话拦截");
                }
                self.guard
                    .set_armed(FilterKind::SessionBlock, after.is_blocking);
                self.publish_if_changed(before, after);
                self.apply_cached_punishment().await;
            }
        }
    }

    async fn apply_punishment(&self, result: Result<PunishmentRecord>) {
        match result {
            Ok(record) => self.apply_punishment_record(record).await,
            Err(e) => {
                debug!("惩罚状态轮询失败，使用缓存记录: {}", e);
                self.apply_cached_punishment().await;
            }
        }
    }

    async fn apply_cache_listing(&self, result: Result<NsfwCacheResponse>) {
        match result {
            Ok(listing) => {
                let cache = self.state.classification();
                let added = cache.merge_checked(&listing.checked_domains);
                if added > 0 {
                    debug!("同步检测缓存: 新增 {} 个域名", added);
                    storage::save_best_effort(
                        &*self.store,
                        keys::CHECKED_DOMAINS,
                        &cache.checked_domains(),
                    )
                    .await;
                }
            }
            Err(e) => {
                trace!("检测缓存同步失败: {}", e);
            }
        }
    }

    /// 从服务器拉取规则集；失败时沿用上次的规则
    pub async fn refresh_rules(&self) -> bool {
        match self.control.sites().await {
            Ok(sites) => {
                let remote = RuleSet::from_sites(sites);
                let (_, rules) = self
                    .state
                    .update_rules(|current| *current = current.merged_with_remote(remote))
                    .await;
                self.guard.set_rules(&rules);
                storage::save_best_effort(&*self.store, keys::RULE_SET, &rules).await;

                info!(
                    "规则已刷新: 会话域名 {} 个, 永久域名 {} 个, 白名单 {} 条",
                    rules.session_domains().len(),
                    rules.permanent_domains().len(),
                    rules.whitelist().len()
                );
                self.event_bus.publish(AppEvent::RulesRefreshed {
                    session_domains: rules.session_domains().len(),
                    permanent_domains: rules.permanent_domains().len(),
                    whitelist: rules.whitelist().len(),
                });
                true
            }
            Err(e) => {
                warn!("获取规则失败，沿用上次的规则: {}", e);
                false
            }
        }
    }

    /// 应用服务器返回的惩罚记录（轮询或违规上报的响应）
    pub async fn apply_punishment_record(&self, record: PunishmentRecord) {
        let cached = CachedPunishment::new(record.clone());
        let changed = self.state.punishment_record().await.as_ref() != Some(&record);
        self.state.set_punishment(cached.clone()).await;
        storage::save_best_effort(&*self.store, keys::PUNISHMENT_RECORD, &cached).await;

        if changed {
            self.event_bus.publish(AppEvent::PunishmentUpdated {
                is_locked: record.is_locked,
                lock_time_remaining: record.lock_time_remaining,
            });
        }
        self.set_punishment_locked(record.is_locked).await;
    }

    /// 服务器不可达时根据缓存记录推算锁定状态
    async fn apply_cached_punishment(&self) {
        let (locked, remaining) = self.state.cached_lock_at(Utc::now()).await;
        if locked {
            trace!("使用缓存惩罚记录，推算剩余 {} 秒", remaining);
        }
        self.set_punishment_locked(locked).await;
    }

    async fn set_punishment_locked(&self, locked: bool) {
        let (before, after) = self
            .state
            .update_sync(|s| s.punishment_locked = locked)
            .await;
        if before.punishment_locked != after.punishment_locked {
            if locked {
                warn!("进入惩罚锁定");
            } else {
                info!("惩罚锁定已解除");
            }
        }
        self.guard.set_armed(FilterKind::Punishment, locked);
        self.publish_if_changed(before, after);
    }

    /// 上报一次违规，并立即应用返回的惩罚记录
    pub async fn report_strike(&self, domain: &str, reason: BlockReason) {
        match self.control.report_strike().await {
            Ok(record) => {
                info!(
                    "违规已上报 [{}] {}: 锁定={}, 剩余={}秒",
                    reason.as_str(),
                    domain,
                    record.is_locked,
                    record.lock_time_remaining
                );
                self.apply_punishment_record(record).await;
            }
            Err(e) => {
                warn!("违规上报失败 [{}] {}: {}", reason.as_str(), domain, e);
            }
        }
    }

    /// 弹窗手动切换会话拦截，仅在未连接桌面应用时允许
    ///
    /// 已连接时返回 None
    pub async fn manual_toggle(&self) -> Option<SyncState> {
        let mut rejected = false;
        let (before, after) = self
            .state
            .update_sync(|s| {
                if s.app_connected {
                    rejected = true;
                    return;
                }
                s.is_blocking = !s.is_blocking;
                s.manual_blocking = s.is_blocking;
            })
            .await;

        if rejected {
            return None;
        }

        info!("手动切换会话拦截: {}", after.is_blocking);
        self.guard
            .set_armed(FilterKind::SessionBlock, after.is_blocking);
        self.publish_if_changed(before, after);
        storage::save_best_effort(&*self.store, keys::SYNC_STATE, &after).await;
        Some(after)
    }

    fn publish_if_changed(&self, before: SyncState, after: SyncState) {
        if before != after {
            self.event_bus
                .publish(AppEvent::SyncStateChanged { state: after });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use chrono::Duration;
    use std::sync::atomic::Ordering;

    fn engine(fx: &Fixture) -> PolicySyncEngine {
        PolicySyncEngine::new(
            fx.control.clone(),
            fx.store.clone(),
            fx.state.clone(),
            fx.guard.clone(),
            fx.event_bus.clone(),
        )
    }

    #[tokio::test]
    async fn test_session_starts_with_fresh_rules() {
        let fx = Fixture::new();
        fx.control.set_sites(&["youtube.com"], &["adult.example"], &["docs.rs"]);
        fx.control.set_blocking(true);
        let sync = engine(&fx);
        sync.initialize().await;

        let state = sync.run_cycle().await;
        assert!(state.app_connected);
        assert!(state.is_blocking);
        assert!(fx.guard.is_armed(FilterKind::SessionBlock));
        assert!(fx.guard.is_armed(FilterKind::AlwaysBlock));

        let rules = fx.state.rules().await;
        assert!(rules.session_domains().contains("youtube.com"));
        assert!(rules.permanent_domains().contains("adult.example"));
        assert!(fx.guard.is_listed("https://youtube.com/"));

        let saved: Option<RuleSet> = storage::load(&*fx.store, keys::RULE_SET).await;
        assert_eq!(saved, Some(rules));
    }

    #[tokio::test]
    async fn test_rules_refreshed_only_on_transition() {
        let fx = Fixture::new();
        fx.control.set_blocking(true);
        let sync = engine(&fx);

        sync.run_cycle().await;
        sync.run_cycle().await;
        sync.run_cycle().await;
        assert_eq!(fx.control.sites_calls.load(Ordering::SeqCst), 1);

        fx.control.set_blocking(false);
        sync.run_cycle().await;
        fx.control.set_blocking(true);
        sync.run_cycle().await;
        assert_eq!(fx.control.sites_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_poll_failure_stops_session_block() {
        let fx = Fixture::new();
        fx.control.set_blocking(true);
        let sync = engine(&fx);
        sync.run_cycle().await;
        assert!(fx.guard.is_armed(FilterKind::SessionBlock));

        fx.control.set_online(false);
        let state = sync.run_cycle().await;
        assert!(!state.app_connected);
        assert!(!state.is_blocking);
        assert!(!fx.guard.is_armed(FilterKind::SessionBlock));

        // 重新连上时再次刷新规则
        fx.control.set_online(true);
        sync.run_cycle().await;
        assert_eq!(fx.control.sites_calls.load(Ordering::SeqCst), 2);
        assert!(fx.guard.is_armed(FilterKind::SessionBlock));
    }

    #[tokio::test]
    async fn test_sites_failure_keeps_previous_rules() {
        let fx = Fixture::new();
        fx.control.set_sites(&["reddit.com"], &[], &[]);
        let sync = engine(&fx);
        assert!(sync.refresh_rules().await);

        fx.control.sites_ok.store(false, Ordering::SeqCst);
        fx.control.set_sites(&["other.com"], &[], &[]);
        assert!(!sync.refresh_rules().await);

        let rules = fx.state.rules().await;
        assert!(rules.session_domains().contains("reddit.com"));
        assert!(!rules.session_domains().contains("other.com"));
    }

    #[tokio::test]
    async fn test_polls_are_independent() {
        let fx = Fixture::new();
        fx.control.status_ok.store(false, Ordering::SeqCst);
        fx.control.set_punishment(true, 300);
        *fx.control.cache_listing.lock().unwrap() = vec!["safe.org".to_string()];
        let sync = engine(&fx);

        let state = sync.run_cycle().await;
        assert!(!state.app_connected);
        assert!(state.punishment_locked);
        assert!(fx.guard.is_armed(FilterKind::Punishment));
        assert!(fx.state.classification().is_checked("safe.org"));
    }

    #[tokio::test]
    async fn test_offline_punishment_extrapolation() {
        let fx = Fixture::new();
        fx.control.set_online(false);

        // 仍在锁定期内
        fx.state
            .set_punishment(CachedPunishment::new_at(
                PunishmentRecord {
                    is_locked: true,
                    lock_time_remaining: 600,
                    strikes_remaining: None,
                },
                Utc::now() - Duration::seconds(60),
            ))
            .await;
        let sync = engine(&fx);
        assert!(sync.run_cycle().await.punishment_locked);
        assert!(fx.guard.is_armed(FilterKind::Punishment));

        // 锁定期已过
        fx.state
            .set_punishment(CachedPunishment::new_at(
                PunishmentRecord {
                    is_locked: true,
                    lock_time_remaining: 30,
                    strikes_remaining: None,
                },
                Utc::now() - Duration::seconds(60),
            ))
            .await;
        assert!(!sync.run_cycle().await.punishment_locked);
        assert!(!fx.guard.is_armed(FilterKind::Punishment));
    }

    #[tokio::test]
    async fn test_remote_punishment_unlock() {
        let fx = Fixture::new();
        fx.control.set_punishment(true, 120);
        let sync = engine(&fx);
        assert!(sync.run_cycle().await.punishment_locked);

        fx.control.set_punishment(false, 0);
        assert!(!sync.run_cycle().await.punishment_locked);

        let cached: Option<CachedPunishment> =
            storage::load(&*fx.store, keys::PUNISHMENT_RECORD).await;
        assert!(!cached.unwrap().record.is_locked);
    }

    #[tokio::test]
    async fn test_strike_applies_returned_lock() {
        let fx = Fixture::new();
        *fx.control.strike_response.lock().unwrap() = PunishmentRecord {
            is_locked: true,
            lock_time_remaining: 900,
            strikes_remaining: Some(0),
        };
        let sync = engine(&fx);

        sync.report_strike("adult.example", BlockReason::Adult).await;
        assert_eq!(fx.control.strikes.load(Ordering::SeqCst), 1);
        assert!(fx.state.sync().await.punishment_locked);
        assert!(fx.guard.is_armed(FilterKind::Punishment));
    }

    #[tokio::test]
    async fn test_manual_toggle_only_when_disconnected() {
        let fx = Fixture::new();
        let sync = engine(&fx);

        sync.run_cycle().await;
        assert!(sync.manual_toggle().await.is_none());

        fx.control.set_online(false);
        sync.run_cycle().await;
        let state = sync.manual_toggle().await.unwrap();
        assert!(state.is_blocking);
        assert!(state.manual_blocking);
        assert!(fx.guard.is_armed(FilterKind::SessionBlock));

        // 离线轮询不会清除手动开启的拦截
        assert!(sync.run_cycle().await.is_blocking);

        let state = sync.manual_toggle().await.unwrap();
        assert!(!state.is_blocking);
        assert!(!fx.guard.is_armed(FilterKind::SessionBlock));
    }

    #[tokio::test]
    async fn test_initialize_restores_persisted_state() {
        let fx = Fixture::new();
        let rules = RuleSet::new(vec!["youtube.com"], vec!["adult.example"], Vec::<String>::new());
        storage::save(&*fx.store, keys::RULE_SET, &rules).await.unwrap();
        storage::save(&*fx.store, keys::BLOCK_COUNT, &7u64).await.unwrap();
        storage::save(
            &*fx.store,
            keys::SYNC_STATE,
            &SyncState {
                is_blocking: true,
                manual_blocking: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let sync = engine(&fx);
        sync.initialize().await;

        assert_eq!(fx.guard.block_count(), 7);
        assert!(fx.guard.is_armed(FilterKind::AlwaysBlock));
        assert!(fx.guard.is_armed(FilterKind::SessionBlock));
        assert!(fx.guard.is_listed("https://adult.example/"));
    }

    #[tokio::test]
    async fn test_try_run_cycle_skips_when_busy() {
        let fx = Fixture::new();
        let sync = engine(&fx);

        let gate = sync.cycle_gate.lock().await;
        assert!(sync.try_run_cycle().await.is_none());
        drop(gate);
        assert!(sync.try_run_cycle().await.is_some());
    }
}
