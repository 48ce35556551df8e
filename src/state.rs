// 引擎共享状态
//
// 所有组件通过同一个 EngineState 读写状态。锁只在挂起点之间短暂持有，
// 从不跨越网络调用，因此跨 await 的多步操作不具备原子性，调用方需容忍

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::classify::ClassificationCache;
use crate::models::{CachedPunishment, PunishmentRecord, SyncState};
use crate::rules::RuleSet;

#[derive(Default)]
pub struct EngineState {
    sync: RwLock<SyncState>,
    rules: RwLock<RuleSet>,
    punishment: RwLock<Option<CachedPunishment>>,
    classification: ClassificationCache,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== 同步状态 ==========

    pub async fn sync(&self) -> SyncState {
        *self.sync.read().await
    }

    /// 修改同步状态，返回修改前后的快照
    pub async fn update_sync<F>(&self, f: F) -> (SyncState, SyncState)
    where
        F: FnOnce(&mut SyncState),
    {
        let mut state = self.sync.write().await;
        let before = *state;
        f(&mut state);
        (before, *state)
    }

    // ========== 规则集 ==========

    pub async fn rules(&self) -> RuleSet {
        self.rules.read().await.clone()
    }

    pub async fn replace_rules(&self, rules: RuleSet) {
        *self.rules.write().await = rules;
    }

    /// 修改规则集并返回修改后的副本
    pub async fn update_rules<F, R>(&self, f: F) -> (R, RuleSet)
    where
        F: FnOnce(&mut RuleSet) -> R,
    {
        let mut rules = self.rules.write().await;
        let result = f(&mut rules);
        (result, rules.clone())
    }

    // ========== 惩罚记录 ==========

    pub async fn punishment(&self) -> Option<CachedPunishment> {
        self.punishment.read().await.clone()
    }

    pub async fn set_punishment(&self, cached: CachedPunishment) {
        *self.punishment.write().await = Some(cached);
    }

    /// 使用缓存记录推算是否处于锁定
    pub async fn cached_lock_at(&self, now: DateTime<Utc>) -> (bool, i64) {
        match self.punishment.read().await.as_ref() {
            Some(cached) => (cached.is_locked_at(now), cached.remaining_at(now)),
            None => (false, 0),
        }
    }

    /// 最近一次缓存的原始记录
    pub async fn punishment_record(&self) -> Option<PunishmentRecord> {
        self.punishment.read().await.as_ref().map(|c| c.record.clone())
    }

    // ========== 检测缓存 ==========

    pub fn classification(&self) -> &ClassificationCache {
        &self.classification
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_update_sync_returns_snapshots() {
        let state = EngineState::new();
        let (before, after) = state
            .update_sync(|s| {
                s.app_connected = true;
                s.is_blocking = true;
            })
            .await;

        assert!(!before.app_connected);
        assert!(after.is_blocking);
        assert_eq!(state.sync().await, after);
    }

    #[tokio::test]
    async fn test_cached_lock() {
        let state = EngineState::new();
        assert_eq!(state.cached_lock_at(Utc::now()).await, (false, 0));

        let now = Utc::now();
        state
            .set_punishment(CachedPunishment::new_at(
                PunishmentRecord {
                    is_locked: true,
                    lock_time_remaining: 100,
                    strikes_remaining: None,
                },
                now - Duration::seconds(40),
            ))
            .await;

        assert_eq!(state.cached_lock_at(now).await, (true, 60));
        assert_eq!(state.cached_lock_at(now + Duration::seconds(61)).await, (false, 0));
    }

    #[tokio::test]
    async fn test_update_rules() {
        let state = EngineState::new();
        let (added, rules) = state.update_rules(|r| r.add_permanent("x.com")).await;
        assert!(added);
        assert!(rules.permanent_domains().contains("x.com"));
        assert_eq!(state.rules().await, rules);
    }
}
