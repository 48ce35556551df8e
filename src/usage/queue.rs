// 离线队列 - 上报失败的使用时长按 FIFO 保存，等待重试

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::models::UsageReport;
use crate::storage::{self, keys, KeyValueStore};

pub struct OfflineQueue {
    reports: Mutex<VecDeque<UsageReport>>,
    store: Arc<dyn KeyValueStore>,
}

impl OfflineQueue {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            reports: Mutex::new(VecDeque::new()),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<UsageReport>> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 恢复持久化的队列，追加在当前队列之前
    pub async fn restore(&self) -> usize {
        let Some(saved) = storage::load::<Vec<UsageReport>>(&*self.store, keys::USAGE_QUEUE).await
        else {
            return 0;
        };
        let count = saved.len();
        {
            let mut reports = self.lock();
            for report in saved.into_iter().rev() {
                reports.push_front(report);
            }
        }
        count
    }

    /// 追加到队尾并持久化
    pub async fn push(&self, report: UsageReport) {
        self.lock().push_back(report);
        self.persist().await;
    }

    /// 队首记录（不移除）
    pub fn front(&self) -> Option<UsageReport> {
        self.lock().front().cloned()
    }

    /// 移除队首
    pub fn pop_front(&self) -> Option<UsageReport> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn snapshot(&self) -> Vec<UsageReport> {
        self.lock().iter().cloned().collect()
    }

    pub async fn persist(&self) {
        let snapshot = self.snapshot();
        storage::save_best_effort(&*self.store, keys::USAGE_QUEUE, &snapshot).await;
    }
}
