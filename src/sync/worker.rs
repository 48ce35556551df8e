// 拦截信号处理任务
//
// 拦截判断是同步的，不能等待网络；计数持久化和违规上报通过通道交给这里异步处理，
// 结果只用于更新缓存状态，从不反过来影响已经做出的拦截判断

use std::sync::Arc;
use tracing::info;

use super::PolicySyncEngine;
use crate::intercept::{GuardSignal, SignalReceiver};
use crate::storage::{self, keys, KeyValueStore};

pub struct SignalWorker {
    receiver: SignalReceiver,
    sync: Arc<PolicySyncEngine>,
    store: Arc<dyn KeyValueStore>,
}

impl SignalWorker {
    pub fn new(
        receiver: SignalReceiver,
        sync: Arc<PolicySyncEngine>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            receiver,
            sync,
            store,
        }
    }

    /// 运行任务，直到拦截器被释放
    pub async fn run(mut self) {
        info!("拦截信号处理任务已启动");

        while let Some(signal) = self.receiver.recv().await {
            self.handle(signal).await;
        }

        info!("拦截信号处理任务已停止");
    }

    async fn handle(&self, signal: GuardSignal) {
        match signal {
            GuardSignal::BlockCountChanged { count } => {
                storage::save_best_effort(&*self.store, keys::BLOCK_COUNT, &count).await;
            }
            GuardSignal::Strike { domain, reason } => {
                self.sync.report_strike(&domain, reason).await;
            }
        }
    }
}
