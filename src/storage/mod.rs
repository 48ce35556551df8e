// 存储模块 - 持久化键值存储抽象层
//
// 持久化只是副作用：进程存活期间内存状态才是准绳，
// 存储用于重启后（尤其是控制服务器不在线时）恢复兜底状态

pub mod file;
pub mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

/// 持久化键名
pub mod keys {
    /// 规则集
    pub const RULE_SET: &str = "rule_set";
    /// 已检测域名
    pub const CHECKED_DOMAINS: &str = "checked_domains";
    /// 惩罚记录（带获取时间）
    pub const PUNISHMENT_RECORD: &str = "punishment_record";
    /// 离线使用时长队列
    pub const USAGE_QUEUE: &str = "usage_queue";
    /// 拦截计数
    pub const BLOCK_COUNT: &str = "block_count";
    /// 同步状态
    pub const SYNC_STATE: &str = "sync_state";
}

/// 键值存储接口 - 所有存储实现必须实现此 trait
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// 读取键，不存在返回 None
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// 写入键
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// 读取并反序列化，缺失或损坏时返回 None（损坏会记录警告）
pub async fn load<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    match store.get(key).await {
        Ok(Some(value)) => match serde_json::from_value::<T>(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("持久化数据 {} 已损坏，忽略: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!("读取持久化数据 {} 失败: {}", key, e);
            None
        }
    }
}

/// 序列化并写入
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let json = serde_json::to_value(value)?;
    store.set(key, json).await
}

/// 尽力写入：失败只记录警告，不影响后续逻辑
pub async fn save_best_effort<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) {
    if let Err(e) = save(store, key, value).await {
        warn!("持久化 {} 失败: {}", key, e);
    }
}
