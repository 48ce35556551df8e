// JSON 文件存储 - 所有键保存在同一个 JSON 文档中，每次写入立即落盘

use super::KeyValueStore;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

pub struct JsonFileStore {
    path: PathBuf,
    data: RwLock<Map<String, Value>>,
}

impl JsonFileStore {
    pub async fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let initial = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice::<Map<String, Value>>(&bytes).unwrap_or_else(|e| {
                    tracing::warn!("存储文件已损坏，重新开始: {}", e);
                    Map::new()
                })
            }
            _ => {
                tokio::fs::write(&path, b"{}").await?;
                Map::new()
            }
        };

        Ok(Self {
            path,
            data: RwLock::new(initial),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut data = self.data.write().await;
        data.insert(key.to_string(), value);
        // 持有写锁落盘，保证文件内容与写入顺序一致
        let json = serde_json::to_vec_pretty(&*data)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
