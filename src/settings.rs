use std::path::PathBuf;

use anyhow::Result;
use tokio::sync::RwLock;

use crate::models::{EngineConfig, EngineConfigPatch};

pub struct SettingsManager {
    path: PathBuf,
    data: RwLock<EngineConfig>,
}

impl SettingsManager {
    pub async fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let initial = match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                serde_json::from_slice::<EngineConfig>(&bytes).unwrap_or_else(|e| {
                    tracing::warn!("配置文件解析失败，使用默认配置: {}", e);
                    EngineConfig::default()
                })
            }
            _ => {
                let default = EngineConfig::default();
                let json = serde_json::to_string_pretty(&default)?;
                tokio::fs::write(&path, json).await?;
                default
            }
        };

        Ok(Self {
            path,
            data: RwLock::new(initial),
        })
    }

    pub async fn get(&self) -> EngineConfig {
        self.data.read().await.clone()
    }

    pub async fn update(&self, update: EngineConfigPatch) -> Result<EngineConfig> {
        let mut config = self.data.write().await;

        if let Some(host) = update.server_host {
            config.server_host = host;
        }
        if let Some(port) = update.server_port {
            config.server_port = port;
        }
        if let Some(ports) = update.backup_ports {
            config.backup_ports = ports;
        }
        if let Some(timeout) = update.request_timeout_secs {
            config.request_timeout_secs = timeout;
        }
        if let Some(interval) = update.poll_interval_secs {
            config.poll_interval_secs = interval.max(1);
        }
        if let Some(interval) = update.usage_flush_interval_secs {
            config.usage_flush_interval_secs = interval.max(1);
        }
        if let Some(secs) = update.usage_min_flush_secs {
            config.usage_min_flush_secs = secs;
        }
        if let Some(interval) = update.queue_drain_interval_secs {
            config.queue_drain_interval_secs = interval.max(1);
        }
        if let Some(origin) = update.extension_origin {
            config.extension_origin = origin;
        }
        if let Some(page) = update.blocked_page {
            config.blocked_page = page;
        }

        self.save(&config).await?;
        Ok(config.clone())
    }

    async fn save(&self, config: &EngineConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }
}
