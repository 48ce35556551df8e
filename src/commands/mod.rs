//! 弹窗命令模块
//!
//! 弹窗以 `{"action": "..."}` 的形式发送请求，解析为 PopupRequest 后穷尽匹配分发：
//! - getStatus: 查询当前状态
//! - manualToggle: 断开桌面应用时手动切换会话拦截
//! - resetCount: 清零拦截计数
//! - forceSync: 立即执行一次同步周期

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::app::Engine;
use crate::models::EngineStatus;

/// 弹窗请求
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum PopupRequest {
    GetStatus,
    ManualToggle,
    ResetCount,
    ForceSync,
}

impl PopupRequest {
    pub fn from_json(value: Value) -> Result<Self, CommandError> {
        serde_json::from_value(value).map_err(|e| CommandError::InvalidRequest(e.to_string()))
    }
}

/// 弹窗命令错误
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// 已连接桌面应用时会话拦截由应用控制
    #[error("已连接桌面应用，请在应用中开始或结束专注会话")]
    AppConnected,

    #[error("无效的请求: {0}")]
    InvalidRequest(String),
}

/// 分发弹窗请求，成功时返回最新状态
pub async fn dispatch(engine: &Engine, request: PopupRequest) -> Result<EngineStatus, CommandError> {
    match request {
        PopupRequest::GetStatus => Ok(engine.status().await),
        PopupRequest::ManualToggle => {
            engine
                .sync_engine()
                .manual_toggle()
                .await
                .ok_or(CommandError::AppConnected)?;
            Ok(engine.status().await)
        }
        PopupRequest::ResetCount => {
            engine.guard().reset_block_count();
            info!("拦截计数已清零");
            Ok(engine.status().await)
        }
        PopupRequest::ForceSync => {
            engine.sync_engine().run_cycle().await;
            Ok(engine.status().await)
        }
    }
}

/// 处理原始 JSON 消息，返回 `{"success": true, "status": ...}` 或 `{"success": false, "error": ...}`
pub async fn handle_message(engine: &Engine, message: Value) -> Value {
    let result = match PopupRequest::from_json(message) {
        Ok(request) => dispatch(engine, request).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(status) => json!({ "success": true, "status": status }),
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    }
}
