// 浏览器宿主模块 - 引擎消费的浏览器能力接口
//
// 页面文本提取和标签页跳转由宿主实现，引擎只通过 BrowserHost trait 调用；
// 标签页/窗口焦点变化以 BrowserEvent 的形式由宿主推送给引擎

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// 标签页 ID
pub type TabId = i64;

/// 页面信号：标题、meta 描述和正文开头
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageSignals {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub meta_description: String,
    #[serde(default)]
    pub body_text: String,
}

/// 浏览器能力接口
#[async_trait]
pub trait BrowserHost: Send + Sync {
    /// 提取指定标签页的可见文本和元数据（尽力而为，可能失败）
    async fn extract_page_signals(&self, tab_id: TabId) -> Result<PageSignals>;

    /// 将指定标签页跳转到 URL
    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()>;
}

/// 页面加载状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Loading,
    Complete,
}

/// 宿主推送的浏览器事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrowserEvent {
    /// 切换到另一个标签页
    TabActivated {
        tab_id: TabId,
        url: Option<String>,
    },

    /// 标签页 URL 或加载状态变化
    TabUpdated {
        tab_id: TabId,
        url: Option<String>,
        status: Option<LoadStatus>,
        active: bool,
    },

    /// 浏览器窗口获得或失去焦点
    WindowFocusChanged {
        focused: bool,
        active_tab: Option<ActiveTab>,
    },
}

/// 当前活动标签页
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTab {
    pub tab_id: TabId,
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_browser_event_deserialization() {
        let event: BrowserEvent = serde_json::from_value(json!({
            "type": "tab_updated",
            "tab_id": 4,
            "url": "https://example.com/",
            "status": "complete",
            "active": true
        }))
        .unwrap();

        assert_eq!(
            event,
            BrowserEvent::TabUpdated {
                tab_id: 4,
                url: Some("https://example.com/".to_string()),
                status: Some(LoadStatus::Complete),
                active: true,
            }
        );

        let event: BrowserEvent = serde_json::from_value(json!({
            "type": "window_focus_changed",
            "focused": false,
            "active_tab": null
        }))
        .unwrap();
        assert!(matches!(
            event,
            BrowserEvent::WindowFocusChanged { focused: false, active_tab: None }
        ));
    }
}
