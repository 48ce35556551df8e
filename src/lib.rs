// 专注守护 - 浏览器端拦截引擎主库
//
// 与本机桌面应用的控制服务器同步专注会话、惩罚锁定和域名规则，
// 在导航发生时同步做出拦截判断，并统计各网站的使用时长

// 声明模块
pub mod app;
pub mod classify;
pub mod commands;
pub mod control;
pub mod event_bus;
pub mod host;
pub mod intercept;
pub mod logger;
pub mod models;
pub mod rules;
pub mod scheduler;
pub mod settings;
pub mod state;
pub mod storage;
pub mod sync;
pub mod usage;

#[cfg(test)]
mod test_support;

pub use app::Engine;
pub use commands::{CommandError, PopupRequest};
pub use control::{ControlApi, ControlClient};
pub use host::{BrowserEvent, BrowserHost, PageSignals};
pub use intercept::{Decision, NavigationRequest, ResourceType};
pub use models::{EngineConfig, EngineStatus, SyncState};
pub use settings::SettingsManager;
pub use storage::{JsonFileStore, KeyValueStore, MemoryStore};
