//! 引擎装配和启动
//!
//! 负责把各组件连接起来：
//! - 读取配置文件并初始化日志（bootstrap）
//! - 恢复持久化状态并启用始终拦截规则
//! - 启动拦截信号处理任务
//! - 启动定时轮询、使用时长刷新和离线队列重试
//! - 把宿主推送的浏览器事件分发给使用统计和内容检测

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::classify::{ClassificationPipeline, ClassifyOutcome};
use crate::commands::{self, CommandError, PopupRequest};
use crate::control::{ControlApi, ControlClient};
use crate::event_bus::EventBus;
use crate::host::{ActiveTab, BrowserEvent, BrowserHost, LoadStatus};
use crate::intercept::{BlockedPage, Decision, InterceptionGuard, NavigationRequest, SignalReceiver};
use crate::logger::{self, LogBroadcaster};
use crate::models::{EngineConfig, EngineStatus};
use crate::rules::{extract_domain, is_internal_url};
use crate::scheduler::{ScheduleIntervals, Scheduler};
use crate::settings::SettingsManager;
use crate::state::EngineState;
use crate::storage::KeyValueStore;
use crate::sync::{PolicySyncEngine, SignalWorker};
use crate::usage::UsageTracker;

/// 浏览器端拦截引擎
pub struct Engine {
    config: EngineConfig,
    state: Arc<EngineState>,
    guard: Arc<InterceptionGuard>,
    sync: Arc<PolicySyncEngine>,
    classifier: Arc<ClassificationPipeline>,
    usage: Arc<UsageTracker>,
    event_bus: Arc<EventBus>,
    store: Arc<dyn KeyValueStore>,
    /// 由 bootstrap 创建时持有配置文件管理器
    settings: Option<Arc<SettingsManager>>,
    log_broadcaster: Arc<LogBroadcaster>,
    /// 拦截信号接收端，start 时交给后台任务
    signals: Mutex<Option<SignalReceiver>>,
    scheduler: Mutex<Option<Scheduler>>,
    /// 当前活动标签页
    active_tab: Mutex<Option<ActiveTab>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        control: Arc<dyn ControlApi>,
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn BrowserHost>,
    ) -> Self {
        let event_bus = Arc::new(EventBus::default());
        let state = Arc::new(EngineState::new());
        let (guard, signals) =
            InterceptionGuard::new(BlockedPage::from_config(&config), event_bus.clone());
        let guard = Arc::new(guard);

        let sync = Arc::new(PolicySyncEngine::new(
            control.clone(),
            store.clone(),
            state.clone(),
            guard.clone(),
            event_bus.clone(),
        ));
        let classifier = Arc::new(ClassificationPipeline::new(
            control.clone(),
            host,
            state.clone(),
            guard.clone(),
            store.clone(),
            event_bus.clone(),
        ));
        let usage = Arc::new(UsageTracker::new(
            control,
            store.clone(),
            event_bus.clone(),
            config.usage_min_flush_secs,
        ));

        Self {
            config,
            state,
            guard,
            sync,
            classifier,
            usage,
            event_bus,
            store,
            settings: None,
            log_broadcaster: Arc::new(LogBroadcaster::default()),
            signals: Mutex::new(Some(signals)),
            scheduler: Mutex::new(None),
            active_tab: Mutex::new(None),
        }
    }

    /// 使用 HTTP 控制客户端创建引擎
    pub fn connect(
        config: EngineConfig,
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn BrowserHost>,
    ) -> anyhow::Result<Self> {
        let control = Arc::new(ControlClient::new(&config)?);
        Ok(Self::new(config, control, store, host))
    }

    /// 宿主入口：读取配置文件、初始化日志，再创建连接控制服务器的引擎
    ///
    /// 宿主已安装全局日志订阅器时沿用已有的订阅器
    pub async fn bootstrap(
        config_path: PathBuf,
        log_dir: Option<PathBuf>,
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn BrowserHost>,
    ) -> anyhow::Result<Self> {
        let settings = Arc::new(SettingsManager::new(config_path).await?);
        let log_broadcaster = Arc::new(LogBroadcaster::default());

        let log_dir = log_dir.unwrap_or_else(logger::default_log_dir);
        if let Err(e) = logger::init(&log_dir, log_broadcaster.clone()) {
            eprintln!("跳过日志初始化: {}", e);
        }

        let config = settings.get().await;
        info!(
            "加载配置: 控制服务器 {}:{}, 轮询间隔 {} 秒",
            config.server_host, config.server_port, config.poll_interval_secs
        );

        let mut engine = Self::connect(config, store, host)?;
        engine.settings = Some(settings);
        engine.log_broadcaster = log_broadcaster;
        Ok(engine)
    }

    /// 恢复持久化状态（不启动后台任务）
    pub async fn restore(&self) {
        self.sync.initialize().await;
        self.classifier.restore().await;
        self.usage.restore().await;
    }

    /// 恢复状态并启动所有后台任务，重复调用为空操作
    pub async fn start(&self) {
        let Some(signals) = lock(&self.signals).take() else {
            debug!("引擎已启动");
            return;
        };

        info!("启动拦截引擎...");
        self.restore().await;

        let worker = SignalWorker::new(signals, self.sync.clone(), self.store.clone());
        tokio::spawn(worker.run());

        let scheduler = Scheduler::start(
            ScheduleIntervals::from_config(&self.config),
            self.sync.clone(),
            self.usage.clone(),
        );
        *lock(&self.scheduler) = Some(scheduler);
        info!("拦截引擎已启动");
    }

    /// 停止定时任务并结算当前使用会话
    pub async fn shutdown(&self) {
        if let Some(mut scheduler) = lock(&self.scheduler).take() {
            scheduler.stop();
        }
        self.usage.on_active_target(None).await;
        info!("拦截引擎已停止");
    }

    // ========== 宿主调用 ==========

    /// 同步判断一次导航
    pub fn decide(&self, request: &NavigationRequest) -> Decision {
        self.guard.decide(request)
    }

    /// 处理宿主推送的浏览器事件
    ///
    /// 页面加载完成时返回后台内容检测任务的句柄
    pub async fn handle_browser_event(
        &self,
        event: BrowserEvent,
    ) -> Option<JoinHandle<ClassifyOutcome>> {
        match event {
            BrowserEvent::TabActivated { tab_id, url } => {
                self.set_active_tab(url.as_ref().map(|url| ActiveTab {
                    tab_id,
                    url: url.clone(),
                }));
                self.usage.on_active_target(url.as_deref()).await;
                None
            }
            BrowserEvent::TabUpdated {
                tab_id,
                url,
                status,
                active,
            } => {
                if !active {
                    return None;
                }
                if let Some(url) = &url {
                    self.set_active_tab(Some(ActiveTab {
                        tab_id,
                        url: url.clone(),
                    }));
                    self.usage.on_active_target(Some(url)).await;
                }
                if status != Some(LoadStatus::Complete) {
                    return None;
                }
                // 加载完成事件可能不带 URL，使用记录的活动标签页地址
                let url = url.or_else(|| {
                    lock(&self.active_tab)
                        .as_ref()
                        .filter(|t| t.tab_id == tab_id)
                        .map(|t| t.url.clone())
                })?;
                self.spawn_classification(tab_id, url)
            }
            BrowserEvent::WindowFocusChanged {
                focused,
                active_tab,
            } => {
                let target = if focused { active_tab } else { None };
                let url = target.as_ref().map(|t| t.url.clone());
                self.set_active_tab(target);
                self.usage.on_active_target(url.as_deref()).await;
                None
            }
        }
    }

    fn set_active_tab(&self, tab: Option<ActiveTab>) {
        *lock(&self.active_tab) = tab;
    }

    fn spawn_classification(
        &self,
        tab_id: i64,
        url: String,
    ) -> Option<JoinHandle<ClassifyOutcome>> {
        if is_internal_url(&url) {
            return None;
        }
        let domain = extract_domain(&url)?;
        if !self.classifier.should_check(&domain) {
            return None;
        }

        let classifier = self.classifier.clone();
        Some(tokio::spawn(async move {
            classifier.classify(tab_id, &url, &domain).await
        }))
    }

    /// 处理弹窗请求
    pub async fn handle_popup(&self, request: PopupRequest) -> Result<EngineStatus, CommandError> {
        commands::dispatch(self, request).await
    }

    // ========== 状态查询 ==========

    /// 弹窗展示用的完整状态
    pub async fn status(&self) -> EngineStatus {
        let sync = self.state.sync().await;
        let rules = self.state.rules().await;
        let (_, lock_time_remaining) = self.state.cached_lock_at(chrono::Utc::now()).await;

        EngineStatus {
            is_blocking: sync.is_blocking,
            app_connected: sync.app_connected,
            punishment_locked: sync.punishment_locked,
            manual_blocking: sync.manual_blocking,
            block_count: self.guard.block_count(),
            sites_count: rules.session_domains().len(),
            always_blocked_count: rules.permanent_domains().len(),
            whitelist_count: rules.whitelist().len(),
            checked_domains_count: self.state.classification().checked_count(),
            lock_time_remaining,
            queued_usage_reports: self.usage.queued_len(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 配置文件管理器，仅 bootstrap 创建的引擎持有
    pub fn settings(&self) -> Option<&Arc<SettingsManager>> {
        self.settings.as_ref()
    }

    /// 订阅日志推送（弹窗诊断页）
    pub fn log_broadcaster(&self) -> &Arc<LogBroadcaster> {
        &self.log_broadcaster
    }

    pub fn guard(&self) -> &Arc<InterceptionGuard> {
        &self.guard
    }

    pub fn sync_engine(&self) -> &Arc<PolicySyncEngine> {
        &self.sync
    }

    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }
}
