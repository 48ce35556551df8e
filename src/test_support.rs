// 测试辅助 - 可编程的控制服务器与浏览器宿主

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::control::ControlApi;
use crate::event_bus::EventBus;
use crate::host::{BrowserHost, PageSignals, TabId};
use crate::intercept::{BlockedPage, InterceptionGuard, SignalReceiver};
use crate::models::{
    ContentCheckRequest, ContentCheckResponse, NsfwCacheResponse, PunishmentRecord,
    SitesResponse, StatusResponse, UsageReport,
};
use crate::state::EngineState;
use crate::storage::MemoryStore;

pub const EXTENSION_ORIGIN: &str = "chrome-extension://ext";

/// 可编程的控制服务器
pub struct FakeControl {
    /// 为 false 时所有请求失败
    pub online: AtomicBool,
    pub status_ok: AtomicBool,
    pub punishment_ok: AtomicBool,
    pub sites_ok: AtomicBool,
    pub usage_ok: AtomicBool,
    pub is_blocking: AtomicBool,
    pub punishment: Mutex<PunishmentRecord>,
    pub strike_response: Mutex<PunishmentRecord>,
    pub sites: Mutex<SitesResponse>,
    pub cache_listing: Mutex<Vec<String>>,
    pub verdict: Mutex<ContentCheckResponse>,
    /// 为 true 时 check_content 等待 release_checks 通知
    pub hold_checks: AtomicBool,
    pub check_release: Notify,
    pub check_requests: Mutex<Vec<ContentCheckRequest>>,
    /// 为 true 时 status 等待 status_release 通知
    pub hold_status: AtomicBool,
    pub status_release: Notify,
    pub status_calls: AtomicUsize,
    pub delivered: Mutex<Vec<UsageReport>>,
    pub usage_attempts: AtomicUsize,
    pub sites_calls: AtomicUsize,
    pub strikes: AtomicUsize,
    pub pings: AtomicUsize,
}

impl Default for FakeControl {
    fn default() -> Self {
        Self {
            online: AtomicBool::new(true),
            status_ok: AtomicBool::new(true),
            punishment_ok: AtomicBool::new(true),
            sites_ok: AtomicBool::new(true),
            usage_ok: AtomicBool::new(true),
            is_blocking: AtomicBool::new(false),
            punishment: Mutex::new(PunishmentRecord::default()),
            strike_response: Mutex::new(PunishmentRecord::default()),
            sites: Mutex::new(SitesResponse::default()),
            cache_listing: Mutex::new(Vec::new()),
            verdict: Mutex::new(ContentCheckResponse {
                method: "heuristic".to_string(),
                ..Default::default()
            }),
            hold_checks: AtomicBool::new(false),
            check_release: Notify::new(),
            check_requests: Mutex::new(Vec::new()),
            hold_status: AtomicBool::new(false),
            status_release: Notify::new(),
            status_calls: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
            usage_attempts: AtomicUsize::new(0),
            sites_calls: AtomicUsize::new(0),
            strikes: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        }
    }
}

impl FakeControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.is_blocking.store(blocking, Ordering::SeqCst);
    }

    pub fn set_sites(&self, sites: &[&str], always_blocked: &[&str], whitelist: &[&str]) {
        *self.sites.lock().unwrap() = SitesResponse {
            sites: sites.iter().map(|s| s.to_string()).collect(),
            always_blocked: always_blocked.iter().map(|s| s.to_string()).collect(),
            whitelist: whitelist.iter().map(|s| s.to_string()).collect(),
        };
    }

    pub fn set_punishment(&self, is_locked: bool, lock_time_remaining: i64) {
        *self.punishment.lock().unwrap() = PunishmentRecord {
            is_locked,
            lock_time_remaining,
            strikes_remaining: None,
        };
    }

    pub fn set_verdict(&self, is_nsfw: bool, method: &str) {
        *self.verdict.lock().unwrap() = ContentCheckResponse {
            is_nsfw,
            confidence: if is_nsfw { 0.95 } else { 0.05 },
            method: method.to_string(),
            cached: false,
        };
    }

    pub fn delivered(&self) -> Vec<UsageReport> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn check_count(&self) -> usize {
        self.check_requests.lock().unwrap().len()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("connection refused"))
        }
    }

    fn ensure(&self, flag: &AtomicBool) -> Result<()> {
        self.ensure_online()?;
        if flag.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("500 Internal Server Error"))
        }
    }
}

#[async_trait]
impl ControlApi for FakeControl {
    async fn status(&self) -> Result<StatusResponse> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.hold_status.load(Ordering::SeqCst) {
            self.status_release.notified().await;
        }
        self.ensure(&self.status_ok)?;
        Ok(StatusResponse {
            is_blocking: self.is_blocking.load(Ordering::SeqCst),
            ..Default::default()
        })
    }

    async fn punishment_status(&self) -> Result<PunishmentRecord> {
        self.ensure(&self.punishment_ok)?;
        Ok(self.punishment.lock().unwrap().clone())
    }

    async fn sites(&self) -> Result<SitesResponse> {
        self.sites_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure(&self.sites_ok)?;
        Ok(self.sites.lock().unwrap().clone())
    }

    async fn report_strike(&self) -> Result<PunishmentRecord> {
        self.ensure_online()?;
        self.strikes.fetch_add(1, Ordering::SeqCst);
        Ok(self.strike_response.lock().unwrap().clone())
    }

    async fn nsfw_cache(&self) -> Result<NsfwCacheResponse> {
        self.ensure_online()?;
        Ok(NsfwCacheResponse {
            checked_domains: self.cache_listing.lock().unwrap().clone(),
        })
    }

    async fn check_content(&self, request: &ContentCheckRequest) -> Result<ContentCheckResponse> {
        self.ensure_online()?;
        self.check_requests.lock().unwrap().push(request.clone());
        if self.hold_checks.load(Ordering::SeqCst) {
            self.check_release.notified().await;
        }
        Ok(self.verdict.lock().unwrap().clone())
    }

    async fn report_usage(&self, report: &UsageReport) -> Result<()> {
        self.usage_attempts.fetch_add(1, Ordering::SeqCst);
        self.ensure(&self.usage_ok)?;
        self.delivered.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()
    }
}

/// 记录跳转的浏览器宿主
#[derive(Default)]
pub struct FakeHost {
    pub signals: Mutex<Option<PageSignals>>,
    pub navigations: Mutex<Vec<(TabId, String)>>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_signals(signals: PageSignals) -> Arc<Self> {
        let host = Self::default();
        *host.signals.lock().unwrap() = Some(signals);
        Arc::new(host)
    }

    pub fn navigations(&self) -> Vec<(TabId, String)> {
        self.navigations.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserHost for FakeHost {
    async fn extract_page_signals(&self, _tab_id: TabId) -> Result<PageSignals> {
        self.signals
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow!("cannot access contents of the page"))
    }

    async fn navigate(&self, tab_id: TabId, url: &str) -> Result<()> {
        self.navigations
            .lock()
            .unwrap()
            .push((tab_id, url.to_string()));
        Ok(())
    }
}

/// 组件测试共用的依赖
pub struct Fixture {
    pub control: Arc<FakeControl>,
    pub store: Arc<MemoryStore>,
    pub state: Arc<EngineState>,
    pub guard: Arc<InterceptionGuard>,
    pub event_bus: Arc<EventBus>,
    pub signals: SignalReceiver,
}

impl Fixture {
    pub fn new() -> Self {
        let event_bus = Arc::new(EventBus::new(64));
        let (guard, signals) = InterceptionGuard::new(
            BlockedPage::new(EXTENSION_ORIGIN, "blocked.html"),
            event_bus.clone(),
        );
        Self {
            control: FakeControl::new(),
            store: Arc::new(MemoryStore::new()),
            state: Arc::new(EngineState::new()),
            guard: Arc::new(guard),
            event_bus,
            signals,
        }
    }
}
