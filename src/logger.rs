// 日志系统 - 控制台 + 每日轮转文件，并可把日志推送给订阅者（弹窗诊断页）

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// 日志消息
#[derive(Clone, Debug, serde::Serialize)]
pub struct LogMessage {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// 日志推送器
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogMessage>,
    enabled: AtomicBool,
}

impl LogBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            enabled: AtomicBool::new(true),
        }
    }

    /// 设置日志推送开关
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn emit_log(&self, log: LogMessage) {
        if !self.is_enabled() {
            return;
        }
        // 没有订阅者时丢弃
        let _ = self.sender.send(log);
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new(512)
    }
}

/// 把日志事件转发给 LogBroadcaster 的层
pub struct BroadcastLayer {
    broadcaster: Arc<LogBroadcaster>,
}

impl BroadcastLayer {
    pub fn new(broadcaster: Arc<LogBroadcaster>) -> Self {
        Self { broadcaster }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        struct MessageVisitor {
            message: String,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.message = format!("{:?}", value);
                    // 移除首尾引号
                    if self.message.len() >= 2
                        && self.message.starts_with('"')
                        && self.message.ends_with('"')
                    {
                        self.message = self.message[1..self.message.len() - 1].to_string();
                    }
                }
            }
        }

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        self.broadcaster.emit_log(LogMessage {
            timestamp: chrono::Local::now()
                .format("%Y-%m-%d %H:%M:%S%.3f")
                .to_string(),
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.message,
        });
    }
}

/// 默认日志目录
pub fn default_log_dir() -> PathBuf {
    if cfg!(target_os = "macos") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join("Library/Logs/focus-guard")
    } else if cfg!(target_os = "windows") {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("focus-guard").join("logs")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".local/share/focus-guard/logs")
    }
}

/// 初始化全局日志：控制台 + 每日轮转文件 + 推送层
pub fn init(log_dir: &Path, broadcaster: Arc<LogBroadcaster>) -> Result<()> {
    use tracing_subscriber::fmt::time::LocalTime;
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)
        .map_err(|e| anyhow!("创建日志目录失败 {:?}: {}", log_dir, e))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, "focus-guard.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // guard 释放后文件写入线程会停止，需与进程同生命周期
    std::mem::forget(guard);

    let writer = std::io::stdout.and(non_blocking);

    let timer = LocalTime::new(
        time::format_description::parse(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]",
        )
        .map_err(|e| anyhow!("日志时间格式无效: {}", e))?,
    );

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(writer)
        .with_timer(timer)
        .with_ansi(cfg!(debug_assertions))
        .finish()
        .with(BroadcastLayer::new(broadcaster));

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow!("日志系统已初始化: {}", e))?;

    eprintln!("日志文件位置: {:?}", log_dir);
    Ok(())
}
