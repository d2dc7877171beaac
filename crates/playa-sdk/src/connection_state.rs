//! 连接状态管理
//!
//! 定期探测远端存储：
//! - 成功：连接中，失败计数清零，记录延迟（≥ 阈值显示为慢速）
//! - 失败：计数 +1，按退避策略安排重试；达到上限后停止自动重试，等待手动重试
//! - 从断开恢复为连接时回调 `ConnectionHook::on_connected`（重放待同步写入、重新订阅）

use crate::error::{PlayaError, Result};
use crate::events::{event_builders, BoardEvent, EventManager};
use crate::remote::RemoteStore;
use crate::retry_policy::{FailureReason, RetryPolicy};
use crate::utils::time::now_millis;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 状态指示
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusIndicator {
    Checking,
    Ok,
    Slow { latency_ms: u64 },
    Unavailable,
    PermissionDenied,
    Offline,
}

impl StatusIndicator {
    /// 界面上的短标签
    pub fn label(&self) -> String {
        match self {
            StatusIndicator::Checking => "...".to_string(),
            StatusIndicator::Ok => "OK".to_string(),
            StatusIndicator::Slow { latency_ms } => format!("{}ms", latency_ms),
            StatusIndicator::Unavailable => "X".to_string(),
            StatusIndicator::PermissionDenied => "!".to_string(),
            StatusIndicator::Offline => "offline".to_string(),
        }
    }
}

impl std::fmt::Display for StatusIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub last_check: Option<DateTime<Utc>>,
    /// 连续失败次数
    pub attempts: u32,
    pub last_error: Option<String>,
    pub latency_ms: Option<u64>,
    pub indicator: StatusIndicator,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            last_check: None,
            attempts: 0,
            last_error: None,
            latency_ms: None,
            indicator: StatusIndicator::Checking,
        }
    }
}

impl ConnectionStatus {
    /// 状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【连接状态】指示: {} | 已连接: {} | 失败次数: {} | 延迟: {} | 最后错误: {}",
            self.indicator,
            if self.connected { "是" } else { "否" },
            self.attempts,
            self.latency_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string()),
            self.last_error.as_deref().unwrap_or("-"),
        )
    }
}

/// 探测参数
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub slow_threshold_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
            slow_threshold_ms: 100,
        }
    }
}

/// 一次探测的结果
#[derive(Debug)]
pub enum ProbeOutcome {
    Connected {
        latency_ms: u64,
        /// 此前处于断开状态
        reconnected: bool,
    },
    Failed {
        error: PlayaError,
        was_connected: bool,
        /// None 表示不再自动重试
        next_retry: Option<Duration>,
    },
    /// 设备离线，未探测
    Skipped,
}

/// 连接状态变化回调
#[async_trait]
pub trait ConnectionHook: Send + Sync {
    /// 从断开恢复为连接
    async fn on_connected(&self) -> Result<()>;

    /// 从连接变为断开
    async fn on_disconnected(&self, error: &PlayaError);

    /// 即使连接未中断，也需要执行一次 `on_connected`（例如写入失败留下了待同步数据）
    fn needs_resync(&self) -> bool {
        false
    }
}

/// 连接监控
pub struct ConnectionMonitor {
    remote: Arc<dyn RemoteStore>,
    events: Arc<EventManager>,
    policy: RetryPolicy,
    settings: MonitorSettings,
    status: RwLock<ConnectionStatus>,
    network_online: AtomicBool,
    awaiting_manual_retry: AtomicBool,
    wake: Notify,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("policy", &self.policy)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ConnectionMonitor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        events: Arc<EventManager>,
        policy: RetryPolicy,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            remote,
            events,
            policy,
            settings,
            status: RwLock::new(ConnectionStatus::default()),
            network_online: AtomicBool::new(true),
            awaiting_manual_retry: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    pub fn is_awaiting_manual_retry(&self) -> bool {
        self.awaiting_manual_retry.load(Ordering::SeqCst)
    }

    /// 探测一次并更新状态
    pub async fn check(&self) -> ProbeOutcome {
        if !self.network_online.load(Ordering::SeqCst) {
            self.update(|s| {
                s.connected = false;
                s.indicator = StatusIndicator::Offline;
            })
            .await;
            return ProbeOutcome::Skipped;
        }

        self.update(|s| s.indicator = StatusIndicator::Checking).await;

        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.probe_timeout, self.remote.probe()).await {
            Ok(result) => result,
            Err(_) => Err(PlayaError::Timeout(format!(
                "连接探测超时（{}ms）",
                self.settings.probe_timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                let latency_ms = started.elapsed().as_millis() as u64;
                let slow_threshold = self.settings.slow_threshold_ms;
                let mut was_connected = false;
                self.update(|s| {
                    was_connected = s.connected;
                    s.connected = true;
                    s.attempts = 0;
                    s.last_error = None;
                    s.latency_ms = Some(latency_ms);
                    s.last_check = Some(Utc::now());
                    s.indicator = if latency_ms >= slow_threshold {
                        StatusIndicator::Slow { latency_ms }
                    } else {
                        StatusIndicator::Ok
                    };
                })
                .await;
                self.awaiting_manual_retry.store(false, Ordering::SeqCst);
                if !was_connected {
                    info!("远端连接已建立，延迟 {}ms", latency_ms);
                }
                ProbeOutcome::Connected {
                    latency_ms,
                    reconnected: !was_connected,
                }
            }
            Err(error) => {
                let reason = FailureReason::from(&error);
                let mut was_connected = false;
                let mut attempts = 0;
                let message = error.to_string();
                self.update(|s| {
                    was_connected = s.connected;
                    s.connected = false;
                    s.attempts += 1;
                    attempts = s.attempts;
                    s.last_error = Some(message.clone());
                    s.latency_ms = None;
                    s.last_check = Some(Utc::now());
                    s.indicator = if error.is_permission() {
                        StatusIndicator::PermissionDenied
                    } else {
                        StatusIndicator::Unavailable
                    };
                })
                .await;

                let next_retry = self.policy.next_delay(attempts, &reason);
                match next_retry {
                    Some(delay) => {
                        warn!("连接探测失败（第 {} 次），{}ms 后重试: {}", attempts, delay.as_millis(), message);
                    }
                    None => {
                        warn!("连接探测失败（第 {} 次），停止自动重试: {}", attempts, message);
                        self.awaiting_manual_retry.store(true, Ordering::SeqCst);
                        self.events
                            .emit(BoardEvent::ManualRetryRequired {
                                attempts,
                                last_error: Some(message),
                                timestamp: now_millis(),
                            })
                            .await;
                    }
                }
                ProbeOutcome::Failed {
                    error,
                    was_connected,
                    next_retry,
                }
            }
        }
    }

    /// 手动重试：清零计数并立即探测
    pub async fn manual_retry(&self) {
        info!("手动重试连接");
        self.awaiting_manual_retry.store(false, Ordering::SeqCst);
        self.update(|s| s.attempts = 0).await;
        self.wake.notify_one();
    }

    /// 设备网络状态变化
    pub async fn set_network_online(&self, online: bool) {
        self.network_online.store(online, Ordering::SeqCst);
        if online {
            self.awaiting_manual_retry.store(false, Ordering::SeqCst);
            self.update(|s| s.attempts = 0).await;
            self.wake.notify_one();
        } else {
            self.update(|s| {
                s.connected = false;
                s.indicator = StatusIndicator::Offline;
            })
            .await;
        }
    }

    async fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut ConnectionStatus),
    {
        let snapshot = {
            let mut status = self.status.write().await;
            let before = status.clone();
            f(&mut status);
            if *status == before {
                return;
            }
            status.clone()
        };
        debug!("{}", snapshot.summary());
        self.events
            .emit(event_builders::connection_changed(&snapshot))
            .await;
    }

    /// 后台探测循环：周期探测、失败退避重试、手动/网络恢复唤醒
    pub async fn run(self: Arc<Self>, hook: Arc<dyn ConnectionHook>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.probe_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_at: Option<Instant> = None;

        loop {
            let retry = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if self.is_awaiting_manual_retry() {
                        continue;
                    }
                }
                _ = retry => {}
                _ = self.wake.notified() => {}
            }

            retry_at = None;
            match self.check().await {
                ProbeOutcome::Connected { reconnected, .. } => {
                    if reconnected || hook.needs_resync() {
                        if let Err(e) = hook.on_connected().await {
                            warn!("重连处理失败: {}", e);
                        }
                    }
                }
                ProbeOutcome::Failed {
                    error,
                    was_connected,
                    next_retry,
                } => {
                    if was_connected {
                        hook.on_disconnected(&error).await;
                    }
                    retry_at = next_retry.map(|delay| Instant::now() + delay);
                }
                ProbeOutcome::Skipped => {}
            }
        }
        debug!("连接监控已停止");
    }
}
