//! Playa 面板主接口
//!
//! 分层结构：
//! - 存储层：KvStore / LocalStore
//! - 同步层：SyncCoordinator（本地优先 + 远端镜像）
//! - 连接层：ConnectionMonitor / NetworkMonitor
//! - 事件层：EventManager
//!
//! 所有运行时状态都是 `PlayaBoard` 的字段，`initialize` 创建、`shutdown` 释放。

use crate::config::PlayaConfig;
use crate::connection_state::{ConnectionMonitor, ConnectionStatus, MonitorSettings};
use crate::element::ElementState;
use crate::error::{PlayaError, Result};
use crate::events::{event_builders, BoardEvent, ChangeOrigin, EventFilter, EventManager, FilteredEventReceiver};
use crate::export;
use crate::ledger::{Ledger, LedgerEntry, OperationRecord, PaymentMethod, Totals};
use crate::network::{NetworkMonitor, NetworkStatus};
use crate::registry::ElementRegistry;
use crate::remote::RemoteStore;
use crate::retry_policy::RetryPolicy;
use crate::storage::{KvStore, LocalStore};
use crate::sync::{SyncConnectionHook, SyncCoordinator, SyncDeps, SyncSettings};
use crate::utils::time::{now_millis, TimeFormatter};
use crate::visibility::{VisibilityGroup, VisibilityState};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Playa 面板
pub struct PlayaBoard {
    config: PlayaConfig,
    formatter: TimeFormatter,
    registry: Arc<ElementRegistry>,
    local: LocalStore,
    events: Arc<EventManager>,
    ledger: Arc<Ledger>,
    visibility: Arc<RwLock<VisibilityState>>,
    network: Arc<NetworkMonitor>,
    monitor: Arc<ConnectionMonitor>,
    sync: Arc<SyncCoordinator>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for PlayaBoard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayaBoard")
            .field("station_id", &self.config.station_id)
            .field("elements", &self.registry.len())
            .field("sync", &self.sync)
            .finish()
    }
}

impl PlayaBoard {
    /// 初始化面板
    ///
    /// 顺序：本地存储 → 布局 → 本地数据 → 同步协调器 → 连接监控与网络监听。
    /// 远端监听在首次探测成功后启动。
    pub async fn initialize(config: PlayaConfig, remote: Arc<dyn RemoteStore>) -> Result<Arc<Self>> {
        info!("正在初始化 PlayaBoard（站点 {}）...", config.station_id);
        config.validate()?;

        let formatter = TimeFormatter::new(config.timezone());
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let kv = Arc::new(KvStore::new(&config.data_dir, &config.station_id).await?);
        let local = LocalStore::new(kv);
        local.check_schema().await?;

        let registry = Arc::new(ElementRegistry::standard_layout(config.circle_count)?);
        let events = Arc::new(EventManager::new(config.event_config.buffer_size));
        let ledger = Arc::new(Ledger::load(local.clone()).await?);
        let visibility = Arc::new(RwLock::new(local.load_visibility().await?));
        let network = Arc::new(NetworkMonitor::new(NetworkStatus::Online));
        let cancel = CancellationToken::new();

        let sync = SyncCoordinator::new(
            SyncDeps {
                registry: registry.clone(),
                local: local.clone(),
                remote: remote.clone(),
                events: events.clone(),
                ledger: ledger.clone(),
                visibility: visibility.clone(),
            },
            SyncSettings::from(&config.sync_config),
            cancel.clone(),
        )
        .await?;

        let monitor = Arc::new(ConnectionMonitor::new(
            remote,
            events.clone(),
            RetryPolicy::from(&config.retry_config),
            MonitorSettings::from(&config.connection_config),
        ));

        let mut tasks = Vec::new();
        let hook = Arc::new(SyncConnectionHook::new(sync.clone()));
        tasks.push(tokio::spawn(monitor.clone().run(hook, cancel.child_token())));
        tasks.push(tokio::spawn(watch_network(
            network.subscribe(),
            sync.clone(),
            monitor.clone(),
            events.clone(),
            cancel.child_token(),
        )));

        info!(
            "PlayaBoard 初始化完成: {} 个元素, {} 条待同步",
            registry.len(),
            sync.pending().len()
        );

        Ok(Arc::new(Self {
            config,
            formatter,
            registry,
            local,
            events,
            ledger,
            visibility,
            network,
            monitor,
            sync,
            cancel,
            tasks: parking_lot::Mutex::new(tasks),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// 关闭面板：取消全部后台任务并刷盘
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 PlayaBoard...");
        self.cancel.cancel();
        self.sync.stop_listeners();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                warn!("后台任务退出异常: {}", e);
            }
        }
        self.local.flush().await?;
        info!("PlayaBoard 关闭完成");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PlayaError::ShuttingDown("面板已关闭".to_string()));
        }
        Ok(())
    }

    pub fn config(&self) -> &PlayaConfig {
        &self.config
    }

    pub fn registry(&self) -> &ElementRegistry {
        &self.registry
    }

    pub fn formatter(&self) -> &TimeFormatter {
        &self.formatter
    }

    // ========== 元素 ==========

    /// 步骤前进一格（到顶后回到 1）
    pub async fn toggle_element(&self, id: &str) -> Result<ElementState> {
        self.ensure_running()?;
        self.sync
            .mutate_element(id, |state| {
                state.toggle();
                Ok(())
            })
            .await
    }

    pub async fn set_element_step(&self, id: &str, step: u8) -> Result<ElementState> {
        self.ensure_running()?;
        self.sync
            .mutate_element(id, |state| state.set_step(step).map(|_| ()))
            .await
    }

    /// 设置或清除顾客名（仅躺椅）
    pub async fn set_customer_name(&self, id: &str, name: Option<&str>) -> Result<ElementState> {
        self.ensure_running()?;
        self.sync
            .mutate_element(id, |state| state.set_customer_name(name))
            .await
    }

    pub async fn element(&self, id: &str) -> Result<ElementState> {
        self.sync.element(id).await
    }

    pub async fn elements(&self) -> Result<Vec<ElementState>> {
        self.sync.elements().await
    }

    /// 元素当前的样式类名
    pub async fn element_css_class(&self, id: &str) -> Result<Option<String>> {
        Ok(self.element(id).await?.step.css_class())
    }

    // ========== 账本 ==========

    pub async fn record_payment(
        &self,
        element_id: &str,
        total: Decimal,
        received: Decimal,
        method: PaymentMethod,
    ) -> Result<LedgerEntry> {
        self.ensure_running()?;
        let entry = self.ledger.record_payment(element_id, total, received, method).await?;
        self.after_ledger_append(&entry).await?;
        Ok(entry)
    }

    pub async fn record_refund(&self, element_id: &str, total: Decimal, method: PaymentMethod) -> Result<LedgerEntry> {
        self.ensure_running()?;
        let entry = self.ledger.record_refund(element_id, total, method).await?;
        self.after_ledger_append(&entry).await?;
        Ok(entry)
    }

    async fn after_ledger_append(&self, entry: &LedgerEntry) -> Result<()> {
        self.events
            .emit(event_builders::ledger_entry_recorded(entry, ChangeOrigin::Local))
            .await;
        self.events
            .emit(event_builders::totals_changed(self.ledger.totals().await))
            .await;
        self.sync.push_ledger_entry(entry).await
    }

    pub async fn totals(&self) -> Totals {
        self.ledger.totals().await
    }

    /// 历史记录，最新在前
    pub async fn ledger_history(&self) -> Vec<LedgerEntry> {
        self.ledger.history().await
    }

    pub async fn ledger_history_lines(&self) -> Vec<String> {
        self.ledger.history_lines(&self.formatter).await
    }

    pub async fn operations(&self) -> Vec<OperationRecord> {
        self.ledger.operations().await
    }

    pub async fn export_summary_csv(&self) -> String {
        export::summary_csv(&self.ledger.history().await, &self.formatter)
    }

    pub async fn export_operations_csv(&self) -> String {
        export::operations_csv(&self.ledger.operations().await, &self.formatter)
    }

    /// 清空历史与合计（操作日志保留）
    pub async fn reset_ledger(&self) -> Result<()> {
        self.ensure_running()?;
        self.ledger.reset().await?;
        self.events
            .emit(BoardEvent::LedgerReset {
                timestamp: now_millis(),
            })
            .await;
        self.events
            .emit(event_builders::totals_changed(Totals::default()))
            .await;
        Ok(())
    }

    // ========== 可见性 ==========

    pub async fn visibility(&self) -> VisibilityState {
        self.visibility.read().await.clone()
    }

    pub async fn is_visible(&self, group: VisibilityGroup) -> bool {
        self.visibility.read().await.is_visible(group)
    }

    /// 切换分组可见性，返回切换后的值
    pub async fn toggle_visibility(&self, group: VisibilityGroup) -> Result<bool> {
        self.ensure_running()?;
        let snapshot = self
            .update_visibility(|state| {
                state.toggle(group, Utc::now());
            })
            .await?;
        let visible = snapshot.is_visible(group);
        self.publish_visibility(group, snapshot).await?;
        Ok(visible)
    }

    pub async fn set_visibility(&self, group: VisibilityGroup, visible: bool) -> Result<()> {
        self.ensure_running()?;
        let snapshot = self
            .update_visibility(|state| state.set(group, visible, Utc::now()))
            .await?;
        self.publish_visibility(group, snapshot).await
    }

    /// 写锁内修改并落盘，返回快照
    async fn update_visibility<F>(&self, f: F) -> Result<VisibilityState>
    where
        F: FnOnce(&mut VisibilityState),
    {
        let mut state = self.visibility.write().await;
        let mut next = state.clone();
        f(&mut next);
        self.local.save_visibility(&next).await?;
        *state = next.clone();
        Ok(next)
    }

    async fn publish_visibility(&self, group: VisibilityGroup, snapshot: VisibilityState) -> Result<()> {
        debug!("可见性变化: {} -> {}", group, snapshot.is_visible(group));
        self.events
            .emit(BoardEvent::VisibilityChanged {
                group: Some(group),
                state: snapshot.clone(),
                origin: ChangeOrigin::Local,
                timestamp: now_millis(),
            })
            .await;
        self.sync.push_visibility(&snapshot).await
    }

    // ========== 连接 ==========

    /// 设备网络状态（由平台层上报）
    pub async fn set_network_online(&self, online: bool) {
        let status = if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        };
        self.network.set_status(status).await;
    }

    pub async fn manual_retry(&self) -> Result<()> {
        self.ensure_running()?;
        self.monitor.manual_retry().await;
        Ok(())
    }

    pub async fn connection_status(&self) -> ConnectionStatus {
        self.monitor.status().await
    }

    pub fn is_syncing_remote(&self) -> bool {
        self.sync.is_online()
    }

    pub fn pending_count(&self) -> usize {
        self.sync.pending().len()
    }

    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.local.last_sync_time().await
    }

    // ========== 本地数据 ==========

    /// 清除本地数据但保留顾客名与可见性
    ///
    /// 步骤清零后由远端快照重新填充：在线时立即重新订阅。
    pub async fn reset_except_customers(&self) -> Result<usize> {
        self.ensure_running()?;
        let removed = self.local.reset_except_customers(Utc::now()).await?;
        self.reload_local_state().await?;
        if self.sync.is_online() {
            self.sync.start_listeners();
        }
        Ok(removed)
    }

    /// 清空本站点的全部本地数据
    pub async fn clear_local_data(&self) -> Result<()> {
        self.ensure_running()?;
        self.local.clear_all().await?;
        *self.visibility.write().await = VisibilityState::default();
        self.reload_local_state().await?;
        info!("本地数据已清空: 站点 {}", self.config.station_id);
        Ok(())
    }

    async fn reload_local_state(&self) -> Result<()> {
        self.ledger.reload().await?;
        self.sync.reload_local().await?;
        self.events
            .emit(BoardEvent::LedgerReset {
                timestamp: now_millis(),
            })
            .await;
        self.events
            .emit(event_builders::totals_changed(self.ledger.totals().await))
            .await;
        for state in self.sync.elements().await? {
            self.events
                .emit(event_builders::element_changed(&state, ChangeOrigin::Local))
                .await;
        }
        Ok(())
    }

    pub async fn set_notes(&self, notes: &str) -> Result<()> {
        self.ensure_running()?;
        self.local.set_notes(notes).await
    }

    pub async fn notes(&self) -> Result<String> {
        self.local.notes().await
    }

    // ========== 事件 ==========

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }
}

/// 网络状态监听：离线时停止远端写入，恢复时立即探测
async fn watch_network(
    mut receiver: broadcast::Receiver<crate::network::NetworkStatusEvent>,
    sync: Arc<SyncCoordinator>,
    monitor: Arc<ConnectionMonitor>,
    events: Arc<EventManager>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            received = receiver.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("网络事件落后 {} 条", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        };

        let online = event.new_status.is_online();
        if !online {
            sync.go_offline();
        }
        monitor.set_network_online(online).await;
        events
            .emit(BoardEvent::NetworkChanged {
                online,
                timestamp: event.timestamp,
            })
            .await;
    }
    debug!("网络监听已停止");
}

impl PlayaBoard {
    /// 元素允许的最大步骤
    pub fn max_step(&self, id: &str) -> Result<u8> {
        let entry = self.registry.require(id)?;
        Ok(entry.kind.max_step())
    }
}
