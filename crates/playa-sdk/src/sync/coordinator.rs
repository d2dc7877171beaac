//! 同步协调器
//!
//! 本地优先：每次修改先写本地存储，在线时再写远端，失败或离线则进入待同步表。
//! 远端推送按最后写入者胜出合并。重连时批量重放待同步写入并重新订阅。

use super::applier::{decide, merge_document, ApplyDecision, ElementDocument};
use super::pending::PendingWrites;
use crate::connection_state::ConnectionHook;
use crate::element::{ElementId, ElementState};
use crate::error::{PlayaError, Result};
use crate::events::{event_builders, BoardEvent, ChangeOrigin, EventManager};
use crate::ledger::{Ledger, LedgerEntry};
use crate::registry::ElementRegistry;
use crate::remote::{
    ChangeKind, ChangeSubscription, Collection, DocumentChange, RemoteStore, WriteOp, MAX_BATCH_WRITES,
};
use crate::storage::{LocalStore, PendingElementWrite};
use crate::utils::time::now_millis;
use crate::visibility::{VisibilityState, VISIBILITY_DOCUMENT_ID};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 同步参数
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// 监听出错后重启的等待时间
    pub listener_restart_delay: Duration,
    /// 重放失败后的重试等待时间
    pub pending_retry_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            listener_restart_delay: Duration::from_secs(5),
            pending_retry_delay: Duration::from_secs(5),
        }
    }
}

/// 构造协调器所需的共享组件
#[derive(Debug, Clone)]
pub struct SyncDeps {
    pub registry: Arc<ElementRegistry>,
    pub local: LocalStore,
    pub remote: Arc<dyn RemoteStore>,
    pub events: Arc<EventManager>,
    pub ledger: Arc<Ledger>,
    pub visibility: Arc<RwLock<VisibilityState>>,
}

/// 一次重放的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub elements: usize,
    pub ledger_entries: usize,
    pub visibility: bool,
}

impl ReplaySummary {
    pub fn total(&self) -> usize {
        self.elements + self.ledger_entries + usize::from(self.visibility)
    }
}

enum ReplayTarget {
    Element(PendingElementWrite),
    Ledger(Uuid),
    Visibility(Option<DateTime<Utc>>),
}

struct ReplayItem {
    op: WriteOp,
    target: ReplayTarget,
}

struct ListenerSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// 同步协调器
pub struct SyncCoordinator {
    registry: Arc<ElementRegistry>,
    local: LocalStore,
    remote: Arc<dyn RemoteStore>,
    events: Arc<EventManager>,
    ledger: Arc<Ledger>,
    visibility: Arc<RwLock<VisibilityState>>,
    pending: PendingWrites,
    settings: SyncSettings,
    online: AtomicBool,
    /// 串行化元素的读-改-写
    element_lock: Mutex<()>,
    replay_lock: Mutex<()>,
    retry_scheduled: AtomicBool,
    listeners: parking_lot::Mutex<Option<ListenerSet>>,
    /// 面板关闭时取消，所有后台任务由它派生
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("online", &self.is_online())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl SyncCoordinator {
    /// 创建协调器；初始视为离线，首次探测成功后才开始同步
    pub async fn new(deps: SyncDeps, settings: SyncSettings, shutdown: CancellationToken) -> Result<Arc<Self>> {
        let pending = PendingWrites::load(deps.local.clone()).await?;
        Ok(Arc::new(Self {
            registry: deps.registry,
            local: deps.local,
            remote: deps.remote,
            events: deps.events,
            ledger: deps.ledger,
            visibility: deps.visibility,
            pending,
            settings,
            online: AtomicBool::new(false),
            element_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
            retry_scheduled: AtomicBool::new(false),
            listeners: parking_lot::Mutex::new(None),
            shutdown,
        }))
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    /// 设备离线：之后的修改直接进入待同步表
    pub fn go_offline(&self) {
        if self.online.swap(false, Ordering::SeqCst) {
            info!("切换到离线模式，修改将在重连后同步");
        }
    }

    // ========== 元素 ==========

    pub async fn element(&self, id: &str) -> Result<ElementState> {
        let entry = self.registry.require(id)?;
        self.local.load_element(&entry.id, entry.kind).await
    }

    pub async fn elements(&self) -> Result<Vec<ElementState>> {
        let mut states = Vec::with_capacity(self.registry.len());
        for entry in self.registry.iter() {
            states.push(self.local.load_element(&entry.id, entry.kind).await?);
        }
        Ok(states)
    }

    /// 修改元素：本地写入并通知界面，然后尝试写远端
    pub async fn mutate_element<F>(&self, id: &str, f: F) -> Result<ElementState>
    where
        F: FnOnce(&mut ElementState) -> Result<()>,
    {
        let entry = match self.registry.require(id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("元素不存在，忽略操作: {}", id);
                self.events.emit(event_builders::element_missing(id)).await;
                return Err(e);
            }
        };

        let state = {
            let _guard = self.element_lock.lock().await;
            let mut state = self.local.load_element(&entry.id, entry.kind).await?;
            f(&mut state)?;
            state.last_updated = Some(Utc::now());
            self.local.save_element(&state).await?;
            state
        };

        self.events
            .emit(event_builders::element_changed(&state, ChangeOrigin::Local))
            .await;
        self.push_element(&state).await?;
        Ok(state)
    }

    async fn push_element(&self, state: &ElementState) -> Result<()> {
        let write = PendingElementWrite::from(state);
        if !self.is_online() {
            debug!("离线，元素写入进入待同步表: {}", state.id);
            return self.pending.queue_element(write).await;
        }

        let data = ElementDocument::from_state(state).to_value()?;
        let collection = Collection::for_kind(state.kind);
        match self
            .remote
            .set_document(collection, state.id.as_str(), data, true)
            .await
        {
            Ok(server_time) => {
                self.confirm_element(&write, server_time).await?;
                Ok(())
            }
            Err(e) => {
                self.on_write_failure(&format!("{}/{}", collection, state.id), &e).await;
                self.pending.queue_element(write).await
            }
        }
    }

    /// 远端确认：本地时间戳替换为服务端时间（期间无新修改时）
    async fn confirm_element(&self, write: &PendingElementWrite, server_time: DateTime<Utc>) -> Result<()> {
        {
            let _guard = self.element_lock.lock().await;
            let mut state = self.local.load_element(&write.id, write.kind).await?;
            if state.last_updated == Some(write.queued_at) {
                state.last_updated = Some(server_time);
                self.local.save_element(&state).await?;
            }
        }
        self.pending.confirm_element(&write.id, write.queued_at).await?;
        Ok(())
    }

    async fn on_write_failure(&self, target: &str, e: &PlayaError) {
        if e.is_connectivity() {
            warn!("远端写入失败，转入离线模式: {} ({})", target, e);
            self.go_offline();
        } else {
            error!("远端写入失败: {} ({})", target, e);
        }
        self.events
            .emit(event_builders::remote_write_failed(target, e))
            .await;
    }

    // ========== 账本 ==========

    /// 镜像账本条目到远端，文档 ID 即条目 ID
    pub async fn push_ledger_entry(&self, entry: &LedgerEntry) -> Result<()> {
        if !self.is_online() {
            return self.pending.queue_ledger(entry.clone()).await;
        }
        let data = serde_json::to_value(entry)?;
        let id = entry.id.to_string();
        match self
            .remote
            .set_document(Collection::LedgerEntries, &id, data, false)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                self.on_write_failure(&format!("{}/{}", Collection::LedgerEntries, id), &e)
                    .await;
                self.pending.queue_ledger(entry.clone()).await
            }
        }
    }

    // ========== 可见性 ==========

    pub async fn push_visibility(&self, state: &VisibilityState) -> Result<()> {
        if !self.is_online() {
            return self.pending.set_visibility_pending(true).await;
        }
        let data = state.to_document()?;
        match self
            .remote
            .set_document(Collection::Visibility, VISIBILITY_DOCUMENT_ID, data, false)
            .await
        {
            Ok(server_time) => {
                self.confirm_visibility(state.last_updated, server_time).await?;
                self.pending.set_visibility_pending(false).await
            }
            Err(e) => {
                self.on_write_failure(&format!("{}/{}", Collection::Visibility, VISIBILITY_DOCUMENT_ID), &e)
                    .await;
                self.pending.set_visibility_pending(true).await
            }
        }
    }

    async fn confirm_visibility(&self, sent_at: Option<DateTime<Utc>>, server_time: DateTime<Utc>) -> Result<()> {
        let mut state = self.visibility.write().await;
        if state.last_updated != sent_at {
            return Ok(());
        }
        let mut confirmed = state.clone();
        confirmed.last_updated = Some(server_time);
        self.local.save_visibility(&confirmed).await?;
        *state = confirmed;
        Ok(())
    }

    // ========== 远端变更 ==========

    /// 应用一条远端变更；元素缺失或数据异常只记录日志
    pub async fn apply_remote_change(&self, change: DocumentChange) -> Result<()> {
        if change.kind == ChangeKind::Removed {
            debug!(
                "忽略远端删除: {}/{}",
                change.document.collection, change.document.id
            );
            return Ok(());
        }
        match change.document.collection {
            Collection::Seats | Collection::Circles => self.apply_element_change(change).await,
            Collection::LedgerEntries => self.apply_ledger_change(change).await,
            Collection::Visibility => self.apply_visibility_change(change).await,
            Collection::ConnectionTest => Ok(()),
        }
    }

    async fn apply_element_change(&self, change: DocumentChange) -> Result<()> {
        let document = change.document;
        let entry = match self.registry.get(&document.id) {
            Some(entry) => entry,
            None => {
                warn!("远端元素在本地布局中不存在，跳过: {}", document.id);
                self.events
                    .emit(event_builders::element_missing(&document.id))
                    .await;
                return Ok(());
            }
        };
        if document.collection.element_kind() != Some(entry.kind) {
            warn!(
                "远端元素类型不匹配，跳过: {}/{}",
                document.collection, document.id
            );
            return Ok(());
        }

        let applied = {
            let _guard = self.element_lock.lock().await;
            let current = self.local.load_element(&entry.id, entry.kind).await?;
            match decide(current.last_updated, document.update_time) {
                ApplyDecision::IgnoreStale => None,
                ApplyDecision::Apply => match merge_document(&current, &document) {
                    Ok(next) => {
                        self.local.save_element(&next).await?;
                        Some(next)
                    }
                    Err(e) => {
                        warn!("远端元素数据无效，跳过: {} ({})", document.id, e);
                        None
                    }
                },
            }
        };

        if let Some(next) = applied {
            if self.pending.drop_element(&next.id).await? {
                debug!("远端更新覆盖了待同步写入: {}", next.id);
            }
            self.events
                .emit(event_builders::element_changed(&next, ChangeOrigin::Remote))
                .await;
        } else {
            debug!("忽略较旧的远端变更: {}", document.id);
        }
        Ok(())
    }

    async fn apply_ledger_change(&self, change: DocumentChange) -> Result<()> {
        let entry: LedgerEntry = match serde_json::from_value(change.document.data) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("远端账本条目格式错误，跳过: {} ({})", change.document.id, e);
                return Ok(());
            }
        };
        match self.ledger.apply_remote(entry.clone()).await {
            Ok(true) => {
                self.events
                    .emit(event_builders::ledger_entry_recorded(&entry, ChangeOrigin::Remote))
                    .await;
                self.events
                    .emit(event_builders::totals_changed(self.ledger.totals().await))
                    .await;
            }
            Ok(false) => {}
            Err(e) if e.is_validation() || matches!(e, PlayaError::InvalidData(_)) => {
                warn!("远端账本条目无效，跳过: {} ({})", entry.id, e);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn apply_visibility_change(&self, change: DocumentChange) -> Result<()> {
        let document = change.document;
        let parsed = match VisibilityState::from_document(&document.data, document.update_time) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("远端可见性文档无效，跳过: {}", e);
                return Ok(());
            }
        };

        let snapshot = {
            let mut state = self.visibility.write().await;
            if !state.is_superseded_by(document.update_time) {
                return Ok(());
            }
            self.local.save_visibility(&parsed).await?;
            *state = parsed;
            state.clone()
        };
        self.pending.set_visibility_pending(false).await?;
        self.events
            .emit(BoardEvent::VisibilityChanged {
                group: None,
                state: snapshot,
                origin: ChangeOrigin::Remote,
                timestamp: now_millis(),
            })
            .await;
        Ok(())
    }

    // ========== 重放 ==========

    /// 批量重放待同步写入（每批不超过 `MAX_BATCH_WRITES`）
    ///
    /// 文档 ID 固定（元素 ID / 条目 ID），重复重放不会产生重复文档。
    pub async fn replay_pending(self: &Arc<Self>) -> Result<ReplaySummary> {
        let _guard = self.replay_lock.lock().await;

        let mut items = Vec::new();
        for write in self.pending.element_snapshot() {
            let data = ElementDocument {
                step: write.step,
                customer_name: write.customer_name.clone(),
            }
            .to_value()?;
            items.push(ReplayItem {
                op: WriteOp {
                    collection: Collection::for_kind(write.kind),
                    id: write.id.to_string(),
                    data,
                    merge: true,
                },
                target: ReplayTarget::Element(write),
            });
        }
        for entry in self.pending.ledger_snapshot() {
            items.push(ReplayItem {
                op: WriteOp {
                    collection: Collection::LedgerEntries,
                    id: entry.id.to_string(),
                    data: serde_json::to_value(&entry)?,
                    merge: false,
                },
                target: ReplayTarget::Ledger(entry.id),
            });
        }
        if self.pending.visibility_pending() {
            let state = self.visibility.read().await.clone();
            items.push(ReplayItem {
                op: WriteOp {
                    collection: Collection::Visibility,
                    id: VISIBILITY_DOCUMENT_ID.to_string(),
                    data: state.to_document()?,
                    merge: false,
                },
                target: ReplayTarget::Visibility(state.last_updated),
            });
        }

        let mut summary = ReplaySummary::default();
        if items.is_empty() {
            return Ok(summary);
        }
        info!("开始重放待同步写入: {} 项", items.len());

        for chunk in items.chunks(MAX_BATCH_WRITES) {
            let writes: Vec<WriteOp> = chunk.iter().map(|item| item.op.clone()).collect();
            let server_time = match self.remote.batch_set(writes).await {
                Ok(server_time) => server_time,
                Err(e) => {
                    warn!("重放失败，{}s 后重试: {}", self.settings.pending_retry_delay.as_secs(), e);
                    if e.is_connectivity() {
                        self.go_offline();
                    }
                    self.schedule_replay_retry();
                    return Err(e);
                }
            };

            for item in chunk {
                match &item.target {
                    ReplayTarget::Element(write) => {
                        self.confirm_element(write, server_time).await?;
                        summary.elements += 1;
                    }
                    ReplayTarget::Ledger(entry_id) => {
                        self.pending.confirm_ledger(entry_id).await?;
                        summary.ledger_entries += 1;
                    }
                    ReplayTarget::Visibility(sent_at) => {
                        self.confirm_visibility(*sent_at, server_time).await?;
                        self.pending.set_visibility_pending(false).await?;
                        summary.visibility = true;
                    }
                }
            }
        }

        self.local.set_last_sync_time(Utc::now()).await?;
        info!(
            "重放完成: {} 个元素, {} 条账本",
            summary.elements, summary.ledger_entries
        );
        self.events
            .emit(BoardEvent::PendingReplayed {
                elements: summary.elements,
                ledger_entries: summary.ledger_entries,
                timestamp: now_millis(),
            })
            .await;
        Ok(summary)
    }

    fn schedule_replay_retry(self: &Arc<Self>) {
        if self.retry_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let delay = self.settings.pending_retry_delay;
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            this.retry_scheduled.store(false, Ordering::SeqCst);
            if this.is_online() {
                if let Err(e) = this.replay_pending().await {
                    debug!("重放重试仍失败: {}", e);
                }
            }
        });
    }

    // ========== 监听 ==========

    /// 启动（或重启）全部集合的监听
    pub fn start_listeners(self: &Arc<Self>) {
        let cancel = self.shutdown.child_token();
        let handles = Collection::LISTENED
            .iter()
            .map(|collection| {
                let this = Arc::clone(self);
                let collection = *collection;
                let cancel = cancel.clone();
                tokio::spawn(async move { this.listen(collection, cancel).await })
            })
            .collect();

        let previous = self.listeners.lock().replace(ListenerSet { cancel, handles });
        if let Some(previous) = previous {
            previous.cancel.cancel();
            debug!("已替换旧的监听任务");
        }
        info!("远端监听已启动");
    }

    pub fn stop_listeners(&self) {
        if let Some(set) = self.listeners.lock().take() {
            set.cancel.cancel();
            for handle in set.handles {
                handle.abort();
            }
            debug!("远端监听已停止");
        }
    }

    pub fn listeners_running(&self) -> bool {
        self.listeners
            .lock()
            .as_ref()
            .is_some_and(|set| !set.cancel.is_cancelled())
    }

    async fn listen(self: Arc<Self>, collection: Collection, cancel: CancellationToken) {
        loop {
            match self.run_subscription(collection, &cancel).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "监听 {} 中断，{}s 后重启: {}",
                        collection,
                        self.settings.listener_restart_delay.as_secs(),
                        e
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.listener_restart_delay) => {}
                    }
                }
            }
        }
        debug!("监听 {} 已退出", collection);
    }

    /// 正常取消返回 Ok，流异常返回 Err
    async fn run_subscription(&self, collection: Collection, cancel: &CancellationToken) -> Result<()> {
        let ChangeSubscription { initial, mut receiver } = self.remote.subscribe(collection).await?;
        debug!("已订阅 {}，初始快照 {} 条", collection, initial.len());
        for change in initial {
            self.apply_logged(change).await;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = receiver.recv() => match received {
                    Ok(change) => self.apply_logged(change).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        return Err(PlayaError::Other(format!("变更流落后 {} 条", n)));
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(PlayaError::Unavailable("变更流已关闭".to_string()));
                    }
                }
            }
        }
    }

    async fn apply_logged(&self, change: DocumentChange) {
        let target = format!("{}/{}", change.document.collection, change.document.id);
        if let Err(e) = self.apply_remote_change(change).await {
            warn!("应用远端变更失败: {} ({})", target, e);
        }
    }

    /// 本地数据被清除后同步内存状态
    pub async fn reload_local(&self) -> Result<()> {
        self.pending.reload().await
    }

    pub fn element_id(&self, id: &str) -> Result<ElementId> {
        Ok(self.registry.require(id)?.id.clone())
    }
}

/// 连接监控回调：恢复连接时重放并重新订阅
pub struct SyncConnectionHook {
    coordinator: Arc<SyncCoordinator>,
}

impl SyncConnectionHook {
    pub fn new(coordinator: Arc<SyncCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl ConnectionHook for SyncConnectionHook {
    async fn on_connected(&self) -> Result<()> {
        self.coordinator.online.store(true, Ordering::SeqCst);
        let replay = self.coordinator.replay_pending().await;
        self.coordinator.start_listeners();
        replay.map(|_| ())
    }

    async fn on_disconnected(&self, error: &PlayaError) {
        debug!("连接断开: {}", error);
        self.coordinator.go_offline();
    }

    fn needs_resync(&self) -> bool {
        !self.coordinator.is_online() || !self.coordinator.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PaymentMethod;
    use crate::remote::MemoryRemoteStore;
    use crate::storage::KvStore;
    use crate::visibility::VisibilityGroup;
    use chrono::Duration as ChronoDuration;
    use rust_decimal::Decimal;
    use serde_json::json;
    use tempfile::TempDir;

    struct Device {
        _dir: TempDir,
        coordinator: Arc<SyncCoordinator>,
        hook: SyncConnectionHook,
        events: Arc<EventManager>,
        ledger: Arc<Ledger>,
    }

    async fn device(remote: Arc<MemoryRemoteStore>) -> Device {
        let dir = TempDir::new().unwrap();
        let kv = KvStore::new(dir.path(), "test").await.unwrap();
        let local = LocalStore::new(Arc::new(kv));
        let events = Arc::new(EventManager::new(256));
        let ledger = Arc::new(Ledger::load(local.clone()).await.unwrap());
        let deps = SyncDeps {
            registry: Arc::new(ElementRegistry::standard_layout(4).unwrap()),
            local,
            remote,
            events: events.clone(),
            ledger: ledger.clone(),
            visibility: Arc::new(RwLock::new(VisibilityState::default())),
        };
        let settings = SyncSettings {
            listener_restart_delay: Duration::from_millis(50),
            pending_retry_delay: Duration::from_millis(50),
        };
        let coordinator = SyncCoordinator::new(deps, settings, CancellationToken::new())
            .await
            .unwrap();
        Device {
            _dir: dir,
            hook: SyncConnectionHook::new(coordinator.clone()),
            coordinator,
            events,
            ledger,
        }
    }

    async fn wait_for<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_offline_mutations_replayed_exactly_once() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;

        for (id, step) in [("clon_1", 2u8), ("clon_2", 3), ("circle_0", 1)] {
            dev.coordinator
                .mutate_element(id, |s| s.set_step(step).map(|_| ()))
                .await
                .unwrap();
        }
        assert_eq!(dev.coordinator.pending().element_count(), 3);
        assert_eq!(remote.write_count(), 0);

        dev.hook.on_connected().await.unwrap();

        assert!(dev.coordinator.pending().is_empty());
        assert_eq!(remote.document_count(Collection::Seats), 2);
        assert_eq!(remote.document_count(Collection::Circles), 1);
        assert_eq!(remote.write_count(), 3);

        // 再次重放不会重复写入
        let summary = dev.coordinator.replay_pending().await.unwrap();
        assert_eq!(summary.total(), 0);
        assert_eq!(remote.write_count(), 3);

        let doc = remote
            .get_document(Collection::Seats, "clon_2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.data["step"], json!(3));
        // 本地时间戳已替换为服务端时间
        let local = dev.coordinator.element("clon_2").await.unwrap();
        assert_eq!(local.last_updated, Some(doc.update_time));
        dev.coordinator.stop_listeners();
    }

    #[tokio::test]
    async fn test_repeated_offline_mutation_keeps_last() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;
        for _ in 0..4 {
            dev.coordinator.mutate_element("clon_3", |s| {
                s.toggle();
                Ok(())
            })
            .await
            .unwrap();
        }
        assert_eq!(dev.coordinator.pending().element_count(), 1);
        dev.coordinator.online.store(true, Ordering::SeqCst);
        dev.coordinator.replay_pending().await.unwrap();
        let doc = remote.get_document(Collection::Seats, "clon_3").await.unwrap().unwrap();
        assert_eq!(doc.data["step"], json!(4));
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_online_write_goes_straight_to_remote() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;
        dev.coordinator.online.store(true, Ordering::SeqCst);

        let state = dev
            .coordinator
            .mutate_element("clon_4", |s| s.set_customer_name(Some("Pepe")))
            .await
            .unwrap();
        assert_eq!(state.customer_name.as_deref(), Some("Pepe"));
        assert!(dev.coordinator.pending().is_empty());
        let doc = remote.get_document(Collection::Seats, "clon_4").await.unwrap().unwrap();
        assert_eq!(doc.data["customer_name"], json!("Pepe"));
    }

    #[tokio::test]
    async fn test_write_failure_queues_and_goes_offline() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;
        dev.coordinator.online.store(true, Ordering::SeqCst);
        remote.set_available(false);
        let mut rx = dev.events.subscribe();

        dev.coordinator
            .mutate_element("clon_5", |s| s.set_step(6).map(|_| ()))
            .await
            .unwrap();
        assert!(!dev.coordinator.is_online());
        assert_eq!(dev.coordinator.pending().element_count(), 1);
        assert!(dev.hook.needs_resync());

        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let BoardEvent::RemoteWriteFailed { permission, .. } = event {
                assert!(!permission);
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_older_remote_change_ignored_newer_applied() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;

        let local = dev
            .coordinator
            .mutate_element("clon_6", |s| s.set_step(2).map(|_| ()))
            .await
            .unwrap();
        let local_time = local.last_updated.unwrap();

        let stale = DocumentChange {
            kind: ChangeKind::Modified,
            document: crate::remote::RemoteDocument {
                collection: Collection::Seats,
                id: "clon_6".into(),
                data: json!({"step": 5}),
                update_time: local_time - ChronoDuration::seconds(10),
            },
        };
        dev.coordinator.apply_remote_change(stale).await.unwrap();
        assert_eq!(dev.coordinator.element("clon_6").await.unwrap().step.value(), 2);
        assert_eq!(dev.coordinator.pending().element_count(), 1);

        let newer = DocumentChange {
            kind: ChangeKind::Modified,
            document: crate::remote::RemoteDocument {
                collection: Collection::Seats,
                id: "clon_6".into(),
                data: json!({"step": 5, "customer_name": "Rosa"}),
                update_time: local_time + ChronoDuration::seconds(10),
            },
        };
        dev.coordinator.apply_remote_change(newer).await.unwrap();
        let state = dev.coordinator.element("clon_6").await.unwrap();
        assert_eq!(state.step.value(), 5);
        assert_eq!(state.customer_name.as_deref(), Some("Rosa"));
        // 被更新的远端值覆盖，待同步写入作废
        assert_eq!(dev.coordinator.pending().element_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_remote_element_is_skipped() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote).await;
        let mut rx = dev.events.subscribe();

        let change = DocumentChange {
            kind: ChangeKind::Added,
            document: crate::remote::RemoteDocument {
                collection: Collection::Seats,
                id: "clon_999".into(),
                data: json!({"step": 1}),
                update_time: Utc::now(),
            },
        };
        dev.coordinator.apply_remote_change(change).await.unwrap();
        match rx.recv().await.unwrap() {
            BoardEvent::ElementMissing { id, .. } => assert_eq!(id, "clon_999"),
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(matches!(
            dev.coordinator.mutate_element("nope", |_| Ok(())).await,
            Err(PlayaError::ElementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_two_devices_converge_through_listeners() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let a = device(remote.clone()).await;
        let b = device(remote.clone()).await;
        a.hook.on_connected().await.unwrap();
        b.hook.on_connected().await.unwrap();

        a.coordinator
            .mutate_element("clon_10", |s| s.set_step(4).map(|_| ()))
            .await
            .unwrap();
        let b_coord = b.coordinator.clone();
        wait_for(|| {
            let b_coord = b_coord.clone();
            async move { b_coord.element("clon_10").await.unwrap().step.value() == 4 }
        })
        .await;

        let entry = a
            .ledger
            .record_payment("10", Decimal::new(15, 0), Decimal::new(20, 0), PaymentMethod::Cash)
            .await
            .unwrap();
        a.coordinator.push_ledger_entry(&entry).await.unwrap();
        let b_ledger = b.ledger.clone();
        wait_for(|| {
            let b_ledger = b_ledger.clone();
            async move { b_ledger.history().await.len() == 1 }
        })
        .await;
        assert_eq!(b.ledger.totals().await.cash, Decimal::new(15, 0));

        // A 的监听收到自己的条目回声，不会重复入账
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(a.ledger.history().await.len(), 1);

        a.coordinator.stop_listeners();
        b.coordinator.stop_listeners();
        assert!(!a.coordinator.listeners_running());
    }

    #[tokio::test]
    async fn test_offline_ledger_and_visibility_replayed() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;

        let entry = dev
            .ledger
            .record_payment("7", Decimal::new(10, 0), Decimal::new(10, 0), PaymentMethod::Card)
            .await
            .unwrap();
        dev.coordinator.push_ledger_entry(&entry).await.unwrap();

        let state = {
            let mut vis = dev.coordinator.visibility.write().await;
            vis.set(VisibilityGroup::Row2, false, Utc::now());
            vis.clone()
        };
        dev.coordinator.push_visibility(&state).await.unwrap();
        assert_eq!(dev.coordinator.pending().len(), 2);

        dev.coordinator.online.store(true, Ordering::SeqCst);
        let summary = dev.coordinator.replay_pending().await.unwrap();
        assert_eq!(summary.ledger_entries, 1);
        assert!(summary.visibility);
        assert!(dev.coordinator.pending().is_empty());

        let doc = remote
            .get_document(Collection::LedgerEntries, &entry.id.to_string())
            .await
            .unwrap()
            .unwrap();
        let mirrored: LedgerEntry = serde_json::from_value(doc.data).unwrap();
        assert_eq!(mirrored, entry);
        let vis_doc = remote
            .get_document(Collection::Visibility, VISIBILITY_DOCUMENT_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(vis_doc.data["groups"]["row2"], json!(false));
    }

    #[tokio::test]
    async fn test_large_replay_split_into_batches() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;
        for _ in 0..(MAX_BATCH_WRITES + 20) {
            let entry = dev
                .ledger
                .record_payment("3", Decimal::new(1, 0), Decimal::new(1, 0), PaymentMethod::Cash)
                .await
                .unwrap();
            dev.coordinator.push_ledger_entry(&entry).await.unwrap();
        }

        dev.coordinator.online.store(true, Ordering::SeqCst);
        let summary = dev.coordinator.replay_pending().await.unwrap();
        assert_eq!(summary.ledger_entries, MAX_BATCH_WRITES + 20);
        assert_eq!(remote.document_count(Collection::LedgerEntries), MAX_BATCH_WRITES + 20);
    }

    #[tokio::test]
    async fn test_failed_replay_is_retried() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let dev = device(remote.clone()).await;
        dev.coordinator
            .mutate_element("clon_8", |s| s.set_step(1).map(|_| ()))
            .await
            .unwrap();

        remote.set_available(false);
        dev.coordinator.online.store(true, Ordering::SeqCst);
        assert!(dev.coordinator.replay_pending().await.is_err());
        assert_eq!(dev.coordinator.pending().element_count(), 1);

        // 恢复后由重试任务完成
        remote.set_available(true);
        dev.coordinator.online.store(true, Ordering::SeqCst);
        let coord = dev.coordinator.clone();
        wait_for(|| {
            let coord = coord.clone();
            async move { coord.pending().is_empty() }
        })
        .await;
        assert_eq!(remote.document_count(Collection::Seats), 1);
    }
}
