//! 事件系统 - 向界面层推送状态变化
//!
//! 界面（或任何壳层）通过 `PlayaBoard::subscribe` 拿到广播接收器，
//! 也可以按事件类型注册同步回调。

use crate::connection_state::ConnectionStatus;
use crate::element::{ElementId, ElementKind};
use crate::ledger::{LedgerEntry, Totals};
use crate::utils::time::now_millis;
use crate::visibility::{VisibilityGroup, VisibilityState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOrigin {
    /// 本机操作
    Local,
    /// 远端推送（其他设备）
    Remote,
}

/// 面板事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BoardEvent {
    /// 元素颜色或顾客名变化
    ElementChanged {
        id: ElementId,
        kind: ElementKind,
        step: u8,
        customer_name: Option<String>,
        origin: ChangeOrigin,
        timestamp: i64,
    },
    /// 远端推送了本地布局里不存在的元素
    ElementMissing { id: String, timestamp: i64 },
    /// 新账本条目入账
    LedgerEntryRecorded {
        entry: LedgerEntry,
        origin: ChangeOrigin,
        timestamp: i64,
    },
    TotalsChanged { totals: Totals, timestamp: i64 },
    LedgerReset { timestamp: i64 },
    VisibilityChanged {
        /// 本地切换时为被切换的分组；远端整体覆盖时为 None
        group: Option<VisibilityGroup>,
        state: VisibilityState,
        origin: ChangeOrigin,
        timestamp: i64,
    },
    ConnectionChanged { status: ConnectionStatus, timestamp: i64 },
    /// 自动重试次数用尽，需要用户手动重试
    ManualRetryRequired {
        attempts: u32,
        last_error: Option<String>,
        timestamp: i64,
    },
    NetworkChanged { online: bool, timestamp: i64 },
    /// 重连后待同步写入已重放
    PendingReplayed {
        elements: usize,
        ledger_entries: usize,
        timestamp: i64,
    },
    /// 远端写入失败（本地已保存）
    RemoteWriteFailed {
        target: String,
        error: String,
        permission: bool,
        timestamp: i64,
    },
}

impl BoardEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            BoardEvent::ElementChanged { .. } => "element_changed",
            BoardEvent::ElementMissing { .. } => "element_missing",
            BoardEvent::LedgerEntryRecorded { .. } => "ledger_entry_recorded",
            BoardEvent::TotalsChanged { .. } => "totals_changed",
            BoardEvent::LedgerReset { .. } => "ledger_reset",
            BoardEvent::VisibilityChanged { .. } => "visibility_changed",
            BoardEvent::ConnectionChanged { .. } => "connection_changed",
            BoardEvent::ManualRetryRequired { .. } => "manual_retry_required",
            BoardEvent::NetworkChanged { .. } => "network_changed",
            BoardEvent::PendingReplayed { .. } => "pending_replayed",
            BoardEvent::RemoteWriteFailed { .. } => "remote_write_failed",
        }
    }

    /// 事件关联的元素 ID
    pub fn element_id(&self) -> Option<&str> {
        match self {
            BoardEvent::ElementChanged { id, .. } => Some(id.as_str()),
            BoardEvent::ElementMissing { id, .. } => Some(id.as_str()),
            _ => None,
        }
    }

    /// 事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            BoardEvent::ElementChanged { timestamp, .. }
            | BoardEvent::ElementMissing { timestamp, .. }
            | BoardEvent::LedgerEntryRecorded { timestamp, .. }
            | BoardEvent::TotalsChanged { timestamp, .. }
            | BoardEvent::LedgerReset { timestamp }
            | BoardEvent::VisibilityChanged { timestamp, .. }
            | BoardEvent::ConnectionChanged { timestamp, .. }
            | BoardEvent::ManualRetryRequired { timestamp, .. }
            | BoardEvent::NetworkChanged { timestamp, .. }
            | BoardEvent::PendingReplayed { timestamp, .. }
            | BoardEvent::RemoteWriteFailed { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    pub event_types: Option<Vec<String>>,
    pub element_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_element_ids(mut self, element_ids: Vec<String>) -> Self {
        self.element_ids = Some(element_ids);
        self
    }

    pub fn matches(&self, event: &BoardEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref ids) = self.element_ids {
            match event.element_id() {
                Some(id) if ids.iter().any(|i| i == id) => {}
                _ => return false,
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&BoardEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<BoardEvent>,
    /// 按事件类型注册的回调，`"*"` 接收全部
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: BoardEvent) {
        debug!("发布事件: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 没有界面订阅时 send 会失败，属正常情况
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("事件无活跃订阅者: {}", e);
        }

        let listeners = self.listeners.read().await;
        for key in [event.event_type(), "*"] {
            if let Some(callbacks) = listeners.get(key) {
                for listener in callbacks {
                    listener(&event);
                }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&BoardEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(Vec::len).sum();
        info!("已注册事件监听器: {}", event_type);
    }

    pub async fn clear_listeners(&self) {
        self.listeners.write().await.clear();
        self.stats.write().await.listener_count = 0;
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<BoardEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<BoardEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    pub async fn recv(&mut self) -> Result<BoardEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<BoardEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件构造辅助
pub mod event_builders {
    use super::*;
    use crate::element::ElementState;

    pub fn element_changed(state: &ElementState, origin: ChangeOrigin) -> BoardEvent {
        BoardEvent::ElementChanged {
            id: state.id.clone(),
            kind: state.kind,
            step: state.step.value(),
            customer_name: state.customer_name.clone(),
            origin,
            timestamp: now_millis(),
        }
    }

    pub fn element_missing(id: &str) -> BoardEvent {
        BoardEvent::ElementMissing {
            id: id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn ledger_entry_recorded(entry: &LedgerEntry, origin: ChangeOrigin) -> BoardEvent {
        BoardEvent::LedgerEntryRecorded {
            entry: entry.clone(),
            origin,
            timestamp: now_millis(),
        }
    }

    pub fn totals_changed(totals: Totals) -> BoardEvent {
        BoardEvent::TotalsChanged {
            totals,
            timestamp: now_millis(),
        }
    }

    pub fn connection_changed(status: &ConnectionStatus) -> BoardEvent {
        BoardEvent::ConnectionChanged {
            status: status.clone(),
            timestamp: now_millis(),
        }
    }

    pub fn remote_write_failed(target: &str, error: &crate::error::PlayaError) -> BoardEvent {
        BoardEvent::RemoteWriteFailed {
            target: target.to_string(),
            error: error.to_string(),
            permission: error.is_permission(),
            timestamp: now_millis(),
        }
    }
}
