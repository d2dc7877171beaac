//! 设备网络状态
//!
//! 由壳层（浏览器 online/offline 事件、移动端系统回调）调用 `set_status` 推送，
//! 面板内部订阅变化以切换离线模式或触发重连。

use crate::utils::time::now_millis;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// 网络状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Online,
    Offline,
}

impl NetworkStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, NetworkStatus::Online)
    }
}

/// 网络状态变化事件
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkStatusEvent {
    pub old_status: NetworkStatus,
    pub new_status: NetworkStatus,
    pub timestamp: i64,
}

/// 网络监控
#[derive(Debug)]
pub struct NetworkMonitor {
    status_sender: broadcast::Sender<NetworkStatusEvent>,
    current_status: Arc<tokio::sync::RwLock<NetworkStatus>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (status_sender, _) = broadcast::channel(100);
        Self {
            status_sender,
            current_status: Arc::new(tokio::sync::RwLock::new(initial)),
        }
    }

    pub async fn get_status(&self) -> NetworkStatus {
        *self.current_status.read().await
    }

    pub async fn is_online(&self) -> bool {
        self.get_status().await.is_online()
    }

    /// 更新状态；只有真正变化时才广播，返回是否变化
    pub async fn set_status(&self, new_status: NetworkStatus) -> bool {
        let old_status = {
            let mut status = self.current_status.write().await;
            let old = *status;
            *status = new_status;
            old
        };
        if old_status == new_status {
            return false;
        }

        info!("网络状态变化: {:?} -> {:?}", old_status, new_status);
        let event = NetworkStatusEvent {
            old_status,
            new_status,
            timestamp: now_millis(),
        };
        let _ = self.status_sender.send(event);
        true
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkStatusEvent> {
        self.status_sender.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Online)
    }
}
