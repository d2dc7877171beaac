//! 远端文档存储
//!
//! 以集合/文档为单位的 trait 接口，服务端时间为准。具体后端（托管文档数据库、
//! 测试用内存实现）通过 `RemoteStore` 注入到 `PlayaBoard`。

pub mod memory;

use crate::element::ElementKind;
use crate::error::{PlayaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use memory::MemoryRemoteStore;

/// 单次批量写入的上限
pub const MAX_BATCH_WRITES: usize = 500;

/// 探测用的集合与文档
pub const PROBE_DOCUMENT_ID: &str = "test";

/// 远端集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Seats,
    Circles,
    LedgerEntries,
    Visibility,
    ConnectionTest,
}

impl Collection {
    /// 需要实时监听的集合
    pub const LISTENED: [Collection; 4] = [
        Collection::Seats,
        Collection::Circles,
        Collection::LedgerEntries,
        Collection::Visibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Seats => "seats",
            Collection::Circles => "circles",
            Collection::LedgerEntries => "ledger_entries",
            Collection::Visibility => "visibility",
            Collection::ConnectionTest => "connection_test",
        }
    }

    pub fn for_kind(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Seat => Collection::Seats,
            ElementKind::Circle => Collection::Circles,
        }
    }

    pub fn element_kind(&self) -> Option<ElementKind> {
        match self {
            Collection::Seats => Some(ElementKind::Seat),
            Collection::Circles => Some(ElementKind::Circle),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 远端文档
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub collection: Collection,
    pub id: String,
    pub data: serde_json::Value,
    /// 服务端写入时间
    pub update_time: DateTime<Utc>,
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// 文档变更通知
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: RemoteDocument,
}

/// 批量写入中的一项
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOp {
    pub collection: Collection,
    pub id: String,
    pub data: serde_json::Value,
    pub merge: bool,
}

/// 集合订阅：先给出当前快照（全部视为 Added），之后推送增量
#[derive(Debug)]
pub struct ChangeSubscription {
    pub initial: Vec<DocumentChange>,
    pub receiver: broadcast::Receiver<DocumentChange>,
}

/// 远端文档存储接口
#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    /// 写入单个文档，返回服务端时间
    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        data: serde_json::Value,
        merge: bool,
    ) -> Result<DateTime<Utc>>;

    /// 以服务端生成的 ID 新增文档
    async fn add_document(&self, collection: Collection, data: serde_json::Value) -> Result<RemoteDocument>;

    async fn get_document(&self, collection: Collection, id: &str) -> Result<Option<RemoteDocument>>;

    /// 按更新时间倒序列出文档
    async fn list_documents(&self, collection: Collection, limit: usize) -> Result<Vec<RemoteDocument>>;

    /// 原子批量写入，最多 `MAX_BATCH_WRITES` 项，全部使用同一服务端时间
    async fn batch_set(&self, writes: Vec<WriteOp>) -> Result<DateTime<Utc>>;

    async fn subscribe(&self, collection: Collection) -> Result<ChangeSubscription>;

    /// 连通性探测：写入探测文档再读回
    async fn probe(&self) -> Result<()> {
        let data = serde_json::json!({ "probe_time": Utc::now().to_rfc3339() });
        self.set_document(Collection::ConnectionTest, PROBE_DOCUMENT_ID, data, false)
            .await?;
        self.get_document(Collection::ConnectionTest, PROBE_DOCUMENT_ID)
            .await?
            .map(|_| ())
            .ok_or_else(|| PlayaError::InvalidData("探测文档写入后读取为空".to_string()))
    }
}
