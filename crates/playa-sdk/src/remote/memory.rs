//! 进程内远端存储
//!
//! 多个 `PlayaBoard` 共享同一实例即可模拟多台设备；支持注入不可用、权限错误与延迟。

use super::{
    ChangeKind, ChangeSubscription, Collection, DocumentChange, RemoteDocument, RemoteStore, WriteOp,
    MAX_BATCH_WRITES,
};
use crate::error::{PlayaError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<Collection, BTreeMap<String, RemoteDocument>>,
    last_server_time: Option<DateTime<Utc>>,
}

impl Inner {
    /// 单调递增的服务端时钟
    fn next_server_time(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_server_time {
            Some(last) if now <= last => last + ChronoDuration::milliseconds(1),
            _ => now,
        };
        self.last_server_time = Some(next);
        next
    }

    fn write(&mut self, op: WriteOp, at: DateTime<Utc>) -> DocumentChange {
        let docs = self.collections.entry(op.collection).or_default();
        let existing = docs.get(&op.id);
        let kind = if existing.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };

        let data = match (op.merge, existing.map(|d| &d.data), op.data) {
            (true, Some(serde_json::Value::Object(old)), serde_json::Value::Object(new)) => {
                let mut merged = old.clone();
                merged.extend(new);
                serde_json::Value::Object(merged)
            }
            (_, _, data) => data,
        };

        let document = RemoteDocument {
            collection: op.collection,
            id: op.id.clone(),
            data,
            update_time: at,
        };
        docs.insert(op.id, document.clone());
        DocumentChange { kind, document }
    }
}

/// 内存远端存储
#[derive(Debug)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
    channels: HashMap<Collection, broadcast::Sender<DocumentChange>>,
    available: AtomicBool,
    permission_denied: AtomicBool,
    latency_ms: AtomicU64,
    write_count: AtomicU64,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        let all = [
            Collection::Seats,
            Collection::Circles,
            Collection::LedgerEntries,
            Collection::Visibility,
            Collection::ConnectionTest,
        ];
        let channels = all
            .into_iter()
            .map(|c| (c, broadcast::channel(CHANNEL_CAPACITY).0))
            .collect();
        Self {
            inner: Mutex::new(Inner::default()),
            channels,
            available: AtomicBool::new(true),
            permission_denied: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
        }
    }

    /// 模拟断网/恢复
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 模拟安全规则拒绝
    pub fn set_permission_denied(&self, denied: bool) {
        self.permission_denied.store(denied, Ordering::SeqCst);
    }

    /// 每次请求附加的延迟
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// 已成功写入的文档数（批量写入按项计）
    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    pub fn document_count(&self, collection: Collection) -> usize {
        self.inner
            .lock()
            .collections
            .get(&collection)
            .map_or(0, BTreeMap::len)
    }

    /// 以指定服务端时间写入（模拟其他设备的历史写入），不检查可用性
    pub fn insert_with_time(
        &self,
        collection: Collection,
        id: &str,
        data: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        let change = {
            let mut inner = self.inner.lock();
            inner.write(
                WriteOp {
                    collection,
                    id: id.to_string(),
                    data,
                    merge: false,
                },
                at,
            )
        };
        self.publish(change);
    }

    async fn guard(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(PlayaError::Unavailable("远端存储不可用".to_string()));
        }
        if self.permission_denied.load(Ordering::SeqCst) {
            return Err(PlayaError::PermissionDenied("安全规则拒绝访问".to_string()));
        }
        Ok(())
    }

    fn publish(&self, change: DocumentChange) {
        if let Some(sender) = self.channels.get(&change.document.collection) {
            // 无订阅者时发送失败，忽略
            let _ = sender.send(change);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn set_document(
        &self,
        collection: Collection,
        id: &str,
        data: serde_json::Value,
        merge: bool,
    ) -> Result<DateTime<Utc>> {
        self.guard().await?;
        let change = {
            let mut inner = self.inner.lock();
            let at = inner.next_server_time();
            inner.write(
                WriteOp {
                    collection,
                    id: id.to_string(),
                    data,
                    merge,
                },
                at,
            )
        };
        let at = change.document.update_time;
        self.write_count.fetch_add(1, Ordering::SeqCst);
        self.publish(change);
        Ok(at)
    }

    async fn add_document(&self, collection: Collection, data: serde_json::Value) -> Result<RemoteDocument> {
        let id = Uuid::new_v4().simple().to_string();
        self.set_document(collection, &id, data, false).await?;
        self.get_document(collection, &id)
            .await?
            .ok_or_else(|| PlayaError::Other(format!("新增文档后读取失败: {}", id)))
    }

    async fn get_document(&self, collection: Collection, id: &str) -> Result<Option<RemoteDocument>> {
        self.guard().await?;
        let inner = self.inner.lock();
        Ok(inner
            .collections
            .get(&collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn list_documents(&self, collection: Collection, limit: usize) -> Result<Vec<RemoteDocument>> {
        self.guard().await?;
        let inner = self.inner.lock();
        let mut docs: Vec<RemoteDocument> = inner
            .collections
            .get(&collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| b.update_time.cmp(&a.update_time));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn batch_set(&self, writes: Vec<WriteOp>) -> Result<DateTime<Utc>> {
        if writes.len() > MAX_BATCH_WRITES {
            return Err(PlayaError::InvalidArgument(format!(
                "批量写入超过上限: {} > {}",
                writes.len(),
                MAX_BATCH_WRITES
            )));
        }
        self.guard().await?;

        let count = writes.len() as u64;
        let (at, changes) = {
            let mut inner = self.inner.lock();
            let at = inner.next_server_time();
            let changes: Vec<DocumentChange> = writes.into_iter().map(|op| inner.write(op, at)).collect();
            (at, changes)
        };
        self.write_count.fetch_add(count, Ordering::SeqCst);
        for change in changes {
            self.publish(change);
        }
        debug!("批量写入完成: {} 项", count);
        Ok(at)
    }

    async fn subscribe(&self, collection: Collection) -> Result<ChangeSubscription> {
        self.guard().await?;
        let sender = self
            .channels
            .get(&collection)
            .ok_or_else(|| PlayaError::InvalidArgument(format!("未知集合: {}", collection)))?;
        // 先订阅再取快照，避免漏掉两者之间的写入
        let receiver = sender.subscribe();
        let inner = self.inner.lock();
        let initial = inner
            .collections
            .get(&collection)
            .map(|docs| {
                docs.values()
                    .cloned()
                    .map(|document| DocumentChange {
                        kind: ChangeKind::Added,
                        document,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ChangeSubscription { initial, receiver })
    }
}
