//! 待同步写入
//!
//! 元素按 ID 去重（只保留最后一次修改），账本条目按条目 ID 去重。
//! 内存表与本地存储同步更新，重启后可继续重放。

use crate::element::ElementId;
use crate::error::Result;
use crate::ledger::LedgerEntry;
use crate::storage::{LocalStore, PendingElementWrite};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub struct PendingWrites {
    local: LocalStore,
    elements: Mutex<HashMap<ElementId, PendingElementWrite>>,
    ledger: Mutex<HashMap<Uuid, LedgerEntry>>,
    visibility: AtomicBool,
}

impl PendingWrites {
    pub async fn load(local: LocalStore) -> Result<Self> {
        let elements: HashMap<_, _> = local
            .load_pending()
            .await?
            .into_iter()
            .map(|w| (w.id.clone(), w))
            .collect();
        let ledger: HashMap<_, _> = local
            .load_pending_ledger()
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        let visibility = local.visibility_pending().await?;
        if !elements.is_empty() || !ledger.is_empty() {
            debug!(
                "恢复待同步写入: {} 个元素, {} 条账本",
                elements.len(),
                ledger.len()
            );
        }
        Ok(Self {
            local,
            elements: Mutex::new(elements),
            ledger: Mutex::new(ledger),
            visibility: AtomicBool::new(visibility),
        })
    }

    /// 入队元素写入，覆盖同一元素之前的待同步值
    pub async fn queue_element(&self, write: PendingElementWrite) -> Result<()> {
        self.local.save_pending(&write).await?;
        self.elements.lock().insert(write.id.clone(), write);
        Ok(())
    }

    /// 远端确认后移除；若期间又有新的本地修改（`queued_at` 不同）则保留
    pub async fn confirm_element(&self, id: &ElementId, queued_at: DateTime<Utc>) -> Result<bool> {
        let removed = {
            let mut elements = self.elements.lock();
            match elements.get(id) {
                Some(w) if w.queued_at == queued_at => {
                    elements.remove(id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.local.remove_pending(id).await?;
        }
        Ok(removed)
    }

    /// 无条件丢弃（远端有更新的值）
    pub async fn drop_element(&self, id: &ElementId) -> Result<bool> {
        let removed = self.elements.lock().remove(id).is_some();
        if removed {
            self.local.remove_pending(id).await?;
        }
        Ok(removed)
    }

    pub fn pending_element(&self, id: &ElementId) -> Option<PendingElementWrite> {
        self.elements.lock().get(id).cloned()
    }

    pub async fn queue_ledger(&self, entry: LedgerEntry) -> Result<()> {
        self.local.save_pending_ledger(&entry).await?;
        self.ledger.lock().insert(entry.id, entry);
        Ok(())
    }

    pub async fn confirm_ledger(&self, entry_id: &Uuid) -> Result<()> {
        if self.ledger.lock().remove(entry_id).is_some() {
            self.local.remove_pending_ledger(entry_id).await?;
        }
        Ok(())
    }

    pub async fn set_visibility_pending(&self, pending: bool) -> Result<()> {
        self.local.set_visibility_pending(pending).await?;
        self.visibility.store(pending, Ordering::SeqCst);
        Ok(())
    }

    pub fn visibility_pending(&self) -> bool {
        self.visibility.load(Ordering::SeqCst)
    }

    /// 元素快照，按入队时间排序
    pub fn element_snapshot(&self) -> Vec<PendingElementWrite> {
        let mut writes: Vec<_> = self.elements.lock().values().cloned().collect();
        writes.sort_by_key(|w| w.queued_at);
        writes
    }

    pub fn ledger_snapshot(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<_> = self.ledger.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.timestamp);
        entries
    }

    pub fn element_count(&self) -> usize {
        self.elements.lock().len()
    }

    pub fn ledger_count(&self) -> usize {
        self.ledger.lock().len()
    }

    /// 全部待同步项数量（可见性算一项）
    pub fn len(&self) -> usize {
        self.element_count() + self.ledger_count() + usize::from(self.visibility_pending())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 本地数据被清除后同步内存表
    pub async fn reload(&self) -> Result<()> {
        let elements = self.local.load_pending().await?;
        let ledger = self.local.load_pending_ledger().await?;
        let visibility = self.local.visibility_pending().await?;
        *self.elements.lock() = elements.into_iter().map(|w| (w.id.clone(), w)).collect();
        *self.ledger.lock() = ledger.into_iter().map(|e| (e.id, e)).collect();
        self.visibility.store(visibility, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{ElementKind, ElementState};
    use crate::storage::KvStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn local(temp_dir: &TempDir) -> LocalStore {
        let kv = KvStore::new(temp_dir.path(), "test").await.unwrap();
        LocalStore::new(Arc::new(kv))
    }

    fn write(id: &str, step: u8) -> PendingElementWrite {
        let mut state = ElementState::new(ElementId::new(id).unwrap(), ElementKind::Seat);
        state.set_step(step).unwrap();
        state.last_updated = Some(Utc::now());
        PendingElementWrite::from(&state)
    }

    #[tokio::test]
    async fn test_last_write_per_element_wins() {
        let temp_dir = TempDir::new().unwrap();
        let pending = PendingWrites::load(local(&temp_dir).await).await.unwrap();

        pending.queue_element(write("clon_1", 1)).await.unwrap();
        pending.queue_element(write("clon_1", 2)).await.unwrap();
        pending.queue_element(write("clon_2", 3)).await.unwrap();

        assert_eq!(pending.element_count(), 2);
        let id = ElementId::new("clon_1").unwrap();
        assert_eq!(pending.pending_element(&id).unwrap().step, 2);
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let temp_dir = TempDir::new().unwrap();
        let store = local(&temp_dir).await;
        {
            let pending = PendingWrites::load(store.clone()).await.unwrap();
            pending.queue_element(write("clon_5", 4)).await.unwrap();
            pending.set_visibility_pending(true).await.unwrap();
        }
        let restored = PendingWrites::load(store).await.unwrap();
        assert_eq!(restored.element_count(), 1);
        assert!(restored.visibility_pending());
        assert_eq!(restored.len(), 2);
    }

    #[tokio::test]
    async fn test_confirm_keeps_newer_mutation() {
        let temp_dir = TempDir::new().unwrap();
        let pending = PendingWrites::load(local(&temp_dir).await).await.unwrap();
        let first = write("clon_9", 1);
        let first_queued = first.queued_at;
        pending.queue_element(first).await.unwrap();

        let mut second = write("clon_9", 2);
        second.queued_at = first_queued + chrono::Duration::milliseconds(5);
        pending.queue_element(second.clone()).await.unwrap();

        let id = ElementId::new("clon_9").unwrap();
        assert!(!pending.confirm_element(&id, first_queued).await.unwrap());
        assert_eq!(pending.element_count(), 1);
        assert!(pending.confirm_element(&id, second.queued_at).await.unwrap());
        assert!(pending.is_empty());
    }
}
