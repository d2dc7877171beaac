//! 本地存储类型化封装
//!
//! 在 `KvStore` 之上固定键空间，复合记录存 JSON，标量（合计、时间、备注）存纯字符串。

use crate::element::{ElementId, ElementKind, ElementState, Step};
use crate::error::{PlayaError, Result};
use crate::ledger::{LedgerEntry, OperationRecord, Totals};
use crate::storage::kv::KvStore;
use crate::version::LOCAL_SCHEMA_VERSION;
use crate::visibility::{VisibilityGroup, VisibilityState};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 键空间
pub mod keys {
    pub const ELEMENT_PREFIX: &str = "element:";
    pub const PENDING_PREFIX: &str = "pending:";
    pub const LEDGER_HISTORY: &str = "ledger:history";
    pub const LEDGER_OPERATIONS: &str = "ledger:operations";
    pub const LEDGER_PENDING_PREFIX: &str = "ledger:pending:";
    pub const LEDGER_RESET_AT: &str = "ledger:reset_at";
    pub const TOTALS_CASH: &str = "totals:cash";
    pub const TOTALS_CARD: &str = "totals:card";
    pub const VISIBILITY_PREFIX: &str = "visibility:";
    pub const VISIBILITY_UPDATED_AT: &str = "visibility_meta:last_updated";
    pub const VISIBILITY_PENDING: &str = "visibility_meta:pending";
    pub const LAST_SYNC_TIME: &str = "sync:last_sync_time";
    pub const NOTES: &str = "notes";
    pub const SCHEMA_VERSION: &str = "meta:schema_version";

    pub fn element(id: &str) -> String {
        format!("{}{}", ELEMENT_PREFIX, id)
    }

    pub fn pending(id: &str) -> String {
        format!("{}{}", PENDING_PREFIX, id)
    }

    pub fn ledger_pending(entry_id: &uuid::Uuid) -> String {
        format!("{}{}", LEDGER_PENDING_PREFIX, entry_id)
    }

    pub fn visibility(group: crate::visibility::VisibilityGroup) -> String {
        format!("{}{}", VISIBILITY_PREFIX, group.as_str())
    }
}

const VISIBLE: &str = "visible";
const HIDDEN: &str = "hidden";

/// 元素的本地持久化形态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub step: u8,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl From<&ElementState> for ElementRecord {
    fn from(state: &ElementState) -> Self {
        Self {
            step: state.step.value(),
            customer_name: state.customer_name.clone(),
            last_updated: state.last_updated,
        }
    }
}

/// 尚未写到远端的元素修改（每个元素只保留最后一次）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingElementWrite {
    pub id: ElementId,
    pub kind: ElementKind,
    pub step: u8,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl From<&ElementState> for PendingElementWrite {
    fn from(state: &ElementState) -> Self {
        Self {
            id: state.id.clone(),
            kind: state.kind,
            step: state.step.value(),
            customer_name: state.customer_name.clone(),
            queued_at: state.last_updated.unwrap_or_else(Utc::now),
        }
    }
}

/// 类型化本地存储
#[derive(Debug, Clone)]
pub struct LocalStore {
    kv: Arc<KvStore>,
}

impl LocalStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    /// 校验并写入存储格式版本；遇到更高版本拒绝打开
    pub async fn check_schema(&self) -> Result<()> {
        match self.kv.get_raw(keys::SCHEMA_VERSION).await? {
            Some(raw) => {
                let version: u32 = raw
                    .parse()
                    .map_err(|_| PlayaError::InvalidData(format!("存储版本无法解析: {}", raw)))?;
                if version > LOCAL_SCHEMA_VERSION {
                    return Err(PlayaError::InvalidData(format!(
                        "本地数据版本 {} 高于当前支持的 {}",
                        version, LOCAL_SCHEMA_VERSION
                    )));
                }
            }
            None => {
                self.kv
                    .set_raw(keys::SCHEMA_VERSION, &LOCAL_SCHEMA_VERSION.to_string())
                    .await?;
            }
        }
        Ok(())
    }

    // ========== 元素 ==========

    /// 读取元素状态；无记录时返回默认状态。
    /// 步骤越界的旧数据按 0 处理。
    pub async fn load_element(&self, id: &ElementId, kind: ElementKind) -> Result<ElementState> {
        let record: Option<ElementRecord> = self.kv.get(keys::element(id.as_str())).await?;
        let mut state = ElementState::new(id.clone(), kind);
        if let Some(record) = record {
            state.step = match Step::new(kind, record.step) {
                Ok(step) => step,
                Err(e) => {
                    warn!("本地步骤越界，按 0 处理: {} ({})", id, e);
                    Step::ZERO
                }
            };
            if kind.supports_customer_name() {
                state.customer_name = crate::element::normalize_name(record.customer_name.as_deref());
            }
            state.last_updated = record.last_updated;
        }
        Ok(state)
    }

    pub async fn save_element(&self, state: &ElementState) -> Result<()> {
        self.kv
            .set(keys::element(state.id.as_str()), &ElementRecord::from(state))
            .await
    }

    // ========== 待同步元素写入 ==========

    pub async fn save_pending(&self, write: &PendingElementWrite) -> Result<()> {
        self.kv.set(keys::pending(write.id.as_str()), write).await
    }

    pub async fn remove_pending(&self, id: &ElementId) -> Result<()> {
        self.kv.delete(keys::pending(id.as_str())).await?;
        Ok(())
    }

    pub async fn load_pending(&self) -> Result<Vec<PendingElementWrite>> {
        let rows: Vec<(Vec<u8>, PendingElementWrite)> =
            self.kv.scan_prefix(keys::PENDING_PREFIX.as_bytes()).await?;
        Ok(rows.into_iter().map(|(_, write)| write).collect())
    }

    // ========== 账本 ==========

    /// 历史记录，最新在前
    pub async fn load_history(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.kv.get(keys::LEDGER_HISTORY).await?.unwrap_or_default())
    }

    pub async fn load_operations(&self) -> Result<Vec<OperationRecord>> {
        Ok(self.kv.get(keys::LEDGER_OPERATIONS).await?.unwrap_or_default())
    }

    /// 合计、历史与操作日志一次性原子写入
    pub async fn save_ledger(
        &self,
        totals: &Totals,
        history: &[LedgerEntry],
        operations: &[OperationRecord],
    ) -> Result<()> {
        let sets = vec![
            (keys::TOTALS_CASH, format!("{:.2}", totals.cash)),
            (keys::TOTALS_CARD, format!("{:.2}", totals.card)),
            (keys::LEDGER_HISTORY, serde_json::to_string(history)?),
            (keys::LEDGER_OPERATIONS, serde_json::to_string(operations)?),
        ];
        self.kv.apply_raw_batch(sets, &[]).await
    }

    pub async fn load_totals(&self) -> Result<Totals> {
        Ok(Totals {
            cash: self.load_decimal(keys::TOTALS_CASH).await?,
            card: self.load_decimal(keys::TOTALS_CARD).await?,
        })
    }


    async fn load_decimal(&self, key: &str) -> Result<Decimal> {
        match self.kv.get_raw(key).await? {
            Some(raw) => Ok(Decimal::from_str(raw.trim())?),
            None => Ok(Decimal::ZERO),
        }
    }

    pub async fn save_pending_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        self.kv.set(keys::ledger_pending(&entry.id), entry).await
    }

    pub async fn remove_pending_ledger(&self, entry_id: &Uuid) -> Result<()> {
        self.kv.delete(keys::ledger_pending(entry_id)).await?;
        Ok(())
    }

    pub async fn load_pending_ledger(&self) -> Result<Vec<LedgerEntry>> {
        let rows: Vec<(Vec<u8>, LedgerEntry)> = self
            .kv
            .scan_prefix(keys::LEDGER_PENDING_PREFIX.as_bytes())
            .await?;
        let mut entries: Vec<LedgerEntry> = rows.into_iter().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    /// 账本最近一次重置的时间；早于它的远端条目不再入账
    pub async fn ledger_reset_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.load_time(keys::LEDGER_RESET_AT).await
    }

    /// 清空历史与合计（保留操作日志），同时记下重置时间
    pub async fn clear_ledger(&self, reset_at: DateTime<Utc>) -> Result<()> {
        self.kv
            .apply_raw_batch(
                vec![(keys::LEDGER_RESET_AT, reset_at.to_rfc3339())],
                &[keys::LEDGER_HISTORY, keys::TOTALS_CASH, keys::TOTALS_CARD],
            )
            .await
    }

    // ========== 可见性 ==========

    pub async fn load_visibility(&self) -> Result<VisibilityState> {
        let mut state = VisibilityState::default();
        for group in VisibilityGroup::ALL {
            match self.kv.get_raw(keys::visibility(group)).await?.as_deref() {
                Some(HIDDEN) => {
                    state.groups.insert(group, false);
                }
                Some(VISIBLE) => {
                    state.groups.insert(group, true);
                }
                Some(other) => warn!("未知可见性值 {}={}", group, other),
                None => {}
            }
        }
        state.last_updated = self.load_time(keys::VISIBILITY_UPDATED_AT).await?;
        Ok(state)
    }

    pub async fn save_visibility(&self, state: &VisibilityState) -> Result<()> {
        let mut sets: Vec<(String, String)> = state
            .groups
            .iter()
            .map(|(group, visible)| {
                let value = if *visible { VISIBLE } else { HIDDEN };
                (keys::visibility(*group), value.to_string())
            })
            .collect();
        if let Some(at) = state.last_updated {
            sets.push((keys::VISIBILITY_UPDATED_AT.to_string(), at.to_rfc3339()));
        }
        self.kv.apply_raw_batch(sets, &[]).await
    }

    pub async fn set_visibility_pending(&self, pending: bool) -> Result<()> {
        if pending {
            self.kv.set_raw(keys::VISIBILITY_PENDING, "1").await
        } else {
            self.kv.delete(keys::VISIBILITY_PENDING).await?;
            Ok(())
        }
    }

    pub async fn visibility_pending(&self) -> Result<bool> {
        self.kv.exists(keys::VISIBILITY_PENDING).await
    }

    // ========== 杂项 ==========

    pub async fn set_last_sync_time(&self, at: DateTime<Utc>) -> Result<()> {
        self.kv.set_raw(keys::LAST_SYNC_TIME, &at.to_rfc3339()).await
    }

    pub async fn last_sync_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.load_time(keys::LAST_SYNC_TIME).await
    }

    async fn load_time(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.kv.get_raw(key).await? {
            Some(raw) => {
                let parsed = DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| PlayaError::InvalidData(format!("时间格式错误 {}: {}", key, e)))?;
                Ok(Some(parsed.with_timezone(&Utc)))
            }
            None => Ok(None),
        }
    }

    pub async fn set_notes(&self, notes: &str) -> Result<()> {
        self.kv.set_raw(keys::NOTES, notes).await
    }

    pub async fn notes(&self) -> Result<String> {
        Ok(self.kv.get_raw(keys::NOTES).await?.unwrap_or_default())
    }

    // ========== 重置 ==========

    /// 清除除顾客名与可见性以外的所有数据
    ///
    /// 元素只保留顾客名，步骤归零且不带时间戳，任何远端快照都能重新填充。
    /// `at` 记为账本重置时间。
    pub async fn reset_except_customers(&self, at: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0usize;
        for key in self.kv.keys().await? {
            if key.starts_with(keys::ELEMENT_PREFIX) {
                let record: Option<ElementRecord> = self.kv.get(&key).await?;
                if let Some(record) = record {
                    let reset = ElementRecord {
                        step: 0,
                        customer_name: record.customer_name,
                        last_updated: None,
                    };
                    self.kv.set(&key, &reset).await?;
                }
                continue;
            }
            if key.starts_with(keys::VISIBILITY_PREFIX)
                || key.starts_with("visibility_meta:")
                || key == keys::SCHEMA_VERSION
            {
                continue;
            }
            self.kv.delete(&key).await?;
            removed += 1;
        }
        self.kv.set_raw(keys::LEDGER_RESET_AT, &at.to_rfc3339()).await?;
        info!("本地数据已重置（保留顾客名），删除 {} 个键", removed);
        Ok(removed)
    }

    /// 清空整个站点命名空间
    pub async fn clear_all(&self) -> Result<()> {
        self.kv.clear().await?;
        self.kv
            .set_raw(keys::SCHEMA_VERSION, &LOCAL_SCHEMA_VERSION.to_string())
            .await?;
        debug!("本地数据已清空");
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PaymentMethod;
    use tempfile::TempDir;

    async fn open(temp_dir: &TempDir) -> LocalStore {
        let kv = KvStore::new(temp_dir.path(), "test").await.unwrap();
        let store = LocalStore::new(Arc::new(kv));
        store.check_schema().await.unwrap();
        store
    }

    fn id(s: &str) -> ElementId {
        ElementId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_element_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;

        let missing = store.load_element(&id("clon_3"), ElementKind::Seat).await.unwrap();
        assert_eq!(missing.step, Step::ZERO);
        assert!(missing.customer_name.is_none());
        assert!(missing.last_updated.is_none());

        let mut state = ElementState::new(id("clon_3"), ElementKind::Seat);
        state.set_step(4).unwrap();
        state.set_customer_name(Some("Marta")).unwrap();
        state.last_updated = Some(Utc::now());
        store.save_element(&state).await.unwrap();

        let loaded = store.load_element(&id("clon_3"), ElementKind::Seat).await.unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_out_of_range_step_reads_as_zero() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;
        let record = ElementRecord {
            step: 9,
            customer_name: None,
            last_updated: None,
        };
        store.kv().set(keys::element("circle_1"), &record).await.unwrap();
        let loaded = store.load_element(&id("circle_1"), ElementKind::Circle).await.unwrap();
        assert_eq!(loaded.step, Step::ZERO);
    }

    #[tokio::test]
    async fn test_ledger_saved_with_plain_totals() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;
        let totals = Totals {
            cash: Decimal::new(1250, 2),
            card: Decimal::new(5, 0),
        };
        let entry = LedgerEntry::payment("3", Decimal::new(1250, 2), Decimal::new(20, 0), PaymentMethod::Cash, Utc::now()).unwrap();
        let operations = vec![OperationRecord::from(&entry)];
        store.save_ledger(&totals, &[entry.clone()], &operations).await.unwrap();
        assert_eq!(
            store.kv().get_raw(keys::TOTALS_CASH).await.unwrap().as_deref(),
            Some("12.50")
        );
        assert_eq!(store.load_totals().await.unwrap(), totals);
        assert_eq!(store.load_history().await.unwrap(), vec![entry]);
        assert_eq!(store.load_operations().await.unwrap(), operations);

        let at = Utc::now();
        store.clear_ledger(at).await.unwrap();
        assert!(store.load_history().await.unwrap().is_empty());
        assert_eq!(store.load_totals().await.unwrap(), Totals::default());
        assert_eq!(store.load_operations().await.unwrap().len(), 1);
        assert!(store.ledger_reset_at().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_visibility_flags() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;
        let mut state = VisibilityState::default();
        state.set(VisibilityGroup::Row3, false, Utc::now());
        store.save_visibility(&state).await.unwrap();

        assert_eq!(
            store.kv().get_raw("visibility:row3").await.unwrap().as_deref(),
            Some("hidden")
        );
        let loaded = store.load_visibility().await.unwrap();
        assert!(!loaded.is_visible(VisibilityGroup::Row3));
        assert!(loaded.is_visible(VisibilityGroup::Row0));
        assert!(loaded.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_reset_keeps_names_and_visibility() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;

        let mut state = ElementState::new(id("clon_7"), ElementKind::Seat);
        state.set_step(2).unwrap();
        state.set_customer_name(Some("Luis")).unwrap();
        store.save_element(&state).await.unwrap();
        store.save_pending(&PendingElementWrite::from(&state)).await.unwrap();
        store.set_notes("sombrilla rota").await.unwrap();

        let entry = LedgerEntry::payment("7", Decimal::new(10, 0), Decimal::new(10, 0), PaymentMethod::Cash, Utc::now()).unwrap();
        store.save_ledger(&Totals::default(), &[entry], &[]).await.unwrap();

        let mut vis = VisibilityState::default();
        vis.set(VisibilityGroup::Row8, false, Utc::now());
        store.save_visibility(&vis).await.unwrap();

        store.reset_except_customers(Utc::now()).await.unwrap();

        let loaded = store.load_element(&id("clon_7"), ElementKind::Seat).await.unwrap();
        assert_eq!(loaded.step, Step::ZERO);
        assert_eq!(loaded.customer_name.as_deref(), Some("Luis"));
        assert!(loaded.last_updated.is_none());
        assert!(store.load_pending().await.unwrap().is_empty());
        assert!(store.load_history().await.unwrap().is_empty());
        assert_eq!(store.notes().await.unwrap(), "");
        assert!(!store.load_visibility().await.unwrap().is_visible(VisibilityGroup::Row8));
    }

    #[tokio::test]
    async fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;
        store
            .kv()
            .set_raw(keys::SCHEMA_VERSION, &(LOCAL_SCHEMA_VERSION + 1).to_string())
            .await
            .unwrap();
        assert!(store.check_schema().await.is_err());

        store.clear_all().await.unwrap();
        store.check_schema().await.unwrap();
    }
}
