//! 收银账本：运行合计、历史记录与操作日志

use super::entry::{EntryKind, LedgerEntry, OperationRecord, PaymentMethod, Totals};
use crate::error::Result;
use crate::storage::LocalStore;
use crate::utils::time::TimeFormatter;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct LedgerState {
    totals: Totals,
    /// 最新在前
    history: Vec<LedgerEntry>,
    operations: Vec<OperationRecord>,
    /// 已入账的条目 ID（含重置前的），远端回声据此去重
    known: HashSet<Uuid>,
    /// 最近一次重置时间，不早于它的远端条目才入账
    reset_at: Option<DateTime<Utc>>,
}

/// 账本
#[derive(Debug)]
pub struct Ledger {
    local: LocalStore,
    state: RwLock<LedgerState>,
}

impl Ledger {
    /// 从本地存储恢复
    pub async fn load(local: LocalStore) -> Result<Self> {
        let totals = local.load_totals().await?;
        let history = local.load_history().await?;
        let operations = local.load_operations().await?;
        let reset_at = local.ledger_reset_at().await?;
        let known = history
            .iter()
            .map(|e| e.id)
            .chain(operations.iter().map(|o| o.entry_id))
            .collect();
        debug!(
            "账本已加载: {} 条历史, {} 条操作日志",
            history.len(),
            operations.len()
        );
        Ok(Self {
            local,
            state: RwLock::new(LedgerState {
                totals,
                history,
                operations,
                known,
                reset_at,
            }),
        })
    }

    /// 记录一笔收款
    pub async fn record_payment(
        &self,
        element_id: &str,
        total: Decimal,
        received: Decimal,
        method: PaymentMethod,
    ) -> Result<LedgerEntry> {
        let entry = LedgerEntry::payment(element_id, total, received, method, Utc::now())?;
        self.append(entry.clone(), false).await?;
        info!(
            "收款: 躺椅 {} 金额 {:.2} 收到 {:.2} 找零 {:.2} ({})",
            entry.element_id, entry.total, entry.received, entry.change, entry.method
        );
        Ok(entry)
    }

    /// 记录一笔冲正（退款）
    pub async fn record_refund(&self, element_id: &str, total: Decimal, method: PaymentMethod) -> Result<LedgerEntry> {
        let entry = LedgerEntry::refund(element_id, total, method, Utc::now())?;
        self.append(entry.clone(), false).await?;
        info!("退款: 躺椅 {} 金额 {:.2} ({})", entry.element_id, entry.total, entry.method);
        Ok(entry)
    }

    /// 应用远端条目；已入账的返回 false
    pub async fn apply_remote(&self, entry: LedgerEntry) -> Result<bool> {
        entry.validate()?;
        let id = entry.id;
        let applied = self.append(entry, true).await?;
        if applied {
            debug!("已应用远端账本条目: {}", id);
        }
        Ok(applied)
    }

    /// 写锁覆盖内存修改与落盘，并发追加不会用旧快照覆盖新数据
    async fn append(&self, entry: LedgerEntry, remote: bool) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.known.contains(&entry.id) {
            return Ok(false);
        }
        if remote && state.reset_at.is_some_and(|cutoff| entry.timestamp <= cutoff) {
            debug!("忽略重置前的远端账本条目: {}", entry.id);
            return Ok(false);
        }

        let mut totals = state.totals;
        totals.apply(&entry);
        let mut operations = state.operations.clone();
        operations.push(OperationRecord::from(&entry));
        // 远端条目可能晚到，按时间插入保持最新在前
        let mut history = state.history.clone();
        let pos = history
            .iter()
            .position(|e| e.timestamp <= entry.timestamp)
            .unwrap_or(history.len());
        let id = entry.id;
        history.insert(pos, entry);

        self.local.save_ledger(&totals, &history, &operations).await?;
        state.known.insert(id);
        state.totals = totals;
        state.history = history;
        state.operations = operations;
        Ok(true)
    }

    pub async fn totals(&self) -> Totals {
        self.state.read().await.totals
    }

    /// 历史记录，最新在前
    pub async fn history(&self) -> Vec<LedgerEntry> {
        self.state.read().await.history.clone()
    }

    pub async fn operations(&self) -> Vec<OperationRecord> {
        self.state.read().await.operations.clone()
    }

    /// 渲染历史文本行
    pub async fn history_lines(&self, formatter: &TimeFormatter) -> Vec<String> {
        self.state
            .read()
            .await
            .history
            .iter()
            .map(|entry| history_line(entry, formatter))
            .collect()
    }

    /// 清空历史与合计，保留操作日志
    pub async fn reset(&self) -> Result<()> {
        let at = Utc::now();
        let mut state = self.state.write().await;
        self.local.clear_ledger(at).await?;
        state.totals = Totals::default();
        state.history.clear();
        state.reset_at = Some(at);
        info!("账本已重置（操作日志保留）");
        Ok(())
    }

    /// 本地数据被外部清除后重新加载
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let totals = self.local.load_totals().await?;
        let history = self.local.load_history().await?;
        let operations = self.local.load_operations().await?;
        let reset_at = self.local.ledger_reset_at().await?;
        state.known = history
            .iter()
            .map(|e| e.id)
            .chain(operations.iter().map(|o| o.entry_id))
            .collect();
        state.totals = totals;
        state.history = history;
        state.operations = operations;
        state.reset_at = reset_at;
        Ok(())
    }
}

/// 单行历史文本
pub fn history_line(entry: &LedgerEntry, formatter: &TimeFormatter) -> String {
    let stamp = formatter.format_stamp(entry.timestamp);
    match entry.kind {
        EntryKind::Payment => format!(
            "Seat {} - Total: €{:.2} - Received: €{:.2} - Change: €{:.2} - Method: {} - {}",
            entry.element_id, entry.total, entry.received, entry.change, entry.method, stamp
        ),
        EntryKind::Refund => format!(
            "Seat {} - Refund: €{:.2} - Method: {} - {}",
            entry.element_id, entry.total, entry.method, stamp
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlayaError;
    use crate::storage::KvStore;
    use crate::utils::time::TimezoneConfig;
    use chrono::{DateTime, Duration};
    use std::str::FromStr;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    async fn open(temp_dir: &TempDir) -> (Ledger, LocalStore) {
        let kv = KvStore::new(temp_dir.path(), "test").await.unwrap();
        let local = LocalStore::new(Arc::new(kv));
        (Ledger::load(local.clone()).await.unwrap(), local)
    }

    #[tokio::test]
    async fn test_payment_updates_totals_and_history() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, _) = open(&temp_dir).await;

        let entry = ledger
            .record_payment("12", dec("10"), dec("20"), PaymentMethod::Cash)
            .await
            .unwrap();
        assert_eq!(entry.change, dec("10"));
        ledger
            .record_payment("13", dec("5"), dec("5"), PaymentMethod::Card)
            .await
            .unwrap();

        let totals = ledger.totals().await;
        assert_eq!(totals.cash, dec("10"));
        assert_eq!(totals.card, dec("5"));
        assert_eq!(totals.general(), dec("15"));
        let history = ledger.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].element_id, "13");
    }

    #[tokio::test]
    async fn test_rejected_payment_leaves_state_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, _) = open(&temp_dir).await;
        let err = ledger
            .record_payment("1", dec("10"), dec("5"), PaymentMethod::Cash)
            .await
            .unwrap_err();
        assert!(matches!(err, PlayaError::InsufficientPayment { .. }));
        assert_eq!(ledger.totals().await, Totals::default());
        assert!(ledger.history().await.is_empty());
        assert!(ledger.operations().await.is_empty());
    }

    #[tokio::test]
    async fn test_refund_and_reset_keeps_operations() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, local) = open(&temp_dir).await;
        ledger
            .record_payment("4", dec("12"), dec("12"), PaymentMethod::Card)
            .await
            .unwrap();
        ledger.record_refund("4", dec("12"), PaymentMethod::Card).await.unwrap();
        assert_eq!(ledger.totals().await.card, Decimal::ZERO);
        assert_eq!(ledger.history().await.len(), 2);

        ledger.reset().await.unwrap();
        assert!(ledger.history().await.is_empty());
        assert_eq!(ledger.totals().await, Totals::default());
        assert_eq!(ledger.operations().await.len(), 2);

        // 重新加载后保持一致
        let reloaded = Ledger::load(local).await.unwrap();
        assert!(reloaded.history().await.is_empty());
        assert_eq!(reloaded.operations().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_entries_deduplicated() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, _) = open(&temp_dir).await;
        let remote = LedgerEntry::payment("9", dec("8"), dec("10"), PaymentMethod::Cash, Utc::now()).unwrap();

        assert!(ledger.apply_remote(remote.clone()).await.unwrap());
        assert!(!ledger.apply_remote(remote).await.unwrap());
        assert_eq!(ledger.totals().await.cash, dec("8"));
        assert_eq!(ledger.history().await.len(), 1);

        // 自己的条目回声不会重复入账
        let own = ledger
            .record_payment("10", dec("3"), dec("3"), PaymentMethod::Cash)
            .await
            .unwrap();
        assert!(!ledger.apply_remote(own).await.unwrap());
        assert_eq!(ledger.totals().await.cash, dec("11"));
    }

    #[tokio::test]
    async fn test_late_remote_entry_sorted_into_history() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, _) = open(&temp_dir).await;
        ledger
            .record_payment("1", dec("1"), dec("1"), PaymentMethod::Cash)
            .await
            .unwrap();
        let older = LedgerEntry::payment(
            "2",
            dec("2"),
            dec("2"),
            PaymentMethod::Cash,
            Utc::now() - Duration::hours(1),
        )
        .unwrap();
        ledger.apply_remote(older).await.unwrap();
        let history = ledger.history().await;
        assert_eq!(history[0].element_id, "1");
        assert_eq!(history[1].element_id, "2");
    }

    #[tokio::test]
    async fn test_remote_entries_before_reset_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, local) = open(&temp_dir).await;
        let before = LedgerEntry::payment("5", dec("3"), dec("3"), PaymentMethod::Card, Utc::now() - Duration::minutes(5)).unwrap();
        ledger.reset().await.unwrap();
        assert!(!ledger.apply_remote(before).await.unwrap());

        let after = LedgerEntry::payment("5", dec("3"), dec("3"), PaymentMethod::Card, Utc::now() + Duration::seconds(1)).unwrap();
        assert!(ledger.apply_remote(after).await.unwrap());
        assert_eq!(ledger.totals().await.card, dec("3"));

        // 截止时间持久化
        let reloaded = Ledger::load(local).await.unwrap();
        let late = LedgerEntry::payment("6", dec("1"), dec("1"), PaymentMethod::Cash, Utc::now() - Duration::minutes(1)).unwrap();
        assert!(!reloaded.apply_remote(late).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_appends_all_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let (ledger, local) = open(&temp_dir).await;
        let ledger = Arc::new(ledger);

        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger
                        .record_payment(&i.to_string(), dec("1"), dec("1"), PaymentMethod::Cash)
                        .await
                        .map(|_| true)
                } else {
                    let entry = LedgerEntry::payment(&i.to_string(), dec("1"), dec("1"), PaymentMethod::Cash, Utc::now()).unwrap();
                    ledger.apply_remote(entry).await
                }
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
        assert_eq!(ledger.history().await.len(), 32);

        let reloaded = Ledger::load(local).await.unwrap();
        assert_eq!(reloaded.history().await.len(), 32);
        assert_eq!(reloaded.operations().await.len(), 32);
        assert_eq!(reloaded.totals().await.cash, dec("32"));
    }

    #[test]
    fn test_history_line_format() {
        let at = DateTime::parse_from_rfc3339("2026-10-16T08:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = LedgerEntry::payment("12", dec("10"), dec("20"), PaymentMethod::Cash, at).unwrap();
        let formatter = TimeFormatter::new(TimezoneConfig::from_hours(2));
        assert_eq!(
            history_line(&entry, &formatter),
            "Seat 12 - Total: €10.00 - Received: €20.00 - Change: €10.00 - Method: cash - 16/10/2026 10:30"
        );
    }
}
