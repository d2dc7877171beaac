//! 账本条目与金额解析

use crate::error::{PlayaError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// 支付方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = PlayaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" | "efectivo" => Ok(PaymentMethod::Cash),
            "card" | "tarjeta" => Ok(PaymentMethod::Card),
            other => Err(PlayaError::InvalidArgument(format!("未知支付方式: {}", other))),
        }
    }
}

/// 条目类型：收款或冲正（退款）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Payment,
    Refund,
}

/// 账本条目，创建后不可修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// 躺椅编号（收银台输入框内容，可为空，记为 "-"）
    pub element_id: String,
    pub kind: EntryKind,
    pub total: Decimal,
    pub received: Decimal,
    pub change: Decimal,
    pub method: PaymentMethod,
    pub timestamp: DateTime<Utc>,
}

impl LedgerEntry {
    /// 创建收款条目；`received < total` 直接拒绝
    pub fn payment(
        element_id: &str,
        total: Decimal,
        received: Decimal,
        method: PaymentMethod,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let total = money(total);
        let received = money(received);
        ensure_positive("total", total)?;
        if received.is_sign_negative() {
            return Err(PlayaError::InvalidAmount(format!("收到金额不能为负: {}", received)));
        }
        if received < total {
            return Err(PlayaError::InsufficientPayment { total, received });
        }

        Ok(Self {
            id: Uuid::new_v4(),
            element_id: normalize_element_id(element_id),
            kind: EntryKind::Payment,
            total,
            received,
            change: received - total,
            method,
            timestamp,
        })
    }

    /// 创建冲正条目：整额退回，不找零
    pub fn refund(
        element_id: &str,
        total: Decimal,
        method: PaymentMethod,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let total = money(total);
        ensure_positive("refund", total)?;
        Ok(Self {
            id: Uuid::new_v4(),
            element_id: normalize_element_id(element_id),
            kind: EntryKind::Refund,
            total,
            received: Decimal::ZERO,
            change: Decimal::ZERO,
            method,
            timestamp,
        })
    }

    /// 对合计的影响：退款为负
    pub fn signed_total(&self) -> Decimal {
        match self.kind {
            EntryKind::Payment => self.total,
            EntryKind::Refund => -self.total,
        }
    }

    /// 远端条目入账前的校验
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            EntryKind::Payment => {
                ensure_positive("total", self.total)?;
                if self.received < self.total || self.change != self.received - self.total {
                    return Err(PlayaError::InvalidData(format!(
                        "账本条目金额不一致: {}",
                        self.id
                    )));
                }
            }
            EntryKind::Refund => ensure_positive("refund", self.total)?,
        }
        Ok(())
    }
}

/// 运行合计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Totals {
    pub cash: Decimal,
    pub card: Decimal,
}

impl Totals {
    pub fn general(&self) -> Decimal {
        self.cash + self.card
    }

    pub fn apply(&mut self, entry: &LedgerEntry) {
        match entry.method {
            PaymentMethod::Cash => self.cash += entry.signed_total(),
            PaymentMethod::Card => self.card += entry.signed_total(),
        }
    }
}

/// 单笔操作日志（重置账本时保留）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub element_id: String,
    pub paid: Option<Decimal>,
    pub refunded: Option<Decimal>,
}

impl From<&LedgerEntry> for OperationRecord {
    fn from(entry: &LedgerEntry) -> Self {
        let (paid, refunded) = match entry.kind {
            EntryKind::Payment => (Some(entry.total), None),
            EntryKind::Refund => (None, Some(entry.total)),
        };
        Self {
            entry_id: entry.id,
            timestamp: entry.timestamp,
            element_id: entry.element_id.clone(),
            paid,
            refunded,
        }
    }
}

/// 解析收银台金额：手动输入框非空时优先，否则取下拉预设
pub fn parse_amount(manual: Option<&str>, preset: Option<&str>) -> Result<Decimal> {
    let raw = manual
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| preset.map(str::trim).filter(|s| !s.is_empty()))
        .ok_or_else(|| PlayaError::InvalidAmount("请输入有效金额".to_string()))?;

    // 兼容逗号小数点（12,50）
    let normalized = raw.replace(',', ".");
    let value = Decimal::from_str(&normalized)
        .map_err(|_| PlayaError::InvalidAmount(format!("请输入有效金额: {}", raw)))?;
    if value.is_sign_negative() {
        return Err(PlayaError::InvalidAmount(format!("金额不能为负: {}", raw)));
    }
    Ok(money(value))
}

/// 统一保留两位小数
pub fn money(value: Decimal) -> Decimal {
    value.round_dp(2)
}

fn ensure_positive(field: &str, value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(PlayaError::InvalidAmount(format!("{} 必须大于 0: {}", field, value)));
    }
    Ok(())
}

fn normalize_element_id(element_id: &str) -> String {
    let trimmed = element_id.trim();
    if trimmed.is_empty() {
        "-".to_string()
    } else {
        trimmed.to_string()
    }
}
