//! 收银账本
//!
//! 金额统一使用 `rust_decimal::Decimal`，保留两位小数；条目只追加不修改，
//! 退款以冲正条目的形式追加。

pub mod book;
pub mod entry;

pub use book::{history_line, Ledger};
pub use entry::{money, parse_amount, EntryKind, LedgerEntry, OperationRecord, PaymentMethod, Totals};
