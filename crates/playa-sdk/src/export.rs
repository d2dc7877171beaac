//! CSV 导出：日/月汇总与逐笔操作

use crate::ledger::{LedgerEntry, OperationRecord, Totals};
use crate::utils::time::{day_key, month_key, TimeFormatter};
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// 汇总表头
const DAILY_HEADER: &str = "Daily Summary\nDay,Cash,Card,Total";
const MONTHLY_HEADER: &str = "Monthly Summary\nMonth,Cash,Card,Total";
const OPERATIONS_HEADER: &str = "Date,Time,Seat,Paid,Refunded";

/// 按日、按月汇总（升序，退款冲减）
pub fn summary_csv(entries: &[LedgerEntry], formatter: &TimeFormatter) -> String {
    let mut daily: BTreeMap<NaiveDate, Totals> = BTreeMap::new();
    let mut monthly: BTreeMap<(i32, u32), (NaiveDate, Totals)> = BTreeMap::new();

    for entry in entries {
        let date = formatter.local_date(entry.timestamp);
        daily.entry(date).or_default().apply(entry);
        monthly
            .entry((date.year(), date.month()))
            .or_insert_with(|| (date, Totals::default()))
            .1
            .apply(entry);
    }

    let mut out = String::new();
    out.push_str(DAILY_HEADER);
    out.push('\n');
    for (date, totals) in &daily {
        push_totals_row(&mut out, &day_key(*date), totals);
    }
    out.push('\n');
    out.push_str(MONTHLY_HEADER);
    out.push('\n');
    for (date, totals) in monthly.values() {
        push_totals_row(&mut out, &month_key(*date), totals);
    }
    out
}

/// 逐笔操作，按时间升序
pub fn operations_csv(operations: &[OperationRecord], formatter: &TimeFormatter) -> String {
    let mut sorted: Vec<&OperationRecord> = operations.iter().collect();
    sorted.sort_by_key(|op| op.timestamp);

    let mut out = String::new();
    out.push_str(OPERATIONS_HEADER);
    out.push('\n');
    for op in sorted {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            formatter.format_date(op.timestamp),
            formatter.format_time(op.timestamp),
            csv_escape(&op.element_id),
            optional_amount(op.paid),
            optional_amount(op.refunded),
        );
    }
    out
}

/// 写出到文件（UTF-8）
pub async fn write_csv(path: impl AsRef<Path>, contents: &str) -> crate::Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, contents.as_bytes()).await?;
    info!("CSV 已导出: {}", path.display());
    Ok(())
}

fn push_totals_row(out: &mut String, key: &str, totals: &Totals) {
    let _ = writeln!(
        out,
        "{},{},{},{}",
        key,
        amount(totals.cash),
        amount(totals.card),
        amount(totals.general())
    );
}

fn amount(value: Decimal) -> String {
    format!("{:.2}", value)
}

fn optional_amount(value: Option<Decimal>) -> String {
    value.map(amount).unwrap_or_default()
}

/// 以公式字符开头的文本前加单引号
fn neutralize_formula(value: &str) -> String {
    let trimmed = value.trim_start();
    let risky = !trimmed.starts_with('\'')
        && matches!(trimmed.chars().next(), Some('=' | '+' | '-' | '@'));
    if risky {
        format!("'{}", value)
    } else {
        value.to_string()
    }
}

fn csv_escape(value: &str) -> String {
    let safe = neutralize_formula(value);
    if safe.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", safe.replace('"', "\"\""))
    } else {
        safe
    }
}
