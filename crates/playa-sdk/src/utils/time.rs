//! 时间处理工具模块
//!
//! - **存储层**: 一律保存 UTC（`DateTime<Utc>`，序列化为 RFC3339）
//! - **显示层**: 通过 `TimeFormatter` 按配置的时区偏移转换
//!
//! 时区随 `PlayaConfig` 传入，格式化器是普通值，不依赖全局状态。

use chrono::{DateTime, FixedOffset, Local, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

/// 时区配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimezoneConfig {
    /// 时区偏移（秒），例如：+02:00 = 7200
    pub offset_seconds: i32,
}

impl TimezoneConfig {
    pub fn from_hours(hours: i32) -> Self {
        Self {
            offset_seconds: hours * 3600,
        }
    }

    pub fn from_minutes(minutes: i32) -> Self {
        Self {
            offset_seconds: minutes * 60,
        }
    }

    /// 使用系统本地时区
    pub fn local() -> Self {
        Self {
            offset_seconds: Local::now().offset().local_minus_utc(),
        }
    }

    /// 偏移超出 ±24h 时返回 None
    pub fn to_fixed_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.offset_seconds)
    }
}

impl Default for TimezoneConfig {
    fn default() -> Self {
        Self::local()
    }
}

/// 时间格式化工具
#[derive(Debug, Clone, Copy)]
pub struct TimeFormatter {
    offset: FixedOffset,
}

impl TimeFormatter {
    /// 非法偏移回退到 UTC
    pub fn new(config: TimezoneConfig) -> Self {
        let offset = config.to_fixed_offset().unwrap_or_else(|| {
            tracing::warn!("时区偏移非法，回退到 UTC: {}", config.offset_seconds);
            Utc.fix()
        });
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(TimezoneConfig::from_hours(0))
    }

    pub fn to_local(&self, time: DateTime<Utc>) -> DateTime<FixedOffset> {
        time.with_timezone(&self.offset)
    }

    /// 本地日期，用于按日汇总
    pub fn local_date(&self, time: DateTime<Utc>) -> NaiveDate {
        self.to_local(time).date_naive()
    }

    /// 历史记录时间戳：`DD/MM/YYYY HH:MM`
    pub fn format_stamp(&self, time: DateTime<Utc>) -> String {
        self.to_local(time).format("%d/%m/%Y %H:%M").to_string()
    }

    /// 日期：`DD/MM/YYYY`
    pub fn format_date(&self, time: DateTime<Utc>) -> String {
        self.to_local(time).format("%d/%m/%Y").to_string()
    }

    /// 时间：`HH:MM:SS`
    pub fn format_time(&self, time: DateTime<Utc>) -> String {
        self.to_local(time).format("%H:%M:%S").to_string()
    }
}

/// 当前 UTC 毫秒时间戳（事件时间戳）
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 日期 key：`DD/MM/YYYY`
pub fn day_key(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

/// 月份 key：`MM/YYYY`
pub fn month_key(date: NaiveDate) -> String {
    date.format("%m/%Y").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_formatter_applies_offset() {
        let fmt = TimeFormatter::new(TimezoneConfig::from_hours(2));
        let t = at("2026-10-16T08:30:00Z");
        assert_eq!(fmt.format_stamp(t), "16/10/2026 10:30");
        assert_eq!(fmt.format_date(t), "16/10/2026");
        assert_eq!(fmt.format_time(t), "10:30:00");
    }

    #[test]
    fn test_local_date_crosses_midnight() {
        let fmt = TimeFormatter::new(TimezoneConfig::from_hours(2));
        let t = at("2026-10-31T23:30:00Z");
        let date = fmt.local_date(t);
        assert_eq!(day_key(date), "01/11/2026");
        assert_eq!(month_key(date), "11/2026");
    }

    #[test]
    fn test_invalid_offset_falls_back_to_utc() {
        let fmt = TimeFormatter::new(TimezoneConfig { offset_seconds: 200_000 });
        assert_eq!(fmt.format_stamp(at("2026-01-02T03:04:00Z")), "02/01/2026 03:04");
    }

    #[test]
    fn test_half_hour_offset() {
        let fmt = TimeFormatter::new(TimezoneConfig::from_minutes(330));
        assert_eq!(fmt.format_stamp(at("2026-10-16T08:00:00Z")), "16/10/2026 13:30");
    }
}
