//! 连接探测的重试策略
//!
//! 失败后延迟 `min(base · factor^attempts, max)`，达到次数上限后停止自动重试，
//! 交给用户手动重试。

use crate::error::PlayaError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 探测失败原因分类
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FailureReason {
    /// 探测超时
    Timeout,
    /// 远端不可用
    Unavailable,
    /// 权限不足 - 不自动重试
    PermissionDenied,
    /// 未知错误
    Unknown(String),
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::PermissionDenied)
    }
}

impl From<&PlayaError> for FailureReason {
    fn from(error: &PlayaError) -> Self {
        match error {
            PlayaError::Timeout(_) => FailureReason::Timeout,
            PlayaError::Unavailable(_) => FailureReason::Unavailable,
            PlayaError::PermissionDenied(_) => FailureReason::PermissionDenied,
            other => FailureReason::Unknown(other.to_string()),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// 最大自动重试次数
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
    /// 随机抖动因子 (0.0-1.0)，默认关闭
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempts` 次失败后的等待时间
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_factor.powf(attempts as f64);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempts: u32, reason: &FailureReason) -> bool {
        attempts < self.max_attempts && reason.is_retryable()
    }

    /// 返回下次重试的延迟；None 表示需要手动重试
    pub fn next_delay(&self, attempts: u32, reason: &FailureReason) -> Option<Duration> {
        if !self.should_retry(attempts, reason) {
            return None;
        }
        Some(self.delay_for(attempts))
    }
}
