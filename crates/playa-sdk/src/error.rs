use thiserror::Error;

/// SDK 统一错误类型
///
/// 分类：
/// - 连接类（`Unavailable` / `Timeout`）：退避重试，超过上限后交给用户手动重试
/// - 权限类（`PermissionDenied`）：单独展示，不自动重试
/// - 元素缺失（`ElementNotFound`）：记录日志后跳过
/// - 账本输入校验（`InvalidAmount` / `InsufficientPayment`）：直接返回给界面提示
#[derive(Debug, Error)]
pub enum PlayaError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Invalid step {step} for {kind} (allowed 0..={max})")]
    InvalidStep { kind: String, step: u8, max: u8 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Insufficient payment: received {received:.2} < total {total:.2}")]
    InsufficientPayment {
        total: rust_decimal::Decimal,
        received: rust_decimal::Decimal,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IO(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Not initialized: {0}")]
    NotInitialized(String),

    #[error("Shutting down: {0}")]
    ShuttingDown(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl From<sled::Error> for PlayaError {
    fn from(error: sled::Error) -> Self {
        PlayaError::KvStore(error.to_string())
    }
}

impl From<serde_json::Error> for PlayaError {
    fn from(error: serde_json::Error) -> Self {
        PlayaError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for PlayaError {
    fn from(error: std::io::Error) -> Self {
        PlayaError::IO(error.to_string())
    }
}

impl From<rust_decimal::Error> for PlayaError {
    fn from(error: rust_decimal::Error) -> Self {
        PlayaError::InvalidAmount(error.to_string())
    }
}

impl PlayaError {
    /// 是否为连接类错误（离线、超时）
    pub fn is_connectivity(&self) -> bool {
        matches!(self, PlayaError::Unavailable(_) | PlayaError::Timeout(_))
    }

    /// 是否为权限错误
    pub fn is_permission(&self) -> bool {
        matches!(self, PlayaError::PermissionDenied(_))
    }

    /// 是否值得重试：只有连接类错误会在恢复后成功
    pub fn is_retryable(&self) -> bool {
        self.is_connectivity()
    }

    /// 是否为用户输入校验错误（界面直接提示，不记录为故障）
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PlayaError::InvalidAmount(_)
                | PlayaError::InsufficientPayment { .. }
                | PlayaError::InvalidStep { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PlayaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PlayaError::Unavailable("offline".into()).is_connectivity());
        assert!(PlayaError::Timeout("5s".into()).is_retryable());
        assert!(!PlayaError::PermissionDenied("rules".into()).is_retryable());
        assert!(PlayaError::PermissionDenied("rules".into()).is_permission());
        assert!(PlayaError::InvalidAmount("abc".into()).is_validation());
        assert!(!PlayaError::ElementNotFound("clon_999".into()).is_validation());
    }
}
