/// 本地优先同步模块
///
/// 职责：
/// - 本地写入后镜像到远端，离线时进入待同步表
/// - 按最后写入者胜出应用远端变更
/// - 重连后批量重放并重新订阅

pub mod applier;
pub mod coordinator;
pub mod pending;

pub use applier::{decide, merge_document, ApplyDecision, ElementDocument};
pub use coordinator::{ReplaySummary, SyncConnectionHook, SyncCoordinator, SyncDeps, SyncSettings};
pub use pending::PendingWrites;
