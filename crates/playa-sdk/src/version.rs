//! SDK 版本信息

/// SDK semver，来自 Cargo.toml
///
/// 禁止手写版本号，必须用 `env!("CARGO_PKG_VERSION")` 与 Cargo.toml 保持同步。
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 本地存储格式版本，写入 KV 的 `meta:schema_version`。
/// 打开时若发现更高版本则拒绝（防 downgrade 读坏数据）。
pub const LOCAL_SCHEMA_VERSION: u32 = 1;
