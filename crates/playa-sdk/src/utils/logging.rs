//! 日志初始化

use tracing_subscriber::EnvFilter;

/// 初始化 fmt 日志输出
///
/// 优先读取 `RUST_LOG`；未设置时 `debug_mode` 决定默认级别。
/// 重复调用（例如多个测试）只有第一次生效。
pub fn init(debug_mode: bool) {
    let default_level = if debug_mode { "playa_sdk=debug" } else { "playa_sdk=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("日志系统已初始化，跳过");
    }
}
