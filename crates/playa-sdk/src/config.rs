//! 面板配置

use crate::connection_state::MonitorSettings;
use crate::error::{PlayaError, Result};
use crate::registry::DEFAULT_CIRCLE_COUNT;
use crate::retry_policy::RetryPolicy;
use crate::sync::SyncSettings;
use crate::utils::time::TimezoneConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Playa 面板配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayaConfig {
    /// 本地数据目录
    pub data_dir: PathBuf,
    /// 本地存储命名空间（每个站点一份数据）
    pub station_id: String,
    /// 圆点数量
    pub circle_count: u32,
    /// 显示时区偏移（秒）；None 表示使用系统本地时区
    pub timezone_offset_seconds: Option<i32>,
    /// 重试配置
    pub retry_config: RetryConfig,
    /// 连接探测配置
    pub connection_config: ConnectionConfig,
    /// 同步配置
    pub sync_config: SyncConfig,
    /// 事件配置
    pub event_config: EventConfig,
    /// 调试模式
    pub debug_mode: bool,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 最大自动重试次数
    pub max_retries: u32,
    /// 基础延迟（毫秒）
    pub base_delay_ms: u64,
    /// 最大延迟（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避因子
    pub backoff_factor: f64,
}

/// 连接探测配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 单次探测超时（毫秒）
    pub probe_timeout_ms: u64,
    /// 周期探测间隔（秒）
    pub probe_interval_secs: u64,
    /// 超过该延迟显示为慢速（毫秒）
    pub slow_threshold_ms: u64,
}

/// 同步配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 监听出错后重启等待（毫秒）
    pub listener_restart_delay_ms: u64,
    /// 重放失败后重试等待（毫秒）
    pub pending_retry_delay_ms: u64,
}

/// 事件配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 事件缓冲区大小
    pub buffer_size: usize,
}

impl Default for PlayaConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            station_id: "default".to_string(),
            circle_count: DEFAULT_CIRCLE_COUNT,
            timezone_offset_seconds: None,
            retry_config: RetryConfig::default(),
            connection_config: ConnectionConfig::default(),
            sync_config: SyncConfig::default(),
            event_config: EventConfig::default(),
            debug_mode: false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5000,
            probe_interval_secs: 30,
            slow_threshold_ms: 100,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            listener_restart_delay_ms: 5000,
            pending_retry_delay_ms: 5000,
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 1000 }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            backoff_factor: config.backoff_factor,
            ..RetryPolicy::default()
        }
    }
}

impl From<&ConnectionConfig> for MonitorSettings {
    fn from(config: &ConnectionConfig) -> Self {
        MonitorSettings {
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            probe_interval: Duration::from_secs(config.probe_interval_secs),
            slow_threshold_ms: config.slow_threshold_ms,
        }
    }
}

impl From<&SyncConfig> for SyncSettings {
    fn from(config: &SyncConfig) -> Self {
        SyncSettings {
            listener_restart_delay: Duration::from_millis(config.listener_restart_delay_ms),
            pending_retry_delay: Duration::from_millis(config.pending_retry_delay_ms),
        }
    }
}

/// 获取默认数据目录 ~/.playa/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".playa")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".playa")
    } else {
        PathBuf::from("./playa_data")
    }
}

impl PlayaConfig {
    pub fn builder() -> PlayaConfigBuilder {
        PlayaConfigBuilder::new()
    }

    /// 从 JSON 文件读取，缺省字段取默认值
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PlayaError::Config(format!("读取配置文件失败 {}: {}", path.display(), e)))?;
        let config: PlayaConfig = serde_json::from_str(&raw)
            .map_err(|e| PlayaError::Config(format!("配置文件格式错误 {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn timezone(&self) -> TimezoneConfig {
        match self.timezone_offset_seconds {
            Some(offset_seconds) => TimezoneConfig { offset_seconds },
            None => TimezoneConfig::local(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(PlayaError::Config("数据目录不能为空".to_string()));
        }
        if self.station_id.trim().is_empty() {
            return Err(PlayaError::Config("站点 ID 不能为空".to_string()));
        }
        if let Some(offset) = self.timezone_offset_seconds {
            let timezone = TimezoneConfig { offset_seconds: offset };
            if timezone.to_fixed_offset().is_none() {
                return Err(PlayaError::Config(format!("时区偏移超出范围: {}", offset)));
            }
        }
        if self.retry_config.backoff_factor < 1.0 {
            return Err(PlayaError::Config("退避因子不能小于 1".to_string()));
        }
        if self.connection_config.probe_timeout_ms == 0 || self.connection_config.probe_interval_secs == 0 {
            return Err(PlayaError::Config("探测超时与间隔必须大于 0".to_string()));
        }
        if self.event_config.buffer_size == 0 {
            return Err(PlayaError::Config("事件缓冲区大小不能为 0".to_string()));
        }
        Ok(())
    }
}

/// Playa 配置构建器
pub struct PlayaConfigBuilder {
    config: PlayaConfig,
}

impl Default for PlayaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlayaConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: PlayaConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn station_id<S: Into<String>>(mut self, station_id: S) -> Self {
        self.config.station_id = station_id.into();
        self
    }

    pub fn circle_count(mut self, count: u32) -> Self {
        self.config.circle_count = count;
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    /// 设置时区偏移（小时），例如：+2
    pub fn timezone_hours(mut self, hours: i32) -> Self {
        self.config.timezone_offset_seconds = Some(hours * 3600);
        self
    }

    pub fn timezone_seconds(mut self, seconds: i32) -> Self {
        self.config.timezone_offset_seconds = Some(seconds);
        self
    }

    /// 使用系统本地时区
    pub fn timezone_local(mut self) -> Self {
        self.config.timezone_offset_seconds = None;
        self
    }

    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.config.retry_config = config;
        self
    }

    pub fn connection_config(mut self, config: ConnectionConfig) -> Self {
        self.config.connection_config = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.config.sync_config = config;
        self
    }

    pub fn event_config(mut self, config: EventConfig) -> Self {
        self.config.event_config = config;
        self
    }

    pub fn build(self) -> PlayaConfig {
        self.config
    }
}
