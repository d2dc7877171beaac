//! Playa SDK - 海滩躺椅租赁看板
//!
//! 本 SDK 提供：
//! - 躺椅/圆点状态板：步骤颜色、顾客名，本地优先并同步到远端文档库
//! - 离线写入缓存，重连后批量重放（最后写入者胜出）
//! - 连接探测：指数退避、次数上限后手动重试、状态指示
//! - 收银账本：现金/刷卡合计、历史记录、操作日志、CSV 导出
//! - 行/区域可见性开关
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use playa_sdk::{MemoryRemoteStore, PaymentMethod, PlayaBoard, PlayaConfig};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PlayaConfig::builder()
//!         .data_dir("/path/to/data")
//!         .station_id("norte")
//!         .timezone_hours(2)
//!         .build();
//!
//!     let board = PlayaBoard::initialize(config, Arc::new(MemoryRemoteStore::new())).await?;
//!
//!     board.toggle_element("clon_12").await?;
//!     board
//!         .record_payment("12", Decimal::new(10, 0), Decimal::new(20, 0), PaymentMethod::Cash)
//!         .await?;
//!     println!("{}", board.export_summary_csv().await);
//!
//!     board.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod board;
pub mod config;
pub mod connection_state;
pub mod element;
pub mod error;
pub mod events;
pub mod export;
pub mod ledger;
pub mod network;
pub mod registry;
pub mod remote;
pub mod retry_policy;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod version;
pub mod visibility;

// 重新导出核心类型，方便使用
pub use board::PlayaBoard;
pub use config::{ConnectionConfig, EventConfig, PlayaConfig, PlayaConfigBuilder, RetryConfig, SyncConfig};
pub use connection_state::{ConnectionHook, ConnectionMonitor, ConnectionStatus, MonitorSettings, StatusIndicator};
pub use element::{ElementId, ElementKind, ElementState, Step};
pub use error::{PlayaError, Result};
pub use events::{BoardEvent, ChangeOrigin, EventFilter, EventManager};
pub use ledger::{parse_amount, EntryKind, LedgerEntry, OperationRecord, PaymentMethod, Totals};
pub use network::{NetworkMonitor, NetworkStatus};
pub use registry::ElementRegistry;
pub use remote::{Collection, MemoryRemoteStore, RemoteDocument, RemoteStore};
pub use retry_policy::RetryPolicy;
pub use utils::{TimeFormatter, TimezoneConfig};
pub use version::SDK_VERSION;
pub use visibility::{VisibilityGroup, VisibilityState};
