//! 本地存储
//!
//! - `kv`: sled 键值存储，按站点隔离命名空间
//! - `local`: 固定键空间的类型化封装

pub mod kv;
pub mod local;

pub use kv::{KvStats, KvStore};
pub use local::{keys, ElementRecord, LocalStore, PendingElementWrite};
