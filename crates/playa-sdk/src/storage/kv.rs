//! KV 存储模块 - 基于 sled 的键值存储
//!
//! 本模块提供：
//! - 按站点（station）隔离的命名空间，对应浏览器里按 origin 共享的 localStorage
//! - JSON 复合值与纯字符串标量两种写法
//! - 批量写入与前缀扫描

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use sled::{Db, Tree};
use serde::{Serialize, Deserialize};
use crate::error::{PlayaError, Result};

/// KV 统计信息
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    pub key_count: u64,
    pub namespace: String,
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 当前站点的 Tree
    tree: Arc<RwLock<Tree>>,
    namespace: Arc<RwLock<String>>,
}

impl KvStore {
    /// 打开 KV 存储，并切换到 `namespace` 对应的 Tree
    pub async fn new(base_path: &Path, namespace: &str) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| PlayaError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 同一目录刚被另一个实例释放时可能仍持有锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 6;
        const RETRY_DELAY_MS: u64 = 100;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            PlayaError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        let tree = Self::open_namespace_tree(&db, namespace)?;
        tracing::info!("KV 命名空间已打开: {}", namespace);

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree: Arc::new(RwLock::new(tree)),
            namespace: Arc::new(RwLock::new(namespace.to_string())),
        })
    }

    fn open_namespace_tree(db: &Db, namespace: &str) -> Result<Tree> {
        let tree_name = format!("station_{}", namespace);
        db.open_tree(&tree_name)
            .map_err(|e| PlayaError::KvStore(format!("打开命名空间 Tree 失败: {}", e)))
    }

    /// 切换站点命名空间
    pub async fn switch_namespace(&self, namespace: &str) -> Result<()> {
        let tree = Self::open_namespace_tree(&self.db, namespace)?;
        *self.tree.write().await = tree;
        *self.namespace.write().await = namespace.to_string();
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn current_tree(&self) -> Tree {
        self.tree.read().await.clone()
    }

    /// 设置 JSON 值
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| PlayaError::Serialization(format!("序列化值失败: {}", e)))?;

        tree.insert(key, value_bytes)
            .map_err(|e| PlayaError::KvStore(format!("设置键值对失败: {}", e)))?;

        Ok(())
    }

    /// 获取 JSON 值
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await;

        let result = tree.get(key)
            .map_err(|e| PlayaError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| PlayaError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 设置纯字符串标量（不经 JSON 编码）
    pub async fn set_raw<K>(&self, key: K, value: &str) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await;
        tree.insert(key, value.as_bytes())
            .map_err(|e| PlayaError::KvStore(format!("设置标量失败: {}", e)))?;
        Ok(())
    }

    /// 获取纯字符串标量
    pub async fn get_raw<K>(&self, key: K) -> Result<Option<String>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await;
        let result = tree.get(key)
            .map_err(|e| PlayaError::KvStore(format!("获取标量失败: {}", e)))?;
        match result {
            Some(bytes) => {
                let value = String::from_utf8(bytes.to_vec())
                    .map_err(|e| PlayaError::InvalidData(format!("标量不是合法 UTF-8: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete<K>(&self, key: K) -> Result<Option<Vec<u8>>>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await;

        let result = tree.remove(key)
            .map_err(|e| PlayaError::KvStore(format!("删除键值对失败: {}", e)))?;

        Ok(result.map(|v| v.to_vec()))
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await;

        let result = tree.contains_key(key)
            .map_err(|e| PlayaError::KvStore(format!("检查键存在失败: {}", e)))?;

        Ok(result)
    }

    /// 批量设置键值对（原子）
    pub async fn set_batch<K, V>(&self, pairs: Vec<(K, V)>) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let tree = self.current_tree().await;
        let mut batch = sled::Batch::default();

        for (key, value) in pairs {
            let value_bytes = serde_json::to_vec(&value)
                .map_err(|e| PlayaError::Serialization(format!("序列化值失败: {}", e)))?;
            batch.insert(key.as_ref(), value_bytes);
        }

        tree.apply_batch(batch)
            .map_err(|e| PlayaError::KvStore(format!("批量设置失败: {}", e)))?;

        Ok(())
    }

    /// 原子地写入一组纯字符串值并删除 `removals` 中的键
    ///
    /// 多个键必须一起落盘时使用（账本合计与历史、可见性各分组）。
    pub async fn apply_raw_batch<K>(&self, sets: Vec<(K, String)>, removals: &[&str]) -> Result<()>
    where
        K: AsRef<[u8]>,
    {
        let tree = self.current_tree().await;
        let mut batch = sled::Batch::default();

        for (key, value) in sets {
            batch.insert(key.as_ref(), value.as_bytes());
        }
        for key in removals {
            batch.remove(key.as_bytes());
        }

        tree.apply_batch(batch)
            .map_err(|e| PlayaError::KvStore(format!("批量写入失败: {}", e)))?;

        Ok(())
    }

    /// 获取指定前缀的所有键值对
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.current_tree().await;
        let mut results = Vec::new();

        for result in tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| PlayaError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| PlayaError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 列出当前命名空间下所有键
    pub async fn keys(&self) -> Result<Vec<String>> {
        let tree = self.current_tree().await;
        let mut keys = Vec::new();
        for key in tree.iter().keys() {
            let key = key.map_err(|e| PlayaError::KvStore(format!("遍历键失败: {}", e)))?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    /// 清空当前命名空间
    pub async fn clear(&self) -> Result<()> {
        let tree = self.current_tree().await;
        tree.clear()
            .map_err(|e| PlayaError::KvStore(format!("清空命名空间失败: {}", e)))?;
        Ok(())
    }

    /// 刷盘，关闭前调用
    pub async fn flush(&self) -> Result<()> {
        let tree = self.current_tree().await;
        tree.flush_async().await
            .map_err(|e| PlayaError::KvStore(format!("刷盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub async fn get_stats(&self) -> KvStats {
        let tree = self.current_tree().await;
        KvStats {
            key_count: tree.len() as u64,
            namespace: self.namespace.read().await.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test_station").await.unwrap();

        let test_data = json!({
            "step": 3,
            "customer_name": "Juan"
        });

        store.set("element:clon_1", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("element:clon_1").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.exists("element:clon_1").await.unwrap());
        assert!(!store.exists("element:clon_2").await.unwrap());

        store.delete("element:clon_1").await.unwrap();
        let deleted: Option<serde_json::Value> = store.get("element:clon_1").await.unwrap();
        assert!(deleted.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_raw_scalars() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test_station").await.unwrap();

        store.set_raw("totals:cash", "12.50").await.unwrap();
        assert_eq!(store.get_raw("totals:cash").await.unwrap().as_deref(), Some("12.50"));
        assert!(store.get_raw("totals:card").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_raw_batch_sets_and_removes_together() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test_station").await.unwrap();
        store.set_raw("totals:card", "4.00").await.unwrap();

        store
            .apply_raw_batch(
                vec![("totals:cash", "7.00".to_string()), ("ledger:history", "[]".to_string())],
                &["totals:card"],
            )
            .await
            .unwrap();

        assert_eq!(store.get_raw("totals:cash").await.unwrap().as_deref(), Some("7.00"));
        let history: Vec<serde_json::Value> = store.get("ledger:history").await.unwrap().unwrap();
        assert!(history.is_empty());
        assert!(!store.exists("totals:card").await.unwrap());
    }

    #[tokio::test]
    async fn test_kv_store_batch_and_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test_station").await.unwrap();

        let pairs = vec![
            ("pending:a", json!({"step": 1})),
            ("pending:b", json!({"step": 2})),
            ("element:a", json!({"step": 1})),
        ];
        store.set_batch(pairs).await.unwrap();

        let results: Vec<(Vec<u8>, serde_json::Value)> = store.scan_prefix(b"pending:").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(store.keys().await.unwrap().len(), 3);

        store.clear().await.unwrap();
        assert_eq!(store.get_stats().await.key_count, 0);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "north").await.unwrap();
        store.set_raw("notes", "north notes").await.unwrap();

        store.switch_namespace("south").await.unwrap();
        assert!(store.get_raw("notes").await.unwrap().is_none());

        store.switch_namespace("north").await.unwrap();
        assert_eq!(store.get_raw("notes").await.unwrap().as_deref(), Some("north notes"));
    }
}
