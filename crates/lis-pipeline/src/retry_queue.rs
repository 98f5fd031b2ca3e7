//! 重试队列
//!
//! 标识暂时无法解析的结果在此落盘等待，按键（设备+原始标识）去重。
//! 条目没有过期时间——缺失的管理记录最终要由人补录。
//! 队列深度与最老条目年龄对外可见，用于运维告警。

use chrono::Utc;
use lis_core::models::PendingEntry;
use lis_core::{LisError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 持久化重试队列
pub struct RetryQueue {
    path: PathBuf,
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl RetryQueue {
    /// 从磁盘加载队列，文件不存在时从空队列开始
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<PendingEntry> = serde_json::from_slice(&bytes)?;
                info!("retry queue loaded: {} pending entries", list.len());
                list.into_iter().map(|e| (e.key(), e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(LisError::Transport(e)),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// 入队（同键覆盖为最新值）并落盘
    pub async fn enqueue(&self, entry: PendingEntry) -> Result<()> {
        let mut entries = self.entries.lock().await;
        warn!(
            "queueing unresolved result: equipment={} identifier={} ({} values)",
            entry.equipment_id,
            entry.raw_identifier,
            entry.values.len()
        );
        entries.insert(entry.key(), entry);
        self.persist(&entries).await
    }

    /// 按键移除并落盘
    pub async fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }

    /// 当前所有条目的快照
    pub async fn snapshot(&self) -> Vec<PendingEntry> {
        self.entries.lock().await.values().cloned().collect()
    }

    /// 队列深度
    pub async fn depth(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// 最老条目的年龄（秒）
    pub async fn oldest_age_secs(&self) -> Option<i64> {
        let entries = self.entries.lock().await;
        entries
            .values()
            .map(|e| e.received_at)
            .min()
            .map(|oldest| (Utc::now() - oldest).num_seconds())
    }

    async fn persist(&self, entries: &HashMap<String, PendingEntry>) -> Result<()> {
        let list: Vec<&PendingEntry> = entries.values().collect();
        let bytes = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::models::{AbnormalFlag, NormalizedValue};
    use uuid::Uuid;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lis-retry-{}-{}.json", name, Uuid::new_v4()))
    }

    fn entry(identifier: &str) -> PendingEntry {
        PendingEntry {
            equipment_id: Uuid::new_v4(),
            raw_identifier: identifier.to_string(),
            values: vec![NormalizedValue {
                parameter: "WBC".to_string(),
                value: "7.5".to_string(),
                unit: String::new(),
                reference_range: String::new(),
                flag: AbnormalFlag::Normal,
            }],
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_depth() {
        let path = temp_path("depth");
        let queue = RetryQueue::load(&path).await.unwrap();

        queue.enqueue(entry("111")).await.unwrap();
        queue.enqueue(entry("222")).await.unwrap();
        assert_eq!(queue.depth().await, 2);
        assert!(queue.oldest_age_secs().await.unwrap() >= 0);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_same_key_overwrites() {
        let path = temp_path("dedupe");
        let queue = RetryQueue::load(&path).await.unwrap();

        let e = entry("333");
        queue.enqueue(e.clone()).await.unwrap();
        queue.enqueue(e).await.unwrap();
        assert_eq!(queue.depth().await, 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_survives_reload() {
        let path = temp_path("reload");

        {
            let queue = RetryQueue::load(&path).await.unwrap();
            queue.enqueue(entry("444")).await.unwrap();
        }

        // 重新加载 → 条目仍在
        let reloaded = RetryQueue::load(&path).await.unwrap();
        assert_eq!(reloaded.depth().await, 1);
        assert_eq!(reloaded.snapshot().await[0].raw_identifier, "444");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_remove_persists() {
        let path = temp_path("remove");
        let queue = RetryQueue::load(&path).await.unwrap();

        let e = entry("555");
        let key = e.key();
        queue.enqueue(e).await.unwrap();
        queue.remove(&key).await.unwrap();

        let reloaded = RetryQueue::load(&path).await.unwrap();
        assert_eq!(reloaded.depth().await, 0);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
