//! 代理本地发送队列
//!
//! 发送失败的完整载荷在此落盘，按入队顺序（最老优先）重放；
//! 只有确认送达后条目才被移除。

use chrono::Utc;
use lis_core::models::{AgentQueueEntry, ResultPayload};
use lis_core::{LisError, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// 持久化发送队列
pub struct AgentQueue {
    path: PathBuf,
    entries: Mutex<Vec<AgentQueueEntry>>,
}

impl AgentQueue {
    /// 从磁盘加载队列，文件不存在时从空队列开始
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<AgentQueueEntry> = serde_json::from_slice(&bytes)?;
                info!("发送队列加载: {} 条待发条目", list.len());
                list
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(LisError::Transport(e)),
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// 追加一条待发载荷并落盘
    pub async fn push(&self, payload: ResultPayload) -> Result<()> {
        let mut entries = self.entries.lock().await;
        warn!(
            "结果进入本地队列: 设备={} 参数={}",
            payload.equipment_name,
            payload.valores.len()
        );
        entries.push(AgentQueueEntry {
            equipment_name: payload.equipment_name.clone(),
            payload,
            queued_at: Utc::now(),
        });
        self.persist(&entries).await
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// 最老优先重放队列。`send` 确认成功的条目被移除，失败的留到下一轮。
    pub async fn flush<F, Fut>(&self, send: F) -> Result<(usize, usize)>
    where
        F: Fn(ResultPayload) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut entries = self.entries.lock().await;
        if entries.is_empty() {
            return Ok((0, 0));
        }

        info!("重放发送队列: {} 条", entries.len());
        let mut kept = Vec::with_capacity(entries.len());
        let mut sent = 0;

        for entry in entries.drain(..) {
            match send(entry.payload.clone()).await {
                Ok(()) => {
                    info!("队列条目送达: 设备={}", entry.equipment_name);
                    sent += 1;
                }
                Err(e) => {
                    warn!("队列条目仍发送失败: 设备={} 错误={}", entry.equipment_name, e);
                    kept.push(entry);
                }
            }
        }

        *entries = kept;
        self.persist(&entries).await?;
        Ok((sent, entries.len()))
    }

    async fn persist(&self, entries: &[AgentQueueEntry]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
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
    use lis_core::models::{AbnormalFlag, PayloadValue};
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lis-agent-queue-{}-{}.json", name, Uuid::new_v4()))
    }

    fn payload(equipment: &str) -> ResultPayload {
        let mut valores = BTreeMap::new();
        valores.insert(
            "WBC".to_string(),
            PayloadValue {
                valor: "7.5".to_string(),
                unidad: "10³/µL".to_string(),
                referencia: String::new(),
                estado: AbnormalFlag::Normal,
            },
        );
        ResultPayload {
            station_name: "norte".to_string(),
            equipment_type: "hematologia".to_string(),
            equipment_name: equipment.to_string(),
            cedula: Some("00000000000".to_string()),
            paciente_id: None,
            tipo_estudio: "Hemograma".to_string(),
            valores,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_survives_reload() {
        let path = temp_path("reload");

        {
            let queue = AgentQueue::load(&path).await.unwrap();
            queue.push(payload("BC-6800")).await.unwrap();
            queue.push(payload("BS-200")).await.unwrap();
        }

        let reloaded = AgentQueue::load(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 2);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_flush_removes_only_confirmed() {
        let path = temp_path("flush");
        let queue = AgentQueue::load(&path).await.unwrap();
        queue.push(payload("BC-6800")).await.unwrap();
        queue.push(payload("BS-200")).await.unwrap();

        // 只有 BC-6800 发送成功
        let (sent, remaining) = queue
            .flush(|p| async move {
                if p.equipment_name == "BC-6800" {
                    Ok(())
                } else {
                    Err(LisError::Delivery("connection refused".to_string()))
                }
            })
            .await
            .unwrap();

        assert_eq!((sent, remaining), (1, 1));

        // 失败条目持久化，重载后仍在
        let reloaded = AgentQueue::load(&path).await.unwrap();
        assert_eq!(reloaded.len().await, 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_flush_is_oldest_first() {
        let path = temp_path("order");
        let queue = AgentQueue::load(&path).await.unwrap();
        queue.push(payload("primero")).await.unwrap();
        queue.push(payload("segundo")).await.unwrap();

        let order = std::sync::Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        queue
            .flush(move |p| {
                let seen = seen.clone();
                async move {
                    seen.lock().await.push(p.equipment_name.clone());
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(*order.lock().await, vec!["primero", "segundo"]);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
