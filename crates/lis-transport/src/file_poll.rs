//! 目录轮询监听器
//!
//! 面向只会导出文件的老设备: 按固定间隔扫描配置目录，
//! 每个匹配文件视为一帧（先按JSON解析，失败回落ASTM），
//! 处理后移入 processed/ 子目录。目录创建失败只停用本设备。

use crate::listener::{set_state, ListenerState, SharedState};
use chrono::Utc;
use lis_core::models::Equipment;
use lis_core::{LisError, Result};
use lis_pipeline::{IngestOutcome, IngestPipeline};
use lis_protocol::decode_tcp_payload;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const PROCESSED_DIR: &str = "processed";

pub async fn run_file_poller(
    equipment: Equipment,
    pipeline: Arc<IngestPipeline>,
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) {
    let Some(watch_dir) = equipment.transport.watch_dir.clone() else {
        error!("设备 {} 未配置轮询目录", equipment.name);
        set_state(&state, ListenerState::Error("missing watch directory".to_string())).await;
        return;
    };

    let processed = watch_dir.join(PROCESSED_DIR);
    if let Err(e) = tokio::fs::create_dir_all(&processed).await {
        error!(
            "轮询目录创建失败: 设备={} 目录={} 错误={}",
            equipment.name,
            watch_dir.display(),
            e
        );
        set_state(&state, ListenerState::Error(e.to_string())).await;
        return;
    }

    info!(
        "目录轮询启动: 设备={} 目录={} 间隔={}s",
        equipment.name,
        watch_dir.display(),
        equipment.transport.poll_interval_secs
    );
    set_state(&state, ListenerState::Listening).await;

    let mut ticker =
        tokio::time::interval(Duration::from_secs(equipment.transport.poll_interval_secs));
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match poll_once(&watch_dir, &equipment, &pipeline, &state).await {
                    Ok(0) => {}
                    Ok(n) => debug!("轮询处理 {} 个文件: 设备={}", n, equipment.name),
                    Err(e) => warn!("轮询失败: 设备={} 错误={}", equipment.name, e),
                }
            }
        }
    }

    set_state(&state, ListenerState::Stopped).await;
    info!("目录轮询停止: 设备={}", equipment.name);
}

/// 扫描一轮目录，返回处理的文件数
pub async fn poll_once(
    watch_dir: &Path,
    equipment: &Equipment,
    pipeline: &Arc<IngestPipeline>,
    state: &SharedState,
) -> Result<usize> {
    let mut handled = 0;
    let mut dir = tokio::fs::read_dir(watch_dir).await?;

    while let Some(entry) = dir.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if !matches_pattern(&path, equipment.transport.pattern.as_deref()) {
            continue;
        }

        set_state(state, ListenerState::Receiving).await;
        if let Err(e) = handle_file(&path, equipment, pipeline).await {
            warn!(
                "结果文件处理失败: 设备={} 文件={} 错误={}",
                equipment.name,
                path.display(),
                e
            );
        }

        // 无论成败都移走，避免下一轮重复处理；失败原因已在日志里
        move_to_processed(watch_dir, &path).await?;
        handled += 1;
        set_state(state, ListenerState::Listening).await;
    }

    Ok(handled)
}

async fn handle_file(path: &Path, equipment: &Equipment, pipeline: &Arc<IngestPipeline>) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    // JSON优先，其次ASTM
    let message = decode_tcp_payload(&content);

    match pipeline.ingest(equipment.id, &message, Utc::now()).await? {
        IngestOutcome::Written(o) => {
            info!(
                "结果文件入库: 设备={} 文件={} 样本={}",
                equipment.name,
                path.display(),
                o.sample_code
            );
        }
        IngestOutcome::Queued => {
            info!("结果文件入重试队列: 设备={} 文件={}", equipment.name, path.display());
        }
        IngestOutcome::Empty => {
            debug!("结果文件无观测值: 文件={}", path.display());
        }
    }
    Ok(())
}

async fn move_to_processed(watch_dir: &Path, path: &Path) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| LisError::Internal(format!("无效文件路径: {}", path.display())))?;
    let target: PathBuf = watch_dir.join(PROCESSED_DIR).join(name);
    tokio::fs::rename(path, &target).await?;
    Ok(())
}

/// 文件名匹配: 无模式匹配一切；`*.ext` 匹配扩展名；其他按子串匹配
fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    if let Some(suffix) = pattern.strip_prefix("*") {
        name.ends_with(suffix)
    } else {
        name.contains(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::models::{
        EquipmentKind, EquipmentState, EquipmentStats, Protocol, TransportConfig,
    };
    use lis_pipeline::{InMemoryAdminStore, Patient, ResolverConfig, RetryQueue};
    use uuid::Uuid;

    fn equipment(watch_dir: PathBuf) -> Equipment {
        Equipment {
            id: Uuid::new_v4(),
            name: "Clinitek".to_string(),
            brand: "Siemens".to_string(),
            model: "Clinitek Status".to_string(),
            kind: EquipmentKind::Orina,
            protocol: Protocol::File,
            transport: TransportConfig {
                watch_dir: Some(watch_dir),
                pattern: Some("*.txt".to_string()),
                ..TransportConfig::default()
            },
            parameter_map: vec![],
            study_map: vec![],
            state: EquipmentState::Activo,
            stats: EquipmentStats::default(),
        }
    }

    #[test]
    fn test_pattern_matching() {
        let p = Path::new("/tmp/result-001.txt");
        assert!(matches_pattern(p, None));
        assert!(matches_pattern(p, Some("*.txt")));
        assert!(matches_pattern(p, Some("result")));
        assert!(!matches_pattern(p, Some("*.csv")));
    }

    #[tokio::test]
    async fn test_poll_moves_file_to_processed() {
        let dir = std::env::temp_dir().join(format!("lis-poll-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(dir.join(PROCESSED_DIR)).await.unwrap();

        let eq = equipment(dir.clone());
        let store = Arc::new(InMemoryAdminStore::new());
        store
            .insert_patient(Patient {
                id: Uuid::new_v4(),
                cedula: "00123456789".to_string(),
                first_name: "Juan".to_string(),
                last_name: "Perez".to_string(),
            })
            .await;

        let queue_path = dir.join("queue.json");
        let queue = Arc::new(RetryQueue::load(&queue_path).await.unwrap());
        let pipeline = Arc::new(IngestPipeline::new(
            store.clone(),
            queue,
            ResolverConfig::default(),
            None,
            vec![eq.clone()],
        ));

        let file = dir.join("result-001.txt");
        tokio::fs::write(
            &file,
            "H|\\^&\nP|1|00123456789\nR|1|^^^GLU|98|mg/dL||||N\nL|1|N\n",
        )
        .await
        .unwrap();
        // 不匹配模式的文件保持原位
        let other = dir.join("ignore.csv");
        tokio::fs::write(&other, "x,y").await.unwrap();

        let state = crate::listener::shared_state();
        let handled = poll_once(&dir, &eq, &pipeline, &state).await.unwrap();

        assert_eq!(handled, 1);
        assert_eq!(store.result_count().await, 1);
        assert!(!file.exists());
        assert!(dir.join(PROCESSED_DIR).join("result-001.txt").exists());
        assert!(other.exists());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
